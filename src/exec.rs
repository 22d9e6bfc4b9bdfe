use core::fmt::Display;
use core::slice;

use crate::arm::{PGSIZE, PTE_RO, PTE_UXN, pg_round_up};
use crate::fs::Path;
use crate::log::Operation;
use crate::param::{MAXARG, USERSTACK};
use crate::proc::current_proc;
use crate::vm::{Uvm, VA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    Alloc,
    Elf,
    Header,
    Read,
    Memory,
}

impl Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::Alloc => write!(f, "allocation error"),
            ExecError::Elf => write!(f, "invalid elf file"),
            ExecError::Header => write!(f, "invalid program header"),
            ExecError::Read => write!(f, "read error"),
            ExecError::Memory => write!(f, "memory error"),
        }
    }
}

const ELF_MAGIC: u32 = 0x464C457F; // "\x7FELF" in little endian
const ELF_MACHINE_AARCH64: u16 = 183;

/// ELF64 file header
#[repr(C)]
#[derive(Debug)]
struct ElfHeader {
    magic: u32,
    elf: [u8; 12],
    r#type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl ElfHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}

/// ELF64 program header
#[repr(C)]
#[derive(Debug)]
struct ProgramHeader {
    r#type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgramHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub const LOAD: u32 = 1;

    // p_flags bits
    const FLAG_X: u32 = 0x1;
    const FLAG_W: u32 = 0x2;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    /// Extra descriptor flags for this segment's pages: pages are
    /// writeable and non-executable unless the header says otherwise.
    fn get_perms(&self) -> usize {
        let mut perm = 0;
        if self.flags & Self::FLAG_X == 0 {
            perm |= PTE_UXN;
        }
        if self.flags & Self::FLAG_W == 0 {
            perm |= PTE_RO;
        }
        perm
    }
}

/// Replaces the current process's image with the program at `path`.
/// On success the return value is `argc`, which lands in the return-value
/// register; the new user stack pointer carries the argv array.
pub fn exec(path: &Path<'_>, argv: &[&str]) -> Result<usize, ExecError> {
    let proc = current_proc();
    let mut size = 0;

    let _op = Operation::begin();

    // open the executable
    let Ok(inode) = log!(path.resolve()) else {
        err!(ExecError::Read);
    };

    let mut inner = inode.lock();

    // read and check the elf header
    let mut elf_buf = [0u8; ElfHeader::SIZE];
    match log!(inode.read(&mut inner, 0, &mut elf_buf)) {
        Ok(read) if read as usize == elf_buf.len() => {}
        _ => {
            inode.unlock_put(inner);
            err!(ExecError::Read);
        }
    }

    let elf = ElfHeader::from_bytes(&elf_buf);

    if elf.magic != ELF_MAGIC || elf.machine != ELF_MACHINE_AARCH64 {
        inode.unlock_put(inner);
        err!(ExecError::Elf);
    }

    // build the new image in a fresh address space
    let Ok(mut pagetable) = log!(Uvm::try_new()) else {
        inode.unlock_put(inner);
        err!(ExecError::Alloc);
    };

    // load each program segment
    let mut ph_buf = [0u8; ProgramHeader::SIZE];
    let mut offset = elf.phoff;

    for _ in 0..elf.phnum {
        match log!(inode.read(&mut inner, offset as u32, &mut ph_buf)) {
            Ok(read) if read as usize == ph_buf.len() => {}
            _ => {
                pagetable.free(size);
                inode.unlock_put(inner);
                err!(ExecError::Read);
            }
        }

        let ph = ProgramHeader::from_bytes(&ph_buf);
        offset += ProgramHeader::SIZE as u64;

        if ph.r#type != ProgramHeader::LOAD {
            continue;
        }

        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || ph.vaddr % PGSIZE as u64 != 0
        {
            pagetable.free(size);
            inode.unlock_put(inner);
            err!(ExecError::Header);
        }

        size = match log!(pagetable.alloc(size, (ph.vaddr + ph.memsz) as usize, ph.get_perms())) {
            Ok(new_size) => new_size,
            Err(_) => {
                pagetable.free(size);
                inode.unlock_put(inner);
                err!(ExecError::Alloc);
            }
        };

        // copy the segment's file contents page by page; the new table is
        // not live yet, so go through its kernel-side page views
        let mut loaded = 0;
        while loaded < ph.filesz as usize {
            let va = VA(ph.vaddr as usize + loaded);
            let n = (ph.filesz as usize - loaded).min(PGSIZE);

            let Ok(page) = pagetable.page_slice_mut(va) else {
                pagetable.free(size);
                inode.unlock_put(inner);
                err!(ExecError::Memory);
            };

            match log!(inode.read(&mut inner, (ph.offset as usize + loaded) as u32, &mut page[..n]))
            {
                Ok(read) if read as usize == n => {}
                _ => {
                    pagetable.free(size);
                    inode.unlock_put(inner);
                    err!(ExecError::Read);
                }
            }

            loaded += n;
        }
    }

    inode.unlock_put(inner);
    drop(_op);

    let old_size = proc.data().size;

    // allocate the user stack at the next page boundary, with one
    // inaccessible guard page below it
    size = pg_round_up(size);

    size = match log!(pagetable.alloc(size, size + (USERSTACK + 1) * PGSIZE, PTE_UXN)) {
        Ok(new_size) => new_size,
        Err(_) => {
            pagetable.free(size);
            err!(ExecError::Alloc);
        }
    };

    if log!(pagetable.clear(VA(size - (USERSTACK + 1) * PGSIZE))).is_err() {
        pagetable.free(size);
        err!(ExecError::Memory);
    }

    let mut sp = size;
    let stackbase = sp - USERSTACK * PGSIZE;

    // copy argument strings onto the new stack, recording their addresses
    let mut ustack = [0u64; MAXARG];
    let mut argc = 0;

    for &arg in argv.iter() {
        if argc >= MAXARG {
            pagetable.free(size);
            err!(ExecError::Memory);
        }

        sp -= arg.len() + 1; // +1 for the NUL
        sp -= sp % 16; // the stack pointer must stay 16-byte aligned

        if sp < stackbase {
            pagetable.free(size);
            err!(ExecError::Memory);
        }

        if log!(pagetable.copy_to(arg.as_bytes(), VA(sp))).is_err()
            || log!(pagetable.copy_to(&[0u8], VA(sp + arg.len()))).is_err()
        {
            pagetable.free(size);
            err!(ExecError::Memory);
        }

        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    // then the argv pointer array itself
    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;

    let ustack_bytes = unsafe {
        slice::from_raw_parts(ustack.as_ptr() as *const u8, (argc + 1) * size_of::<u64>())
    };

    if sp < stackbase || log!(pagetable.copy_to(ustack_bytes, VA(sp))).is_err() {
        pagetable.free(size);
        err!(ExecError::Memory);
    }

    // Safety: we are the current proc
    let data = unsafe { proc.data_mut() };

    // keep the program name for debugging
    data.name.clear();
    data.name.push_str(
        path.as_str()
            .rsplit_once('/')
            .unwrap_or(("", path.as_str()))
            .1,
    );

    // commit to the new image and make it the live address space before
    // the old one goes away
    let old_pagetable = data.pagetable.replace(pagetable).unwrap();
    data.size = size;
    data.pagetable().switch();

    let trapframe = data.trapframe_mut();
    trapframe.elr = elf.entry as usize; // initial program counter
    trapframe.sp = sp; // initial stack pointer
    trapframe.x1 = sp; // argv, for main(argc, argv)

    old_pagetable.free(old_size);

    Ok(argc) // becomes x0, the first argument to main
}
