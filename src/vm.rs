use core::cmp::min;
use core::fmt::Display;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};
use core::slice;

use alloc::boxed::Box;

use crate::arm::{
    MAXVA, PGLEVELS, PGSIZE, PTE_AF, PTE_DEVICE, PTE_FLAG_MASK, PTE_ISH, PTE_NORMAL, PTE_PAGE,
    PTE_PXN, PTE_RO, PTE_TABLE, PTE_USER, PTE_UXN, PTE_V, pa_to_pte, pg_round_down, pg_round_up,
    pte_to_pa, px,
    registers::{sctlr, ttbr0},
    tlbi_vmalle1,
};
use crate::kalloc::Page;
use crate::memlayout::{GICD, PHYSTOP, UART0, USERTOP, VIRTIO0};
use crate::sync::OnceLock;

/// 2 MiB, the reach of one level-1 block descriptor.
const BLKSIZE: usize = 1 << 21;

/// RAM base on the virt board; 2 MiB aligned, unlike KERNBASE.
const RAMBASE: usize = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Alloc,
    InvalidAddress,
    NotMapped,
    NotUser,
    ReadOnly,
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Alloc => write!(f, "allocation failed"),
            VmError::InvalidAddress => write!(f, "invalid address"),
            VmError::NotMapped => write!(f, "address not mapped"),
            VmError::NotUser => write!(f, "not a user page"),
            VmError::ReadOnly => write!(f, "page is read-only"),
        }
    }
}

impl From<core::alloc::AllocError> for VmError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::Alloc
    }
}

pub static KVM: OnceLock<Kvm> = OnceLock::new();

/// Physical address. The kernel runs identity mapped, so a `PA` is also a
/// valid kernel pointer.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PA(pub usize);

impl PA {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for PA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Virtual address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VA(pub usize);

impl VA {
    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for VA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl core::ops::Add<usize> for VA {
    type Output = VA;

    fn add(self, rhs: usize) -> VA {
        VA(self.0 + rhs)
    }
}

/// An ARMv8-A stage 1 translation table descriptor.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PageTableEntry(usize);

impl PageTableEntry {
    fn is_valid(&self) -> bool {
        self.0 & PTE_V != 0
    }

    /// At a non-leaf level, does this entry point at a next-level table
    /// (rather than being a block descriptor)?
    fn is_table(&self) -> bool {
        self.is_valid() && self.0 & PTE_TABLE != 0
    }

    fn is_user(&self) -> bool {
        self.0 & PTE_USER != 0
    }

    fn is_writeable(&self) -> bool {
        self.0 & PTE_RO == 0
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }

    fn flags(&self) -> usize {
        self.0 & PTE_FLAG_MASK
    }
}

#[repr(C, align(4096))]
struct RawPageTable([PageTableEntry; 512]);

impl RawPageTable {
    fn try_new() -> Result<*mut Self, VmError> {
        let memory: Box<MaybeUninit<RawPageTable>> = Box::try_new_zeroed()?;
        let memory = unsafe { memory.assume_init() };
        Ok(Box::into_raw(memory))
    }
}

/// A translation table tree. Level 3 is the root; level 0 entries map
/// 4 KiB pages, level 1 entries may be 2 MiB block descriptors.
#[derive(Debug)]
pub struct PageTable {
    ptr: *mut RawPageTable,
}

impl PageTable {
    pub fn try_new() -> Result<Self, VmError> {
        Ok(Self {
            ptr: RawPageTable::try_new()?,
        })
    }

    pub fn as_pa(&self) -> PA {
        PA(self.ptr as usize)
    }

    /// Descends the tree to the entry for `va` at `level`, allocating
    /// intermediate tables on the way down if `alloc` is set.
    fn walk(&mut self, va: VA, alloc: bool, level: usize) -> Result<&mut PageTableEntry, VmError> {
        assert!(va.0 < MAXVA, "walk");

        let mut table = self.ptr;

        unsafe {
            for lvl in ((level + 1)..PGLEVELS).rev() {
                let pte = &mut (*table).0[px(lvl, va.0)];

                if pte.is_table() {
                    table = pte.as_pa().0 as *mut RawPageTable;
                } else {
                    if !alloc {
                        return Err(VmError::NotMapped);
                    }

                    table = RawPageTable::try_new()?;
                    pte.0 = pa_to_pte(table as usize) | PTE_V | PTE_TABLE;
                }
            }

            Ok(&mut (*table).0[px(level, va.0)])
        }
    }

    /// Looks up a user virtual address and returns its physical address.
    fn walk_addr(&mut self, va: VA) -> Result<PA, VmError> {
        if va.0 >= MAXVA {
            return Err(VmError::InvalidAddress);
        }

        let pte = self.walk(va, false, 0)?;

        if !pte.is_valid() {
            return Err(VmError::NotMapped);
        }
        if !pte.is_user() {
            return Err(VmError::NotUser);
        }

        Ok(pte.as_pa())
    }

    /// Creates 4 KiB page descriptors for [va, va + size) pointing at
    /// physical memory starting at `pa`. `va` and `size` must be
    /// page-aligned.
    pub fn map_pages(&mut self, va: VA, pa: PA, size: usize, perm: usize) -> Result<(), VmError> {
        assert_eq!(va.0 % PGSIZE, 0, "map_pages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: size");

        let mut va = va.0;
        let mut pa = pa.0;
        let last = va + size - PGSIZE;

        loop {
            let pte = self.walk(VA(va), true, 0)?;
            assert!(!pte.is_valid(), "map_pages: remap");

            pte.0 = pa_to_pte(pa) | perm | PTE_V | PTE_PAGE | PTE_AF;

            if va == last {
                break;
            }

            va += PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Creates 2 MiB block descriptors at level 1. Used only for the kernel
    /// portion of an address space, which never changes after creation.
    fn map_blocks(&mut self, va: VA, pa: PA, size: usize, perm: usize) -> Result<(), VmError> {
        assert_eq!(va.0 % BLKSIZE, 0, "map_blocks: va not aligned");
        assert_eq!(size % BLKSIZE, 0, "map_blocks: size not aligned");

        let mut va = va.0;
        let mut pa = pa.0;
        let last = va + size - BLKSIZE;

        loop {
            let pte = self.walk(VA(va), true, 1)?;
            assert!(!pte.is_valid(), "map_blocks: remap");

            // bit 1 clear makes this a block descriptor
            pte.0 = pa_to_pte(pa) | perm | PTE_V | PTE_AF;

            if va == last {
                break;
            }

            va += BLKSIZE;
            pa += BLKSIZE;
        }

        Ok(())
    }

    /// Recursively frees table pages at and below `level`.
    /// Leaf and block entries are skipped, not freed: data pages must have
    /// been released already (or, for the kernel mappings, are not owned by
    /// this tree at all).
    fn free_walk(self, level: usize) {
        let table = unsafe { &mut *self.ptr };

        if level > 0 {
            for pte in table.0.iter_mut() {
                if pte.is_table() {
                    let child = PageTable {
                        ptr: pte.as_pa().0 as *mut RawPageTable,
                    };
                    child.free_walk(level - 1);
                    pte.0 = 0;
                }
            }
        }

        let _table = unsafe { Box::from_raw(self.ptr) };
    }
}

/// Installs the kernel half of an address space: device MMIO windows plus
/// all of RAM, identity mapped with 2 MiB blocks. Every process table gets
/// the same entries, so the kernel keeps running (and can touch user memory
/// directly) no matter which table is live.
fn map_kernel(pt: &mut PageTable) -> Result<(), VmError> {
    let device = PTE_DEVICE | PTE_PXN | PTE_UXN;

    // GIC (distributor and cpu interface share one block)
    pt.map_blocks(VA(GICD), PA(GICD), BLKSIZE, device)?;

    // uart0
    pt.map_blocks(VA(UART0), PA(UART0), BLKSIZE, device)?;

    // virtio mmio disk interface
    pt.map_blocks(VA(VIRTIO0), PA(VIRTIO0), BLKSIZE, device)?;

    // kernel image and the rest of RAM; executable at EL1 only
    pt.map_blocks(
        VA(RAMBASE),
        PA(RAMBASE),
        PHYSTOP - RAMBASE,
        PTE_NORMAL | PTE_ISH | PTE_UXN,
    )?;

    Ok(())
}

/// The kernel page table, used by a CPU whenever it is not running a
/// process.
#[derive(Debug)]
pub struct Kvm(PageTable);

/// # Safety
/// Written once during boot, read-only after.
unsafe impl Sync for Kvm {}
unsafe impl Send for Kvm {}

/// Initialize the kernel page table.
pub fn init() {
    let mut pt = PageTable::try_new().expect("kvm alloc");
    map_kernel(&mut pt).expect("kvm map");

    KVM.initialize(|| Ok::<_, VmError>(Kvm(pt)));

    println!("kvm  init");
}

/// Point translation at the kernel page table.
pub fn kvm_switch() {
    unsafe { ttbr0::write(KVM.get().expect("kvm to be init").0.as_pa().0) };
    tlbi_vmalle1();
}

/// Turn on translation for this CPU. MAIR/TCR were programmed in `start`.
///
/// # Safety
/// Must be called once per CPU, after `vm::init`.
pub unsafe fn init_hart() {
    unsafe {
        ttbr0::write(KVM.get().expect("kvm to be init").0.as_pa().0);
        crate::arm::isb();

        sctlr::write(sctlr::read() | sctlr::M | sctlr::C | sctlr::I);
        crate::arm::isb();
    }

    tlbi_vmalle1();
}

/// A user address space: user pages in [0, size) plus the shared kernel
/// mappings.
#[derive(Debug)]
pub struct Uvm(PageTable);

impl Uvm {
    /// Creates an address space with no user memory yet.
    pub fn try_new() -> Result<Self, VmError> {
        let mut pt = PageTable::try_new()?;

        if let Err(e) = map_kernel(&mut pt) {
            pt.free_walk(PGLEVELS - 1);
            return Err(e);
        }

        Ok(Self(pt))
    }

    /// Loads the initial user image (must fit in one page) at address 0.
    /// Used only for the very first process.
    pub fn init_code(&mut self, src: &[u8]) -> Result<(), VmError> {
        assert!(src.len() < PGSIZE, "init_code: more than a page");

        let mut page = unsafe { Box::<Page>::try_new_zeroed()?.assume_init() };
        page.0[..src.len()].copy_from_slice(src);

        let pa = Box::into_raw(page) as usize;
        self.map_pages(
            VA(0),
            PA(pa),
            PGSIZE,
            PTE_NORMAL | PTE_ISH | PTE_USER | PTE_PXN,
        )
    }

    /// Allocates PTEs and physical memory to grow the process from
    /// `old_size` to `new_size`, which need not be page aligned.
    pub fn alloc(&mut self, old_size: usize, new_size: usize, xperm: usize) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        if new_size > USERTOP {
            return Err(VmError::InvalidAddress);
        }

        let old_size = pg_round_up(old_size);
        for va in (old_size..new_size).step_by(PGSIZE) {
            let page = match Box::<Page>::try_new_zeroed() {
                Ok(page) => unsafe { page.assume_init() },
                Err(err) => {
                    self.dealloc(va, old_size);
                    return Err(err.into());
                }
            };

            let pa = Box::into_raw(page) as usize;

            if let Err(err) = self.map_pages(
                va.into(),
                pa.into(),
                PGSIZE,
                PTE_NORMAL | PTE_ISH | PTE_USER | PTE_PXN | xperm,
            ) {
                let _page = unsafe { Box::from_raw(pa as *mut Page) };
                self.dealloc(va, old_size);
                return Err(err);
            }
        }

        Ok(new_size)
    }

    /// Deallocates user pages to bring the process size from `old_size` to
    /// `new_size`. Neither needs to be page-aligned. Returns the new size.
    pub fn dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let rounded_new = pg_round_up(new_size);
        let rounded_old = pg_round_up(old_size);

        if rounded_new < rounded_old {
            let npages = (rounded_old - rounded_new) / PGSIZE;
            self.unmap(rounded_new.into(), npages, true);
        }

        new_size
    }

    /// Removes `npages` of mappings starting from `va`, which must be
    /// page-aligned and mapped. Optionally frees the physical pages.
    pub fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert_eq!(va.0 % PGSIZE, 0, "unmap: not aligned");

        for va in (va.0..va.0 + npages * PGSIZE).step_by(PGSIZE) {
            match self.walk(VA(va), false, 0) {
                Err(_) => panic!("unmap: walk"),
                Ok(pte) if !pte.is_valid() => panic!("unmap: not mapped"),
                Ok(pte) => {
                    if free {
                        let pa = pte.as_pa();
                        let _page = unsafe { Box::from_raw(pa.0 as *mut Page) };
                    }
                    pte.0 = 0;
                }
            }
        }
    }

    /// Copies this address space's user memory into `child`, for fork.
    /// On failure the partial copy is undone.
    pub fn copy(&mut self, child: &mut Uvm, size: usize) -> Result<(), VmError> {
        for va in (0..size).step_by(PGSIZE) {
            let pte = match self.walk(VA(va), false, 0) {
                Ok(pte) if pte.is_valid() => pte,
                _ => panic!("uvm copy: page not present"),
            };

            let pa = pte.as_pa();
            let flags = pte.flags() & !(PTE_V | PTE_PAGE | PTE_AF);

            let result = (|| {
                let mut page = unsafe { Box::<Page>::try_new_zeroed()?.assume_init() };

                let src = unsafe { slice::from_raw_parts(pa.0 as *const u8, PGSIZE) };
                page.0.copy_from_slice(src);

                let new_pa = Box::into_raw(page) as usize;
                if let Err(err) = child.map_pages(va.into(), new_pa.into(), PGSIZE, flags) {
                    let _page = unsafe { Box::from_raw(new_pa as *mut Page) };
                    return Err(err);
                }

                Ok(())
            })();

            if let Err(err) = result {
                if va > 0 {
                    child.unmap(VA(0), va / PGSIZE, true);
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Marks a page inaccessible from user mode. Used for the stack guard.
    pub fn clear(&mut self, va: VA) -> Result<(), VmError> {
        let pte = self.walk(va, false, 0)?;
        pte.0 &= !PTE_USER;
        Ok(())
    }

    /// Copies bytes from kernel `src` to `dstva` through this table's
    /// mappings. Works even when the table is not the live one (exec builds
    /// the new image before switching to it).
    pub fn copy_to(&mut self, src: &[u8], dstva: VA) -> Result<(), VmError> {
        let mut src = src;
        let mut dstva = dstva.0;

        while !src.is_empty() {
            let va0 = pg_round_down(dstva);

            let pte = self.walk(VA(va0), false, 0)?;
            if !pte.is_valid() || !pte.is_user() {
                return Err(VmError::NotUser);
            }
            if !pte.is_writeable() {
                return Err(VmError::ReadOnly);
            }

            let pa0 = pte.as_pa().0;
            let n = min(PGSIZE - (dstva - va0), src.len());

            unsafe {
                let dst = (pa0 + (dstva - va0)) as *mut u8;
                core::ptr::copy_nonoverlapping(src.as_ptr(), dst, n);
            }

            src = &src[n..];
            dstva = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Returns the writable kernel-side view of the user page containing
    /// `va`. The page must already be mapped. Used by exec to load segment
    /// bytes into a not-yet-live image.
    pub fn page_slice_mut(&mut self, va: VA) -> Result<&'static mut [u8], VmError> {
        assert_eq!(va.0 % PGSIZE, 0, "page_slice_mut: not aligned");

        let pa = self.walk_addr(va)?;
        Ok(unsafe { slice::from_raw_parts_mut(pa.0 as *mut u8, PGSIZE) })
    }

    /// Frees user memory pages, then all table pages (all 4 levels).
    pub fn free(mut self, size: usize) {
        if size > 0 {
            self.unmap(VA(0), pg_round_up(size) / PGSIZE, true);
        }
        self.0.free_walk(PGLEVELS - 1);
    }

    /// Makes this address space the live one.
    pub fn switch(&self) {
        unsafe { ttbr0::write(self.0.as_pa().0) };
        tlbi_vmalle1();
    }
}

impl Deref for Uvm {
    type Target = PageTable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Uvm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// # Safety
/// A `Uvm` is owned by exactly one process and only touched while that
/// process runs or while its slot is being set up or torn down.
unsafe impl Send for Uvm {}
unsafe impl Sync for Uvm {}
