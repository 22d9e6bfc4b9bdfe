use core::mem;
use core::slice;

use crate::console;
use crate::fs::{BSIZE, FsError, Inode, Stat};
use crate::log::Operation;
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::proc;
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLock;
use crate::syscall::SysError;
use crate::vm::VA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileType {
    None,
    Inode { inode: Inode },
    Device { inode: Inode, major: u16 },
}

/// Allocation state, protected by the table-wide spinlock.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub ref_count: usize,
}

impl FileMeta {
    const fn new() -> Self {
        Self { ref_count: 0 }
    }
}

/// Per-file mutable state, protected by a per-file sleep lock.
#[derive(Debug, Clone)]
pub struct FileInner {
    pub readable: bool,
    pub writeable: bool,
    pub r#type: FileType,
    pub offset: u32,
}

impl FileInner {
    const fn new() -> Self {
        Self {
            readable: false,
            writeable: false,
            r#type: FileType::None,
            offset: 0,
        }
    }
}

pub static FILE_TABLE: FileTable = FileTable::new();

/// Global file table
#[derive(Debug)]
pub struct FileTable {
    /// protects allocation and reference counts
    pub meta: SpinLock<[FileMeta; NFILE]>,
    /// per-file locks allow concurrent access to different files
    pub inner: [SleepLock<FileInner>; NFILE],
}

impl FileTable {
    const fn new() -> Self {
        Self {
            meta: SpinLock::new([const { FileMeta::new() }; NFILE], "filetable"),
            inner: [const { SleepLock::new(FileInner::new(), "file") }; NFILE],
        }
    }
}

/// File handle; an index into the `FILE_TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: usize,
}

impl File {
    /// Allocates a file structure with a reference count of one.
    pub fn alloc() -> Result<Self, FsError> {
        let mut meta = FILE_TABLE.meta.lock();

        for (i, meta) in meta.iter_mut().enumerate() {
            if meta.ref_count == 0 {
                meta.ref_count = 1;

                return Ok(Self { id: i });
            }
        }

        err!(FsError::OutOfFile);
    }

    /// Increments the reference count for the file.
    pub fn dup(&mut self) -> Self {
        let meta = &mut FILE_TABLE.meta.lock()[self.id];

        assert!(meta.ref_count >= 1, "file dup");

        meta.ref_count += 1;

        self.clone()
    }

    /// Decrements the reference count, closing the file when it hits 0.
    pub fn close(&mut self) {
        let mut meta_guard = FILE_TABLE.meta.lock();
        let meta = &mut meta_guard[self.id];

        assert!(meta.ref_count >= 1, "file close");

        meta.ref_count -= 1;
        if meta.ref_count > 0 {
            return;
        }

        let inner_copy = {
            let mut inner = FILE_TABLE.inner[self.id].lock();
            let copy = inner.clone();

            inner.r#type = FileType::None;

            drop(meta_guard);
            copy
        }; // both locks dropped; the inode put below may sleep

        match inner_copy.r#type {
            FileType::None => {}
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let _op = Operation::begin();
                inode.put();
            }
        }
    }

    /// Copies this file's metadata out to user space.
    pub fn stat(&self, addr: VA) -> Result<(), FsError> {
        let file_inner = FILE_TABLE.inner[self.id].lock();

        match &file_inner.r#type {
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let inode_inner = inode.lock();
                let stat = inode.stat(&inode_inner);
                inode.unlock(inode_inner);

                let src = unsafe {
                    slice::from_raw_parts(&stat as *const _ as *const u8, mem::size_of::<Stat>())
                };
                if log!(proc::copy_out_user(src, addr)).is_err() {
                    err!(FsError::Copy);
                }

                Ok(())
            }
            _ => Err(FsError::Type),
        }
    }

    /// Reads from the file into user memory at `addr`.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, SysError> {
        let mut file_inner = FILE_TABLE.inner[self.id].lock();

        if !file_inner.readable {
            err!(SysError::BadDescriptor);
        }

        match &mut file_inner.r#type {
            FileType::None => panic!("file read"),

            FileType::Inode { inode } => {
                let inode = inode.clone();
                let mut inode_inner = inode.lock();

                let dst = try_log!(proc::user_slice_mut(addr, n));
                let read = log!(inode.read(&mut inode_inner, file_inner.offset, dst));

                if let Ok(read) = read {
                    file_inner.offset += read;
                }

                inode.unlock(inode_inner);

                match read {
                    Ok(read) => Ok(read as usize),
                    Err(_) => err!(SysError::IoError),
                }
            }

            FileType::Device { inode: _, major } => match &DEVICES[*major as usize] {
                Some(dev) => (dev.read)(addr, n),
                None => err!(SysError::BadDescriptor),
            },
        }
    }

    /// Writes user memory at `addr` to the file.
    pub fn write(&mut self, addr: VA, n: usize) -> Result<usize, SysError> {
        let mut file_inner = FILE_TABLE.inner[self.id].lock();

        if !file_inner.writeable {
            err!(SysError::BadDescriptor);
        }

        match &mut file_inner.r#type {
            FileType::None => panic!("file write"),

            FileType::Inode { inode } => {
                let inode = inode.clone();
                let src = try_log!(proc::user_slice(addr, n));

                // write a few blocks at a time to stay inside the maximum
                // log transaction size: inode, indirect block, allocation
                // blocks, and 2 blocks of slop for non-aligned writes
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                let mut i = 0;

                while i < n {
                    let n1 = (n - i).min(max);

                    let _op = Operation::begin();
                    let mut inode_inner = inode.lock();

                    let write = log!(inode.write(&mut inode_inner, file_inner.offset, &src[i..i + n1]));

                    if let Ok(w) = write {
                        file_inner.offset += w;
                    }

                    inode.unlock(inode_inner);
                    drop(_op);

                    match write {
                        Ok(w) => i += w as usize,
                        Err(_) => break,
                    }
                }

                if i == n {
                    Ok(n)
                } else {
                    err!(SysError::IoError);
                }
            }

            FileType::Device { inode: _, major } => match &DEVICES[*major as usize] {
                Some(dev) => (dev.write)(addr, n),
                None => err!(SysError::BadDescriptor),
            },
        }
    }
}

/// Device interface
#[derive(Debug, Clone, Copy)]
pub struct Device {
    pub read: fn(addr: VA, n: usize) -> Result<usize, SysError>,
    pub write: fn(addr: VA, n: usize) -> Result<usize, SysError>,
}

/// Console device major number
pub const CONSOLE: usize = 1;

/// Device table
pub static DEVICES: [Option<Device>; NDEV] = {
    let mut devices = [None; NDEV];
    devices[CONSOLE] = Some(Device {
        read: console::read,
        write: console::write,
    });
    devices
};

/// Open flags, Linux numbering (this kernel speaks the Linux syscall
/// table, so user code passes Linux values).
pub mod open_flags {
    pub const O_RDONLY: usize = 0o0;
    pub const O_WRONLY: usize = 0o1;
    pub const O_RDWR: usize = 0o2;
    pub const O_CREAT: usize = 0o100;
    pub const O_TRUNC: usize = 0o1000;
}
