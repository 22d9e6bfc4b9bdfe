use core::fmt::Display;
use core::str;

use crate::file::File;
use crate::fs::FsError;
use crate::param::NOFILE;
use crate::proc::{Proc, TrapFrame, current_proc, user_slice};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::VA;

/// Syscall error codes using POSIX-standard numeric values.
///
/// The kernel encodes `-(code)` in the return register (`x0`); a libc
/// decodes that back into errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SysError {
    NoEntry = 2,
    Interrupted = 4,
    IoError = 5,
    BadDescriptor = 9,
    NoChildren = 10,
    OutOfMemory = 12,
    BadAddress = 14,
    AlreadyExists = 17,
    NotDirectory = 20,
    IsDirectory = 21,
    InvalidArgument = 22,
    FileTableFull = 23,
    TooManyFiles = 24,
    NoSpace = 28,
    NotImplemented = 38,
    NotEmpty = 39,
}

impl SysError {
    /// Returns the numeric code for this error.
    pub fn as_code(self) -> u16 {
        self as u16
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NoEntry => write!(f, "no such file or directory"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::IoError => write!(f, "input/output error"),
            SysError::BadDescriptor => write!(f, "bad file descriptor"),
            SysError::NoChildren => write!(f, "no child processes"),
            SysError::OutOfMemory => write!(f, "cannot allocate memory"),
            SysError::BadAddress => write!(f, "bad address"),
            SysError::AlreadyExists => write!(f, "file exists"),
            SysError::NotDirectory => write!(f, "not a directory"),
            SysError::IsDirectory => write!(f, "is a directory"),
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::FileTableFull => write!(f, "too many open files in system"),
            SysError::TooManyFiles => write!(f, "too many open files"),
            SysError::NoSpace => write!(f, "no space left on device"),
            SysError::NotImplemented => write!(f, "function not implemented"),
            SysError::NotEmpty => write!(f, "directory not empty"),
        }
    }
}

impl From<FsError> for SysError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::OutOfBlock | FsError::OutOfInode => SysError::NoSpace,
            FsError::OutOfFile => SysError::FileTableFull,
            FsError::OutOfRange => SysError::InvalidArgument,
            FsError::Read | FsError::Write => SysError::IoError,
            FsError::Create => SysError::NoSpace,
            FsError::Link => SysError::AlreadyExists,
            FsError::Resolve => SysError::NoEntry,
            FsError::Type => SysError::InvalidArgument,
            FsError::Copy => SysError::BadAddress,
        }
    }
}

/// Typed access to system call arguments.
///
/// The caller's registers arrive in the trap frame: the syscall number in
/// `x8`, arguments 0..=3 in `x1`..`x4`, and the return value goes back out
/// through `x0`. While the kernel runs on behalf of this process its page
/// table stays live, so a user pointer is directly dereferenceable; the
/// bounds check against `proc.size` is the only safety barrier.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &'static Proc {
        self.proc
    }

    /// Returns raw argument `index`. Asking for an argument past the
    /// marshalling registers is a kernel bug.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.x1,
            1 => self.trapframe.x2,
            2 => self.trapframe.x3,
            3 => self.trapframe.x4,
            _ => panic!("syscall argument index {}", index),
        }
    }

    /// Returns argument `index` as a signed integer.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns argument `index` as a user virtual address.
    ///
    /// No legality check here; the users of the address bounds-check it.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Returns argument `index` as a user address after checking that
    /// `[addr, addr + size)` lies inside the process's memory.
    pub fn get_ptr(&self, index: usize, size: usize) -> Result<VA, SysError> {
        let addr = self.get_addr(index);
        try_log!(user_slice(addr, size));
        Ok(addr)
    }

    /// Reads a 64-bit word from user memory.
    pub fn fetch_int(&self, addr: VA) -> Result<usize, SysError> {
        let bytes = try_log!(user_slice(addr, size_of::<usize>()));
        Ok(usize::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Returns the NUL-terminated string at `addr`, borrowed straight from
    /// user memory. Fails if no NUL appears before the end of the
    /// process's memory.
    pub fn fetch_str(&self, addr: VA) -> Result<&'static str, SysError> {
        let size = self.proc.data().size;

        if addr.as_usize() >= size {
            err!(SysError::BadAddress);
        }

        let bytes = try_log!(user_slice(addr, size - addr.as_usize()));

        let Some(len) = bytes.iter().position(|&c| c == 0) else {
            err!(SysError::BadAddress);
        };

        str::from_utf8(&bytes[..len]).or(Err(SysError::InvalidArgument))
    }

    /// Returns argument `index` as a user string.
    pub fn get_str(&self, index: usize) -> Result<&'static str, SysError> {
        self.fetch_str(self.get_addr(index))
    }

    /// Returns argument `index` as a file descriptor along with the
    /// corresponding open `File`.
    pub fn get_file(&self, index: usize) -> Result<(usize, File), SysError> {
        let fd: usize = try_log!(
            self.get_int(index)
                .try_into()
                .or(Err(SysError::BadDescriptor))
        );

        if fd >= NOFILE {
            err!(SysError::BadDescriptor);
        }

        if let Some(file) = &current_proc().data().open_files[fd] {
            return Ok((fd, file.clone()));
        }

        err!(SysError::BadDescriptor);
    }
}

/// System call numbers, following the Linux AArch64 table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Dup = 23,
    Ioctl = 29,
    MknodAt = 33,
    MkdirAt = 34,
    Chdir = 49,
    OpenAt = 56,
    Close = 57,
    Read = 63,
    Writev = 66,
    NewFstatAt = 79,
    Fstat = 80,
    Exit = 93,
    ExitGroup = 94,
    SetTidAddress = 96,
    SchedYield = 124,
    RtSigprocmask = 135,
    GetTid = 178,
    Brk = 214,
    Clone = 220,
    Execve = 221,
    Wait4 = 260,
}

impl TryFrom<usize> for Syscall {
    type Error = SysError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            23 => Ok(Syscall::Dup),
            29 => Ok(Syscall::Ioctl),
            33 => Ok(Syscall::MknodAt),
            34 => Ok(Syscall::MkdirAt),
            49 => Ok(Syscall::Chdir),
            56 => Ok(Syscall::OpenAt),
            57 => Ok(Syscall::Close),
            63 => Ok(Syscall::Read),
            66 => Ok(Syscall::Writev),
            79 => Ok(Syscall::NewFstatAt),
            80 => Ok(Syscall::Fstat),
            93 => Ok(Syscall::Exit),
            94 => Ok(Syscall::ExitGroup),
            96 => Ok(Syscall::SetTidAddress),
            124 => Ok(Syscall::SchedYield),
            135 => Ok(Syscall::RtSigprocmask),
            178 => Ok(Syscall::GetTid),
            214 => Ok(Syscall::Brk),
            220 => Ok(Syscall::Clone),
            221 => Ok(Syscall::Execve),
            260 => Ok(Syscall::Wait4),
            _ => Err(SysError::NotImplemented),
        }
    }
}

/// Handles a system call.
///
/// # Safety
/// Called from `usertrap` in trap.rs with the process's trap frame.
#[unsafe(no_mangle)]
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    let result = match Syscall::try_from(trapframe.x8) {
        Ok(syscall) => match syscall {
            Syscall::Dup => sys_dup(&args),
            Syscall::Ioctl => sys_ioctl(&args),
            Syscall::MknodAt => sys_mknodat(&args),
            Syscall::MkdirAt => sys_mkdirat(&args),
            Syscall::Chdir => sys_chdir(&args),
            Syscall::OpenAt => sys_openat(&args),
            Syscall::Close => sys_close(&args),
            Syscall::Read => sys_read(&args),
            Syscall::Writev => sys_writev(&args),
            Syscall::NewFstatAt => sys_newfstatat(&args),
            Syscall::Fstat => sys_fstat(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::ExitGroup => sys_exit_group(&args),
            Syscall::SetTidAddress => sys_set_tid_address(&args),
            Syscall::SchedYield => sys_sched_yield(&args),
            Syscall::RtSigprocmask => sys_rt_sigprocmask(&args),
            Syscall::GetTid => sys_gettid(&args),
            Syscall::Brk => sys_brk(&args),
            Syscall::Clone => sys_clone(&args),
            Syscall::Execve => sys_execve(&args),
            Syscall::Wait4 => sys_wait4(&args),
        },
        Err(e) => {
            println!(
                "unknown sys call {} from proc {} ({})",
                trapframe.x8,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            Err(e)
        }
    };

    trapframe.x0 = match log!(result) {
        Ok(v) => v,
        Err(error) => {
            #[cfg(debug_assertions)]
            println!(
                "! syscall error ({}) from proc {} ({})",
                error,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            (-(error.as_code() as isize)) as usize
        }
    };
}
