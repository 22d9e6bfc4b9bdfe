use crate::proc;
use crate::syscall::{SysError, SyscallArgs};

/// clone(2) flag value for a plain SIGCHLD fork.
const SIGCHLD: isize = 17;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let status = args.get_int(0);
    proc::exit(status);
}

pub fn sys_exit_group(args: &SyscallArgs) -> ! {
    // one thread per process, so exit_group is exit
    let status = args.get_int(0);
    proc::exit(status);
}

/// Only the fork-like form is supported: `flags` must be exactly SIGCHLD
/// and the child stack argument is ignored (the child gets a copy of the
/// parent's stack at the same address).
pub fn sys_clone(args: &SyscallArgs) -> Result<usize, SysError> {
    let flags = args.get_int(0);

    if flags != SIGCHLD {
        err!(SysError::InvalidArgument);
    }

    match log!(proc::fork()) {
        Ok(pid) => Ok(*pid),
        Err(_) => Err(SysError::OutOfMemory),
    }
}

/// Only the "wait for any child" form is supported:
/// `wait4(-1, 0, 0, 0)`. Anything else fails.
pub fn sys_wait4(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.get_int(0);
    let wstatus = args.get_addr(1);
    let options = args.get_int(2);
    let rusage = args.get_raw(3);

    if pid != -1 || !wstatus.is_null() || options != 0 || rusage != 0 {
        err!(SysError::InvalidArgument);
    }

    match proc::wait(wstatus) {
        Some(pid) => Ok(*pid),
        None => err!(SysError::NoChildren),
    }
}

/// Adjusts the user memory size by `n` bytes and returns the previous
/// size, sbrk style.
pub fn sys_brk(args: &SyscallArgs) -> Result<usize, SysError> {
    let n = args.get_int(0);
    let addr = args.proc().data().size;

    match unsafe { log!(proc::grow(n)) } {
        Ok(_) => Ok(addr),
        Err(_) => Err(SysError::OutOfMemory),
    }
}

pub fn sys_sched_yield(_args: &SyscallArgs) -> Result<usize, SysError> {
    proc::r#yield();
    Ok(0)
}

/// No thread-exit futexes here; reporting the pid keeps libcs happy.
pub fn sys_set_tid_address(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

/// One thread per process, so the tid is the pid.
pub fn sys_gettid(args: &SyscallArgs) -> Result<usize, SysError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

/// Terminal ioctls are accepted and ignored.
pub fn sys_ioctl(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(0)
}

/// No signals; the mask is accepted and ignored.
pub fn sys_rt_sigprocmask(_args: &SyscallArgs) -> Result<usize, SysError> {
    Ok(0)
}
