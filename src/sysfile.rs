use core::mem;

use alloc::vec::Vec;

use crate::exec::exec;
use crate::file::{FILE_TABLE, File, FileType, open_flags::*};
use crate::fs::{Inode, InodeType, Path, Stat};
use crate::log::Operation;
use crate::param::{MAXARG, NDEV};
use crate::proc::current_proc_and_data_mut;
use crate::syscall::{SysError, SyscallArgs};

/// The "use the current working directory" directory fd.
/// The *at syscalls accept nothing else; there are no directory fds here.
const AT_FDCWD: isize = -100;

/// Allocates a file descriptor for the given file.
/// Takes over the file reference from the caller on success.
fn fd_alloc(file: File) -> Result<usize, SysError> {
    let (_proc, data) = current_proc_and_data_mut();

    for (fd, open_file) in data.open_files.iter_mut().enumerate() {
        if open_file.is_none() {
            *open_file = Some(file);
            return Ok(fd);
        }
    }

    err!(SysError::TooManyFiles)
}

pub fn sys_dup(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_, mut file) = try_log!(args.get_file(0));
    let fd = try_log!(fd_alloc(file.clone()));
    file.dup();
    Ok(fd)
}

pub fn sys_read(args: &SyscallArgs) -> Result<usize, SysError> {
    let addr = args.get_addr(1);
    let n = args.get_int(2);
    let (_, file) = try_log!(args.get_file(0));
    log!(file.read(addr, n as usize))
}

/// An element of the iovec array passed to writev.
const IOVEC_SIZE: usize = 2 * size_of::<usize>();

pub fn sys_writev(args: &SyscallArgs) -> Result<usize, SysError> {
    let iov = args.get_addr(1);
    let iovcnt = args.get_int(2);
    let (_, mut file) = try_log!(args.get_file(0));

    if iovcnt < 0 {
        err!(SysError::InvalidArgument);
    }

    let mut written = 0;

    for i in 0..iovcnt as usize {
        let base = try_log!(args.fetch_int(iov + i * IOVEC_SIZE));
        let len = try_log!(args.fetch_int(iov + i * IOVEC_SIZE + size_of::<usize>()));

        if len == 0 {
            continue;
        }

        match log!(file.write(base.into(), len)) {
            Ok(n) => {
                written += n;
                if n < len {
                    break;
                }
            }
            Err(e) => {
                if written == 0 {
                    return Err(e);
                }
                break;
            }
        }
    }

    Ok(written)
}

pub fn sys_close(args: &SyscallArgs) -> Result<usize, SysError> {
    let (fd, mut file) = try_log!(args.get_file(0));

    let (_proc, data) = current_proc_and_data_mut();

    data.open_files[fd] = None;
    file.close();

    Ok(0)
}

pub fn sys_fstat(args: &SyscallArgs) -> Result<usize, SysError> {
    let addr = args.get_addr(1);
    let (_, file) = try_log!(args.get_file(0));
    match log!(file.stat(addr)) {
        Ok(_) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

pub fn sys_newfstatat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let addr = args.get_addr(2);
    let flags = args.get_int(3);

    if dirfd != AT_FDCWD || flags != 0 {
        err!(SysError::InvalidArgument);
    }

    let Ok(inode) = log!(Path::new(path).resolve()) else {
        err!(SysError::NoEntry);
    };

    let inner = inode.lock();
    let stat = inode.stat(&inner);
    inode.unlock_put(inner);

    let bytes = unsafe {
        core::slice::from_raw_parts(&stat as *const _ as *const u8, size_of::<Stat>())
    };
    try_log!(crate::proc::copy_out_user(bytes, addr));

    Ok(0)
}

pub fn sys_openat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let flags = args.get_raw(2);

    if dirfd != AT_FDCWD {
        err!(SysError::BadDescriptor);
    }

    let path = Path::new(path);

    let _op = Operation::begin();

    let (mut inode, mut inode_inner);

    // create the file, or look it up
    if flags & O_CREAT != 0 {
        (inode, inode_inner) = match log!(Inode::create(&path, InodeType::File, 0, 0)) {
            Ok(v) => v,
            Err(e) => err!(e),
        };
    } else {
        inode = match log!(path.resolve()) {
            Ok(inode) => inode,
            Err(_) => err!(SysError::NoEntry),
        };

        inode_inner = inode.lock();

        // a directory may only be opened read-only
        if inode_inner.r#type == InodeType::Directory && flags & (O_WRONLY | O_RDWR) != 0 {
            inode.unlock_put(inode_inner);
            err!(SysError::IsDirectory);
        }
    }

    if inode_inner.r#type == InodeType::Device && inode_inner.major >= NDEV as u16 {
        inode.unlock_put(inode_inner);
        err!(SysError::NoEntry);
    }

    // allocate a file structure and a descriptor
    let (fd, file) = match log!(File::alloc()) {
        Ok(mut file) => match log!(fd_alloc(file.clone())) {
            Ok(fd) => (fd, file),
            Err(e) => {
                file.close();
                inode.unlock_put(inode_inner);
                return Err(e);
            }
        },
        Err(e) => {
            inode.unlock_put(inode_inner);
            err!(e);
        }
    };

    {
        let mut file_inner = FILE_TABLE.inner[file.id].lock();

        if inode_inner.r#type == InodeType::Device {
            file_inner.r#type = FileType::Device {
                inode: inode.clone(),
                major: inode_inner.major,
            };
        } else {
            file_inner.r#type = FileType::Inode {
                inode: inode.clone(),
            };
            file_inner.offset = 0;
        }

        file_inner.readable = flags & O_WRONLY == 0;
        file_inner.writeable = flags & (O_WRONLY | O_RDWR) != 0;
    }

    if flags & O_TRUNC != 0 && inode_inner.r#type == InodeType::File {
        inode.trunc(&mut inode_inner);
    }

    inode.unlock(inode_inner);

    Ok(fd)
}

pub fn sys_mkdirat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));

    if dirfd != AT_FDCWD {
        err!(SysError::BadDescriptor);
    }

    let _op = Operation::begin();

    let Ok((inode, inode_inner)) =
        log!(Inode::create(&Path::new(path), InodeType::Directory, 0, 0))
    else {
        err!(SysError::AlreadyExists);
    };

    inode.unlock_put(inode_inner);

    Ok(0)
}

pub fn sys_mknodat(args: &SyscallArgs) -> Result<usize, SysError> {
    let dirfd = args.get_int(0);
    let path = try_log!(args.get_str(1));
    let dev = args.get_raw(3);

    if dirfd != AT_FDCWD {
        err!(SysError::BadDescriptor);
    }

    let major = ((dev >> 8) & 0xfff) as u16;
    let minor = (dev & 0xff) as u16;

    let _op = Operation::begin();

    let Ok((inode, inner)) = log!(Inode::create(
        &Path::new(path),
        InodeType::Device,
        major,
        minor
    )) else {
        err!(SysError::AlreadyExists);
    };

    inode.unlock_put(inner);

    Ok(0)
}

pub fn sys_chdir(args: &SyscallArgs) -> Result<usize, SysError> {
    let (_proc, data) = current_proc_and_data_mut();

    let _op = Operation::begin();

    let path = try_log!(args.get_str(0));

    let Ok(inode) = log!(Path::new(path).resolve()) else {
        err!(SysError::NoEntry);
    };

    let inner = inode.lock();

    if inner.r#type != InodeType::Directory {
        inode.unlock_put(inner);
        err!(SysError::NotDirectory);
    }

    inode.unlock(inner);

    let old_cwd = mem::replace(&mut data.cwd, Some(inode));
    if let Some(old_cwd) = old_cwd {
        old_cwd.put();
    }

    Ok(0)
}

pub fn sys_execve(args: &SyscallArgs) -> Result<usize, SysError> {
    let path = try_log!(args.get_str(0));
    let uargv = args.get_addr(1);
    // the environment pointer (argument 2) is accepted and ignored

    let mut argv: Vec<&str> = Vec::with_capacity(MAXARG);

    for i in 0..MAXARG {
        // fetch the pointer argv[i] from user space
        let uarg = try_log!(args.fetch_int(uargv + i * size_of::<usize>()));

        if uarg == 0 {
            break; // NULL terminator
        }

        argv.push(try_log!(args.fetch_str(uarg.into())));
    }

    match log!(exec(&Path::new(path), &argv)) {
        Ok(argc) => Ok(argc),
        Err(_) => err!(SysError::NoEntry),
    }
}
