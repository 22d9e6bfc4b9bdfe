//! Boot-time self tests, compiled in with the `selftest` feature.
//!
//! These run on the boot CPU after device init but before the first
//! process exists, so they can only exercise what works without the
//! scheduler: the process table and its allocator, pid minting, syscall
//! decoding, and error encoding. Each case prints its name and `[ok]`;
//! the machine powers off once everything has passed.

use alloc::vec::Vec;

use crate::param::NPROC;
use crate::proc::{Channel, PROC_TABLE, Pid, ProcState};
use crate::psci;
use crate::syscall::{SysError, Syscall};

pub fn run() {
    println!("selftest: start");

    pids_increase();
    slot_alloc_and_free();
    full_table_refuses();
    syscall_decode();
    error_encoding();
    channel_identity();

    println!("selftest: all passed");
    psci::system_off();
}

fn pids_increase() {
    let a = Pid::alloc();
    let b = Pid::alloc();
    let c = Pid::alloc();

    assert!(*a < *b && *b < *c);

    println!("pids_increase [ok]");
}

fn slot_alloc_and_free() {
    let (proc, inner) = PROC_TABLE.alloc().expect("slot alloc");

    assert_eq!(inner.state, ProcState::Embryo);
    assert!(*inner.pid > 0);
    assert!(proc.data().kstack.is_some());
    assert!(!proc.data().trapframe.is_null());
    assert!(!proc.data().context.is_null());

    // the initial context must land the first switch in fork_ret
    let context = unsafe { &*proc.data().context };
    assert_ne!(context.x30, 0);

    proc.free(inner);

    let inner = proc.inner.lock();
    assert_eq!(inner.state, ProcState::Unused);
    assert_eq!(*inner.pid, 0);
    assert!(proc.data().kstack.is_none());
    assert!(proc.data().trapframe.is_null());

    println!("slot_alloc_and_free [ok]");
}

fn full_table_refuses() {
    let mut held = Vec::new();

    // claim every slot (dropping the guards keeps the slots allocated)
    while let Ok((proc, guard)) = PROC_TABLE.alloc() {
        drop(guard);
        held.push(proc);
    }

    assert_eq!(held.len(), NPROC);

    // a full table must refuse without changing any slot
    assert!(PROC_TABLE.alloc().is_err());
    for proc in &held {
        assert_eq!(proc.inner.lock().state, ProcState::Embryo);
    }

    for proc in held {
        let guard = proc.inner.lock();
        proc.free(guard);
    }

    println!("full_table_refuses [ok]");
}

fn syscall_decode() {
    assert_eq!(Syscall::try_from(221), Ok(Syscall::Execve));
    assert_eq!(Syscall::try_from(220), Ok(Syscall::Clone));
    assert_eq!(Syscall::try_from(260), Ok(Syscall::Wait4));
    assert_eq!(Syscall::try_from(124), Ok(Syscall::SchedYield));
    assert_eq!(Syscall::try_from(93), Ok(Syscall::Exit));
    assert_eq!(Syscall::try_from(214), Ok(Syscall::Brk));

    assert_eq!(Syscall::try_from(0), Err(SysError::NotImplemented));
    assert_eq!(Syscall::try_from(usize::MAX), Err(SysError::NotImplemented));

    println!("syscall_decode [ok]");
}

fn error_encoding() {
    assert_eq!(SysError::NoChildren.as_code(), 10);
    assert_eq!(SysError::BadAddress.as_code(), 14);
    assert_eq!(SysError::InvalidArgument.as_code(), 22);

    // the value user space sees
    let encoded = -(SysError::NoChildren.as_code() as isize) as usize;
    assert_eq!(encoded as isize, -10);

    println!("error_encoding [ok]");
}

fn channel_identity() {
    assert_eq!(Channel::Proc(3), Channel::Proc(3));
    assert_ne!(Channel::Proc(3), Channel::Proc(4));
    assert_ne!(Channel::Proc(3), Channel::Ticks);
    assert_ne!(Channel::Buffer(0x40), Channel::Lock(0x40));

    println!("channel_identity [ok]");
}
