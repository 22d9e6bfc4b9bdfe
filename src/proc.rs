use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, size_of, transmute};
use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::string::String;

use crate::arm::{PGSIZE, PTE_UXN, interrupts, registers::mpidr};
use crate::error::KernelError;
use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::kalloc::Page;
use crate::log::Operation;
use crate::param::{NCPU, NOFILE, NPROC, ROOTDEV};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::swtch;
use crate::sync::OnceLock;
use crate::syscall::SysError;
use crate::trap::usertrapret;
use crate::vm::{Uvm, VA, kvm_switch};

pub static CPU_TABLE: CpuTable = CpuTable::new();
pub static PROC_TABLE: ProcTable = ProcTable::new();
pub static INIT_PROC: OnceLock<&Proc> = OnceLock::new();

/// A user program that calls execve("/init", argv, 0) through the trap
/// path, then exits if that fails.
/// od -t xC initcode
static INITCODE: [u8; 64] = [
    0x41, 0x01, 0x00, 0x10, // adr x1, path
    0x62, 0x01, 0x00, 0x10, // adr x2, argv
    0xa8, 0x1b, 0x80, 0xd2, // mov x8, #221 (execve)
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0xa8, 0x0b, 0x80, 0xd2, // mov x8, #93 (exit)
    0x01, 0x00, 0x80, 0xd2, // mov x1, #0
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0x00, 0x00, 0x00, 0x14, // b .
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x00, // "/init"
    0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[0] -> path
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // argv[1] = 0
];

/// Per-CPU state
pub struct Cpu {
    pub proc: Option<&'static Proc>,
    /// the scheduler context, saved on the boot stack by the last swtch
    /// away from the scheduler loop
    pub scheduler: *mut Context,
    pub num_off: isize,
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            scheduler: ptr::null_mut(),
            num_off: 0,
            interrupts_enabled: false,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    pub fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            interrupts::enable();
        }
    }
}

/// Table of CPUs
pub struct CpuTable([UnsafeCell<Cpu>; NCPU]);

impl CpuTable {
    const fn new() -> Self {
        Self([const { UnsafeCell::new(Cpu::new()) }; NCPU])
    }
}

unsafe impl Sync for CpuTable {}

/// A lock that releases the CPU lock when dropped.
#[derive(Debug)]
pub struct InterruptLock;

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // Safety: we are still holding the CPU lock
        unsafe { current_cpu().unlock() }
    }
}

/// Returns the id of the current CPU.
///
/// # Safety
/// Must be called with interrupts disabled to prevent a race with the
/// process being moved to a different CPU.
#[inline]
pub unsafe fn current_cpu_id() -> usize {
    mpidr::id()
}

/// Returns a mutable reference to the current CPU's [`Cpu`] struct.
///
/// # Safety
/// Must be called with interrupts disabled to prevent a race with the
/// process being moved to a different CPU.
pub unsafe fn current_cpu() -> &'static mut Cpu {
    unsafe {
        assert!(!interrupts::get(), "current_cpu interrupts enabled");
        let id = current_cpu_id();
        &mut *CPU_TABLE.0[id].get()
    }
}

/// Locks this CPU by disabling interrupts.
/// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    unsafe { current_cpu().lock(old_state) }
}

/// Returns a reference to this CPU's [`Proc`], if any.
pub fn current_proc_opt() -> Option<&'static Proc> {
    let _lock = lock_current_cpu();

    let cpu = unsafe { current_cpu() };
    cpu.proc
}

/// Returns a reference to this CPU's [`Proc`].
/// Panics if there is no current process.
pub fn current_proc() -> &'static Proc {
    current_proc_opt().expect("no current process")
}

/// Returns a shared reference to this CPU's [`Proc`] and its [`ProcData`].
pub fn current_proc_and_data() -> (&'static Proc, &'static ProcData) {
    let proc = current_proc();
    let data = proc.data();
    (proc, data)
}

/// Returns a shared reference to this CPU's [`Proc`] and an exclusive
/// reference to its [`ProcData`].
pub fn current_proc_and_data_mut() -> (&'static Proc, &'static mut ProcData) {
    let proc = current_proc();
    // Safety: we are the current proc
    let data = unsafe { proc.data_mut() };
    (proc, data)
}

/// Callee-saved registers for kernel context switches.
///
/// swtch pushes this onto the kernel stack of the thread being suspended;
/// `Proc.data.context` and `Cpu.scheduler` record where. The layout must
/// match the stores in swtch.rs.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    /*   0 */ pub x19: usize,
    /*   8 */ pub x20: usize,
    /*  16 */ pub x21: usize,
    /*  24 */ pub x22: usize,
    /*  32 */ pub x23: usize,
    /*  40 */ pub x24: usize,
    /*  48 */ pub x25: usize,
    /*  56 */ pub x26: usize,
    /*  64 */ pub x27: usize,
    /*  72 */ pub x28: usize,
    /*  80 */ pub x29: usize,
    /*  88 */ pub x30: usize, // return address
}

impl Context {
    pub const fn new() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            x30: 0,
        }
    }
}

/// The user-mode register snapshot, living at the top of the process's
/// kernel stack while the process is in the kernel. The EL0 vector entry
/// in trap.rs fills it; userret drains it. Offsets must match that code.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    /*   0 */ pub x0: usize,
    /*   8 */ pub x1: usize,
    /*  16 */ pub x2: usize,
    /*  24 */ pub x3: usize,
    /*  32 */ pub x4: usize,
    /*  40 */ pub x5: usize,
    /*  48 */ pub x6: usize,
    /*  56 */ pub x7: usize,
    /*  64 */ pub x8: usize, // syscall number
    /*  72 */ pub x9: usize,
    /*  80 */ pub x10: usize,
    /*  88 */ pub x11: usize,
    /*  96 */ pub x12: usize,
    /* 104 */ pub x13: usize,
    /* 112 */ pub x14: usize,
    /* 120 */ pub x15: usize,
    /* 128 */ pub x16: usize,
    /* 136 */ pub x17: usize,
    /* 144 */ pub x18: usize,
    /* 152 */ pub x19: usize,
    /* 160 */ pub x20: usize,
    /* 168 */ pub x21: usize,
    /* 176 */ pub x22: usize,
    /* 184 */ pub x23: usize,
    /* 192 */ pub x24: usize,
    /* 200 */ pub x25: usize,
    /* 208 */ pub x26: usize,
    /* 216 */ pub x27: usize,
    /* 224 */ pub x28: usize,
    /* 232 */ pub x29: usize,
    /* 240 */ pub x30: usize,
    /* 248 */ pub sp: usize, // user stack pointer (sp_el0)
    /* 256 */ pub elr: usize, // user program counter (elr_el1)
    /* 264 */ pub spsr: usize, // saved program status
}

/// Wrapper around usize to represent process IDs.
/// Must be created with `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    /// Allocates a new PID by incrementing a global counter.
    /// PIDs are strictly increasing within one boot.
    pub fn alloc() -> Self {
        static PID_COUNT: AtomicUsize = AtomicUsize::new(1);
        Pid(PID_COUNT.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a PID from a usize.
    ///
    /// # Safety
    /// The caller must ensure the `Pid` has already been allocated via
    /// `Pid::alloc()`.
    pub unsafe fn from_usize(value: usize) -> Self {
        Pid(value)
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Channel identity for `sleep`/`wakeup`. Compared for equality, never
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// `proc.id`, used by wait/exit
    Proc(usize),
    /// system ticks
    Ticks,
    /// an I/O buffer address
    Buffer(usize),
    /// a sleep lock address
    Lock(usize),
    /// the file system log
    Log,
}

/// The state of a process.
#[derive(Debug, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    /// allocated, still being set up
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Fields shared with other processes.
///
/// The process lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    /// process state
    pub state: ProcState,
    /// if Some, sleeping on this channel
    pub channel: Option<Channel>,
    /// if true, another process asked for this one to die
    pub killed: bool,
    /// exit status to be returned to the parent's wait
    pub xstate: isize,
    /// process ID
    pub pid: Pid,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            channel: None,
            killed: false,
            xstate: 0,
            pid: Pid(0),
        }
    }
}

/// Fields private to the process; no lock needed.
#[derive(Debug)]
pub struct ProcData {
    /// kernel-mode stack page
    pub kstack: Option<Box<Page>>,
    /// size of user memory (bytes); user addresses are [0, size)
    pub size: usize,
    /// user address space
    pub pagetable: Option<Uvm>,
    /// the user register snapshot, at the top of kstack
    pub trapframe: *mut TrapFrame,
    /// the saved kernel context, on kstack while suspended
    pub context: *mut Context,
    /// open files
    pub open_files: [Option<File>; NOFILE],
    /// current directory
    pub cwd: Option<Inode>,
    /// process name (debugging)
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: None,
            size: 0,
            pagetable: None,
            trapframe: ptr::null_mut(),
            context: ptr::null_mut(),
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: String::new(),
        }
    }

    /// Returns a reference to the trap frame.
    pub fn trapframe(&self) -> &TrapFrame {
        unsafe { &*self.trapframe }
    }

    /// Returns a mutable reference to the trap frame.
    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        unsafe { &mut *self.trapframe }
    }

    /// Returns a reference to the user page table.
    pub fn pagetable(&self) -> &Uvm {
        self.pagetable.as_ref().unwrap()
    }

    /// Returns a mutable reference to the user page table.
    pub fn pagetable_mut(&mut self) -> &mut Uvm {
        self.pagetable.as_mut().unwrap()
    }
}

unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

/// Process control block
#[derive(Debug)]
pub struct Proc {
    /// NOT `Pid`. Index into `PROC_TABLE`, also used by the parents table.
    pub id: usize,
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new(id: usize) -> Self {
        Self {
            id,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the process's private data.
    ///
    /// # Safety
    /// The caller must have exclusive access to the `Proc`: either it is
    /// the current process, or the slot has not been made runnable yet
    /// (fork, alloc), or it is a zombie being reaped under `wait_lock`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Returns true if this process is the init process.
    pub fn is_init_proc(&self) -> bool {
        INIT_PROC.get().is_some_and(|init| ptr::eq(self, *init))
    }

    /// Returns true if this process has been killed.
    ///
    /// Acquires and releases the proc lock.
    pub fn is_killed(&self) -> bool {
        let inner = self.inner.lock();
        inner.killed
    }

    /// Frees the process and everything hanging from it: kernel stack,
    /// user pages, file references. Leaves the slot Unused.
    pub fn free(&self, mut inner: SpinLockGuard<'_, ProcInner>) {
        // Safety: only the reaper (or the failed allocator) reaches here,
        // and the process no longer runs
        let data = unsafe { self.data_mut() };

        data.kstack.take();
        data.trapframe = ptr::null_mut();
        data.context = ptr::null_mut();

        if let Some(pagetable) = data.pagetable.take() {
            pagetable.free(data.size);
        }
        data.size = 0;

        // exit already closed the files and dropped cwd; clear the slots
        for file in &mut data.open_files {
            *file = None;
        }
        data.cwd = None;

        data.name.clear();
        inner.pid = Pid(0);
        inner.channel = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcState::Unused;
    }
}

/// Table of processes
pub struct ProcTable {
    pub table: [UnsafeCell<Proc>; NPROC],
    /// The parent of each slot, by slot index, all behind one lock.
    /// Serializes every parent/child observation: reparenting, reaping,
    /// and the wait/exit handshake.
    pub parents: SpinLock<[Option<usize>; NPROC]>,
}

unsafe impl Sync for ProcTable {}

impl ProcTable {
    pub const fn new() -> Self {
        let mut table: [MaybeUninit<UnsafeCell<Proc>>; NPROC] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let mut i = 0;
        while i < NPROC {
            table[i] = MaybeUninit::new(UnsafeCell::new(Proc::new(i)));
            i += 1;
        }

        Self {
            table: unsafe {
                transmute::<[MaybeUninit<UnsafeCell<Proc>>; NPROC], [UnsafeCell<Proc>; NPROC]>(
                    table,
                )
            },
            parents: SpinLock::new([None; NPROC], "parents"),
        }
    }

    /// Returns a reference to the process at the given index.
    pub fn get(&self, index: usize) -> &Proc {
        unsafe { &*self.table[index].get() }
    }

    /// Returns an iterator over all processes.
    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        (0..NPROC).map(|i| self.get(i))
    }

    /// Searches the table for an Unused slot. If found, allocates the
    /// kernel stack, carves the trap frame and the initial context at its
    /// top, and returns the slot with its lock still held. The caller
    /// fills in the rest (page table, trap frame contents, name, parent)
    /// and releases the lock.
    pub fn alloc(&self) -> Result<(&Proc, SpinLockGuard<'_, ProcInner>), KernelError> {
        for proc in self.iter() {
            let mut inner = proc.inner.lock();

            if inner.state == ProcState::Unused {
                inner.pid = Pid::alloc();
                inner.state = ProcState::Embryo;

                // Safety: proc is not yet runnable, so we are the only
                // ones with access to it
                let data = unsafe { proc.data_mut() };

                let kstack = match log!(Box::<Page>::try_new_zeroed()) {
                    Ok(kstack) => unsafe { kstack.assume_init() },
                    Err(_) => {
                        proc.free(inner);
                        return Err(KernelError::Alloc);
                    }
                };

                let top = (&raw const kstack.0 as usize) + PGSIZE;
                let trapframe = (top - size_of::<TrapFrame>()) as *mut TrapFrame;
                let context = (top - size_of::<TrapFrame>() - size_of::<Context>()) as *mut Context;

                data.kstack = Some(kstack);
                data.trapframe = trapframe;
                data.context = context;

                // the first swtch into this slot "returns" into fork_ret
                unsafe {
                    context.write(Context::new());
                    (*context).x30 = fork_ret as *const () as usize;
                }

                return Ok((proc, inner));
            }
        }

        err!(KernelError::OutOfProc)
    }
}

/// Initializes the process table.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    println!("proc init");
}

/// Sets up the first user process.
pub fn user_init() {
    let (proc, mut inner) = PROC_TABLE.alloc().expect("user_init alloc");
    INIT_PROC.initialize(|| Ok::<_, ()>(proc));

    // Safety: during initialization we are the only ones with access
    let data = unsafe { proc.data_mut() };

    let mut pagetable = Uvm::try_new().expect("user_init pagetable");
    pagetable
        .init_code(&INITCODE)
        .expect("user_init initcode");
    data.pagetable = Some(pagetable);
    data.size = PGSIZE;

    // the first return to user space jumps to the bootstrap at address 0
    // with the stack pointer one page up
    let trapframe = data.trapframe_mut();
    trapframe.elr = 0;
    trapframe.sp = PGSIZE;

    data.name.push_str("initcode");
    data.cwd = Some(Path::new("/").resolve().expect("root path to exist"));

    inner.state = ProcState::Runnable;

    // inner lock is dropped
}

/// Grows or shrinks user memory by `n` bytes.
/// The new size is reflected in `proc.data.size`.
///
/// # Safety
/// The caller must ensure exclusive access to the process's memory.
pub unsafe fn grow(n: isize) -> Result<usize, KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    let mut size = data.size;

    if n > 0 {
        size = try_log!(data.pagetable_mut().alloc(size, size + (n as usize), PTE_UXN));
    } else if n < 0 {
        let shrink = (-n) as usize;
        if shrink > size {
            err!(KernelError::InvalidArgument);
        }

        size = data.pagetable_mut().dealloc(size, size - shrink);
    }

    data.size = size;
    Ok(size)
}

/// Creates a new process, copying the parent.
/// The child returns from the `fork()` system call with 0, the parent with
/// the child's pid.
pub fn fork() -> Result<Pid, KernelError> {
    let (proc, data) = current_proc_and_data_mut();

    let (new_proc, new_inner) = try_log!(PROC_TABLE.alloc());
    // Safety: new_proc is not yet runnable, so we are the only ones with
    // access to it
    let new_data = unsafe { new_proc.data_mut() };

    // fresh address space, then a deep copy of the parent's user memory
    let mut pagetable = match log!(Uvm::try_new()) {
        Ok(pagetable) => pagetable,
        Err(err) => {
            new_proc.free(new_inner);
            return Err(err.into());
        }
    };

    let size = data.size;
    if let Err(err) = log!(data.pagetable_mut().copy(&mut pagetable, size)) {
        pagetable.free(0);
        new_proc.free(new_inner);
        return Err(err.into());
    }

    new_data.pagetable = Some(pagetable);
    new_data.size = data.size;

    // copy saved user registers; fork returns 0 in the child
    unsafe {
        *new_data.trapframe = *data.trapframe;
        (*new_data.trapframe).x0 = 0;
    }

    // increment reference counts on open file descriptors
    for (i, file) in data.open_files.iter_mut().enumerate() {
        if let Some(file) = file.as_mut() {
            new_data.open_files[i] = Some(file.dup());
        }
    }
    new_data.cwd = data.cwd.as_ref().map(|cwd| cwd.dup());

    new_data.name = data.name.clone();

    let pid = new_inner.pid;

    // drop the child's lock before taking the parents lock
    drop(new_inner);

    {
        let mut parents = PROC_TABLE.parents.lock();
        parents[new_proc.id] = Some(proc.id);
    }

    // re-acquire the child's lock to publish it
    let mut new_inner = new_proc.inner.lock();
    new_inner.state = ProcState::Runnable;

    Ok(pid)
}

/// Passes `original`'s abandoned children to init.
pub fn reparent(original: &Proc, parents: &mut SpinLockGuard<'_, [Option<usize>; NPROC]>) {
    let init = INIT_PROC.get().expect("init proc");

    for parent in parents.iter_mut() {
        if *parent == Some(original.id) {
            *parent = Some(init.id);
            wakeup(Channel::Proc(init.id));
        }
    }
}

/// Exits the current process; does not return.
///
/// An exited process stays a zombie until its parent calls `wait`.
pub fn exit(status: isize) -> ! {
    let (proc, data) = current_proc_and_data_mut();
    assert!(!proc.is_init_proc(), "init exiting");

    // close all open files
    for file in &mut data.open_files {
        if let Some(mut file) = file.take() {
            file.close();
        }
    }

    if let Some(cwd) = data.cwd.take() {
        let _op = Operation::begin();
        cwd.put();
    }

    let mut parents = PROC_TABLE.parents.lock();

    // give any children to init
    reparent(proc, &mut parents);

    // the parent might be sleeping in wait
    let parent_id = parents[proc.id].expect("exit no parent");
    wakeup(Channel::Proc(parent_id));

    let mut inner = proc.inner.lock();
    inner.xstate = status;
    inner.state = ProcState::Zombie;

    // unlock parents
    drop(parents);

    sched(inner, &mut data.context);

    unreachable!("zombie exit");
}

/// Waits for a child process to exit; returns its pid, or None if there
/// are no children. If `addr` is non-null, the child's exit status is
/// stored there.
pub fn wait(addr: VA) -> Option<Pid> {
    let proc = current_proc();

    // serializes with each child's exit
    let mut parents = PROC_TABLE.parents.lock();

    loop {
        let mut have_kids = false;

        // scan the table looking for exited children
        for child in PROC_TABLE.iter() {
            if parents[child.id] == Some(proc.id) {
                // the lock ensures the child is not still in exit/swtch
                let inner = child.inner.lock();

                have_kids = true;

                if inner.state == ProcState::Zombie {
                    let pid = inner.pid;

                    if !addr.is_null() {
                        let xstate = inner.xstate as i32;
                        copy_out_user(&xstate.to_le_bytes(), addr).expect("wait copy out xstate");
                    }

                    // dissolve the parent relationship and free the slot
                    parents[child.id] = None;
                    child.free(inner);

                    return Some(pid);
                }
            }
        }

        // no point waiting if we don't have any children
        if !have_kids || proc.is_killed() {
            return None;
        }

        // wait for a child to exit
        parents = sleep(Channel::Proc(proc.id), parents);
    }
}

/// Per-CPU process scheduler.
/// Each CPU calls `scheduler` after setting itself up; it never returns.
/// It loops, picking a runnable process, switching into it, and taking
/// control back when that process suspends itself via `sched`.
///
/// # Safety
/// Must be called with interrupts disabled, once per CPU.
pub unsafe fn scheduler() -> ! {
    // the cpu reference is stable; the scheduler never migrates
    let cpu = unsafe { current_cpu() };

    cpu.proc.take();

    loop {
        // the most recent process may have had interrupts turned off;
        // enable them briefly so pending device interrupts (and wakeups)
        // can land, then turn them off again before scanning
        interrupts::enable();
        interrupts::disable();

        let mut found = false;

        for proc in PROC_TABLE.iter() {
            let mut inner = proc.inner.lock();

            if inner.state == ProcState::Runnable {
                // switch to the chosen process. it releases its lock and
                // reacquires it before jumping back here.
                inner.state = ProcState::Running;
                cpu.proc.replace(proc);

                let data = proc.data();
                data.pagetable().switch();

                unsafe { swtch(&mut cpu.scheduler, data.context) };

                kvm_switch();

                // the process is done running for now; it changed its
                // state before coming back
                cpu.proc.take();
                found = true;
            }
        }

        if !found {
            // nothing to run; idle until an interrupt
            unsafe { asm!("wfi") };
        }
    }
}

/// Switches to the scheduler.
///
/// The caller must hold exactly `proc.inner` (so `num_off` is 1) and must
/// already have moved the process out of Running. Saves and restores
/// `interrupts_enabled` because it is a property of this kernel thread,
/// not of the CPU it happens to resume on.
pub fn sched<'a>(
    inner: SpinLockGuard<'a, ProcInner>,
    context: &mut *mut Context,
) -> SpinLockGuard<'a, ProcInner> {
    let cpu = unsafe { current_cpu() };

    assert_eq!(cpu.num_off, 1, "sched locks");
    assert_ne!(inner.state, ProcState::Running, "sched running");
    assert!(!interrupts::get(), "sched interruptible");

    let interrupts_enabled = cpu.interrupts_enabled;
    unsafe { swtch(context, cpu.scheduler) };

    // look the cpu up again; the process may have moved
    let cpu = unsafe { current_cpu() };
    cpu.interrupts_enabled = interrupts_enabled;

    inner
}

/// Gives up the CPU for one scheduling round.
pub fn r#yield() {
    let (proc, data) = current_proc_and_data_mut();

    // the proc lock is held across the switch
    let mut inner = proc.inner.lock();
    inner.state = ProcState::Runnable;

    sched(inner, &mut data.context);
}

/// Entry point for a newly scheduled process.
///
/// Never called directly; proc alloc plants its address in the initial
/// context's saved return register, so the first swtch into the slot lands
/// here with the slot's lock still held by the scheduler.
pub unsafe extern "C" fn fork_ret() -> ! {
    // multiple CPUs may schedule their first process at the same time
    static FIRST: AtomicBool = AtomicBool::new(true);

    // still holding the process lock from the scheduler
    unsafe { current_proc().inner.force_unlock() };

    if FIRST
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // the file system must be initialized in the context of a regular
        // process (it sleeps), so it cannot run from main()
        fs::init(ROOTDEV);
    }

    // return to user space as if coming back from a trap
    usertrapret();
}

/// Atomically releases a condition's lock and sleeps on a channel.
/// Reacquires the condition's lock when awakened.
pub fn sleep<T>(channel: Channel, guard: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    // Acquire the proc lock before releasing the condition lock: wakeup
    // needs the proc lock to inspect state and channel, so once we hold
    // it no wakeup can slip past between the release and the sleep.
    let lock;
    {
        let proc = current_proc();
        let mut inner = proc.inner.lock();

        lock = SpinLock::unlock(guard);

        // go to sleep
        inner.channel = Some(channel);
        inner.state = ProcState::Sleeping;

        // Safety: we are the current proc
        let context = unsafe { &mut proc.data_mut().context };
        inner = sched(inner, context);
        // a wakeup has made us runnable and the scheduler picked us again

        inner.channel = None;
    } // drop the proc lock

    // reacquire the condition lock
    lock.lock()
}

/// Wakes up all processes sleeping on `channel`.
/// Must be called without any proc lock held.
pub fn wakeup(channel: Channel) {
    // the caller may be the scheduler itself, with no current process
    let current = current_proc_opt();

    for proc in PROC_TABLE.iter() {
        if current.is_some_and(|p| ptr::eq(p, proc)) {
            continue;
        }

        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
            inner.state = ProcState::Runnable;
        }
    }
}

/// Kills the process with the given pid.
///
/// The victim won't exit until it next crosses the user/kernel boundary
/// (see usertrap in trap.rs).
pub fn kill(pid: Pid) -> bool {
    for proc in PROC_TABLE.iter() {
        let mut inner = proc.inner.lock();
        if inner.pid == pid {
            inner.killed = true;

            if inner.state == ProcState::Sleeping {
                // wake it from sleep() so it notices
                inner.state = ProcState::Runnable;
            }

            return true;
        }
    }

    false
}

/// Borrows `[va, va + len)` of the current process's memory as a slice.
///
/// The user's pages are mapped in the live page table, so after this
/// bounds check a user address is directly dereferenceable.
pub fn user_slice(va: VA, len: usize) -> Result<&'static [u8], SysError> {
    let size = current_proc().data().size;

    match va.as_usize().checked_add(len) {
        Some(end) if end <= size => Ok(unsafe { slice::from_raw_parts(va.as_ptr(), len) }),
        _ => err!(SysError::BadAddress),
    }
}

/// Mutable variant of [`user_slice`].
pub fn user_slice_mut(va: VA, len: usize) -> Result<&'static mut [u8], SysError> {
    let size = current_proc().data().size;

    match va.as_usize().checked_add(len) {
        Some(end) if end <= size => Ok(unsafe { slice::from_raw_parts_mut(va.as_mut_ptr(), len) }),
        _ => err!(SysError::BadAddress),
    }
}

/// Copies from the kernel into the current process's memory.
pub fn copy_out_user(src: &[u8], dst: VA) -> Result<(), SysError> {
    let dst = try_log!(user_slice_mut(dst, src.len()));
    dst.copy_from_slice(src);
    Ok(())
}

/// Copies from the current process's memory into the kernel.
pub fn copy_in_user(src: VA, dst: &mut [u8]) -> Result<(), SysError> {
    let src = try_log!(user_slice(src, dst.len()));
    dst.copy_from_slice(src);
    Ok(())
}
