use core::arch::global_asm;

use crate::arm::{
    EC_DATA_ABORT_LOWER, EC_INSTR_ABORT_LOWER, EC_SVC64, ESR_EC_SHIFT, SPSR_M_MASK, interrupts,
    registers::{cntfrq, cntp_ctl, cntp_tval, elr, esr, far, mpidr, spsr, vbar},
};
use crate::gic;
use crate::memlayout::{TIMER_IRQ, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::{self, Channel, TrapFrame, current_proc, current_proc_and_data_mut};
use crate::spinlock::SpinLock;
use crate::syscall::syscall;
use crate::uart;
use crate::virtio;

pub static TICKS: SpinLock<usize> = SpinLock::new(0, "ticks");

// The exception vector table and the low-level entry/exit paths.
//
// Exceptions from EL0 arrive with SP_EL1 pointing at the top of the current
// process's kernel stack (userret leaves it there on the way out), so the
// entry code builds the trap frame exactly where proc_alloc carved it.
// Kernel-mode exceptions push a caller-saved frame on whatever kernel stack
// is current, including elr/spsr so that a timer-driven yield can safely
// take further traps.
//
// TrapFrame layout (proc.rs):
//   x0..x30 at 0..240, sp at 248, elr at 256, spsr at 264; 272 bytes.
global_asm!(
    r#"
// Build the trap frame for an exception from EL0 and hand it to usertrap.
.macro el0_entry kind
    sub sp, sp, #272
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    mrs x10, sp_el0
    str x10, [sp, #248]
    mrs x10, elr_el1
    str x10, [sp, #256]
    mrs x10, spsr_el1
    str x10, [sp, #264]

    mov x0, sp
    mov x1, #\kind
    bl usertrap
    // usertrap tail-calls userret; no return
.endm

.balign 2048
.globl vectors
vectors:
    // current EL, SP_EL0: unused
    b .
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .

    // current EL, SP_ELx
.balign 0x80
    b el1_sync
.balign 0x80
    b el1_irq
.balign 0x80
    b .
.balign 0x80
    b .

    // lower EL, aarch64
.balign 0x80
    b el0_sync
.balign 0x80
    b el0_irq
.balign 0x80
    b .
.balign 0x80
    b .

    // lower EL, aarch32: unsupported
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .
.balign 0x80
    b .

el0_sync:
    el0_entry 0

el0_irq:
    el0_entry 1

.globl userret
userret:
    // x0 = trap frame
    mov sp, x0
    ldr x9, [sp, #248]
    msr sp_el0, x9
    ldr x9, [sp, #256]
    msr elr_el1, x9
    ldr x9, [sp, #264]
    msr spsr_el1, x9
    ldp x0, x1, [sp, #0]
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    add sp, sp, #272
    eret

// Save the caller-saved registers around a kernel-mode trap. elr/spsr are
// saved too, so a yield from the timer path can take further traps.
.macro el1_entry kind
    sub sp, sp, #192
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x29, [sp, #144]
    str x30, [sp, #160]
    mrs x10, elr_el1
    mrs x11, spsr_el1
    stp x10, x11, [sp, #168]

    mov x0, #\kind
    bl kerneltrap

    ldp x10, x11, [sp, #168]
    msr elr_el1, x10
    msr spsr_el1, x11
    ldr x30, [sp, #160]
    ldp x18, x29, [sp, #144]
    ldp x16, x17, [sp, #128]
    ldp x14, x15, [sp, #112]
    ldp x12, x13, [sp, #96]
    ldp x10, x11, [sp, #80]
    ldp x8, x9, [sp, #64]
    ldp x6, x7, [sp, #48]
    ldp x4, x5, [sp, #32]
    ldp x2, x3, [sp, #16]
    ldp x0, x1, [sp, #0]
    add sp, sp, #192
    eret
.endm

el1_sync:
    el1_entry 0

el1_irq:
    el1_entry 1
"#
);

unsafe extern "C" {
    fn vectors();
    fn userret(tf: *mut TrapFrame) -> !;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptType {
    Device,
    Timer,
}

/// Handles an interrupt, exception, or system call from user space.
///
/// # Safety
/// Called from the EL0 vector entries with `tf` pointing at the trap frame
/// built on the process kernel stack.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrap(tf: *mut TrapFrame, kind: usize) -> ! {
    let proc = current_proc();

    // the trap frame sits at a fixed spot on the kstack, but the slot
    // records whatever frame the process trapped with
    // Safety: we are the current proc
    unsafe { proc.data_mut() }.trapframe = tf;

    // Safety: the frame was fully initialized by the entry path
    let tf = unsafe { &mut *tf };

    assert_eq!(tf.spsr & SPSR_M_MASK, 0, "usertrap: not from user mode");

    let mut which_dev = None;

    match kind {
        // synchronous exception
        0 => {
            let ec = (unsafe { esr::read() } >> ESR_EC_SHIFT) & 0x3f;

            match ec {
                // system call
                EC_SVC64 => {
                    if proc.is_killed() {
                        proc::exit(-1);
                    }

                    // elr already points at the instruction after svc.
                    // an interrupt would clobber esr, so enable only now
                    // that we are done with it.
                    interrupts::enable();

                    unsafe { syscall(tf) };
                }

                EC_INSTR_ABORT_LOWER | EC_DATA_ABORT_LOWER => {
                    let mut inner = proc.inner.lock();

                    println!(
                        "usertrap: fault ec={:#x} pid={:?} elr={:#x} far={:#x}",
                        ec,
                        inner.pid,
                        tf.elr,
                        unsafe { far::read() },
                    );

                    inner.killed = true;
                }

                _ => {
                    let mut inner = proc.inner.lock();

                    println!(
                        "usertrap: unexpected ec={:#x} pid={:?} elr={:#x}",
                        ec, inner.pid, tf.elr,
                    );

                    inner.killed = true;
                }
            }
        }

        // device interrupt
        1 => {
            which_dev = dev_intr();
        }

        _ => panic!("usertrap kind"),
    }

    if proc.is_killed() {
        proc::exit(-1);
    }

    // a timer tick means this process has had its turn
    if which_dev == Some(InterruptType::Timer) {
        proc::r#yield();
    }

    usertrapret();
}

/// Returns to user space through the saved trap frame.
pub fn usertrapret() -> ! {
    // interrupts stay off from here until eret re-enables them through the
    // restored spsr
    interrupts::disable();

    let (_proc, data) = current_proc_and_data_mut();
    let tf = data.trapframe;

    {
        // Safety: every runnable process has a valid trap frame
        let tf = unsafe { &mut *tf };

        // force a return to EL0 with interrupts enabled, whatever state the
        // frame was captured in
        tf.spsr &= !SPSR_M_MASK;
        tf.spsr &= !(1 << 7);
    }

    unsafe { userret(tf) }
}

/// Interrupts and exceptions from kernel code arrive here via the EL1
/// vector entries, on the current kernel stack.
///
/// # Safety
/// Called from the EL1 vector entries.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kerneltrap(kind: usize) {
    assert!(!interrupts::get(), "kerneltrap: interrupts enabled");
    assert_ne!(
        unsafe { spsr::read() } & SPSR_M_MASK,
        0,
        "kerneltrap: not from kernel mode"
    );

    match kind {
        1 => {
            // a timer tick in the kernel preempts the current process, if
            // any; the vector entry saved elr/spsr so further traps during
            // the yield are safe
            if dev_intr() == Some(InterruptType::Timer) && proc::current_proc_opt().is_some() {
                proc::r#yield();
            }
        }

        _ => {
            println!(
                "esr={:#x} elr={:#x} far={:#x}",
                unsafe { esr::read() },
                unsafe { elr::read() },
                unsafe { far::read() },
            );
            panic!("kerneltrap");
        }
    }
}

/// Handle clock interrupts.
fn clock_intr() {
    let _lock = proc::lock_current_cpu();
    let cpu = mpidr::id();

    if cpu == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        proc::wakeup(Channel::Ticks);
    }

    // ask for the next timer interrupt; roughly a tenth of a second
    unsafe { cntp_tval::write(cntfrq::read() / 10) };
}

/// Asks the GIC what fired and dispatches it.
fn dev_intr() -> Option<InterruptType> {
    let irq = gic::claim()?;

    let which = match irq {
        TIMER_IRQ => {
            clock_intr();
            InterruptType::Timer
        }
        UART0_IRQ => {
            uart::handle_interrupt();
            InterruptType::Device
        }
        VIRTIO0_IRQ => {
            virtio::handle_interrupt();
            InterruptType::Device
        }
        _ => {
            println!("unexpected interrupt irq = {}", irq);
            InterruptType::Device
        }
    };

    gic::complete(irq);

    Some(which)
}

/// One-time interrupt routing setup.
///
/// # Safety
/// Must be called only once, by the boot CPU.
pub unsafe fn init() {
    unsafe {
        gic::init();

        // shared peripheral interrupts go to the boot CPU
        gic::enable(UART0_IRQ, 0);
        gic::enable(VIRTIO0_IRQ, 0);
    }
}

/// Sets up this CPU to take exceptions and timer ticks.
///
/// # Safety
/// Must be called once per CPU during initialization.
pub unsafe fn init_hart() {
    unsafe {
        vbar::write(vectors as usize);

        gic::init_hart();

        // the EL1 physical timer interrupt is banked per CPU
        gic::enable(TIMER_IRQ, mpidr::id());

        // first tick
        cntp_tval::write(cntfrq::read() / 10);
        cntp_ctl::write(cntp_ctl::ENABLE);
    }
}
