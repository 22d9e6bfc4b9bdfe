//! Power State Coordination Interface calls.
//!
//! qemu's virt machine exposes PSCI with the hvc conduit when the kernel
//! runs at EL1.

use core::arch::asm;

const CPU_ON: usize = 0xc400_0003;
const SYSTEM_OFF: usize = 0x8400_0008;

/// PSCI return value for a cpu id the machine does not have.
const INVALID_PARAMETERS: isize = -2;

fn call(func: usize, a1: usize, a2: usize, a3: usize) -> isize {
    let ret: isize;

    // SMCCC: the callee may clobber x0..x3
    unsafe {
        asm!(
            "hvc #0",
            inlateout("x0") func => ret,
            inlateout("x1") a1 => _,
            inlateout("x2") a2 => _,
            inlateout("x3") a3 => _,
        );
    }

    ret
}

/// Powers on a secondary core, entering at the physical address `entry`.
/// Asking for a core the machine does not have is not an error; booting
/// always requests NCPU cores regardless of the -smp setting.
pub fn cpu_on(cpu: usize, entry: usize) {
    let ret = call(CPU_ON, cpu, entry, 0);

    if ret != 0 && ret != INVALID_PARAMETERS {
        println!("psci: cpu {} failed to start ({})", cpu, ret);
    }
}

/// Shuts the machine down.
pub fn system_off() -> ! {
    call(SYSTEM_OFF, 0, 0, 0);
    unreachable!("psci system off");
}
