use crate::arm::isb;
use crate::arm::registers::{cpacr, currentel, mair, tcr};
use crate::param::NCPU;

/// Boot stack bytes per core; entry.rs hard-codes the same figure.
const STACK_SIZE: usize = 0x4000;

#[repr(C, align(16))]
struct Stack([u8; STACK_SIZE * NCPU]);

#[unsafe(no_mangle)]
static mut STACK0: Stack = Stack([0; STACK_SIZE * NCPU]);

unsafe extern "C" {
    fn main() -> !;
}

/// Entry point for each core, called from entry.rs on the boot stack.
///
/// # Safety
/// Called exactly once per core, from `_entry`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn start() -> ! {
    unsafe {
        assert_eq!(currentel::read(), 1, "kernel must enter at EL1");

        // no trapping on FP/SIMD instructions
        cpacr::write(cpacr::FPEN);

        // memory attributes and translation layout for the MMU; actually
        // turning it on happens in vm::init_hart once the kernel page
        // table exists
        mair::write(mair::DEFAULT);
        tcr::write(tcr::DEFAULT);
        isb();

        main();
    }
}
