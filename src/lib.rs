#![no_std]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]

extern crate alloc;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

#[macro_use]
pub mod printf;
#[macro_use]
pub mod error;

pub mod arm;
pub mod buf;
pub mod console;
pub mod entry;
pub mod exec;
pub mod file;
pub mod fs;
pub mod gic;
pub mod kalloc;
pub mod log;
pub mod memlayout;
pub mod param;
pub mod proc;
pub mod psci;
#[cfg(feature = "selftest")]
pub mod selftest;
pub mod sleeplock;
pub mod spinlock;
pub mod start;
pub mod swtch;
pub mod sync;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod uart;
pub mod virtio;
pub mod vm;

static STARTED: AtomicBool = AtomicBool::new(false);

/// Kernel main, reached by every core through start().
/// The boot core brings the machine up, then releases the others.
pub fn main() -> ! {
    // interrupts are still masked from reset
    let id = unsafe { proc::current_cpu_id() };

    if id == 0 {
        unsafe {
            console::init();
        }

        println!();
        println!("nautilos kernel is booting");
        println!();

        unsafe {
            kalloc::init(); // physical page allocator
            vm::init(); // kernel page table
            vm::init_hart(); // turn on the MMU
            proc::init(); // process table
            trap::init(); // interrupt controller
            trap::init_hart(); // vectors and timer
            virtio::init(); // disk
        }

        #[cfg(feature = "selftest")]
        selftest::run();

        proc::user_init(); // first user process

        STARTED.store(true, Ordering::Release);

        // release the secondary cores
        for cpu in 1..param::NCPU {
            psci::cpu_on(cpu, entry::_entry as *const () as usize);
        }
    } else {
        while !STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        println!("cpu {} starting", id);

        unsafe {
            vm::init_hart();
            trap::init_hart();
        }
    }

    unsafe { proc::scheduler() }
}

/// Panic plumbing for the binary crate.
pub fn panic_handler(info: &PanicInfo<'_>) -> ! {
    printf::handle_panic(info)
}
