// Physical memory layout

// qemu -machine virt is set up like this,
// based on qemu's hw/arm/virt.c:
//
// 08000000 -- GIC distributor
// 08010000 -- GIC cpu interface
// 09000000 -- uart0 (PL011)
// 0a000000 -- virtio disk
// 40000000 -- start of RAM
// 40010000 -- -kernel loads the kernel here

// the kernel uses physical memory thus:
// 40010000 -- entry, then kernel text and data
// end -- start of kernel page allocation area
// PHYSTOP -- end of RAM used by the kernel

pub const GICD: usize = 0x0800_0000;
pub const GICC: usize = 0x0801_0000;

pub const UART0: usize = 0x0900_0000;
pub const UART0_IRQ: usize = 33;

pub const VIRTIO0: usize = 0x0a00_0000;
pub const VIRTIO0_IRQ: usize = 48;

/// EL1 physical timer PPI
pub const TIMER_IRQ: usize = 30;

pub const KERNBASE: usize = 0x4001_0000;
pub const PHYSTOP: usize = 0x4800_0000;

/// Start of the device hole. User memory lives in [0, USERTOP) so that user
/// pages and kernel mappings stay disjoint in the shared page tables.
pub const USERTOP: usize = GICD;
