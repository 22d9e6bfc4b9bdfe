//! Low-level driver routines for the PL011 UART.

use core::ptr;
use core::sync::atomic::Ordering;

use crate::console;
use crate::memlayout::UART0;
use crate::printf::PRINTF;

use self::Reg::*;

const UART_CLK: usize = 24_000_000;
const UART_BAUD: usize = 115_200;

/// PL011 control registers, as byte offsets from the base address.
/// See the ARM PrimeCell UART (PL011) technical reference manual.
#[derive(Clone, Copy)]
enum Reg {
    /// data register
    DR,
    /// flag register
    FR,
    /// integer baud rate divisor
    IBRD,
    /// fractional baud rate divisor
    FBRD,
    /// line control register
    LCRH,
    /// control register
    CR,
    /// interrupt mask set/clear register
    IMSC,
    /// interrupt clear register
    ICR,
}

impl Reg {
    fn addr(self) -> *mut u32 {
        let offset = match self {
            DR => 0x00,
            FR => 0x18,
            IBRD => 0x24,
            FBRD => 0x28,
            LCRH => 0x2c,
            CR => 0x30,
            IMSC => 0x38,
            ICR => 0x44,
        };
        (UART0 + offset) as *mut u32
    }
}

// FR bits
const FR_RXFE: u32 = 1 << 4; // receive FIFO empty
const FR_TXFF: u32 = 1 << 5; // transmit FIFO full

// LCRH bits
const LCRH_FEN: u32 = 1 << 4; // enable FIFOs
const LCRH_WLEN_8: u32 = 3 << 5; // 8 bit words

// CR bits
const CR_EN: u32 = 1 << 0; // enable UART
const CR_TXE: u32 = 1 << 8; // enable transmit
const CR_RXE: u32 = 1 << 9; // enable receive

// IMSC bits
const IMSC_RX: u32 = 1 << 4; // receive interrupt

fn read(reg: Reg) -> u32 {
    // Safety: reading a memory-mapped UART register
    unsafe { ptr::read_volatile(reg.addr()) }
}

fn write(reg: Reg, value: u32) {
    // Safety: writing a memory-mapped UART register
    unsafe { ptr::write_volatile(reg.addr(), value) }
}

/// Initializes the UART.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    // disable while configuring
    write(CR, 0);

    // set the baud rate divisors
    let div = 16 * UART_BAUD;
    write(IBRD, (UART_CLK / div) as u32);
    write(FBRD, (((UART_CLK % div) * 64 + div / 2) / div) as u32);

    // 8 bit words, FIFOs on
    write(LCRH, LCRH_WLEN_8 | LCRH_FEN);

    // interrupt on receive; transmit is synchronous
    write(IMSC, IMSC_RX);

    write(CR, CR_EN | CR_TXE | CR_RXE);
}

/// Writes one character, spinning until the transmit FIFO has room.
/// Used by the console and by printf; does not use interrupts.
pub fn putc_sync(c: u8) {
    if PRINTF.is_panicked().load(Ordering::Relaxed) {
        #[allow(clippy::empty_loop)]
        loop {}
    }

    while read(FR) & FR_TXFF != 0 {
        core::hint::spin_loop();
    }

    write(DR, c as u32);
}

/// Reads one input character, if one is waiting.
pub fn getc() -> Option<u8> {
    if read(FR) & FR_RXFE != 0 {
        None
    } else {
        Some(read(DR) as u8)
    }
}

/// Handles a UART interrupt: drains received characters into the console.
pub fn handle_interrupt() {
    while let Some(c) = getc() {
        console::handle_interrupt(c);
    }

    // clear the interrupt
    write(ICR, IMSC_RX);
}
