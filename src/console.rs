use crate::proc::{self, Channel, current_proc};
use crate::spinlock::SpinLock;
use crate::syscall::SysError;
use crate::uart;
use crate::vm::VA;

/// Translate character to control-key equivalent.
const fn ctrl(c: u8) -> u8 {
    c.wrapping_sub(b'@')
}

const INPUT_BUF_SIZE: usize = 128;

pub static CONSOLE: SpinLock<Console> = SpinLock::new(Console::new(), "console");

/// Console input state.
pub struct Console {
    buf: [u8; INPUT_BUF_SIZE],
    /// read index
    r: usize,
    /// write index (completed input)
    w: usize,
    /// edit index (current editing position)
    e: usize,
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

pub fn putc(c: u8) {
    uart::putc_sync(c);
}

/// Erase the character before the cursor.
fn put_backspace() {
    putc(b'\x08');
    putc(b' ');
    putc(b'\x08');
}

/// User `write()`s to the console end up here.
pub fn write(src: VA, len: usize) -> Result<usize, SysError> {
    let src = try_log!(proc::user_slice(src, len));

    for &c in src {
        putc(c);
    }

    Ok(len)
}

/// User `read()`s from the console end up here.
/// Copies a whole input line (or as much as fits) to the user buffer.
pub fn read(dst: VA, len: usize) -> Result<usize, SysError> {
    let dst = try_log!(proc::user_slice_mut(dst, len));

    let mut console = CONSOLE.lock();
    let target = dst.len();
    let mut n = 0;

    while n < target {
        // wait until the interrupt handler has put some input into buf
        while console.r == console.w {
            if current_proc().is_killed() {
                err!(SysError::Interrupted);
            }

            console = proc::sleep(Channel::Buffer(&raw const console.r as usize), console);
        }

        let c = console.buf[console.r % INPUT_BUF_SIZE];
        console.r += 1;

        // end-of-file
        if c == ctrl(b'D') {
            if n > 0 {
                // save ^D for next time, so the caller gets a 0-byte result
                console.r -= 1;
            }

            break;
        }

        dst[n] = c;
        n += 1;

        // a whole line has arrived; return to the user-level read
        if c == b'\n' {
            break;
        }
    }

    Ok(n)
}

/// Console input interrupt handler.
///
/// `uart::handle_interrupt()` calls this for each input character.
/// Does erase processing, appends to `buf`, and wakes up `read()` when a
/// whole line has arrived.
pub fn handle_interrupt(c: u8) {
    let mut console = CONSOLE.lock();

    match c {
        // backspace or delete
        c if c == ctrl(b'H') || c == b'\x7f' => {
            if console.e != console.w {
                console.e -= 1;
                put_backspace();
            }
        }

        mut c => {
            if c != 0 && console.e - console.r < INPUT_BUF_SIZE {
                if c == b'\r' {
                    c = b'\n';
                }

                // echo back to the user
                putc(c);

                // store for consumption by read()
                let index = console.e % INPUT_BUF_SIZE;
                console.buf[index] = c;
                console.e += 1;

                if c == b'\n' || c == ctrl(b'D') || console.e - console.r == INPUT_BUF_SIZE {
                    console.w = console.e;
                    proc::wakeup(Channel::Buffer(&raw const console.r as usize));
                }
            }
        }
    }
}

/// Initialize the console.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    unsafe { uart::init() };
}
