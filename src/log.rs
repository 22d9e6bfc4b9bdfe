// Write-ahead log for multi-block FS updates.
//
// Disk writes made inside an `Operation` are not sent to their home
// blocks directly. They are queued (and their cache slots pinned), and
// when the last concurrent operation finishes the whole batch is copied
// into the on-disk log area, the header naming those blocks is written
// (the commit point), and only then are the blocks installed at home.
// After a crash, a non-empty header means a committed batch never
// finished installing; replaying it at boot makes the update whole.
//
// The log area holds a header block followed by `capacity - 1` data
// blocks. The header stores a count and the home block numbers.

use crate::buf::{BCACHE, Buf};
use crate::fs::{BSIZE, SuperBlock};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;
use crate::sync::OnceLock;

/// Where the log lives. Fixed at init, read-only afterwards.
#[derive(Debug)]
struct LogArea {
    dev: u32,
    /// block number of the on-disk header
    head: u32,
    /// total log blocks, header included
    capacity: u32,
}

static AREA: OnceLock<LogArea> = OnceLock::new();

/// Everything that changes while the system runs.
#[derive(Debug)]
struct LogState {
    /// FS system calls currently inside an Operation
    outstanding: u32,
    /// a commit is flushing the queue to disk
    committing: bool,
    /// home block numbers queued for the next commit
    queued: [u32; LOGSIZE],
    queued_len: usize,
}

static STATE: SpinLock<LogState> = SpinLock::new(
    LogState {
        outstanding: 0,
        committing: false,
        queued: [0; LOGSIZE],
        queued_len: 0,
    },
    "log",
);

fn area() -> &'static LogArea {
    AREA.get().expect("log to be init")
}

/// Overwrites the on-disk header with the given block list. Writing a
/// non-empty list is the commit point; writing an empty one retires the
/// transaction.
fn write_header(queued: &[u32]) {
    let area = area();
    let mut buf = BCACHE.read(area.dev, area.head);

    let data = buf.data_mut();
    data[..4].copy_from_slice(&(queued.len() as u32).to_le_bytes());
    for (i, &block_no) in queued.iter().enumerate() {
        data[4 + i * 4..][..4].copy_from_slice(&block_no.to_le_bytes());
    }

    BCACHE.write(&mut buf);
    BCACHE.release(buf);
}

/// Reads the block list back out of the on-disk header.
fn read_header() -> ([u32; LOGSIZE], usize) {
    let area = area();
    let buf = BCACHE.read(area.dev, area.head);

    let data = buf.data();
    let n = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    assert!(n <= LOGSIZE, "log header corrupt");

    let mut queued = [0u32; LOGSIZE];
    for (i, slot) in queued[..n].iter_mut().enumerate() {
        *slot = u32::from_le_bytes(data[4 + i * 4..][..4].try_into().unwrap());
    }

    BCACHE.release(buf);
    (queued, n)
}

/// Copies one block's bytes from `from` to `to` on the log device,
/// optionally releasing the pin the log holds on the destination.
fn copy_block(from: u32, to: u32, unpin_to: bool) {
    let dev = area().dev;

    let src = BCACHE.read(dev, from);
    let mut dst = BCACHE.read(dev, to);

    dst.data_mut().copy_from_slice(src.data());
    BCACHE.write(&mut dst);

    if unpin_to {
        BCACHE.unpin(&dst);
    }

    BCACHE.release(src);
    BCACHE.release(dst);
}

/// Copies committed blocks from the log area to their home locations.
/// During normal commits this also drops the pins taken by `write`;
/// recovery has no pins to drop.
fn install(queued: &[u32], unpin: bool) {
    let head = area().head;

    for (i, &block_no) in queued.iter().enumerate() {
        copy_block(head + 1 + i as u32, block_no, unpin);
    }
}

/// Runs a full commit of the queued blocks.
fn commit(queued: &[u32]) {
    if queued.is_empty() {
        return;
    }

    // cached contents into the log area
    let head = area().head;
    for (i, &block_no) in queued.iter().enumerate() {
        copy_block(block_no, head + 1 + i as u32, false);
    }

    // the real commit point
    write_header(queued);

    // home locations, releasing the pins
    install(queued, true);

    // transaction retired
    write_header(&[]);
}

/// Brackets one FS system call. Every `log::write` between `begin` and
/// the guard's drop lands in a single transaction.
#[derive(Debug)]
pub struct Operation(());

impl Operation {
    pub fn begin() -> Self {
        reserve();
        Self(())
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        complete();
    }
}

/// Admits one more FS system call into the current transaction, waiting
/// while a commit runs or while the call's worst-case writes might not
/// fit in the log.
fn reserve() {
    let mut state = STATE.lock();

    loop {
        let worst_case = state.queued_len + (state.outstanding as usize + 1) * MAXOPBLOCKS;

        if state.committing || worst_case > LOGSIZE {
            state = proc::sleep(Channel::Log, state);
        } else {
            state.outstanding += 1;
            break;
        }
    }
}

/// Retires one FS system call; the last one out commits.
fn complete() {
    let mut state = STATE.lock();

    assert!(!state.committing, "log: complete during commit");
    state.outstanding -= 1;

    if state.outstanding > 0 {
        // the space this call had reserved is free again
        proc::wakeup(Channel::Log);
        return;
    }

    // snapshot the queue, then do the disk I/O without the lock held;
    // the committing flag keeps new operations out
    state.committing = true;
    let queued = state.queued;
    let queued_len = state.queued_len;
    drop(state);

    commit(&queued[..queued_len]);

    let mut state = STATE.lock();
    state.queued_len = 0;
    state.committing = false;
    proc::wakeup(Channel::Log);
}

/// Queues a modified buffer for the current transaction and pins its
/// cache slot until the commit writes it out.
/// Use instead of `BCACHE.write()` inside an Operation.
pub fn write(buf: &Buf<'_>) {
    let mut state = STATE.lock();

    assert!(state.outstanding >= 1, "log write outside of operation");
    assert!(
        state.queued_len < LOGSIZE && state.queued_len + 1 < area().capacity as usize,
        "log: transaction too big"
    );

    // absorb repeat writes to the same block
    if state.queued[..state.queued_len].contains(&buf.block_no) {
        return;
    }

    let len = state.queued_len;
    state.queued[len] = buf.block_no;
    state.queued_len += 1;

    BCACHE.pin(buf);
}

/// Sets up the log from the superblock, then replays anything a crash
/// left committed but not installed.
pub fn init(dev: u32, sb: &SuperBlock) {
    // the header block holds a u32 count and LOGSIZE u32 block numbers
    assert!((1 + LOGSIZE) * size_of::<u32>() <= BSIZE, "log header too big");

    AREA.initialize(|| {
        Ok::<_, ()>(LogArea {
            dev,
            head: sb.logstart,
            capacity: sb.nlogs,
        })
    });

    let (queued, n) = read_header();
    install(&queued[..n], false);
    write_header(&[]);
}
