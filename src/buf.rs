use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::virtio;

/// Identity and reference bookkeeping for one cache slot.
#[derive(Debug, Clone, Copy)]
struct Slot {
    dev: u32,
    block_no: u32,
    refs: u32,
    /// whether the slot's bytes reflect the disk block
    valid: bool,
    /// when the slot last went idle; smaller means colder
    stamp: u64,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            dev: 0,
            block_no: 0,
            refs: 0,
            valid: false,
            stamp: 0,
        }
    }
}

#[derive(Debug)]
struct Slots {
    slots: [Slot; NBUF],
    /// monotonic counter backing the stamps
    clock: u64,
}

impl Slots {
    /// Finds the slot already holding (dev, block_no), if any.
    fn find(&self, dev: u32, block_no: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.dev == dev && s.block_no == block_no && (s.refs > 0 || s.valid))
    }

    /// Rebinds the coldest idle slot to (dev, block_no).
    /// With every slot busy the cache is misconfigured for the workload,
    /// so that is fatal rather than a wait.
    fn evict(&mut self, dev: u32, block_no: u32) -> usize {
        let mut coldest: Option<usize> = None;

        for (id, slot) in self.slots.iter().enumerate() {
            if slot.refs != 0 {
                continue;
            }

            if coldest.is_none_or(|c| slot.stamp < self.slots[c].stamp) {
                coldest = Some(id);
            }
        }

        let id = coldest.expect("bcache: every buffer referenced");

        self.slots[id] = Slot {
            dev,
            block_no,
            refs: 1,
            valid: false,
            stamp: 0,
        };

        id
    }
}

/// Block contents, behind a per-slot sleep lock so that only one process
/// at a time does I/O on a given block.
#[derive(Debug)]
pub struct BlockData(pub [u8; BSIZE]);

/// A checked-out cache slot. Carries its identity so callers (the log,
/// the disk driver) never have to ask the cache who it is.
#[derive(Debug)]
pub struct Buf<'a> {
    pub id: usize,
    pub dev: u32,
    pub block_no: u32,
    guard: SleepLockGuard<'a, BlockData>,
}

impl Buf<'_> {
    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard.0
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard.0
    }
}

pub static BCACHE: BCache = BCache::new();

/// Block cache: cached copies of disk blocks, doubling as the
/// synchronization point for blocks shared between processes.
///
/// Interface:
/// * `read()` checks a block out, locked;
/// * `write()` pushes changed contents to disk;
/// * `release()` checks it back in; do not touch it afterwards.
///
/// Eviction is by coldest release stamp rather than a linked list: slots
/// carry the tick of their last release and a miss rebinds the idle slot
/// with the smallest one.
pub struct BCache {
    slots: SpinLock<Slots>,
    blocks: [SleepLock<BlockData>; NBUF],
}

impl BCache {
    const fn new() -> Self {
        Self {
            slots: SpinLock::new(
                Slots {
                    slots: [const { Slot::empty() }; NBUF],
                    clock: 0,
                },
                "bcache",
            ),
            blocks: [const { SleepLock::new(BlockData([0; BSIZE]), "buffer") }; NBUF],
        }
    }

    /// Checks out the slot for (dev, block_no), evicting on a miss.
    fn get(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let id = {
            let mut slots = self.slots.lock();

            match slots.find(dev, block_no) {
                Some(id) => {
                    slots.slots[id].refs += 1;
                    id
                }
                None => slots.evict(dev, block_no),
            }
        };

        // taking the block lock may sleep; the slot cannot be rebound
        // underneath us because refs is already ours
        Buf {
            id,
            dev,
            block_no,
            guard: self.blocks[id].lock(),
        }
    }

    /// Returns a locked buffer holding the block's current contents.
    pub fn read(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let mut buf = self.get(dev, block_no);

        // holding the block lock keeps valid stable until we set it
        let cached = self.slots.lock().slots[buf.id].valid;

        if !cached {
            virtio::rw(&mut buf, false);
            self.slots.lock().slots[buf.id].valid = true;
        }

        buf
    }

    /// Writes the buffer's contents to disk. The caller holds the buffer.
    pub fn write(&self, buf: &mut Buf<'_>) {
        virtio::rw(buf, true);
    }

    /// Checks a buffer back in, stamping the slot as just used.
    pub fn release(&self, buf: Buf<'_>) {
        let id = buf.id;
        drop(buf); // give the block lock back first

        let mut slots = self.slots.lock();

        slots.slots[id].refs -= 1;
        if slots.slots[id].refs == 0 {
            slots.clock += 1;
            slots.slots[id].stamp = slots.clock;
        }
    }

    /// Holds a reference on the slot so eviction skips it while the log
    /// still needs the cached contents.
    pub fn pin(&self, buf: &Buf<'_>) {
        self.slots.lock().slots[buf.id].refs += 1;
    }

    /// Undoes a `pin`.
    pub fn unpin(&self, buf: &Buf<'_>) {
        let mut slots = self.slots.lock();

        assert!(slots.slots[buf.id].refs >= 1, "bcache unpin");
        slots.slots[buf.id].refs -= 1;
    }
}
