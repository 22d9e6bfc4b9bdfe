// Driver for the qemu virtio block device, legacy MMIO interface.
//
// The virtio spec:
// https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf

use core::ptr;

use crate::buf::Buf;
use crate::fs::BSIZE;
use crate::memlayout::VIRTIO0;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

// virtio mmio control registers, mapped starting at VIRTIO0.
// from qemu's virtio_mmio.h
const MMIO_MAGIC_VALUE: usize = 0x000; // 0x74726976
const MMIO_VERSION: usize = 0x004; // should be 2
const MMIO_DEVICE_ID: usize = 0x008; // 1 is net, 2 is disk
const MMIO_VENDOR_ID: usize = 0x00c; // 0x554d4551
const MMIO_DEVICE_FEATURES: usize = 0x010;
const MMIO_DRIVER_FEATURES: usize = 0x020;
const MMIO_QUEUE_SEL: usize = 0x030;
const MMIO_QUEUE_NUM_MAX: usize = 0x034;
const MMIO_QUEUE_NUM: usize = 0x038;
const MMIO_QUEUE_READY: usize = 0x044;
const MMIO_QUEUE_NOTIFY: usize = 0x050;
const MMIO_INTERRUPT_STATUS: usize = 0x060;
const MMIO_INTERRUPT_ACK: usize = 0x064;
const MMIO_STATUS: usize = 0x070;
const MMIO_QUEUE_DESC_LOW: usize = 0x080;
const MMIO_QUEUE_DESC_HIGH: usize = 0x084;
const MMIO_DRIVER_DESC_LOW: usize = 0x090;
const MMIO_DRIVER_DESC_HIGH: usize = 0x094;
const MMIO_DEVICE_DESC_LOW: usize = 0x0a0;
const MMIO_DEVICE_DESC_HIGH: usize = 0x0a4;

// status register bits, from qemu's virtio_config.h
const CONFIG_S_ACKNOWLEDGE: u32 = 1;
const CONFIG_S_DRIVER: u32 = 2;
const CONFIG_S_DRIVER_OK: u32 = 4;
const CONFIG_S_FEATURES_OK: u32 = 8;

// device feature bits we refuse
const BLK_F_RO: u32 = 5;
const BLK_F_SCSI: u32 = 7;
const BLK_F_CONFIG_WCE: u32 = 11;
const BLK_F_MQ: u32 = 12;
const F_ANY_LAYOUT: u32 = 27;
const RING_F_INDIRECT_DESC: u32 = 28;
const RING_F_EVENT_IDX: u32 = 29;

const VRING_DESC_F_NEXT: u16 = 1; // chained with another descriptor
const VRING_DESC_F_WRITE: u16 = 2; // device writes (vs reads)

const BLK_T_IN: u32 = 0; // read the disk
const BLK_T_OUT: u32 = 1; // write the disk

/// queue size
const NUM: usize = 8;

/// A single descriptor, from the spec.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

impl VirtqDesc {
    const fn new() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        }
    }
}

/// The available ring: descriptor chain heads the driver hands over.
#[repr(C)]
#[derive(Debug)]
struct VirtqAvail {
    flags: u16, // always zero
    idx: u16,   // the driver writes ring[idx % NUM] next
    ring: [u16; NUM],
    unused: u16,
}

/// One used-ring entry: a chain the device has finished with.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

/// The used ring.
#[repr(C)]
#[derive(Debug)]
struct VirtqUsed {
    flags: u16, // always zero
    idx: u16,   // the device increments this as it adds entries
    ring: [VirtqUsedElem; NUM],
}

/// The first descriptor of every disk request points at one of these.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockReq {
    r#type: u32,
    reserved: u32,
    sector: u64,
}

/// In-flight request state, indexed by the head descriptor of the chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Request {
    header: BlockReq,
    status: u8,
    /// completion flag; handle_interrupt sets it, rw sleeps on it
    done: bool,
    buf_id: usize,
}

impl Request {
    const fn new() -> Self {
        Self {
            header: BlockReq {
                r#type: 0,
                reserved: 0,
                sector: 0,
            },
            status: 0,
            done: false,
            buf_id: usize::MAX,
        }
    }
}

static DISK: SpinLock<Disk> = SpinLock::new(Disk::new(), "virtio_disk");

#[derive(Debug)]
pub struct Disk {
    /// descriptor table; most requests chain three of these
    desc: [VirtqDesc; NUM],
    avail: VirtqAvail,
    used: VirtqUsed,

    free: [bool; NUM],
    /// how far we have looked in used.ring
    used_idx: u16,

    reqs: [Request; NUM],
}

impl Disk {
    const fn new() -> Self {
        Disk {
            desc: [VirtqDesc::new(); NUM],
            avail: VirtqAvail {
                flags: 0,
                idx: 0,
                ring: [0; NUM],
                unused: 0,
            },
            used: VirtqUsed {
                flags: 0,
                idx: 0,
                ring: [VirtqUsedElem { id: 0, len: 0 }; NUM],
            },
            free: [true; NUM],
            used_idx: 0,
            reqs: [Request::new(); NUM],
        }
    }

    fn read(&self, reg: usize) -> u32 {
        // Safety: reading a memory-mapped virtio register
        unsafe { ptr::read_volatile((VIRTIO0 + reg) as *const u32) }
    }

    fn write(&mut self, reg: usize, value: u32) {
        // Safety: writing a memory-mapped virtio register
        unsafe { ptr::write_volatile((VIRTIO0 + reg) as *mut u32, value) }
    }

    /// Finds a free descriptor, marks it in use, returns its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        for (i, free) in self.free.iter_mut().enumerate() {
            if *free {
                *free = false;
                return Some(i);
            }
        }

        None
    }

    /// Marks a descriptor free again.
    fn free_desc(&mut self, i: usize) {
        assert!(i < NUM, "free_desc out of bounds");

        self.desc[i] = VirtqDesc::new();
        self.free[i] = true;

        proc::wakeup(Channel::Buffer(&raw const self.free as usize));
    }

    /// Frees a chain of descriptors.
    fn free_chain(&mut self, i: usize) {
        let mut i = i;

        loop {
            let flags = self.desc[i].flags;
            let next = self.desc[i].next;

            self.free_desc(i);

            if flags & VRING_DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    /// Allocates the three descriptors every disk transfer uses.
    /// They need not be contiguous.
    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut ids = [0; 3];

        for i in 0..3 {
            match self.alloc_desc() {
                Some(id) => ids[i] = id,
                None => {
                    for &id in &ids[..i] {
                        self.free_desc(id);
                    }
                    return None;
                }
            }
        }

        Some(ids)
    }
}

/// Reads or writes one buffer's block.
/// Sleeps until the device reports completion.
pub fn rw(buf: &mut Buf<'_>, write: bool) {
    let sector = buf.block_no as u64 * (BSIZE as u64 / 512);

    let mut disk = DISK.lock();

    // the spec's section 5.2 says legacy block operations use three
    // descriptors: one for type/reserved/sector, one for the data, one
    // for a one-byte status result
    let ids = loop {
        if let Some(ids) = disk.alloc3_desc() {
            break ids;
        }

        disk = proc::sleep(Channel::Buffer(&raw const disk.free as usize), disk);
    };

    let req = &mut disk.reqs[ids[0]];
    req.header.r#type = if write { BLK_T_OUT } else { BLK_T_IN };
    req.header.reserved = 0;
    req.header.sector = sector;
    req.status = 0xff; // the device writes 0 on success
    req.done = false;
    req.buf_id = buf.id;

    let header_addr = &raw const req.header as u64;
    let status_addr = &raw const req.status as u64;

    disk.desc[ids[0]].addr = header_addr;
    disk.desc[ids[0]].len = size_of::<BlockReq>() as u32;
    disk.desc[ids[0]].flags = VRING_DESC_F_NEXT;
    disk.desc[ids[0]].next = ids[1] as u16;

    disk.desc[ids[1]].addr = buf.data().as_ptr() as u64;
    disk.desc[ids[1]].len = BSIZE as u32;
    disk.desc[ids[1]].flags = if write { 0 } else { VRING_DESC_F_WRITE };
    disk.desc[ids[1]].flags |= VRING_DESC_F_NEXT;
    disk.desc[ids[1]].next = ids[2] as u16;

    disk.desc[ids[2]].addr = status_addr;
    disk.desc[ids[2]].len = 1;
    disk.desc[ids[2]].flags = VRING_DESC_F_WRITE;
    disk.desc[ids[2]].next = 0;

    // hand the head of the chain to the device
    let avail_index = disk.avail.idx as usize % NUM;
    disk.avail.ring[avail_index] = ids[0] as u16;
    disk.avail.idx = disk.avail.idx.wrapping_add(1);

    // value is the queue number
    disk.write(MMIO_QUEUE_NOTIFY, 0);

    // wait for handle_interrupt to flag completion
    while !disk.reqs[ids[0]].done {
        disk = proc::sleep(Channel::Buffer(buf.id), disk);
    }

    assert_eq!(disk.reqs[ids[0]].status, 0, "virtio rw: request failed");

    disk.reqs[ids[0]].buf_id = usize::MAX;
    disk.free_chain(ids[0]);
}

/// Handles a disk completion interrupt.
pub fn handle_interrupt() {
    let mut disk = DISK.lock();

    // telling the device we've seen this interrupt may race with it
    // writing new used-ring entries; we would then process those now and
    // have nothing to do next time, which is harmless
    let intr_status = disk.read(MMIO_INTERRUPT_STATUS);
    disk.write(MMIO_INTERRUPT_ACK, intr_status & 0x3);

    // the device increments used.idx as it finishes chains
    while disk.used_idx != disk.used.idx {
        let id = disk.used.ring[disk.used_idx as usize % NUM].id as usize;

        disk.reqs[id].done = true;
        proc::wakeup(Channel::Buffer(disk.reqs[id].buf_id));

        disk.used_idx = disk.used_idx.wrapping_add(1);
    }
}

/// Initializes the virtio disk.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    let mut disk = DISK.lock();
    let mut status = 0;

    assert!(
        disk.read(MMIO_MAGIC_VALUE) == 0x74726976
            && disk.read(MMIO_VERSION) == 2
            && disk.read(MMIO_DEVICE_ID) == 2
            && disk.read(MMIO_VENDOR_ID) == 0x554d4551,
        "could not find virtio disk"
    );

    // reset
    disk.write(MMIO_STATUS, status);

    status |= CONFIG_S_ACKNOWLEDGE;
    disk.write(MMIO_STATUS, status);

    status |= CONFIG_S_DRIVER;
    disk.write(MMIO_STATUS, status);

    // negotiate features
    let mut features = disk.read(MMIO_DEVICE_FEATURES);
    features &= !(1 << BLK_F_RO);
    features &= !(1 << BLK_F_SCSI);
    features &= !(1 << BLK_F_CONFIG_WCE);
    features &= !(1 << BLK_F_MQ);
    features &= !(1 << F_ANY_LAYOUT);
    features &= !(1 << RING_F_EVENT_IDX);
    features &= !(1 << RING_F_INDIRECT_DESC);
    disk.write(MMIO_DRIVER_FEATURES, features);

    status |= CONFIG_S_FEATURES_OK;
    disk.write(MMIO_STATUS, status);

    // re-read to make sure the device accepted the features
    status = disk.read(MMIO_STATUS);
    assert_ne!(
        status & CONFIG_S_FEATURES_OK,
        0,
        "virtio disk features negotiation failed"
    );

    // initialize queue 0
    disk.write(MMIO_QUEUE_SEL, 0);

    assert_eq!(disk.read(MMIO_QUEUE_READY), 0, "virtio disk queue in use");

    let max = disk.read(MMIO_QUEUE_NUM_MAX);
    assert_ne!(max, 0, "virtio disk has no queue 0");
    assert!(max as usize >= NUM, "virtio disk max queue too short");

    disk.write(MMIO_QUEUE_NUM, NUM as u32);

    // tell the device where the rings live
    let desc_addr = &raw const disk.desc as usize;
    disk.write(MMIO_QUEUE_DESC_LOW, desc_addr as u32);
    disk.write(MMIO_QUEUE_DESC_HIGH, (desc_addr >> 32) as u32);

    let avail_addr = &raw const disk.avail as usize;
    disk.write(MMIO_DRIVER_DESC_LOW, avail_addr as u32);
    disk.write(MMIO_DRIVER_DESC_HIGH, (avail_addr >> 32) as u32);

    let used_addr = &raw const disk.used as usize;
    disk.write(MMIO_DEVICE_DESC_LOW, used_addr as u32);
    disk.write(MMIO_DEVICE_DESC_HIGH, (used_addr >> 32) as u32);

    // queue is ready
    disk.write(MMIO_QUEUE_READY, 1);

    // and so are we
    status |= CONFIG_S_DRIVER_OK;
    disk.write(MMIO_STATUS, status);

    println!("disk init");
}

unsafe impl Send for Disk {}
