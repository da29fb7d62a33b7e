//! Split-virtqueue transport.
//!
//! Virtqueues are the mechanism for bulk data transport between the driver
//! and the device. Each queue is three single-page shared-memory areas —
//! descriptor table, available ring, used ring — plus driver-local state:
//! a free-set over the descriptor slots, a table of the page bound to each
//! slot, and a cursor into the used ring.
//!
//! Descriptor lifecycle per slot: FREE → allocated → posted (visible in the
//! available ring, owned by the device) → completed (reported in the used
//! ring) → FREE again. Only the owning device mutates this state, always
//! under its lock.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::hal::Event;
use crate::NUM;

bitflags::bitflags! {
    /// Descriptor flags shared with the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the `next` field.
        const NEXT = 1;
        /// Buffer is write-only for the device.
        const WRITE = 2;
        /// Buffer contains a list of buffer descriptors.
        const INDIRECT = 4;
    }
}

/// One descriptor-table slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Raw [`DescFlags`] bits.
    pub flags: u16,
    /// Next descriptor index if `NEXT` is set.
    pub next: u16,
}

/// Available ring: driver-to-device queue of chain heads.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    /// Producer index; only ever incremented by the driver.
    pub idx: u16,
    pub ring: [u16; NUM],
    pub used_event: u16,
}

/// Used ring element: a completed chain and its resulting byte length.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Head index of the completed descriptor chain.
    pub id: u32,
    /// Total bytes the device wrote to the chain.
    pub len: u32,
}

/// Used ring: device-to-driver queue of completions.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    /// Producer index; only ever incremented by the device.
    pub idx: u16,
    pub ring: [VirtqUsedElem; NUM],
    pub avail_event: u16,
}

/// Driver-side state of one virtqueue.
pub struct VirtQueue {
    /// Descriptor table (one shared page).
    desc: *mut VirtqDesc,
    /// Available ring (one shared page).
    avail: *mut VirtqAvail,
    /// Used ring (one shared page, device-written).
    used: *mut VirtqUsed,
    /// Free-set over the descriptor slots.
    free: [bool; NUM],
    /// Page permanently bound to each slot.
    pages: [*mut u8; NUM],
    /// Last consumed used-ring index.
    last_used: u16,
    /// Signaled every time a descriptor returns to the free-set.
    freed: Arc<Event>,
}

// The ring pointers are exclusively owned by the NetDevice that created the
// queue and only touched under its lock.
unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Build a queue over three zeroed ring pages.
    ///
    /// # Safety
    ///
    /// Each pointer must address one zero-filled page that stays allocated
    /// and exclusively owned by this queue for its whole lifetime.
    pub unsafe fn new(desc: *mut u8, avail: *mut u8, used: *mut u8, freed: Arc<Event>) -> Self {
        VirtQueue {
            desc: desc as *mut VirtqDesc,
            avail: avail as *mut VirtqAvail,
            used: used as *mut VirtqUsed,
            free: [true; NUM],
            pages: [ptr::null_mut(); NUM],
            last_used: 0,
            freed,
        }
    }

    /// Permanently bind a frame-buffer page to slot `idx`.
    pub fn bind_page(&mut self, idx: u16, page: *mut u8) {
        self.pages[idx as usize] = page;
    }

    /// The page bound to slot `idx`.
    pub fn page(&self, idx: u16) -> *mut u8 {
        self.pages[idx as usize]
    }

    /// Reserve one free descriptor slot.
    ///
    /// `None` is backpressure, not an error: every slot is in flight and
    /// the caller must wait for a release.
    pub fn alloc_desc(&mut self) -> Option<u16> {
        for i in 0..NUM {
            if self.free[i] {
                self.free[i] = false;
                return Some(i as u16);
            }
        }
        None
    }

    /// Reserve `n` slots, writing their indices into `out`.
    ///
    /// All-or-nothing: a mid-sequence failure rolls back every slot already
    /// taken, so the free count after a failed call equals the count before
    /// it.
    pub fn alloc_chain(&mut self, n: usize, out: &mut [u16]) -> bool {
        for i in 0..n {
            match self.alloc_desc() {
                Some(idx) => out[i] = idx,
                None => {
                    for &taken in &out[..i] {
                        self.free_desc(taken);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Return slot `idx` to the free-set and wake capacity waiters.
    pub fn free_desc(&mut self, idx: u16) {
        debug_assert!(!self.free[idx as usize], "double free of descriptor");
        unsafe {
            *self.desc.add(idx as usize) = VirtqDesc::default();
        }
        self.free[idx as usize] = true;
        self.freed.signal();
    }

    /// Release every slot of the chain starting at `head`.
    pub fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let d = self.desc(idx);
            let next = d.next;
            let chained = DescFlags::from_bits_truncate(d.flags).contains(DescFlags::NEXT);
            self.free_desc(idx);
            if chained {
                idx = next;
            } else {
                break;
            }
        }
    }

    /// Fill slot `idx` of the descriptor table.
    pub fn set_desc(&mut self, idx: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        unsafe {
            *self.desc.add(idx as usize) = VirtqDesc {
                addr,
                len,
                flags: flags.bits(),
                next,
            };
        }
    }

    /// Copy of slot `idx`.
    pub fn desc(&self, idx: u16) -> VirtqDesc {
        unsafe { *self.desc.add(idx as usize) }
    }

    /// Publish the chain at `head` into the available ring.
    ///
    /// Two-barrier discipline: the first fence makes the ring entry (and
    /// the descriptors behind it) visible before the index moves, the
    /// second makes the incremented index visible before any later notify
    /// write. The device can never observe an index pointing at an entry
    /// that is not yet valid.
    pub fn publish(&mut self, head: u16) {
        let avail = unsafe { &mut *self.avail };
        avail.ring[avail.idx as usize % NUM] = head;
        fence(Ordering::SeqCst);
        avail.idx = avail.idx.wrapping_add(1);
        fence(Ordering::SeqCst);
    }

    /// Device-reported used-ring producer index.
    pub fn used_idx(&self) -> u16 {
        let idx = unsafe { ptr::read_volatile(&(*self.used).idx) };
        fence(Ordering::SeqCst);
        idx
    }

    /// Consume one completion, advancing the local cursor.
    ///
    /// The fence after the element read orders the device's buffer writes
    /// before the driver touches the completed chain's pages.
    pub fn pop_used(&mut self) -> Option<VirtqUsedElem> {
        if self.used_idx() == self.last_used {
            return None;
        }
        let elem =
            unsafe { ptr::read_volatile(&(*self.used).ring[self.last_used as usize % NUM]) };
        fence(Ordering::SeqCst);
        self.last_used = self.last_used.wrapping_add(1);
        Some(elem)
    }

    /// Number of FREE slots.
    pub fn free_count(&self) -> usize {
        self.free.iter().filter(|&&f| f).count()
    }
}
