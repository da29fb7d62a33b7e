//! Collaborator interfaces consumed by the driver.
//!
//! The driver owns nothing below these seams: physical pages come from the
//! kernel's frame allocator, syscall buffers are copied through the process
//! address space, and waiting is delegated to a pluggable policy so the
//! busy-polling driver and an interrupt-driven variant observe the same
//! blocking contract.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

/// Fixed-size page alloc/free, supplied by the kernel's frame allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocate one zero-filled page of [`crate::PAGE_SIZE`] bytes.
    ///
    /// Returns `None` when physical memory is exhausted.
    fn alloc(&self) -> Option<NonNull<u8>>;

    /// Return a page previously obtained from [`PageAllocator::alloc`].
    fn free(&self, page: NonNull<u8>);
}

/// An address-space copy failed (e.g. invalid user pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyFault;

/// Fallible copy between a caller's address space and kernel memory.
///
/// `user` selects user-space vs kernel addressing, mirroring the kernel's
/// either-copy routines.
pub trait AddressSpace: Send + Sync {
    /// Copy `dst.len()` bytes from `src` in the caller's space into `dst`.
    fn copy_in(&self, user: bool, src: u64, dst: &mut [u8]) -> Result<(), CopyFault>;

    /// Copy `src` into the caller's space at `dst`.
    fn copy_out(&self, user: bool, dst: u64, src: &[u8]) -> Result<(), CopyFault>;
}

/// How a thread waits when a polled condition is still false.
///
/// The in-tree backend is [`PollBackend`]; an interrupt-driven waker can be
/// substituted without changing any caller: `relax` parks instead of
/// spinning and `wake` unparks.
pub trait WaitBackend: Send + Sync {
    /// Invoked each time a polled condition is observed still false.
    fn relax(&self);

    /// Invoked when the condition may have become true.
    fn wake(&self);
}

/// Busy-polling wait policy.
pub struct PollBackend;

impl WaitBackend for PollBackend {
    fn relax(&self) {
        core::hint::spin_loop();
    }

    fn wake(&self) {}
}

/// Monotonic event counter for missed-wakeup-free blocking.
///
/// A waiter snapshots the sequence with [`Event::observe`] while still
/// holding the lock that guards the condition, drops the lock, then calls
/// [`Event::wait_past`]. Signals happen under the same lock, so a signal
/// between the failed check and the wait advances the sequence and the
/// waiter returns immediately instead of sleeping through it.
pub struct Event {
    seq: AtomicU64,
    wait: Arc<dyn WaitBackend>,
}

impl Event {
    pub fn new(wait: Arc<dyn WaitBackend>) -> Self {
        Event {
            seq: AtomicU64::new(0),
            wait,
        }
    }

    /// Snapshot the sequence. Call while holding the condition's lock.
    pub fn observe(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Advance the sequence and wake waiters. Call under the condition's
    /// lock.
    pub fn signal(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.wait.wake();
    }

    /// Block until the sequence moves past `seen`.
    pub fn wait_past(&self, seen: u64) {
        while self.observe() == seen {
            self.wait.relax();
        }
    }
}
