//! KPIO VirtIO network device driver.
//!
//! This crate provides the network device driver subsystem for the KPIO
//! operating system: bring-up of a virtio network adapter over the
//! virtio-mmio transport, transmit/receive over split virtqueues, and a
//! byte-stream character device adapter the kernel's fd layer dispatches
//! read/write syscalls to.
//!
//! # Architecture
//!
//! - `hal`: narrow traits for the collaborators the driver consumes
//!   (page allocator, user/kernel copy, wait policy)
//! - `mmio`: typed, ordered access to the virtio-mmio register block
//! - `queue`: the split-virtqueue transport (descriptor table, available
//!   ring, used ring, free-set)
//! - `device`: device bring-up and the transmit/receive protocol
//! - `chardev`: the character device adapter and the device dispatch table
//!
//! # Concurrency
//!
//! One exclusive lock per [`device::NetDevice`] serializes every virtqueue
//! mutation across both queues. Completion waiting is busy-polling performed
//! while holding that lock: there is no interrupt handler, so one thread's
//! wait for hardware completion blocks every other thread's use of the
//! device. This is a deliberate simplification, accepted as a serialization
//! cost. The sole suspension point is descriptor-allocation backpressure,
//! which is resolved race-free through [`hal::Event`].

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod chardev;
pub mod device;
pub mod hal;
pub mod mmio;
pub mod queue;

use core::fmt;

/// Size of one frame buffer / ring-area page.
pub const PAGE_SIZE: usize = 4096;

/// Virtqueue depth (descriptor table and ring capacity). Power of two.
pub const NUM: usize = 8;

/// Network driver error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Probe signature mismatch (magic, version, device type, or vendor).
    DeviceNotFound,
    /// Device rejected the negotiated feature set.
    FeaturesRejected,
    /// Queue was already marked ready at bring-up.
    QueueInUse(u32),
    /// Queue depth offered by the device is below our ring capacity.
    QueueTooShort { queue: u32, max: u32 },
    /// Page allocator exhausted during bring-up.
    OutOfMemory,
    /// Address-space copy failed during a syscall-level read/write.
    CopyFault,
    /// No device registered in the dispatch slot.
    NoDevice,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotFound => write!(f, "virtio network device not found"),
            Self::FeaturesRejected => write!(f, "device rejected feature selection"),
            Self::QueueInUse(q) => write!(f, "queue {} already in use", q),
            Self::QueueTooShort { queue, max } => {
                write!(f, "queue {} max depth {} below required {}", queue, max, NUM)
            }
            Self::OutOfMemory => write!(f, "out of pages"),
            Self::CopyFault => write!(f, "address-space copy fault"),
            Self::NoDevice => write!(f, "no device in dispatch slot"),
        }
    }
}

impl From<hal::CopyFault> for NetError {
    fn from(_: hal::CopyFault) -> Self {
        NetError::CopyFault
    }
}
