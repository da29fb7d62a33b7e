//! VirtIO MMIO register interface.
//!
//! Typed, ordered access to the device's memory-mapped control block.
//! All multi-register sequences that publish shared state (ring addresses,
//! notify) must be issued in the order the bring-up and transfer protocols
//! mandate; [`Regs`] centralizes the barrier placed in front of every
//! doorbell write so ring contents are globally visible before the device
//! is told to look.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

/// MMIO register offsets (VirtIO MMIO transport v2).
pub mod reg {
    pub const MAGIC: usize = 0x00;
    pub const VERSION: usize = 0x04;
    pub const DEVICE_ID: usize = 0x08;
    pub const VENDOR_ID: usize = 0x0C;
    pub const DEVICE_FEATURES: usize = 0x10;
    pub const DRIVER_FEATURES: usize = 0x20;
    pub const QUEUE_SEL: usize = 0x30;
    pub const QUEUE_NUM_MAX: usize = 0x34;
    pub const QUEUE_NUM: usize = 0x38;
    pub const QUEUE_READY: usize = 0x44;
    pub const QUEUE_NOTIFY: usize = 0x50;
    pub const INTERRUPT_STATUS: usize = 0x60;
    pub const INTERRUPT_ACK: usize = 0x64;
    pub const STATUS: usize = 0x70;
    pub const QUEUE_DESC_LOW: usize = 0x80;
    pub const QUEUE_DESC_HIGH: usize = 0x84;
    pub const QUEUE_AVAIL_LOW: usize = 0x90;
    pub const QUEUE_AVAIL_HIGH: usize = 0x94;
    pub const QUEUE_USED_LOW: usize = 0xA0;
    pub const QUEUE_USED_HIGH: usize = 0xA4;
    pub const CONFIG: usize = 0x100;
}

/// VirtIO device status bits.
pub mod status {
    /// Driver has acknowledged the device.
    pub const ACKNOWLEDGE: u32 = 1;
    /// Driver knows how to drive the device.
    pub const DRIVER: u32 = 2;
    /// Driver is ready.
    pub const DRIVER_OK: u32 = 4;
    /// Feature negotiation complete.
    pub const FEATURES_OK: u32 = 8;
    /// Device has experienced an error and needs reset.
    pub const NEEDS_RESET: u32 = 64;
    /// Something went wrong; device is unusable.
    pub const FAILED: u32 = 128;
}

/// Feature bits this minimal driver refuses.
pub mod features {
    /// Indirect descriptor support.
    pub const RING_INDIRECT_DESC: u32 = 1 << 28;
    /// Used/available event index notifications.
    pub const RING_EVENT_IDX: u32 = 1 << 29;
    /// virtio-net multiqueue.
    pub const NET_MQ: u32 = 1 << 22;
}

/// Required probe signature.
pub mod probe {
    /// "virt" in little-endian ASCII.
    pub const MAGIC: u32 = 0x7472_6976;
    /// MMIO transport version.
    pub const VERSION: u32 = 2;
    /// Device type: network adapter.
    pub const DEVICE_ID_NET: u32 = 1;
    /// "QEMU" in little-endian ASCII.
    pub const VENDOR_QEMU: u32 = 0x554d_4551;
}

/// Receive virtqueue index.
pub const RX_QUEUE: u32 = 0;
/// Transmit virtqueue index.
pub const TX_QUEUE: u32 = 1;

/// Raw 32-bit access to the device's register block.
///
/// The production implementation is [`MmioRegion`]; tests substitute a
/// software device model behind the same trait.
pub trait MmioBus: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// A memory-mapped register region at a fixed physical base.
pub struct MmioRegion {
    base: usize,
}

impl MmioRegion {
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped virtio-mmio register
    /// block that stays mapped for the lifetime of the region.
    pub const unsafe fn new(base: usize) -> Self {
        MmioRegion { base }
    }
}

impl MmioBus for MmioRegion {
    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Typed accessor for the virtio-mmio register block.
pub struct Regs {
    bus: Arc<dyn MmioBus>,
}

impl Regs {
    pub fn new(bus: Arc<dyn MmioBus>) -> Self {
        Regs { bus }
    }

    pub fn magic(&self) -> u32 {
        self.bus.read(reg::MAGIC)
    }

    pub fn version(&self) -> u32 {
        self.bus.read(reg::VERSION)
    }

    pub fn device_id(&self) -> u32 {
        self.bus.read(reg::DEVICE_ID)
    }

    pub fn vendor_id(&self) -> u32 {
        self.bus.read(reg::VENDOR_ID)
    }

    pub fn device_features(&self) -> u32 {
        self.bus.read(reg::DEVICE_FEATURES)
    }

    pub fn set_driver_features(&self, bits: u32) {
        self.bus.write(reg::DRIVER_FEATURES, bits);
    }

    pub fn status(&self) -> u32 {
        self.bus.read(reg::STATUS)
    }

    pub fn set_status(&self, bits: u32) {
        self.bus.write(reg::STATUS, bits);
    }

    pub fn select_queue(&self, queue: u32) {
        self.bus.write(reg::QUEUE_SEL, queue);
    }

    /// Maximum depth of the currently selected queue.
    pub fn queue_num_max(&self) -> u32 {
        self.bus.read(reg::QUEUE_NUM_MAX)
    }

    pub fn set_queue_num(&self, num: u32) {
        self.bus.write(reg::QUEUE_NUM, num);
    }

    pub fn queue_ready(&self) -> u32 {
        self.bus.read(reg::QUEUE_READY)
    }

    pub fn set_queue_ready(&self) {
        self.bus.write(reg::QUEUE_READY, 1);
    }

    /// Publish the three ring-area addresses of the selected queue.
    pub fn set_queue_addrs(&self, desc: u64, avail: u64, used: u64) {
        self.bus.write(reg::QUEUE_DESC_LOW, desc as u32);
        self.bus.write(reg::QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.bus.write(reg::QUEUE_AVAIL_LOW, avail as u32);
        self.bus.write(reg::QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
        self.bus.write(reg::QUEUE_USED_LOW, used as u32);
        self.bus.write(reg::QUEUE_USED_HIGH, (used >> 32) as u32);
    }

    /// Ring the doorbell for `queue`.
    ///
    /// The full fence orders every preceding descriptor and available-ring
    /// write before the device can observe the notify.
    pub fn queue_notify(&self, queue: u32) {
        fence(Ordering::SeqCst);
        self.bus.write(reg::QUEUE_NOTIFY, queue);
    }

    /// Read one 32-bit word of device-specific config space.
    pub fn config(&self, offset: usize) -> u32 {
        self.bus.read(reg::CONFIG + offset)
    }
}
