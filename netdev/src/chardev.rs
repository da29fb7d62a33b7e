//! Character device adapter.
//!
//! Bridges syscall-level read/write to the transmit/receive paths. Each
//! call moves at most one page through a kernel scratch buffer: a copy
//! fault aborts before any device interaction. The adapter registers in the
//! kernel's device dispatch table under the reserved network slot, so
//! open + read/write on the device's well-known name route here.

use alloc::sync::Arc;
use spin::Mutex;

use crate::device::NetDevice;
use crate::hal::AddressSpace;
use crate::{NetError, PAGE_SIZE};

/// Number of dispatch-table slots.
pub const NDEV: usize = 10;

/// Reserved dispatch slot for the network device.
pub const NET_MAJOR: usize = 2;

/// Read/write entry points of one character device.
pub trait CharDevice: Send + Sync {
    /// Copy up to `len` bytes from the device to `dst` in the caller's
    /// space.
    fn read(
        &self,
        space: &dyn AddressSpace,
        user: bool,
        dst: u64,
        len: usize,
    ) -> Result<usize, NetError>;

    /// Copy up to `len` bytes from `src` in the caller's space to the
    /// device.
    fn write(
        &self,
        space: &dyn AddressSpace,
        user: bool,
        src: u64,
        len: usize,
    ) -> Result<usize, NetError>;
}

/// The kernel's device dispatch table: maps a major number to the entry
/// points syscall read/write route through.
pub struct DeviceTable {
    slots: [Option<Arc<dyn CharDevice>>; NDEV],
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Install `dev` in slot `major`.
    pub fn register(&mut self, major: usize, dev: Arc<dyn CharDevice>) -> Result<(), NetError> {
        let slot = self.slots.get_mut(major).ok_or(NetError::NoDevice)?;
        *slot = Some(dev);
        Ok(())
    }

    fn device(&self, major: usize) -> Result<&Arc<dyn CharDevice>, NetError> {
        self.slots
            .get(major)
            .and_then(|s| s.as_ref())
            .ok_or(NetError::NoDevice)
    }

    pub fn read(
        &self,
        major: usize,
        space: &dyn AddressSpace,
        user: bool,
        dst: u64,
        len: usize,
    ) -> Result<usize, NetError> {
        self.device(major)?.read(space, user, dst, len)
    }

    pub fn write(
        &self,
        major: usize,
        space: &dyn AddressSpace,
        user: bool,
        src: u64,
        len: usize,
    ) -> Result<usize, NetError> {
        self.device(major)?.write(space, user, src, len)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The network character device.
///
/// Owns a page-sized scratch buffer behind its own lock, separate from the
/// device lock, so syscall copies never hold up the virtqueues.
pub struct NetChardev {
    dev: Arc<NetDevice>,
    scratch: Mutex<[u8; PAGE_SIZE]>,
}

impl NetChardev {
    pub fn new(dev: Arc<NetDevice>) -> Self {
        NetChardev {
            dev,
            scratch: Mutex::new([0; PAGE_SIZE]),
        }
    }

    /// Build the adapter and install it under [`NET_MAJOR`].
    pub fn register(dev: Arc<NetDevice>, table: &mut DeviceTable) -> Result<(), NetError> {
        table.register(NET_MAJOR, Arc::new(NetChardev::new(dev)))
    }
}

impl CharDevice for NetChardev {
    fn read(
        &self,
        space: &dyn AddressSpace,
        user: bool,
        dst: u64,
        len: usize,
    ) -> Result<usize, NetError> {
        let n = len.min(PAGE_SIZE);
        let mut scratch = self.scratch.lock();
        let got = self.dev.receive(&mut scratch[..n]);
        space.copy_out(user, dst, &scratch[..got])?;
        Ok(got)
    }

    fn write(
        &self,
        space: &dyn AddressSpace,
        user: bool,
        src: u64,
        len: usize,
    ) -> Result<usize, NetError> {
        let n = len.min(PAGE_SIZE);
        let mut scratch = self.scratch.lock();
        // Fault before the device sees anything: no partial frame is ever
        // sent.
        space.copy_in(user, src, &mut scratch[..n])?;
        Ok(self.dev.send(&scratch[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::CopyFault;
    use std::sync::Arc;

    struct NullSpace;

    impl AddressSpace for NullSpace {
        fn copy_in(&self, _user: bool, _src: u64, _dst: &mut [u8]) -> Result<(), CopyFault> {
            Ok(())
        }
        fn copy_out(&self, _user: bool, _dst: u64, _src: &[u8]) -> Result<(), CopyFault> {
            Ok(())
        }
    }

    struct StubDev;

    impl CharDevice for StubDev {
        fn read(
            &self,
            _space: &dyn AddressSpace,
            _user: bool,
            _dst: u64,
            len: usize,
        ) -> Result<usize, NetError> {
            Ok(len)
        }
        fn write(
            &self,
            _space: &dyn AddressSpace,
            _user: bool,
            _src: u64,
            len: usize,
        ) -> Result<usize, NetError> {
            Ok(len)
        }
    }

    #[test]
    fn test_empty_slot_is_no_device() {
        let table = DeviceTable::new();
        assert_eq!(
            table.read(NET_MAJOR, &NullSpace, false, 0, 16),
            Err(NetError::NoDevice)
        );
    }

    #[test]
    fn test_out_of_range_major() {
        let mut table = DeviceTable::new();
        assert_eq!(
            table.register(NDEV, Arc::new(StubDev)),
            Err(NetError::NoDevice)
        );
    }

    #[test]
    fn test_registered_slot_routes() {
        let mut table = DeviceTable::new();
        table.register(NET_MAJOR, Arc::new(StubDev)).unwrap();
        assert_eq!(table.write(NET_MAJOR, &NullSpace, true, 0, 32), Ok(32));
        assert_eq!(table.read(NET_MAJOR, &NullSpace, true, 0, 8), Ok(8));
    }
}
