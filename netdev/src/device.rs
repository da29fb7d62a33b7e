//! VirtIO network device: bring-up, transmit path, receive path.
//!
//! The device owns two virtqueues (receive = queue 0, transmit = queue 1)
//! behind one exclusive lock. Transmit builds a header + payload descriptor
//! chain per frame and waits synchronously for completion; receive drains a
//! completed chain into the caller's buffer and re-posts it, so receive
//! capacity is conserved forever. Frames are opaque bytes: no checksum or
//! segmentation offload is negotiated and no Ethernet/IP processing happens
//! here.

use alloc::sync::Arc;
use core::fmt;
use core::ptr;
use spin::Mutex;

use crate::hal::{Event, PageAllocator, WaitBackend};
use crate::mmio::{features, probe, status, MmioBus, Regs, RX_QUEUE, TX_QUEUE};
use crate::queue::{DescFlags, VirtQueue};
use crate::{NetError, NUM, PAGE_SIZE};

/// Per-frame header prepended on the wire. Every field stays zero: no
/// offload is negotiated.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

/// Wire-format header size.
pub const NET_HDR_SIZE: usize = core::mem::size_of::<VirtioNetHdr>();

/// Descriptors per pre-posted receive chain. The device writes the header
/// plus payload across the pair, so a chain holds up to
/// `2 * PAGE_SIZE - NET_HDR_SIZE` payload bytes and a full page of payload
/// always fits.
const RX_CHAIN: usize = 2;

/// Largest payload one transmit chain can carry: the header descriptor
/// plus `NUM - 1` page-sized data descriptors.
pub const MAX_TX_PAYLOAD: usize = (NUM - 1) * PAGE_SIZE;

/// MAC address read from device config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Traffic counters, updated under the device lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Everything the device lock protects.
struct Queues {
    rx: VirtQueue,
    tx: VirtQueue,
    stats: NetStats,
}

/// One virtio network adapter.
///
/// Created once at boot by whatever composes the kernel's device table and
/// passed around by `Arc`; there is no global instance.
pub struct NetDevice {
    regs: Regs,
    inner: Mutex<Queues>,
    wait: Arc<dyn WaitBackend>,
    /// Transmit-queue capacity-freed condition.
    tx_freed: Arc<Event>,
    mac: MacAddress,
}

impl NetDevice {
    /// Probe and bring up the adapter behind `bus`.
    ///
    /// Any failure means the device is absent or incompatible; the boot
    /// path treats that as fatal. There is no retry and no degraded mode.
    pub fn new(
        bus: Arc<dyn MmioBus>,
        allocator: &dyn PageAllocator,
        wait: Arc<dyn WaitBackend>,
    ) -> Result<Self, NetError> {
        let regs = Regs::new(bus);

        if regs.magic() != probe::MAGIC
            || regs.version() != probe::VERSION
            || regs.device_id() != probe::DEVICE_ID_NET
            || regs.vendor_id() != probe::VENDOR_QEMU
        {
            return Err(NetError::DeviceNotFound);
        }

        // Status handshake: reset, then accumulate bits in protocol order.
        let mut st = 0;
        regs.set_status(st);
        st |= status::ACKNOWLEDGE;
        regs.set_status(st);
        st |= status::DRIVER;
        regs.set_status(st);

        // Take what the device offers minus what we refuse.
        let feats = regs.device_features()
            & !(features::RING_INDIRECT_DESC | features::RING_EVENT_IDX | features::NET_MQ);
        regs.set_driver_features(feats);
        st |= status::FEATURES_OK;
        regs.set_status(st);
        if regs.status() & status::FEATURES_OK == 0 {
            regs.set_status(status::FAILED);
            return Err(NetError::FeaturesRejected);
        }

        let rx_freed = Arc::new(Event::new(wait.clone()));
        let tx_freed = Arc::new(Event::new(wait.clone()));
        let mut rx = setup_queue(&regs, allocator, RX_QUEUE, rx_freed)?;
        let mut tx = setup_queue(&regs, allocator, TX_QUEUE, tx_freed.clone())?;

        st |= status::DRIVER_OK;
        regs.set_status(st);

        // Bind a dedicated page to every descriptor of both queues, for
        // the lifetime of the device. Receive chains go straight into the
        // available ring; transmit pages wait as per-send scratch space.
        let mut chain = [0u16; RX_CHAIN];
        while rx.alloc_chain(RX_CHAIN, &mut chain) {
            for (i, &idx) in chain.iter().enumerate() {
                let page = alloc_page(allocator)?;
                rx.bind_page(idx, page);
                let last = i + 1 == RX_CHAIN;
                let flags = if last {
                    DescFlags::WRITE
                } else {
                    DescFlags::WRITE | DescFlags::NEXT
                };
                let next = if last { 0 } else { chain[i + 1] };
                rx.set_desc(idx, page as u64, PAGE_SIZE as u32, flags, next);
            }
            rx.publish(chain[0]);
        }
        regs.queue_notify(RX_QUEUE);

        for i in 0..NUM as u16 {
            let page = alloc_page(allocator)?;
            tx.bind_page(i, page);
        }

        let mac = read_mac(&regs);
        log::info!("virtio-net: ready, mac {}", mac);

        Ok(NetDevice {
            regs,
            inner: Mutex::new(Queues {
                rx,
                tx,
                stats: NetStats::default(),
            }),
            wait,
            tx_freed,
            mac,
        })
    }

    /// Transmit one frame, blocking until the device has consumed it.
    ///
    /// A payload larger than [`MAX_TX_PAYLOAD`] is truncated to what one
    /// chain can carry. Returns the number of payload bytes handed to the
    /// device.
    pub fn send(&self, frame: &[u8]) -> usize {
        let len = frame.len().min(MAX_TX_PAYLOAD);
        if len < frame.len() {
            log::warn!("virtio-net: truncating {} byte frame to {}", frame.len(), len);
        }
        let ndesc = 1 + (len + PAGE_SIZE - 1) / PAGE_SIZE;

        let mut idx = [0u16; NUM];
        let mut inner = self.inner.lock();
        loop {
            if inner.tx.alloc_chain(ndesc, &mut idx[..ndesc]) {
                break;
            }
            // Queue saturated: snapshot the freed sequence while still
            // holding the lock, then wait for a release. A release in the
            // gap advances the sequence, so the wakeup cannot be lost.
            let seen = self.tx_freed.observe();
            drop(inner);
            self.tx_freed.wait_past(seen);
            inner = self.inner.lock();
        }

        // Slot 0 carries the zeroed net header.
        let hdr_page = inner.tx.page(idx[0]);
        unsafe { ptr::write_bytes(hdr_page, 0, NET_HDR_SIZE) };
        let hdr_flags = if ndesc > 1 { DescFlags::NEXT } else { DescFlags::empty() };
        let hdr_next = if ndesc > 1 { idx[1] } else { 0 };
        inner
            .tx
            .set_desc(idx[0], hdr_page as u64, NET_HDR_SIZE as u32, hdr_flags, hdr_next);

        // Up to one page of payload per remaining slot.
        for slot in 1..ndesc {
            let off = (slot - 1) * PAGE_SIZE;
            let chunk = (len - off).min(PAGE_SIZE);
            let page = inner.tx.page(idx[slot]);
            unsafe { ptr::copy_nonoverlapping(frame.as_ptr().add(off), page, chunk) };
            let last = slot + 1 == ndesc;
            let flags = if last { DescFlags::empty() } else { DescFlags::NEXT };
            let next = if last { 0 } else { idx[slot + 1] };
            inner.tx.set_desc(idx[slot], page as u64, chunk as u32, flags, next);
        }

        inner.tx.publish(idx[0]);
        self.regs.queue_notify(TX_QUEUE);

        // Synchronous completion: poll the used ring while holding the
        // lock, which serializes every other caller behind the hardware.
        // No timeout exists; an unresponsive device hangs here.
        let elem = loop {
            if let Some(e) = inner.tx.pop_used() {
                break e;
            }
            self.wait.relax();
        };
        debug_assert_eq!(elem.id as u16, idx[0], "completion for a chain we did not publish");
        inner.tx.free_chain(idx[0]);

        inner.stats.tx_packets += 1;
        inner.stats.tx_bytes += len as u64;
        len
    }

    /// Receive one frame into `buf`, blocking until the device delivers
    /// one.
    ///
    /// Returns the number of payload bytes copied, which is less than the
    /// frame's true length when `buf` is smaller.
    pub fn receive(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();

        // Poll until the used ring advances past our cursor. Same blocking
        // contract as send: lock held, no timeout.
        let elem = loop {
            if let Some(e) = inner.rx.pop_used() {
                break e;
            }
            self.wait.relax();
        };
        let head = elem.id as u16;
        let total = elem.len as usize;

        // Collect the chain before any descriptor is rewritten.
        let mut chain = [0u16; NUM];
        let mut nchain = 0;
        let mut cursor = head;
        loop {
            chain[nchain] = cursor;
            nchain += 1;
            let d = inner.rx.desc(cursor);
            if DescFlags::from_bits_truncate(d.flags).contains(DescFlags::NEXT) {
                cursor = d.next;
            } else {
                break;
            }
        }

        // Drain the frame: skip the wire header, then copy payload until
        // the frame or the caller's capacity runs out.
        let mut frame_off = 0usize;
        let mut copied = 0usize;
        for &idx in &chain[..nchain] {
            if frame_off >= total || copied == buf.len() {
                break;
            }
            let in_this = PAGE_SIZE.min(total - frame_off);
            let skip = NET_HDR_SIZE.saturating_sub(frame_off).min(in_this);
            let n = (in_this - skip).min(buf.len() - copied);
            let page = inner.rx.page(idx);
            unsafe { ptr::copy_nonoverlapping(page.add(skip), buf[copied..].as_mut_ptr(), n) };
            copied += n;
            frame_off += in_this;
        }

        // Recycle the chain: zero every backing page, restore the
        // device-writable flags, re-post. Receive capacity is conserved
        // across unboundedly many cycles.
        for (i, &idx) in chain[..nchain].iter().enumerate() {
            let page = inner.rx.page(idx);
            unsafe { ptr::write_bytes(page, 0, PAGE_SIZE) };
            let last = i + 1 == nchain;
            let flags = if last {
                DescFlags::WRITE
            } else {
                DescFlags::WRITE | DescFlags::NEXT
            };
            let next = if last { 0 } else { chain[i + 1] };
            inner.rx.set_desc(idx, page as u64, PAGE_SIZE as u32, flags, next);
        }
        inner.rx.publish(head);
        self.regs.queue_notify(RX_QUEUE);

        inner.stats.rx_packets += 1;
        inner.stats.rx_bytes += copied as u64;
        copied
    }

    /// MAC address read at bring-up.
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> NetStats {
        self.inner.lock().stats
    }

    /// Free descriptor counts `(rx, tx)` at a lock-held observation point.
    pub fn free_descriptors(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.rx.free_count(), inner.tx.free_count())
    }
}

/// Provision one virtqueue: select, sanity-check, hand the device its three
/// zeroed ring pages, mark ready.
fn setup_queue(
    regs: &Regs,
    allocator: &dyn PageAllocator,
    queue: u32,
    freed: Arc<Event>,
) -> Result<VirtQueue, NetError> {
    regs.select_queue(queue);
    if regs.queue_ready() != 0 {
        return Err(NetError::QueueInUse(queue));
    }
    let max = regs.queue_num_max();
    if (max as usize) < NUM {
        return Err(NetError::QueueTooShort { queue, max });
    }

    let desc = alloc_page(allocator)?;
    let avail = alloc_page(allocator)?;
    let used = alloc_page(allocator)?;

    regs.set_queue_num(NUM as u32);
    regs.set_queue_addrs(desc as u64, avail as u64, used as u64);
    regs.set_queue_ready();
    log::debug!("virtio-net: queue {} depth {} (device max {})", queue, NUM, max);

    Ok(unsafe { VirtQueue::new(desc, avail, used, freed) })
}

fn alloc_page(allocator: &dyn PageAllocator) -> Result<*mut u8, NetError> {
    allocator
        .alloc()
        .map(|p| p.as_ptr())
        .ok_or(NetError::OutOfMemory)
}

fn read_mac(regs: &Regs) -> MacAddress {
    let lo = regs.config(0);
    let hi = regs.config(4);
    MacAddress::new([
        lo as u8,
        (lo >> 8) as u8,
        (lo >> 16) as u8,
        (lo >> 24) as u8,
        hi as u8,
        (hi >> 8) as u8,
    ])
}
