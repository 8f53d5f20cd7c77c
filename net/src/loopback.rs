//! In-memory linked NIC pair.
//!
//! [`LinkedNic::pair`] returns two devices joined by a virtual wire: a frame
//! transmitted on one end lands in the receive queue of the other, where the
//! owner of that end drains it with [`LinkedNic::poll_rx`] and hands it to its
//! stack. Each direction of the wire is a bounded queue behind an
//! [`IrqMutex`], since transmit and poll may run from different contexts.
//!
//! Frames are moved across the wire, not copied: the receiving stack releases
//! the buffer into the sender's store when it drops the packet.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use unikos_lib::{IrqMutex, klog_debug};

use crate::buffer_store::BufferStore;
use crate::nic::{Nic, NicFeatures, NicStats};
use crate::packet::Packet;
use crate::types::{MacAddr, NetError};

/// Frames one direction of the wire holds before transmit fails.
pub const WIRE_QUEUE_CAPACITY: usize = 256;

/// Decides whether a frame put on the wire is delivered (`true`) or lost.
pub type WireFilter = Box<dyn FnMut(&Packet) -> bool>;

struct WireQueue {
    frames: VecDeque<Packet>,
    capacity: usize,
}

type Wire = Rc<IrqMutex<WireQueue>>;

fn wire(capacity: usize) -> Wire {
    Rc::new(IrqMutex::new(WireQueue {
        frames: VecDeque::with_capacity(64),
        capacity,
    }))
}

/// One end of a linked pair.
pub struct LinkedNic {
    mac: MacAddr,
    mtu: u16,
    store: Rc<BufferStore>,
    tx: Wire,
    rx: Wire,
    stats: IrqMutex<NicStats>,
    up: Cell<bool>,
    filter: RefCell<Option<WireFilter>>,
}

impl LinkedNic {
    /// Two devices wired to each other, each with its own buffer store.
    pub fn pair(
        mac_a: MacAddr,
        store_a: Rc<BufferStore>,
        mac_b: MacAddr,
        store_b: Rc<BufferStore>,
        mtu: u16,
    ) -> (Self, Self) {
        Self::pair_with_capacity(mac_a, store_a, mac_b, store_b, mtu, WIRE_QUEUE_CAPACITY)
    }

    pub fn pair_with_capacity(
        mac_a: MacAddr,
        store_a: Rc<BufferStore>,
        mac_b: MacAddr,
        store_b: Rc<BufferStore>,
        mtu: u16,
        capacity: usize,
    ) -> (Self, Self) {
        let a_to_b = wire(capacity);
        let b_to_a = wire(capacity);
        let a = Self::new(mac_a, mtu, store_a, a_to_b.clone(), b_to_a.clone());
        let b = Self::new(mac_b, mtu, store_b, b_to_a, a_to_b);
        (a, b)
    }

    fn new(mac: MacAddr, mtu: u16, store: Rc<BufferStore>, tx: Wire, rx: Wire) -> Self {
        Self {
            mac,
            mtu,
            store,
            tx,
            rx,
            stats: IrqMutex::new(NicStats::new()),
            up: Cell::new(true),
            filter: RefCell::new(None),
        }
    }

    /// Drain up to `budget` frames the peer transmitted.
    pub fn poll_rx(&self, budget: usize) -> Vec<Packet> {
        let mut rx = self.rx.lock();
        let count = budget.min(rx.frames.len());
        let mut packets = Vec::with_capacity(count);
        let mut bytes = 0u64;
        for _ in 0..count {
            if let Some(pkt) = rx.frames.pop_front() {
                bytes += pkt.len() as u64;
                packets.push(pkt);
            }
        }
        drop(rx);
        let mut stats = self.stats.lock();
        stats.rx_packets += packets.len() as u64;
        stats.rx_bytes += bytes;
        packets
    }

    /// Frames waiting for this end to poll them.
    pub fn rx_pending(&self) -> usize {
        self.rx.lock().frames.len()
    }

    /// Install a filter consulted for every transmitted frame.
    pub fn set_filter(&self, filter: impl FnMut(&Packet) -> bool + 'static) {
        *self.filter.borrow_mut() = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.borrow_mut() = None;
    }

    pub fn set_up(&self) {
        self.up.set(true);
    }

    /// Take the link down, discarding anything still queued towards us.
    pub fn set_down(&self) {
        self.up.set(false);
        self.rx.lock().frames.clear();
    }
}

impl Nic for LinkedNic {
    fn transmit(&self, pkt: Packet) -> Result<(), NetError> {
        if !self.up.get() {
            self.stats.lock().tx_dropped += 1;
            return Err(NetError::InterfaceDown);
        }
        let len = pkt.len() as u64;
        let deliver = match self.filter.borrow_mut().as_mut() {
            Some(f) => f(&pkt),
            None => true,
        };
        if !deliver {
            klog_debug!("loopback: {} filtered frame of {} bytes", self.mac, len);
            let mut stats = self.stats.lock();
            stats.tx_packets += 1;
            stats.tx_bytes += len;
            return Ok(());
        }
        let mut tx = self.tx.lock();
        if tx.frames.len() >= tx.capacity {
            drop(tx);
            self.stats.lock().tx_dropped += 1;
            return Err(NetError::NoBufferSpace);
        }
        tx.frames.push_back(pkt);
        drop(tx);
        let mut stats = self.stats.lock();
        stats.tx_packets += 1;
        stats.tx_bytes += len;
        Ok(())
    }

    fn transmit_queue_available(&self) -> usize {
        let tx = self.tx.lock();
        tx.capacity.saturating_sub(tx.frames.len())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn stats(&self) -> NicStats {
        *self.stats.lock()
    }

    fn features(&self) -> NicFeatures {
        NicFeatures::empty()
    }

    fn is_up(&self) -> bool {
        self.up.get()
    }

    fn buffer_store(&self) -> &Rc<BufferStore> {
        &self.store
    }
}
