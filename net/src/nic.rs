//! Link device boundary.
//!
//! A [`Nic`] moves frames; the stack on top of it understands protocols. Only
//! [`Packet`] crosses this boundary. On receive the driver hands each frame to
//! [`Inet::receive`](crate::inet::Inet::receive) with `layer_begin` at the
//! Ethernet header; on transmit the stack calls [`Nic::transmit`] with a
//! complete frame and consults [`Nic::transmit_queue_available`] first, so a
//! full device queue stalls the stack instead of dropping.
//!
//! All methods take `&self`; implementations keep their mutable state behind
//! interior mutability.

extern crate alloc;

use alloc::rc::Rc;
use core::fmt;

use bitflags::bitflags;

use crate::buffer_store::BufferStore;
use crate::packet::Packet;
use crate::types::{MacAddr, NetError};

pub trait Nic {
    /// Queue one complete frame for transmission.
    ///
    /// Returns `Err(NoBufferSpace)` if the transmit queue is full and
    /// `Err(InterfaceDown)` if the link is down.
    fn transmit(&self, pkt: Packet) -> Result<(), NetError>;

    /// Frames [`transmit`](Nic::transmit) will still accept.
    fn transmit_queue_available(&self) -> usize;

    /// Largest payload of one frame, link header excluded.
    fn mtu(&self) -> u16;

    fn mac(&self) -> MacAddr;

    /// Read-only snapshot of device statistics.
    fn stats(&self) -> NicStats;

    fn features(&self) -> NicFeatures {
        NicFeatures::empty()
    }

    fn is_up(&self) -> bool {
        true
    }

    /// The store every packet of this link is carved from.
    fn buffer_store(&self) -> &Rc<BufferStore>;

    /// Fresh packet with `link_offset` bytes reserved for headers.
    fn create_packet(&self, link_offset: usize) -> Packet {
        Packet::create(self.buffer_store(), link_offset)
    }
}

/// Monotonic device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NicStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    /// Frames dropped on receive (queue full, demux miss).
    pub rx_dropped: u64,
    /// Frames refused on transmit (queue full, link down, filtered).
    pub tx_dropped: u64,
}

impl NicStats {
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_errors: 0,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }

    #[inline]
    pub const fn total_packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    #[inline]
    pub const fn total_dropped(&self) -> u64 {
        self.rx_dropped + self.tx_dropped
    }
}

impl fmt::Display for NicStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, err: {}/{}, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_errors,
            self.tx_errors,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

bitflags! {
    /// Offloads a device advertises.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NicFeatures: u32 {
        /// Transport checksums are filled in by the device.
        const CHECKSUM_TX = 1 << 0;
        /// Received checksums were verified by the device.
        const CHECKSUM_RX = 1 << 1;
        /// The device inserts and strips 802.1Q tags itself.
        const VLAN_TAG    = 1 << 2;
    }
}
