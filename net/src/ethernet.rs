//! Ethernet II framing.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::rc::Rc;

use unikos_lib::klog_trace;

use crate::buffer_store::BufferStore;
use crate::packet::Packet;
use crate::timer::NetTimers;
use crate::types::{EtherType, MacAddr, NetError};

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_ADDR_LEN: usize = 6;
/// Offset of the type field inside the header.
pub const ETH_TYPE_OFFSET: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Raw type field; unknown values are kept so they can be logged.
    pub ethertype: u16,
}

impl EthHeader {
    #[inline]
    pub fn ethertype(&self) -> Option<EtherType> {
        EtherType::from_u16(self.ethertype)
    }
}

pub fn parse_header(frame: &[u8]) -> Option<EthHeader> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; ETH_ADDR_LEN];
    let mut src = [0u8; ETH_ADDR_LEN];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    Some(EthHeader {
        dst: MacAddr(dst),
        src: MacAddr(src),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    })
}

pub fn write_header(hdr: &EthHeader, out: &mut [u8]) {
    out[0..6].copy_from_slice(hdr.dst.as_bytes());
    out[6..12].copy_from_slice(hdr.src.as_bytes());
    out[12..14].copy_from_slice(&hdr.ethertype.to_be_bytes());
}

/// Whether a frame addressed to `dst` is for the interface owning `own`.
#[inline]
pub fn accepts(dst: &MacAddr, own: &MacAddr) -> bool {
    dst == own || dst.is_broadcast() || dst.is_multicast()
}

/// Prepend an Ethernet header to a packet whose layer begins at the network
/// header.
pub fn encapsulate(
    pkt: &mut Packet,
    dst: MacAddr,
    src: MacAddr,
    ethertype: EtherType,
) -> Result<(), NetError> {
    let hdr = EthHeader {
        dst,
        src,
        ethertype: ethertype.as_u16(),
    };
    write_header(&hdr, pkt.push_header(ETH_HEADER_LEN)?);
    Ok(())
}

/// What neighbor resolution needs to put frames on the link.
pub struct LinkIo<'a> {
    pub mac: MacAddr,
    pub store: &'a Rc<BufferStore>,
    pub timers: &'a mut NetTimers,
    pub frames: &'a mut VecDeque<Packet>,
}

impl LinkIo<'_> {
    /// Frame `pkt` and queue it for the device.
    pub fn send(&mut self, mut pkt: Packet, dst: MacAddr, ethertype: EtherType) {
        if encapsulate(&mut pkt, dst, self.mac, ethertype).is_err() {
            klog_trace!("eth: no headroom for {} frame to {}", ethertype, dst);
            return;
        }
        self.frames.push_back(pkt);
    }
}
