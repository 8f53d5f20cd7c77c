//! ICMPv6 (RFC 4443): message framing and echo. Neighbor discovery and MLD
//! messages are framed here and handled by their own modules.

extern crate alloc;

use alloc::rc::Rc;

use unikos_lib::{klog_debug, klog_trace};

use crate::buffer_store::{BufferStore, PACKET_HEADROOM};
use crate::checksum::transport_checksum;
use crate::icmp4::{ICMP_HEADER_LEN, IcmpEvent, IcmpHeader, IcmpStats, parse_header};
use crate::ip::{Datagram, Tx};
use crate::packet::Packet;
use crate::types::{IpAddr, Ipv6Addr, NetError, Protocol};

pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const MLD_QUERY: u8 = 130;
pub const MLD_V1_REPORT: u8 = 131;
pub const MLD_V1_DONE: u8 = 132;
pub const NDP_ROUTER_SOLICITATION: u8 = 133;
pub const NDP_ROUTER_ADVERTISEMENT: u8 = 134;
pub const NDP_NEIGHBOR_SOLICITATION: u8 = 135;
pub const NDP_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const NDP_REDIRECT: u8 = 137;
pub const MLD_V2_REPORT: u8 = 143;

pub const ICMP6_CODE_PORT_UNREACHABLE: u8 = 4;

/// Minimum IPv6 MTU; error messages never grow past it.
const MIN_MTU: usize = 1280;

/// Build a message from header fields and body, checksummed for `src` ->
/// `dst`. The packet's layer begins at the ICMPv6 header.
pub fn build(
    store: &Rc<BufferStore>,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    typ: u8,
    code: u8,
    rest: u32,
    body: &[u8],
) -> Result<Packet, NetError> {
    let mut pkt = Packet::create(store, PACKET_HEADROOM);
    let mut hdr = [0u8; ICMP_HEADER_LEN];
    hdr[0] = typ;
    hdr[1] = code;
    hdr[4..8].copy_from_slice(&rest.to_be_bytes());
    pkt.append(&hdr)?;
    pkt.append(body)?;
    let csum = transport_checksum(
        IpAddr::V6(src),
        IpAddr::V6(dst),
        Protocol::Icmpv6.as_u8(),
        pkt.data(),
    );
    pkt.data_mut()[2..4].copy_from_slice(&csum.to_be_bytes());
    pkt.mark_l4();
    Ok(pkt)
}

/// Build a message and queue it as a datagram.
pub fn send(
    tx: &mut Tx<'_>,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    typ: u8,
    code: u8,
    rest: u32,
    body: &[u8],
) -> Result<(), NetError> {
    let pkt = build(tx.store, src, dst, typ, code, rest, body)?;
    tx.out.push_back(Datagram::new(
        IpAddr::V6(src),
        IpAddr::V6(dst),
        Protocol::Icmpv6,
        pkt,
    ));
    Ok(())
}

/// Verify the checksum of an inbound message and decode its header.
pub fn verify(dgram: &Datagram) -> Option<IcmpHeader> {
    let data = dgram.packet.data();
    if transport_checksum(dgram.src, dgram.dst, Protocol::Icmpv6.as_u8(), data) != 0 {
        klog_debug!("icmp6: bad checksum from {}", dgram.src);
        return None;
    }
    let hdr = parse_header(data);
    if hdr.is_none() {
        klog_debug!("icmp6: truncated message from {}", dgram.src);
    }
    hdr
}

#[derive(Default)]
pub struct Icmp6 {
    stats: IcmpStats,
}

impl Icmp6 {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> &IcmpStats {
        &self.stats
    }

    pub fn count_drop(&mut self) {
        self.stats.dropped += 1;
    }

    /// Handle an echo or error message already verified by [`verify`].
    pub fn receive(
        &mut self,
        dgram: &Datagram,
        hdr: &IcmpHeader,
        local: Ipv6Addr,
        tx: &mut Tx<'_>,
    ) -> IcmpEvent {
        let data = dgram.packet.data();
        let IpAddr::V6(remote) = dgram.src else {
            return IcmpEvent::None;
        };
        match hdr.typ {
            ICMP6_ECHO_REQUEST => {
                self.stats.echo_requests_in += 1;
                klog_trace!("icmp6: echo request from {} seq {}", remote, hdr.seq());
                let payload = &data[ICMP_HEADER_LEN..];
                match send(tx, local, remote, ICMP6_ECHO_REPLY, 0, hdr.rest, payload) {
                    Ok(()) => self.stats.echo_replies_out += 1,
                    Err(e) => klog_debug!("icmp6: echo reply to {} failed: {}", remote, e),
                }
                IcmpEvent::None
            }
            ICMP6_ECHO_REPLY => IcmpEvent::EchoReply {
                id: hdr.id(),
                seq: hdr.seq(),
                payload_len: data.len() - ICMP_HEADER_LEN,
            },
            ICMP6_DEST_UNREACHABLE => {
                self.stats.unreachables_in += 1;
                klog_debug!("icmp6: {} reports unreachable code {}", remote, hdr.code);
                IcmpEvent::Unreachable { code: hdr.code }
            }
            t => {
                klog_trace!("icmp6: type {} from {} ignored", t, remote);
                IcmpEvent::None
            }
        }
    }

    /// Port unreachable for the datagram quoted by `original`, which starts
    /// at its IPv6 header.
    pub fn port_unreachable(
        &mut self,
        original: &[u8],
        local: Ipv6Addr,
        dst: Ipv6Addr,
        tx: &mut Tx<'_>,
    ) {
        let quote = &original[..original.len().min(MIN_MTU - 48)];
        match send(
            tx,
            local,
            dst,
            ICMP6_DEST_UNREACHABLE,
            ICMP6_CODE_PORT_UNREACHABLE,
            0,
            quote,
        ) {
            Ok(()) => self.stats.unreachables_out += 1,
            Err(e) => klog_debug!("icmp6: port unreachable to {} failed: {}", dst, e),
        }
    }
}
