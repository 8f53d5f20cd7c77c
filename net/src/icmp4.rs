//! ICMP for IPv4 (RFC 792): echo and destination unreachable.

use unikos_lib::{klog_debug, klog_trace};

use crate::buffer_store::PACKET_HEADROOM;
use crate::checksum::checksum;
use crate::ip::{Datagram, Tx};
use crate::ip4::IP4_HEADER_LEN;
use crate::packet::Packet;
use crate::types::{IpAddr, Ipv4Addr, NetError, Protocol};

pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const ICMP_CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// Bytes of the offending datagram quoted after its IP header.
const QUOTE_LEN: usize = 8;

/// The fixed part of every ICMP message. For echo messages `rest` holds the
/// identifier (high half) and sequence number (low half).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcmpHeader {
    pub typ: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: u32,
}

impl IcmpHeader {
    #[inline]
    pub fn id(&self) -> u16 {
        (self.rest >> 16) as u16
    }

    #[inline]
    pub fn seq(&self) -> u16 {
        self.rest as u16
    }
}

pub fn parse_header(data: &[u8]) -> Option<IcmpHeader> {
    if data.len() < ICMP_HEADER_LEN {
        return None;
    }
    Some(IcmpHeader {
        typ: data[0],
        code: data[1],
        checksum: u16::from_be_bytes([data[2], data[3]]),
        rest: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
    })
}

/// Build a message whose checksum is computed from scratch over header and
/// body. The packet's layer begins at the ICMP header.
pub fn build(tx: &Tx<'_>, typ: u8, code: u8, rest: u32, body: &[u8]) -> Result<Packet, NetError> {
    let mut pkt = Packet::create(tx.store, PACKET_HEADROOM);
    let mut hdr = [0u8; ICMP_HEADER_LEN];
    hdr[0] = typ;
    hdr[1] = code;
    hdr[4..8].copy_from_slice(&rest.to_be_bytes());
    pkt.append(&hdr)?;
    pkt.append(body)?;
    let csum = checksum(pkt.data());
    pkt.data_mut()[2..4].copy_from_slice(&csum.to_be_bytes());
    pkt.mark_l4();
    Ok(pkt)
}

pub fn echo_request(tx: &Tx<'_>, id: u16, seq: u16, payload: &[u8]) -> Result<Packet, NetError> {
    build(tx, ICMP_ECHO_REQUEST, 0, ((id as u32) << 16) | seq as u32, payload)
}

/// Destination unreachable quoting `original`, which starts at the IP
/// header of the offending datagram.
pub fn unreachable(tx: &Tx<'_>, code: u8, original: &[u8]) -> Result<Packet, NetError> {
    let ihl = original
        .first()
        .map(|b| ((b & 0x0f) as usize) * 4)
        .unwrap_or(IP4_HEADER_LEN);
    let quote = &original[..original.len().min(ihl + QUOTE_LEN)];
    build(tx, ICMP_DEST_UNREACHABLE, code, 0, quote)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcmpStats {
    pub echo_requests_in: u64,
    pub echo_replies_out: u64,
    pub unreachables_in: u64,
    pub unreachables_out: u64,
    pub dropped: u64,
}

/// What the stack has to do with an inbound message beyond the reply
/// already queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpEvent {
    None,
    EchoReply { id: u16, seq: u16, payload_len: usize },
    Unreachable { code: u8 },
}

#[derive(Default)]
pub struct Icmp4 {
    stats: IcmpStats,
}

impl Icmp4 {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> &IcmpStats {
        &self.stats
    }

    /// Handle an inbound message addressed to `local`.
    pub fn receive(&mut self, dgram: &Datagram, local: Ipv4Addr, tx: &mut Tx<'_>) -> IcmpEvent {
        let data = dgram.packet.data();
        if checksum(data) != 0 {
            klog_debug!("icmp: bad checksum from {}", dgram.src);
            self.stats.dropped += 1;
            return IcmpEvent::None;
        }
        let Some(hdr) = parse_header(data) else {
            klog_debug!("icmp: truncated message from {}", dgram.src);
            self.stats.dropped += 1;
            return IcmpEvent::None;
        };
        match hdr.typ {
            ICMP_ECHO_REQUEST => {
                self.stats.echo_requests_in += 1;
                klog_trace!("icmp: echo request from {} seq {}", dgram.src, hdr.seq());
                let payload = &data[ICMP_HEADER_LEN..];
                match build(tx, ICMP_ECHO_REPLY, 0, hdr.rest, payload) {
                    Ok(pkt) => {
                        tx.out.push_back(Datagram::new(
                            IpAddr::V4(local),
                            dgram.src,
                            Protocol::Icmp,
                            pkt,
                        ));
                        self.stats.echo_replies_out += 1;
                    }
                    Err(e) => klog_debug!("icmp: echo reply to {} failed: {}", dgram.src, e),
                }
                IcmpEvent::None
            }
            ICMP_ECHO_REPLY => IcmpEvent::EchoReply {
                id: hdr.id(),
                seq: hdr.seq(),
                payload_len: data.len() - ICMP_HEADER_LEN,
            },
            ICMP_DEST_UNREACHABLE => {
                self.stats.unreachables_in += 1;
                klog_debug!("icmp: {} reports unreachable code {}", dgram.src, hdr.code);
                IcmpEvent::Unreachable { code: hdr.code }
            }
            t => {
                klog_trace!("icmp: type {} from {} ignored", t, dgram.src);
                IcmpEvent::None
            }
        }
    }

    /// Tell `dst` that the datagram quoted by `original` hit a closed port.
    pub fn port_unreachable(
        &mut self,
        original: &[u8],
        local: Ipv4Addr,
        dst: Ipv4Addr,
        tx: &mut Tx<'_>,
    ) {
        match unreachable(tx, ICMP_CODE_PORT_UNREACHABLE, original) {
            Ok(pkt) => {
                tx.out.push_back(Datagram::new(
                    IpAddr::V4(local),
                    IpAddr::V4(dst),
                    Protocol::Icmp,
                    pkt,
                ));
                self.stats.unreachables_out += 1;
            }
            Err(e) => klog_debug!("icmp: port unreachable to {} failed: {}", dst, e),
        }
    }
}
