//! IPv6 (RFC 8200) fixed header and extension header chain.

use core::fmt;

use crate::packet::Packet;
use crate::types::{Ipv6Addr, NetError, Protocol};

pub const IP6_HEADER_LEN: usize = 40;
pub const IP6_VERSION: u8 = 6;
/// Authentication header; its length field counts 4-byte units.
const IP6_AH: u8 = 51;
const FRAGMENT_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ip6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ip6Drop {
    Truncated(usize),
    BadVersion(u8),
    BadPayloadLength(usize),
}

impl fmt::Display for Ip6Drop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(n) => write!(f, "packet too short ({} < {})", n, IP6_HEADER_LEN),
            Self::BadVersion(v) => write!(f, "bad version {}", v),
            Self::BadPayloadLength(n) => write!(f, "payload length {} exceeds packet", n),
        }
    }
}

pub fn parse_header(data: &[u8]) -> Result<Ip6Header, Ip6Drop> {
    if data.len() < IP6_HEADER_LEN {
        return Err(Ip6Drop::Truncated(data.len()));
    }
    let version = data[0] >> 4;
    if version != IP6_VERSION {
        return Err(Ip6Drop::BadVersion(version));
    }
    let payload_len = u16::from_be_bytes([data[4], data[5]]);
    if IP6_HEADER_LEN + payload_len as usize > data.len() {
        return Err(Ip6Drop::BadPayloadLength(payload_len as usize));
    }
    let word = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);
    Ok(Ip6Header {
        traffic_class: ((word >> 20) & 0xff) as u8,
        flow_label: word & 0x000f_ffff,
        payload_len,
        next_header: data[6],
        hop_limit: data[7],
        src: Ipv6Addr(src),
        dst: Ipv6Addr(dst),
    })
}

pub fn write_header(hdr: &Ip6Header, out: &mut [u8]) {
    let word = ((IP6_VERSION as u32) << 28)
        | ((hdr.traffic_class as u32) << 20)
        | (hdr.flow_label & 0x000f_ffff);
    out[0..4].copy_from_slice(&word.to_be_bytes());
    out[4..6].copy_from_slice(&hdr.payload_len.to_be_bytes());
    out[6] = hdr.next_header;
    out[7] = hdr.hop_limit;
    out[8..24].copy_from_slice(&hdr.src.0);
    out[24..40].copy_from_slice(&hdr.dst.0);
}

/// Prepend an IPv6 header to a packet whose layer begins at the first
/// extension or upper-layer header.
pub fn encapsulate(
    pkt: &mut Packet,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    hop_limit: u8,
) -> Result<(), NetError> {
    if pkt.len() > u16::MAX as usize {
        return Err(NetError::InvalidArgument);
    }
    let hdr = Ip6Header {
        traffic_class: 0,
        flow_label: 0,
        payload_len: pkt.len() as u16,
        next_header,
        hop_limit,
        src,
        dst,
    };
    write_header(&hdr, pkt.push_header(IP6_HEADER_LEN)?);
    pkt.mark_l3();
    Ok(())
}

/// Walk the extension header chain of an IPv6 payload.
///
/// `data` starts right after the fixed header and `first` is the fixed
/// header's next-header value. Returns the upper-layer protocol and the offset
/// of its header inside `data`. Every step is bounds-checked against the end
/// of `data`: a chain that runs past it yields [`Protocol::NoNext`] at the
/// offset of the broken header. Each step advances by at least 8 bytes, so the
/// walk ends after at most `data.len() / 8` steps.
pub fn parse_extension_headers(data: &[u8], first: u8) -> (u8, usize) {
    let no_next = Protocol::NoNext.as_u8();
    let mut next = first;
    let mut off = 0usize;
    loop {
        let len = match Protocol::from_u8(next) {
            Some(Protocol::HopByHop | Protocol::Routing | Protocol::DestOpts) => {
                if off + 2 > data.len() {
                    return (no_next, off);
                }
                (data[off + 1] as usize + 1) * 8
            }
            Some(Protocol::Fragment) => FRAGMENT_HEADER_LEN,
            _ if next == IP6_AH => {
                if off + 2 > data.len() {
                    return (no_next, off);
                }
                (data[off + 1] as usize + 2) * 4
            }
            _ => return (next, off),
        };
        if off + len > data.len() {
            return (no_next, off);
        }
        next = data[off];
        off += len;
    }
}
