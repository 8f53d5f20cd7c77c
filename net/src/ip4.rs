//! IPv4 (RFC 791) header handling and interface configuration.

use core::fmt;

use crate::checksum::checksum;
use crate::config::ConfigError;
use crate::packet::Packet;
use crate::types::{Ipv4Addr, NetError, Protocol};

pub const IP4_HEADER_LEN: usize = 20;
pub const IP4_VERSION: u8 = 4;
/// More-fragments flag in the flags/fragment-offset word.
pub const IP4_MF: u16 = 0x2000;
pub const IP4_DF: u16 = 0x4000;
pub const IP4_FRAG_OFFSET_MASK: u16 = 0x1fff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ip4Header {
    /// Header length in bytes.
    pub ihl: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ip4Header {
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.flags_frag & IP4_MF != 0 || self.flags_frag & IP4_FRAG_OFFSET_MASK != 0
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.total_len as usize - self.ihl
    }
}

/// Why an inbound header was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ip4Drop {
    Truncated(usize),
    BadVersion(u8),
    BadHeaderLength(usize),
    BadTotalLength(usize),
    BadChecksum,
    TtlExpired,
}

impl fmt::Display for Ip4Drop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(n) => write!(f, "packet too short ({} < {})", n, IP4_HEADER_LEN),
            Self::BadVersion(v) => write!(f, "bad version {}", v),
            Self::BadHeaderLength(n) => write!(f, "bad IHL {}", n),
            Self::BadTotalLength(n) => write!(f, "bad total length {}", n),
            Self::BadChecksum => write!(f, "bad header checksum"),
            Self::TtlExpired => write!(f, "TTL=0"),
        }
    }
}

/// Validate and decode the header at the start of `data`.
///
/// Checks, in order: length, version, IHL, total length against the
/// buffer, header checksum, TTL.
pub fn parse_header(data: &[u8]) -> Result<Ip4Header, Ip4Drop> {
    if data.len() < IP4_HEADER_LEN {
        return Err(Ip4Drop::Truncated(data.len()));
    }
    let version = data[0] >> 4;
    if version != IP4_VERSION {
        return Err(Ip4Drop::BadVersion(version));
    }
    let ihl = ((data[0] & 0x0f) as usize) * 4;
    if ihl < IP4_HEADER_LEN || data.len() < ihl {
        return Err(Ip4Drop::BadHeaderLength(ihl));
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]);
    if (total_len as usize) < ihl || total_len as usize > data.len() {
        return Err(Ip4Drop::BadTotalLength(total_len as usize));
    }
    if checksum(&data[..ihl]) != 0 {
        return Err(Ip4Drop::BadChecksum);
    }
    let ttl = data[8];
    if ttl == 0 {
        return Err(Ip4Drop::TtlExpired);
    }
    Ok(Ip4Header {
        ihl,
        tos: data[1],
        total_len,
        id: u16::from_be_bytes([data[4], data[5]]),
        flags_frag: u16::from_be_bytes([data[6], data[7]]),
        ttl,
        protocol: data[9],
        checksum: u16::from_be_bytes([data[10], data[11]]),
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    })
}

/// Write a 20-byte header (no options) with a fresh checksum.
pub fn write_header(hdr: &Ip4Header, out: &mut [u8]) {
    out[0] = (IP4_VERSION << 4) | (IP4_HEADER_LEN / 4) as u8;
    out[1] = hdr.tos;
    out[2..4].copy_from_slice(&hdr.total_len.to_be_bytes());
    out[4..6].copy_from_slice(&hdr.id.to_be_bytes());
    out[6..8].copy_from_slice(&hdr.flags_frag.to_be_bytes());
    out[8] = hdr.ttl;
    out[9] = hdr.protocol;
    out[10..12].copy_from_slice(&[0, 0]);
    out[12..16].copy_from_slice(hdr.src.as_bytes());
    out[16..20].copy_from_slice(hdr.dst.as_bytes());
    let csum = checksum(&out[..IP4_HEADER_LEN]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Prepend an IPv4 header to a packet whose layer begins at the transport
/// header.
pub fn encapsulate(
    pkt: &mut Packet,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: Protocol,
    ttl: u8,
    id: u16,
) -> Result<(), NetError> {
    let total = pkt.len() + IP4_HEADER_LEN;
    if total > u16::MAX as usize {
        return Err(NetError::InvalidArgument);
    }
    let hdr = Ip4Header {
        ihl: IP4_HEADER_LEN,
        tos: 0,
        total_len: total as u16,
        id,
        flags_frag: IP4_DF,
        ttl,
        protocol: protocol.as_u8(),
        checksum: 0,
        src,
        dst,
    };
    write_header(&hdr, pkt.push_header(IP4_HEADER_LEN)?);
    pkt.mark_l3();
    Ok(())
}

/// Static configuration of an IPv4 interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ip4Config {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Unspecified when there is no default route.
    pub gateway: Ipv4Addr,
    pub dns: Option<Ipv4Addr>,
}

impl Ip4Config {
    /// Check the combination before anything is applied.
    pub fn new(
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Option<Ipv4Addr>,
    ) -> Result<Self, ConfigError> {
        if addr.is_unspecified() {
            return Err(ConfigError::UnspecifiedAddress);
        }
        if netmask.mask_bits().is_none() {
            return Err(ConfigError::InvalidNetmask);
        }
        if !gateway.is_unspecified() && !Ipv4Addr::in_subnet(gateway, addr, netmask) {
            return Err(ConfigError::GatewayOutsideSubnet);
        }
        Ok(Self {
            addr,
            netmask,
            gateway,
            dns,
        })
    }

    #[inline]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.addr.to_u32_be() & self.netmask.to_u32_be())
    }

    /// Directed broadcast address of the subnet.
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.addr.to_u32_be() | !self.netmask.to_u32_be())
    }

    #[inline]
    pub fn on_link(&self, dst: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(dst, self.addr, self.netmask)
    }

    /// Address whose link address a packet for `dst` goes to.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        if dst.is_broadcast() || dst.is_multicast() || self.on_link(dst) {
            Some(dst)
        } else if !self.gateway.is_unspecified() {
            Some(self.gateway)
        } else {
            None
        }
    }

    /// Whether a packet addressed to `dst` is for this interface.
    pub fn accepts(&self, dst: Ipv4Addr) -> bool {
        dst == self.addr || dst.is_broadcast() || dst == self.broadcast() || dst.is_multicast()
    }
}
