//! Type-safe network primitives shared by every layer of the stack.
//!
//! Addresses are stored in network byte order exactly as they appear on the
//! wire; ports and other numeric fields are kept in host order and converted
//! explicitly when headers are read or written.

use core::fmt;
use core::str::FromStr;

// =============================================================================
// Addresses
// =============================================================================

/// IPv4 address stored in **network byte order**.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);

    #[inline]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    #[inline]
    pub const fn from_u32_be(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    #[inline]
    pub const fn to_u32_be(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub const fn is_unspecified(&self) -> bool {
        self.to_u32_be() == 0
    }

    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        self.to_u32_be() == u32::MAX
    }

    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] >= 224 && self.0[0] <= 239
    }

    #[inline]
    pub const fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// `true` if `addr` is inside the subnet `network/mask`.
    #[inline]
    pub const fn in_subnet(addr: Ipv4Addr, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
        let m = mask.to_u32_be();
        (addr.to_u32_be() & m) == (network.to_u32_be() & m)
    }

    /// Netmask with the top `bits` bits set.
    pub const fn netmask(bits: u8) -> Self {
        if bits == 0 {
            Self::UNSPECIFIED
        } else if bits >= 32 {
            Self::BROADCAST
        } else {
            Self::from_u32_be(u32::MAX << (32 - bits as u32))
        }
    }

    /// Prefix length if this is a contiguous netmask.
    pub fn mask_bits(&self) -> Option<u8> {
        let m = self.to_u32_be();
        let ones = m.leading_ones();
        match m.checked_shl(ones) {
            Some(rest) if rest != 0 => None,
            _ => Some(ones as u8),
        }
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Returned when an address string does not parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrParseError;

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address syntax")
    }
}

impl FromStr for Ipv4Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 4];
        let mut parts = s.split('.');
        for octet in out.iter_mut() {
            let part = parts.next().ok_or(AddrParseError)?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(AddrParseError);
            }
            *octet = part.parse().map_err(|_| AddrParseError)?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError);
        }
        Ok(Self(out))
    }
}

/// IPv6 address stored in **network byte order**.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv6Addr(pub [u8; 16]);

impl Ipv6Addr {
    pub const UNSPECIFIED: Self = Self([0; 16]);
    pub const LOCALHOST: Self = Self([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    /// `ff02::1`
    pub const ALL_NODES: Self = Self([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    /// `ff02::2`
    pub const ALL_ROUTERS: Self = Self([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
    /// `ff02::16`, destination of MLDv2 reports.
    pub const ALL_MLDV2_ROUTERS: Self =
        Self([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x16]);

    pub const fn from_segments(seg: [u16; 8]) -> Self {
        let mut out = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            let b = seg[i].to_be_bytes();
            out[i * 2] = b[0];
            out[i * 2 + 1] = b[1];
            i += 1;
        }
        Self(out)
    }

    pub fn segments(&self) -> [u16; 8] {
        let mut seg = [0u16; 8];
        for (i, s) in seg.iter_mut().enumerate() {
            *s = u16::from_be_bytes([self.0[i * 2], self.0[i * 2 + 1]]);
        }
        seg
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 16]
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    #[inline]
    pub fn is_link_local(&self) -> bool {
        self.0[0] == 0xfe && (self.0[1] & 0xc0) == 0x80
    }

    /// `ff02::1:ffXX:XXXX` for this address.
    pub fn solicited_node(&self) -> Self {
        let mut out = [0u8; 16];
        out[0] = 0xff;
        out[1] = 0x02;
        out[11] = 0x01;
        out[12] = 0xff;
        out[13..].copy_from_slice(&self.0[13..]);
        Self(out)
    }

    /// `fe80::/64` combined with the EUI-64 identifier of `mac`.
    pub fn link_local_from_mac(mac: MacAddr) -> Self {
        Self::from_prefix_and_mac(&Self([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]), mac)
    }

    /// Upper 64 bits of `prefix` plus the modified EUI-64 identifier of `mac`.
    pub fn from_prefix_and_mac(prefix: &Ipv6Addr, mac: MacAddr) -> Self {
        let m = mac.0;
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&prefix.0[..8]);
        out[8] = m[0] ^ 0x02;
        out[9] = m[1];
        out[10] = m[2];
        out[11] = 0xff;
        out[12] = 0xfe;
        out[13] = m[3];
        out[14] = m[4];
        out[15] = m[5];
        Self(out)
    }

    /// `true` when the first `prefix_len` bits of both addresses agree.
    pub fn matches_prefix(&self, other: &Ipv6Addr, prefix_len: u8) -> bool {
        let bits = prefix_len.min(128) as usize;
        let full = bits / 8;
        if self.0[..full] != other.0[..full] {
            return false;
        }
        let rem = bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (self.0[full] & mask) == (other.0[full] & mask)
    }

    /// Multicast MAC `33:33:xx:xx:xx:xx` for this (multicast) address.
    pub fn multicast_mac(&self) -> MacAddr {
        MacAddr([0x33, 0x33, self.0[12], self.0[13], self.0[14], self.0[15]])
    }
}

impl fmt::Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seg = self.segments();
        // Longest run of zero groups (length >= 2) collapses to "::".
        let mut best = (0usize, 0usize);
        let mut i = 0;
        while i < 8 {
            if seg[i] == 0 {
                let start = i;
                while i < 8 && seg[i] == 0 {
                    i += 1;
                }
                if i - start > best.1 {
                    best = (start, i - start);
                }
            } else {
                i += 1;
            }
        }
        if best.1 < 2 {
            for (i, s) in seg.iter().enumerate() {
                if i > 0 {
                    write!(f, ":")?;
                }
                write!(f, "{:x}", s)?;
            }
            return Ok(());
        }
        for (i, s) in seg[..best.0].iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", s)?;
        }
        write!(f, "::")?;
        for (i, s) in seg[best.0 + best.1..].iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", s)?;
        }
        Ok(())
    }
}

fn parse_groups(s: &str, out: &mut [u16; 8]) -> Result<usize, AddrParseError> {
    if s.is_empty() {
        return Ok(0);
    }
    let mut n = 0;
    for group in s.split(':') {
        if n == 8 || group.is_empty() || group.len() > 4 {
            return Err(AddrParseError);
        }
        out[n] = u16::from_str_radix(group, 16).map_err(|_| AddrParseError)?;
        n += 1;
    }
    Ok(n)
}

impl FromStr for Ipv6Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut seg = [0u16; 8];
        match s.find("::") {
            Some(pos) => {
                let (head, tail) = (&s[..pos], &s[pos + 2..]);
                if tail.contains("::") {
                    return Err(AddrParseError);
                }
                let mut h = [0u16; 8];
                let mut t = [0u16; 8];
                let hn = parse_groups(head, &mut h)?;
                let tn = parse_groups(tail, &mut t)?;
                if hn + tn > 7 {
                    return Err(AddrParseError);
                }
                seg[..hn].copy_from_slice(&h[..hn]);
                seg[8 - tn..].copy_from_slice(&t[..tn]);
            }
            None => {
                if parse_groups(s, &mut seg)? != 8 {
                    return Err(AddrParseError);
                }
            }
        }
        Ok(Self::from_segments(seg))
    }
}

/// Either address family.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddr {
    #[inline]
    pub fn is_v4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            Self::V4(a) => a.is_unspecified(),
            Self::V6(a) => a.is_unspecified(),
        }
    }

    /// The unspecified address of the same family.
    pub fn unspecified_like(&self) -> Self {
        match self {
            Self::V4(_) => Self::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6(_) => Self::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(a: Ipv4Addr) -> Self {
        Self::V4(a)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(a: Ipv6Addr) -> Self {
        Self::V6(a)
    }
}

impl fmt::Debug for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(a) => write!(f, "{}", a),
            Self::V6(a) => write!(f, "{}", a),
        }
    }
}

impl FromStr for IpAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse().map(Self::V6)
        } else {
            s.parse().map(Self::V4)
        }
    }
}

/// Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0; 6]);

    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.0, [0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
    }

    /// Least-significant bit of the first octet.
    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

// =============================================================================
// Sockets and quadruples
// =============================================================================

/// (address, port) endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Socket {
    pub addr: IpAddr,
    pub port: u16,
}

impl Socket {
    #[inline]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    #[inline]
    pub const fn v4(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr: IpAddr::V4(addr), port }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

/// Pair of sockets identifying a flow.
///
/// For TCP connections `src` is the local end and `dst` the remote end. In
/// connection tracking `src` is whoever sent the packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quadruple {
    pub src: Socket,
    pub dst: Socket,
}

impl Quadruple {
    #[inline]
    pub const fn new(src: Socket, dst: Socket) -> Self {
        Self { src, dst }
    }

    /// The same flow seen from the other end.
    #[inline]
    pub const fn swapped(&self) -> Self {
        Self { src: self.dst, dst: self.src }
    }
}

impl fmt::Debug for Quadruple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Quadruple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

// =============================================================================
// Protocol numbers
// =============================================================================

/// Ethernet frame type field values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Vlan = 0x8100,
    Ipv6 = 0x86DD,
}

impl EtherType {
    #[inline]
    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x8100 => Some(Self::Vlan),
            0x86DD => Some(Self::Ipv6),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Arp => write!(f, "ARP"),
            Self::Vlan => write!(f, "802.1Q"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// IP protocol / IPv6 next-header values understood by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    HopByHop = 0,
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    Routing = 43,
    Fragment = 44,
    Icmpv6 = 58,
    NoNext = 59,
    DestOpts = 60,
}

impl Protocol {
    #[inline]
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::HopByHop),
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            43 => Some(Self::Routing),
            44 => Some(Self::Fragment),
            58 => Some(Self::Icmpv6),
            59 => Some(Self::NoNext),
            60 => Some(Self::DestOpts),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HopByHop => write!(f, "HOPOPT"),
            Self::Icmp => write!(f, "ICMP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Routing => write!(f, "IPv6-Route"),
            Self::Fragment => write!(f, "IPv6-Frag"),
            Self::Icmpv6 => write!(f, "ICMPv6"),
            Self::NoNext => write!(f, "IPv6-NoNxt"),
            Self::DestOpts => write!(f, "IPv6-Opts"),
        }
    }
}

// =============================================================================
// NetError
// =============================================================================

/// Error codes surfaced to callers of the stack and to connection callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// Connection refused by the remote host.
    ConnectionRefused,
    /// Connection reset by the remote host.
    ConnectionReset,
    /// Connection aborted locally.
    ConnectionAborted,
    /// Retransmission limit or handshake timeout reached.
    TimedOut,
    /// The interface went down underneath the connection.
    InterfaceDown,
    AddressInUse,
    AddressNotAvailable,
    /// No free ephemeral port left.
    PortsExhausted,
    NotConnected,
    AlreadyConnected,
    NetworkUnreachable,
    HostUnreachable,
    InvalidArgument,
    /// Operation not allowed in the current state.
    InvalidState,
    NoBufferSpace,
    ProtocolNotSupported,
    /// Write after close.
    Shutdown,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::InterfaceDown => write!(f, "interface down"),
            Self::AddressInUse => write!(f, "address already in use"),
            Self::AddressNotAvailable => write!(f, "address not available"),
            Self::PortsExhausted => write!(f, "no free ports"),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid state for operation"),
            Self::NoBufferSpace => write!(f, "no buffer space available"),
            Self::ProtocolNotSupported => write!(f, "protocol not supported"),
            Self::Shutdown => write!(f, "connection closing"),
        }
    }
}
