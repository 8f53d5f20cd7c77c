//! Address translation of IPv4 packets.
//!
//! The free functions rewrite one side of a packet in place and patch the
//! IP and transport checksums incrementally. [`Napt`] adds the stateful
//! part: per-protocol tables of translated ports, kept in step with the
//! conntrack entries they belong to.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::RefCell;

use unikos_lib::{klog_debug, klog_trace};

use crate::checksum::{adjust_at, checksum_adjust};
use crate::conntrack::{Conntrack, EntryId, flow_of, l4_offset};
use crate::port_util::PortUtil;
use crate::types::{IpAddr, Ipv4Addr, NetError, Protocol, Quadruple, Socket};

const IP_CSUM_OFFSET: usize = 10;
const IP_SRC_OFFSET: usize = 12;
const IP_DST_OFFSET: usize = 16;
const TCP_CSUM_OFFSET: usize = 16;
const UDP_CSUM_OFFSET: usize = 6;

/// First port handed out for translated flows.
pub const NAPT_PORT_START: u16 = 60000;

/// What a translation rewrites one side of a packet to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatTarget {
    Addr(Ipv4Addr),
    Port(u16),
    Socket(Socket),
}

impl NatTarget {
    fn parts(self) -> Option<(Option<Ipv4Addr>, Option<u16>)> {
        match self {
            Self::Addr(a) => Some((Some(a), None)),
            Self::Port(p) => Some((None, Some(p))),
            Self::Socket(Socket {
                addr: IpAddr::V4(a),
                port,
            }) => Some((Some(a), Some(port))),
            Self::Socket(_) => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dst,
}

/// Transport checksum offset, `None` when the protocol has none to patch.
fn transport_csum(proto: u8, l4: &[u8]) -> Option<usize> {
    match Protocol::from_u8(proto)? {
        Protocol::Tcp if l4.len() >= TCP_CSUM_OFFSET + 2 => Some(TCP_CSUM_OFFSET),
        // A zero UDP checksum means "none" and stays zero.
        Protocol::Udp if l4.len() >= UDP_CSUM_OFFSET + 2 && (l4[6] | l4[7]) != 0 => {
            Some(UDP_CSUM_OFFSET)
        }
        _ => None,
    }
}

fn patch_transport(ip: &mut [u8], off: usize, old: &[u8], new: &[u8]) {
    let udp = ip[9] == Protocol::Udp.as_u8();
    let mut sum = u16::from_be_bytes([ip[off], ip[off + 1]]);
    checksum_adjust(&mut sum, old, new);
    if udp && sum == 0 {
        sum = 0xffff;
    }
    ip[off..off + 2].copy_from_slice(&sum.to_be_bytes());
}

fn rewrite(ip: &mut [u8], side: Side, target: NatTarget) -> bool {
    let Some((addr, port)) = target.parts() else {
        return false;
    };
    let l4 = l4_offset(ip);
    if ip.len() < l4 {
        return false;
    }
    let proto = ip[9];
    // Portless protocols only take the address part.
    let port = port.filter(|_| {
        matches!(Protocol::from_u8(proto), Some(Protocol::Tcp | Protocol::Udp))
    });
    if port.is_some() && ip.len() < l4 + 4 {
        return false;
    }
    let csum = transport_csum(proto, &ip[l4..]).map(|o| l4 + o);

    if let Some(new) = addr {
        let off = match side {
            Side::Src => IP_SRC_OFFSET,
            Side::Dst => IP_DST_OFFSET,
        };
        let mut old = [0u8; 4];
        old.copy_from_slice(&ip[off..off + 4]);
        adjust_at(ip, IP_CSUM_OFFSET, &old, new.as_bytes());
        if let Some(c) = csum {
            patch_transport(ip, c, &old, new.as_bytes());
        }
        ip[off..off + 4].copy_from_slice(new.as_bytes());
    }
    if let Some(new) = port {
        let off = l4
            + match side {
                Side::Src => 0,
                Side::Dst => 2,
            };
        let old = [ip[off], ip[off + 1]];
        let new = new.to_be_bytes();
        if let Some(c) = csum {
            patch_transport(ip, c, &old, &new);
        }
        ip[off..off + 2].copy_from_slice(&new);
    }
    true
}

/// Rewrite the source of an IPv4 packet (layer at its IP header).
pub fn snat(ip: &mut [u8], to: NatTarget) -> bool {
    rewrite(ip, Side::Src, to)
}

/// Rewrite the destination of an IPv4 packet (layer at its IP header).
pub fn dnat(ip: &mut [u8], to: NatTarget) -> bool {
    rewrite(ip, Side::Dst, to)
}

/// Translated ports of one protocol: which internal socket each external
/// port stands for.
///
/// A port is bound in the allocator exactly when it has a table entry.
pub struct PortMap {
    ports: PortUtil,
    map: BTreeMap<u16, Socket>,
}

impl PortMap {
    pub fn new() -> Self {
        Self {
            ports: PortUtil::with_start(NAPT_PORT_START),
            map: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn ports(&self) -> &PortUtil {
        &self.ports
    }

    pub fn lookup(&self, port: u16) -> Option<Socket> {
        self.map.get(&port).copied()
    }

    /// Bind the next free port for `internal`.
    pub fn add_entry(&mut self, internal: Socket) -> Result<u16, NetError> {
        let port = self.ports.bind_ephemeral()?;
        self.map.insert(port, internal);
        Ok(port)
    }

    /// Bind a specific port for `internal`.
    pub fn add_entry_port(&mut self, port: u16, internal: Socket) -> Result<(), NetError> {
        self.ports.bind(port)?;
        self.map.insert(port, internal);
        Ok(())
    }

    pub fn remove_entry(&mut self, port: u16) -> Option<Socket> {
        let internal = self.map.remove(&port)?;
        if !self.ports.unbind(port) {
            panic!("napt: port {} translated for {} was not bound", port, internal);
        }
        Some(internal)
    }

    /// Check the port/table correspondence.
    pub fn is_consistent(&self) -> bool {
        self.ports.bound_count() == self.map.len()
            && self.map.keys().all(|p| self.ports.is_bound(*p))
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateful translation on top of conntrack entries.
pub struct Napt {
    tcp: Rc<RefCell<PortMap>>,
    udp: Rc<RefCell<PortMap>>,
}

impl Napt {
    pub fn new() -> Self {
        Self {
            tcp: Rc::new(RefCell::new(PortMap::new())),
            udp: Rc::new(RefCell::new(PortMap::new())),
        }
    }

    pub fn table(&self, proto: Protocol) -> Option<&Rc<RefCell<PortMap>>> {
        match proto {
            Protocol::Tcp => Some(&self.tcp),
            Protocol::Udp => Some(&self.udp),
            _ => None,
        }
    }

    /// Rewrite the source of the first-direction packet `ip` of entry `id`
    /// to `to`, and expect replies at the new socket.
    pub fn snat(&mut self, ip: &mut [u8], ct: &mut Conntrack, id: EntryId, to: NatTarget) -> bool {
        let Some(e) = ct.entry(id) else {
            return false;
        };
        let (proto, second) = (e.proto, e.second);
        if !snat(ip, to) {
            return false;
        }
        let mut dst = second.dst;
        apply(&mut dst, to);
        ct.update_entry(proto, &second, Quadruple::new(second.src, dst));
        true
    }

    /// Rewrite the destination of the first-direction packet `ip` of entry
    /// `id` to `to`, and expect replies from it.
    pub fn dnat(&mut self, ip: &mut [u8], ct: &mut Conntrack, id: EntryId, to: NatTarget) -> bool {
        let Some(e) = ct.entry(id) else {
            return false;
        };
        let (proto, second) = (e.proto, e.second);
        if !dnat(ip, to) {
            return false;
        }
        let mut src = second.src;
        apply(&mut src, to);
        ct.update_entry(proto, &second, Quadruple::new(src, second.dst));
        true
    }

    /// Undo a destination translation on a reply: its source becomes the
    /// destination the flow was opened towards.
    pub fn snat_back(&self, ip: &mut [u8], ct: &Conntrack, id: EntryId) -> bool {
        match ct.entry(id) {
            Some(e) if !e.is_mirrored() => snat(ip, NatTarget::Socket(e.first.dst)),
            _ => false,
        }
    }

    /// Undo a source translation on a reply: its destination becomes the
    /// socket that opened the flow.
    pub fn dnat_back(&self, ip: &mut [u8], ct: &Conntrack, id: EntryId) -> bool {
        match ct.entry(id) {
            Some(e) if !e.is_mirrored() => dnat(ip, NatTarget::Socket(e.first.src)),
            _ => false,
        }
    }

    /// Source-translate a first-direction packet to `external` and a port of
    /// its own. The port is released when the conntrack entry goes away.
    pub fn masquerade(
        &mut self,
        ip: &mut [u8],
        ct: &mut Conntrack,
        id: EntryId,
        external: Ipv4Addr,
    ) -> Result<(), NetError> {
        let flow = flow_of(ip).ok_or(NetError::InvalidArgument)?;
        let e = ct.entry(id).ok_or(NetError::InvalidState)?;
        if flow.quad != e.first {
            return Err(NetError::InvalidArgument);
        }
        if !e.is_mirrored() {
            // Already translated; reuse it.
            let to = e.second.dst;
            snat(ip, NatTarget::Socket(to));
            return Ok(());
        }
        let Some(table) = self.table(flow.proto).cloned() else {
            // Portless protocols only get the address rewritten.
            self.snat(ip, ct, id, NatTarget::Addr(external));
            return Ok(());
        };
        let port = table.borrow_mut().add_entry(flow.quad.src)?;
        let release = table.clone();
        let registered = ct.on_close(id, move |entry| {
            if let Some(internal) = release.borrow_mut().remove_entry(port) {
                klog_debug!("napt: released port {} of {} ({})", port, internal, entry.proto);
            }
        });
        if !registered {
            // Nothing would ever release the port.
            table.borrow_mut().remove_entry(port);
            return Err(NetError::InvalidState);
        }
        let ext = Socket::v4(external, port);
        klog_trace!("napt: {} {} masqueraded as {}", flow.proto, flow.quad.src, ext);
        self.snat(ip, ct, id, NatTarget::Socket(ext));
        Ok(())
    }

    /// Restore the destination of a reply to a masqueraded flow.
    pub fn demasquerade(&self, ip: &mut [u8], ct: &Conntrack, id: EntryId) -> bool {
        let Some(flow) = flow_of(ip) else {
            return false;
        };
        match ct.entry(id) {
            Some(e) if flow.quad == e.second => self.dnat_back(ip, ct, id),
            _ => false,
        }
    }
}

impl Default for Napt {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(sock: &mut Socket, to: NatTarget) {
    match to {
        NatTarget::Addr(a) => sock.addr = IpAddr::V4(a),
        NatTarget::Port(p) => sock.port = p,
        NatTarget::Socket(s) => *sock = s,
    }
}
