//! IPv6 neighbor discovery (RFC 4861) and stateless address
//! autoconfiguration (RFC 4862).
//!
//! [`Ndp`] owns the interface's IPv6 address list, the neighbor cache and the
//! default router. Neighbor and router messages arrive already verified by
//! [`icmp6::verify`](crate::icmp6::verify).

extern crate alloc;

use alloc::vec::Vec;
use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::{klog_debug, klog_info, klog_trace};

use crate::ethernet::LinkIo;
use crate::icmp4::IcmpHeader;
use crate::icmp6::{
    self, NDP_NEIGHBOR_ADVERTISEMENT, NDP_NEIGHBOR_SOLICITATION, NDP_REDIRECT,
    NDP_ROUTER_ADVERTISEMENT, NDP_ROUTER_SOLICITATION,
};
use crate::ip6;
use crate::neighbor::{NeighborCache, Resolve, Retry};
use crate::packet::Packet;
use crate::timer::NetTimer;
use crate::types::{EtherType, Ipv6Addr, MacAddr, NetError, Protocol};

/// Hop limit every neighbor discovery message is sent and received with.
pub const NDP_HOP_LIMIT: u8 = 255;
/// Interval of the cache and lifetime maintenance tick.
pub const NDP_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Lifetime value meaning "forever".
pub const INFINITE_LIFETIME: u32 = u32::MAX;
/// Floor below which a re-advertisement may not cut the valid lifetime of an
/// autoconfigured address (RFC 4862 5.5.3 e).
pub const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);
/// Prefix length autoconfiguration derives interface identifiers for.
pub const AUTOCONF_PREFIX_LEN: u8 = 64;

const OPT_SOURCE_LL_ADDR: u8 = 1;
const OPT_TARGET_LL_ADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;

const NA_FLAG_SOLICITED: u32 = 0x4000_0000;
const NA_FLAG_OVERRIDE: u32 = 0x2000_0000;

const PREFIX_FLAG_ON_LINK: u8 = 0x80;
const PREFIX_FLAG_AUTONOMOUS: u8 = 0x40;

/// Deadline of a lifetime given in seconds, `None` for infinite.
fn deadline(now: Duration, lifetime: u32) -> Option<Duration> {
    (lifetime != INFINITE_LIFETIME).then(|| now + Duration::from_secs(lifetime as u64))
}

/// One IPv6 address of the interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ip6AddrEntry {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    /// `None` while the address never deprecates.
    pub preferred_until: Option<Duration>,
    /// `None` while the address never expires.
    pub valid_until: Option<Duration>,
    /// Created from a router advertisement rather than configured.
    pub autoconf: bool,
}

impl Ip6AddrEntry {
    pub fn is_valid(&self, now: Duration) -> bool {
        self.valid_until.is_none_or(|t| now < t)
    }

    pub fn is_preferred(&self, now: Duration) -> bool {
        self.preferred_until.is_none_or(|t| now < t)
    }

    /// Valid lifetime left at `now`; `None` means infinite.
    pub fn remaining_valid(&self, now: Duration) -> Option<Duration> {
        self.valid_until.map(|t| t.saturating_sub(now))
    }

    #[inline]
    pub fn on_link(&self, dst: &Ipv6Addr) -> bool {
        self.addr.matches_prefix(dst, self.prefix_len)
    }
}

/// The addresses assigned to one interface.
#[derive(Default)]
pub struct AddrList {
    entries: Vec<Ip6AddrEntry>,
}

impl AddrList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ip6AddrEntry> {
        self.entries.iter()
    }

    pub fn get(&self, addr: &Ipv6Addr) -> Option<&Ip6AddrEntry> {
        self.entries.iter().find(|e| e.addr == *addr)
    }

    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.get(addr).is_some()
    }

    pub fn link_local(&self) -> Option<Ipv6Addr> {
        self.entries
            .iter()
            .find(|e| e.addr.is_link_local())
            .map(|e| e.addr)
    }

    /// Add or update a configured address. Returns `true` if it is new.
    pub fn add(
        &mut self,
        addr: Ipv6Addr,
        prefix_len: u8,
        preferred_lft: u32,
        valid_lft: u32,
        now: Duration,
    ) -> bool {
        let entry = Ip6AddrEntry {
            addr,
            prefix_len,
            preferred_until: deadline(now, preferred_lft),
            valid_until: deadline(now, valid_lft),
            autoconf: false,
        };
        match self.entries.iter_mut().find(|e| e.addr == addr) {
            Some(e) => {
                *e = entry;
                false
            }
            None => {
                self.entries.push(entry);
                true
            }
        }
    }

    /// Form or refresh the address for an advertised prefix.
    ///
    /// A new address takes the advertised lifetimes. For an existing
    /// autoconfigured address the valid lifetime follows RFC 4862 5.5.3 e:
    /// the advertised value is taken when it exceeds two hours or the time
    /// left; otherwise the time left is kept when it is at most two hours,
    /// and cut to two hours when it is longer. Returns the address when it
    /// was newly formed.
    pub fn add_autoconf(
        &mut self,
        prefix: &Ipv6Addr,
        prefix_len: u8,
        preferred_lft: u32,
        valid_lft: u32,
        mac: MacAddr,
        now: Duration,
    ) -> Option<Ipv6Addr> {
        let addr = Ipv6Addr::from_prefix_and_mac(prefix, mac);
        if let Some(e) = self.entries.iter_mut().find(|e| e.addr == addr) {
            e.preferred_until = deadline(now, preferred_lft);
            let advertised =
                (valid_lft != INFINITE_LIFETIME).then(|| Duration::from_secs(valid_lft as u64));
            let remaining = e.remaining_valid(now);
            e.valid_until = match (advertised, remaining) {
                (None, _) => None,
                (Some(adv), rem) if adv > TWO_HOURS || rem.is_some_and(|r| adv > r) => {
                    Some(now + adv)
                }
                (Some(_), Some(rem)) if rem <= TWO_HOURS => e.valid_until,
                (Some(_), _) => Some(now + TWO_HOURS),
            };
            return None;
        }
        self.entries.push(Ip6AddrEntry {
            addr,
            prefix_len,
            preferred_until: deadline(now, preferred_lft),
            valid_until: deadline(now, valid_lft),
            autoconf: true,
        });
        Some(addr)
    }

    pub fn remove(&mut self, addr: &Ipv6Addr) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.addr != *addr);
        self.entries.len() != before
    }

    /// Drop addresses whose valid lifetime ran out. Returns them.
    pub fn expire(&mut self, now: Duration) -> Vec<Ipv6Addr> {
        let mut gone = Vec::new();
        self.entries.retain(|e| {
            let keep = e.is_valid(now);
            if !keep {
                gone.push(e.addr);
            }
            keep
        });
        gone
    }

    /// Source address for traffic to `dst`: a preferred address on the same
    /// link first, then any preferred global, then the link-local one.
    pub fn source_for(&self, dst: &Ipv6Addr, now: Duration) -> Option<Ipv6Addr> {
        let usable = || self.entries.iter().filter(|e| e.is_preferred(now));
        if dst.is_link_local() || dst.is_multicast() {
            if let Some(ll) = self.link_local() {
                return Some(ll);
            }
        }
        usable()
            .find(|e| !e.addr.is_link_local() && e.on_link(dst))
            .or_else(|| usable().find(|e| !e.addr.is_link_local()))
            .or_else(|| usable().next())
            .map(|e| e.addr)
    }

    /// Whether `dst` is on a prefix of this link.
    pub fn on_link(&self, dst: &Ipv6Addr) -> bool {
        dst.is_link_local() || self.entries.iter().any(|e| e.on_link(dst))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NdpStats {
    pub solicitations_in: u64,
    pub solicitations_out: u64,
    pub advertisements_in: u64,
    pub advertisements_out: u64,
    pub router_advertisements_in: u64,
    pub dropped: u64,
    /// IPv6 packets discarded because resolution failed.
    pub unresolved: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DefaultRouter {
    addr: Ipv6Addr,
    until: Duration,
}

/// What the stack must do after an inbound neighbor discovery message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NdpEvent {
    None,
    /// Autoconfiguration formed new addresses; their solicited-node groups
    /// must be joined.
    AddressesFormed(Vec<Ipv6Addr>),
}

/// Options of a neighbor discovery message.
#[derive(Default)]
struct NdOptions {
    source_ll: Option<MacAddr>,
    target_ll: Option<MacAddr>,
    prefixes: Vec<PrefixInfo>,
}

#[derive(Clone, Copy)]
struct PrefixInfo {
    prefix_len: u8,
    flags: u8,
    valid: u32,
    preferred: u32,
    prefix: Ipv6Addr,
}

/// Walk the TLV options; stops at the first malformed one.
fn parse_options(mut data: &[u8]) -> NdOptions {
    let mut opts = NdOptions::default();
    while data.len() >= 2 {
        let typ = data[0];
        let len = data[1] as usize * 8;
        if len == 0 || len > data.len() {
            break;
        }
        let body = &data[..len];
        match typ {
            OPT_SOURCE_LL_ADDR | OPT_TARGET_LL_ADDR if len >= 8 => {
                let mut m = [0u8; 6];
                m.copy_from_slice(&body[2..8]);
                if typ == OPT_SOURCE_LL_ADDR {
                    opts.source_ll = Some(MacAddr(m));
                } else {
                    opts.target_ll = Some(MacAddr(m));
                }
            }
            OPT_PREFIX_INFO if len >= 32 => {
                let mut p = [0u8; 16];
                p.copy_from_slice(&body[16..32]);
                opts.prefixes.push(PrefixInfo {
                    prefix_len: body[2],
                    flags: body[3],
                    valid: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                    preferred: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
                    prefix: Ipv6Addr(p),
                });
            }
            _ => {}
        }
        data = &data[len..];
    }
    opts
}

fn ll_option(typ: u8, mac: MacAddr) -> [u8; 8] {
    let mut opt = [0u8; 8];
    opt[0] = typ;
    opt[1] = 1;
    opt[2..8].copy_from_slice(mac.as_bytes());
    opt
}

fn read_addr(data: &[u8]) -> Ipv6Addr {
    let mut a = [0u8; 16];
    a.copy_from_slice(&data[..16]);
    Ipv6Addr(a)
}

pub struct Ndp {
    addrs: AddrList,
    cache: NeighborCache<Ipv6Addr>,
    router: Option<DefaultRouter>,
    stats: NdpStats,
    tick_timer: Option<TimerId>,
}

impl Ndp {
    pub fn new() -> Self {
        Self {
            addrs: AddrList::new(),
            cache: NeighborCache::new(),
            router: None,
            stats: NdpStats::default(),
            tick_timer: None,
        }
    }

    #[inline]
    pub fn addrs(&self) -> &AddrList {
        &self.addrs
    }

    #[inline]
    pub fn cache(&self) -> &NeighborCache<Ipv6Addr> {
        &self.cache
    }

    #[inline]
    pub fn stats(&self) -> &NdpStats {
        &self.stats
    }

    pub fn default_router(&self) -> Option<Ipv6Addr> {
        self.router.map(|r| r.addr)
    }

    /// Configure a default router by hand; it expires like an advertised one.
    pub fn add_router(&mut self, addr: Ipv6Addr, lifetime: Duration, io: &mut LinkIo<'_>) {
        klog_info!("ndp: default router {} (static)", addr);
        self.router = Some(DefaultRouter {
            addr,
            until: io.timers.now() + lifetime,
        });
        self.ensure_tick(io);
    }

    /// Assign a static address. Returns `true` if it is new.
    pub fn add_addr(
        &mut self,
        addr: Ipv6Addr,
        prefix_len: u8,
        preferred_lft: u32,
        valid_lft: u32,
        io: &mut LinkIo<'_>,
    ) -> bool {
        let now = io.timers.now();
        let added = self.addrs.add(addr, prefix_len, preferred_lft, valid_lft, now);
        if added {
            klog_info!("ndp: address {}/{} assigned", addr, prefix_len);
        }
        self.ensure_tick(io);
        added
    }

    /// Apply an advertised prefix with the interface's own link address.
    pub fn add_addr_autoconf(
        &mut self,
        prefix: &Ipv6Addr,
        prefix_len: u8,
        preferred_lft: u32,
        valid_lft: u32,
        io: &mut LinkIo<'_>,
    ) -> Option<Ipv6Addr> {
        let now = io.timers.now();
        let formed =
            self.addrs
                .add_autoconf(prefix, prefix_len, preferred_lft, valid_lft, io.mac, now);
        if let Some(addr) = formed {
            klog_info!("ndp: autoconfigured {}/{}", addr, prefix_len);
        }
        self.ensure_tick(io);
        formed
    }

    pub fn remove_addr(&mut self, addr: &Ipv6Addr) -> bool {
        self.addrs.remove(addr)
    }

    /// Whether a packet for `dst` is for this interface, not counting
    /// joined multicast groups.
    pub fn accepts(&self, dst: &Ipv6Addr) -> bool {
        self.addrs.contains(dst)
            || *dst == Ipv6Addr::ALL_NODES
            || self.addrs.iter().any(|e| e.addr.solicited_node() == *dst)
    }

    /// Address whose link address a packet for `dst` goes to.
    pub fn next_hop(&self, dst: &Ipv6Addr) -> Option<Ipv6Addr> {
        if dst.is_multicast() || self.addrs.on_link(dst) {
            Some(*dst)
        } else {
            self.default_router()
        }
    }

    fn ensure_tick(&mut self, io: &mut LinkIo<'_>) {
        if self.tick_timer.is_none() {
            self.tick_timer = Some(io.timers.periodic(
                NDP_TICK_INTERVAL,
                NDP_TICK_INTERVAL,
                NetTimer::NdpTick,
            ));
        }
    }

    /// A verified neighbor discovery message from `src` to `dst`. `data`
    /// starts at the ICMPv6 header.
    pub fn receive(
        &mut self,
        hdr: &IcmpHeader,
        data: &[u8],
        src: Ipv6Addr,
        hop_limit: u8,
        io: &mut LinkIo<'_>,
    ) -> NdpEvent {
        if hop_limit != NDP_HOP_LIMIT || hdr.code != 0 {
            klog_debug!("ndp: type {} from {} with hop limit {}, dropping", hdr.typ, src, hop_limit);
            self.stats.dropped += 1;
            return NdpEvent::None;
        }
        match hdr.typ {
            NDP_NEIGHBOR_SOLICITATION => self.on_solicitation(data, src, io),
            NDP_NEIGHBOR_ADVERTISEMENT => self.on_advertisement(data, io),
            NDP_ROUTER_ADVERTISEMENT => return self.on_router_advertisement(data, src, io),
            NDP_ROUTER_SOLICITATION | NDP_REDIRECT => {
                klog_trace!("ndp: type {} from {} ignored", hdr.typ, src);
            }
            _ => {}
        }
        NdpEvent::None
    }

    fn on_solicitation(&mut self, data: &[u8], src: Ipv6Addr, io: &mut LinkIo<'_>) {
        if data.len() < 24 {
            self.stats.dropped += 1;
            return;
        }
        self.stats.solicitations_in += 1;
        let target = read_addr(&data[8..24]);
        if !self.addrs.contains(&target) {
            klog_trace!("ndp: solicitation for {} is not ours", target);
            return;
        }
        let opts = parse_options(&data[24..]);
        let now = io.timers.now();
        let reply_mac = match (src.is_unspecified(), opts.source_ll) {
            (false, Some(mac)) => {
                let pending = self.cache.update(src, mac, now, io.timers);
                for pkt in pending {
                    io.send(pkt, mac, EtherType::Ipv6);
                }
                self.ensure_tick(io);
                Some(mac)
            }
            (false, None) => self.cache.lookup(&src),
            (true, _) => None,
        };

        // Duplicate address detection probes are answered to all nodes.
        let (dst, dst_mac, flags) = if src.is_unspecified() {
            (Ipv6Addr::ALL_NODES, Ipv6Addr::ALL_NODES.multicast_mac(), NA_FLAG_OVERRIDE)
        } else {
            let Some(mac) = reply_mac else {
                klog_debug!("ndp: no link address to answer {}", src);
                self.stats.dropped += 1;
                return;
            };
            (src, mac, NA_FLAG_SOLICITED | NA_FLAG_OVERRIDE)
        };
        let mut body = [0u8; 24];
        body[..16].copy_from_slice(&target.0);
        body[16..].copy_from_slice(&ll_option(OPT_TARGET_LL_ADDR, io.mac));
        if self
            .send(target, dst, dst_mac, NDP_NEIGHBOR_ADVERTISEMENT, flags, &body, io)
            .is_ok()
        {
            self.stats.advertisements_out += 1;
        }
    }

    fn on_advertisement(&mut self, data: &[u8], io: &mut LinkIo<'_>) {
        if data.len() < 24 {
            self.stats.dropped += 1;
            return;
        }
        self.stats.advertisements_in += 1;
        let target = read_addr(&data[8..24]);
        let Some(mac) = parse_options(&data[24..]).target_ll else {
            klog_trace!("ndp: advertisement for {} without link address", target);
            return;
        };
        let now = io.timers.now();
        if let Some(pending) = self.cache.refresh(target, mac, now, io.timers) {
            for pkt in pending {
                io.send(pkt, mac, EtherType::Ipv6);
            }
        }
    }

    fn on_router_advertisement(
        &mut self,
        data: &[u8],
        src: Ipv6Addr,
        io: &mut LinkIo<'_>,
    ) -> NdpEvent {
        if data.len() < 16 || !src.is_link_local() {
            self.stats.dropped += 1;
            return NdpEvent::None;
        }
        self.stats.router_advertisements_in += 1;
        let now = io.timers.now();
        let lifetime = u16::from_be_bytes([data[6], data[7]]);
        if lifetime == 0 {
            if self.router.is_some_and(|r| r.addr == src) {
                klog_info!("ndp: router {} withdrew", src);
                self.router = None;
            }
        } else {
            if self.router.is_none_or(|r| r.addr != src) {
                klog_info!("ndp: default router {}", src);
            }
            self.router = Some(DefaultRouter {
                addr: src,
                until: now + Duration::from_secs(lifetime as u64),
            });
        }

        let opts = parse_options(&data[16..]);
        if let Some(mac) = opts.source_ll {
            let pending = self.cache.update(src, mac, now, io.timers);
            for pkt in pending {
                io.send(pkt, mac, EtherType::Ipv6);
            }
        }
        let mut formed = Vec::new();
        for p in opts.prefixes {
            if p.flags & PREFIX_FLAG_AUTONOMOUS == 0 || p.prefix.is_link_local() {
                continue;
            }
            if p.preferred > p.valid {
                klog_debug!("ndp: prefix {}/{} preferred > valid, ignored", p.prefix, p.prefix_len);
                continue;
            }
            if p.prefix_len != AUTOCONF_PREFIX_LEN {
                klog_debug!("ndp: prefix length {} cannot be autoconfigured", p.prefix_len);
                continue;
            }
            if p.flags & PREFIX_FLAG_ON_LINK == 0 {
                klog_trace!("ndp: prefix {} is off-link", p.prefix);
            }
            if let Some(addr) =
                self.add_addr_autoconf(&p.prefix, p.prefix_len, p.preferred, p.valid, io)
            {
                formed.push(addr);
            }
        }
        self.ensure_tick(io);
        if formed.is_empty() {
            NdpEvent::None
        } else {
            NdpEvent::AddressesFormed(formed)
        }
    }

    /// Send an IPv6 packet (layer at its IP header) to `next_hop`, resolving
    /// the link address first if needed.
    pub fn transmit(&mut self, pkt: Packet, next_hop: Ipv6Addr, io: &mut LinkIo<'_>) {
        if next_hop.is_multicast() {
            io.send(pkt, next_hop.multicast_mac(), EtherType::Ipv6);
            return;
        }
        let now = io.timers.now();
        match self
            .cache
            .resolve(next_hop, pkt, now, io.timers, NetTimer::NdpRetry(next_hop))
        {
            Resolve::Resolved(mac, pkt) => io.send(pkt, mac, EtherType::Ipv6),
            Resolve::Queued => {}
            Resolve::Solicit => {
                self.ensure_tick(io);
                self.solicit(next_hop, io);
            }
            Resolve::Failed => self.stats.unresolved += 1,
        }
    }

    /// Multicast a neighbor solicitation for `target`.
    pub fn solicit(&mut self, target: Ipv6Addr, io: &mut LinkIo<'_>) {
        let now = io.timers.now();
        let src = self
            .addrs
            .source_for(&target, now)
            .unwrap_or(Ipv6Addr::UNSPECIFIED);
        let dst = target.solicited_node();
        let mut body = [0u8; 24];
        body[..16].copy_from_slice(&target.0);
        let len = if src.is_unspecified() {
            16
        } else {
            body[16..].copy_from_slice(&ll_option(OPT_SOURCE_LL_ADDR, io.mac));
            24
        };
        if self
            .send(src, dst, dst.multicast_mac(), NDP_NEIGHBOR_SOLICITATION, 0, &body[..len], io)
            .is_ok()
        {
            self.stats.solicitations_out += 1;
        }
    }

    /// Ask routers on the link to advertise.
    pub fn solicit_routers(&mut self, io: &mut LinkIo<'_>) {
        let src = self.addrs.link_local().unwrap_or(Ipv6Addr::UNSPECIFIED);
        let opt = ll_option(OPT_SOURCE_LL_ADDR, io.mac);
        let body: &[u8] = if src.is_unspecified() { &[] } else { &opt };
        let dst = Ipv6Addr::ALL_ROUTERS;
        if let Err(e) = self.send(src, dst, dst.multicast_mac(), NDP_ROUTER_SOLICITATION, 0, body, io)
        {
            klog_debug!("ndp: router solicitation failed: {}", e);
        }
    }

    /// Retry timer for `target` fired.
    pub fn on_retry(&mut self, target: Ipv6Addr, id: TimerId, io: &mut LinkIo<'_>) {
        let now = io.timers.now();
        match self
            .cache
            .on_retry(target, id, now, io.timers, NetTimer::NdpRetry(target))
        {
            Retry::Solicit => self.solicit(target, io),
            Retry::GaveUp(dropped) => self.stats.unresolved += dropped.len() as u64,
            Retry::Ignore => {}
        }
    }

    /// Periodic maintenance: neighbor aging, address and router expiry.
    /// Returns the addresses that expired.
    pub fn on_tick(&mut self, io: &mut LinkIo<'_>) -> Vec<Ipv6Addr> {
        let now = io.timers.now();
        self.cache.age(now);
        if self.router.is_some_and(|r| now >= r.until) {
            klog_info!("ndp: default router expired");
            self.router = None;
        }
        let gone = self.addrs.expire(now);
        for addr in &gone {
            klog_info!("ndp: address {} expired", addr);
        }
        if self.cache.is_empty() && self.addrs.is_empty() && self.router.is_none() {
            if let Some(id) = self.tick_timer.take() {
                io.timers.stop(id);
            }
        }
        gone
    }

    /// Forget neighbors and routers (interface down). Addresses stay.
    pub fn clear(&mut self, io: &mut LinkIo<'_>) {
        self.cache.clear(io.timers);
        self.router = None;
        if let Some(id) = self.tick_timer.take() {
            io.timers.stop(id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        dst_mac: MacAddr,
        typ: u8,
        rest: u32,
        body: &[u8],
        io: &mut LinkIo<'_>,
    ) -> Result<(), NetError> {
        let mut pkt = icmp6::build(io.store, src, dst, typ, 0, rest, body)?;
        ip6::encapsulate(&mut pkt, src, dst, Protocol::Icmpv6.as_u8(), NDP_HOP_LIMIT)?;
        io.send(pkt, dst_mac, EtherType::Ipv6);
        Ok(())
    }
}

impl Default for Ndp {
    fn default() -> Self {
        Self::new()
    }
}
