//! ARP (RFC 826) over Ethernet for IPv4.

use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::{klog_debug, klog_trace};

use crate::buffer_store::PACKET_HEADROOM;
use crate::ethernet::LinkIo;
use crate::neighbor::{NeighborCache, Resolve, Retry};
use crate::packet::Packet;
use crate::timer::NetTimer;
use crate::types::{EtherType, Ipv4Addr, MacAddr};

pub const ARP_PACKET_LEN: usize = 28;
pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;
/// Interval of the cache aging tick.
pub const ARP_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

pub fn parse(data: &[u8]) -> Option<ArpPacket> {
    if data.len() < ARP_PACKET_LEN {
        return None;
    }
    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    if htype != ARP_HTYPE_ETHERNET || ptype != EtherType::Ipv4.as_u16() {
        return None;
    }
    if data[4] != 6 || data[5] != 4 {
        return None;
    }
    let mac = |o: usize| {
        let mut m = [0u8; 6];
        m.copy_from_slice(&data[o..o + 6]);
        MacAddr(m)
    };
    let ip = |o: usize| Ipv4Addr::new(data[o], data[o + 1], data[o + 2], data[o + 3]);
    Some(ArpPacket {
        op: u16::from_be_bytes([data[6], data[7]]),
        sender_mac: mac(8),
        sender_ip: ip(14),
        target_mac: mac(18),
        target_ip: ip(24),
    })
}

pub fn write(p: &ArpPacket, out: &mut [u8; ARP_PACKET_LEN]) {
    out[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    out[2..4].copy_from_slice(&EtherType::Ipv4.as_u16().to_be_bytes());
    out[4] = 6;
    out[5] = 4;
    out[6..8].copy_from_slice(&p.op.to_be_bytes());
    out[8..14].copy_from_slice(p.sender_mac.as_bytes());
    out[14..18].copy_from_slice(p.sender_ip.as_bytes());
    out[18..24].copy_from_slice(p.target_mac.as_bytes());
    out[24..28].copy_from_slice(p.target_ip.as_bytes());
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArpStats {
    pub requests_in: u64,
    pub replies_in: u64,
    pub requests_out: u64,
    pub replies_out: u64,
    pub dropped: u64,
    /// IPv4 packets discarded because resolution failed.
    pub unresolved: u64,
}

/// Resolver of one IPv4 interface.
pub struct Arp {
    cache: NeighborCache<Ipv4Addr>,
    stats: ArpStats,
    flush_timer: Option<TimerId>,
}

impl Arp {
    pub fn new() -> Self {
        Self {
            cache: NeighborCache::new(),
            stats: ArpStats::default(),
            flush_timer: None,
        }
    }

    #[inline]
    pub fn cache(&self) -> &NeighborCache<Ipv4Addr> {
        &self.cache
    }

    #[inline]
    pub fn stats(&self) -> &ArpStats {
        &self.stats
    }

    pub fn lookup(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.cache.lookup(ip)
    }

    /// Install a permanent-until-aged mapping, e.g. from configuration.
    pub fn cache_static(&mut self, ip: Ipv4Addr, mac: MacAddr, io: &mut LinkIo<'_>) {
        let now = io.timers.now();
        self.cache.update(ip, mac, now, io.timers);
        self.ensure_flush_timer(io);
    }

    fn ensure_flush_timer(&mut self, io: &mut LinkIo<'_>) {
        if self.flush_timer.is_none() {
            self.flush_timer = Some(io.timers.periodic(
                ARP_FLUSH_INTERVAL,
                ARP_FLUSH_INTERVAL,
                NetTimer::ArpFlush,
            ));
        }
    }

    /// An ARP packet arrived. `own` lists the addresses this interface
    /// answers for; the first one is its primary address.
    pub fn receive(&mut self, data: &[u8], own: &[Ipv4Addr], io: &mut LinkIo<'_>) {
        let Some(p) = parse(data) else {
            klog_debug!("arp: malformed packet, dropping");
            self.stats.dropped += 1;
            return;
        };
        match p.op {
            ARP_OP_REQUEST => self.stats.requests_in += 1,
            ARP_OP_REPLY => self.stats.replies_in += 1,
            op => {
                klog_debug!("arp: unknown op {}, dropping", op);
                self.stats.dropped += 1;
                return;
            }
        }
        if p.sender_ip.is_unspecified() && p.op == ARP_OP_REPLY {
            self.stats.dropped += 1;
            return;
        }

        let now = io.timers.now();
        let for_us = own.contains(&p.target_ip);
        let flushed = if for_us && !p.sender_ip.is_unspecified() {
            Some(self.cache.update(p.sender_ip, p.sender_mac, now, io.timers))
        } else {
            self.cache.refresh(p.sender_ip, p.sender_mac, now, io.timers)
        };
        if let Some(pending) = flushed {
            self.ensure_flush_timer(io);
            for pkt in pending {
                io.send(pkt, p.sender_mac, EtherType::Ipv4);
            }
        }

        if for_us && p.op == ARP_OP_REQUEST {
            klog_trace!("arp: who-has {} tell {}", p.target_ip, p.sender_ip);
            let reply = ArpPacket {
                op: ARP_OP_REPLY,
                sender_mac: io.mac,
                sender_ip: p.target_ip,
                target_mac: p.sender_mac,
                target_ip: p.sender_ip,
            };
            self.send(&reply, p.sender_mac, io);
            self.stats.replies_out += 1;
        }
    }

    /// Send an IPv4 packet (layer at its IP header) to `next_hop`, resolving
    /// the link address first if needed.
    pub fn transmit(&mut self, pkt: Packet, next_hop: Ipv4Addr, own: Ipv4Addr, io: &mut LinkIo<'_>) {
        if next_hop.is_broadcast() {
            io.send(pkt, MacAddr::BROADCAST, EtherType::Ipv4);
            return;
        }
        if next_hop.is_multicast() {
            let o = next_hop.as_bytes();
            let mac = MacAddr([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]);
            io.send(pkt, mac, EtherType::Ipv4);
            return;
        }
        let now = io.timers.now();
        match self
            .cache
            .resolve(next_hop, pkt, now, io.timers, NetTimer::ArpRetry(next_hop))
        {
            Resolve::Resolved(mac, pkt) => io.send(pkt, mac, EtherType::Ipv4),
            Resolve::Queued => {}
            Resolve::Solicit => {
                self.ensure_flush_timer(io);
                self.request(next_hop, own, io);
            }
            Resolve::Failed => self.stats.unresolved += 1,
        }
    }

    /// Broadcast a who-has for `target`.
    pub fn request(&mut self, target: Ipv4Addr, own: Ipv4Addr, io: &mut LinkIo<'_>) {
        let req = ArpPacket {
            op: ARP_OP_REQUEST,
            sender_mac: io.mac,
            sender_ip: own,
            target_mac: MacAddr::ZERO,
            target_ip: target,
        };
        self.send(&req, MacAddr::BROADCAST, io);
        self.stats.requests_out += 1;
    }

    /// Retry timer for `target` fired.
    pub fn on_retry(&mut self, target: Ipv4Addr, id: TimerId, own: Ipv4Addr, io: &mut LinkIo<'_>) {
        let now = io.timers.now();
        match self
            .cache
            .on_retry(target, id, now, io.timers, NetTimer::ArpRetry(target))
        {
            Retry::Solicit => self.request(target, own, io),
            Retry::GaveUp(dropped) => self.stats.unresolved += dropped.len() as u64,
            Retry::Ignore => {}
        }
    }

    /// Periodic aging tick.
    pub fn on_flush(&mut self, io: &mut LinkIo<'_>) {
        let now = io.timers.now();
        self.cache.age(now);
        if self.cache.is_empty() {
            if let Some(id) = self.flush_timer.take() {
                io.timers.stop(id);
            }
        }
    }

    /// Forget everything (interface down).
    pub fn clear(&mut self, io: &mut LinkIo<'_>) {
        self.cache.clear(io.timers);
        if let Some(id) = self.flush_timer.take() {
            io.timers.stop(id);
        }
    }

    fn send(&self, p: &ArpPacket, dst: MacAddr, io: &mut LinkIo<'_>) {
        let mut buf = [0u8; ARP_PACKET_LEN];
        write(p, &mut buf);
        let mut pkt = Packet::create(io.store, PACKET_HEADROOM);
        if pkt.append(&buf).is_err() {
            return;
        }
        io.send(pkt, dst, EtherType::Arp);
    }
}

impl Default for Arp {
    fn default() -> Self {
        Self::new()
    }
}
