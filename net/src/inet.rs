//! One IP stack instance bound to one link device.
//!
//! [`Inet`] owns every protocol of the stack and is driven from three entry
//! points: [`Inet::receive`] for each frame the driver hands up,
//! [`Inet::poll`] after the timer interrupt and [`Inet::flush`] once the
//! device has room in its transmit queue again. Protocols never call each
//! other directly; they queue [`Datagram`]s and frames on the context and the
//! stack routes them before returning, so every entry point finishes with
//! the output of the work it caused already handed to the device.
//!
//! # Ingress
//!
//! 1. Parse the Ethernet header, filter by destination MAC
//! 2. Untag 802.1Q frames and pass them to the registered VLAN
//! 3. Dispatch by EtherType: ARP, IPv4, IPv6
//! 4. IP: validate, accept only local destinations, undo masquerading
//! 5. Dispatch by protocol to ICMP, NDP/MLD, UDP or TCP
//!
//! # Egress
//!
//! Datagrams get their IP header, are looped back when addressed to the
//! stack itself, masqueraded when enabled and resolved to a link address by
//! ARP or NDP. Frames leave through the device only while
//! [`Nic::transmit_queue_available`] reports room; the rest wait for
//! [`Inet::flush`].

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::time::Duration;

use unikos_core::FiredTimer;
use unikos_lib::{Clock, klog_debug, klog_info, klog_trace, klog_warn};

use crate::arp::Arp;
use crate::buffer_store::BufferStore;
use crate::config::{ConfigError, StackConfig};
use crate::conntrack::{Conntrack, flow_of};
use crate::ethernet::{self, ETH_HEADER_LEN, LinkIo};
use crate::icmp4::{self, Icmp4, IcmpEvent};
use crate::icmp6::{self, ICMP6_ECHO_REQUEST, Icmp6};
use crate::ip::{Datagram, Tx};
use crate::ip4::{self, Ip4Config};
use crate::ip6::{self, IP6_HEADER_LEN};
use crate::mld::Mld;
use crate::nat::Napt;
use crate::ndp::{AddrList, INFINITE_LIFETIME, Ndp, NdpEvent};
use crate::nic::Nic;
use crate::packet::Packet;
use crate::ping::{EchoReply, Pinger};
use crate::tcp::{Connection, Listener, Tcp};
use crate::timer::{NetTimer, NetTimers};
use crate::types::{
    EtherType, IpAddr, Ipv4Addr, Ipv6Addr, MacAddr, NetError, Protocol, Quadruple, Socket,
};
use crate::udp::{Udp, UdpRx, UdpSocket};
use crate::vlan::VlanManager;

/// Borrow the link-level context out of disjoint fields of an [`Inet`].
macro_rules! link_io {
    ($s:ident) => {
        LinkIo {
            mac: $s.mac,
            store: &$s.store,
            timers: &mut $s.timers,
            frames: &mut $s.frames,
        }
    };
}

/// Borrow the transport context out of disjoint fields of an [`Inet`].
macro_rules! tx {
    ($s:ident) => {
        Tx::new(&mut $s.timers, &$s.store, &mut $s.out)
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InetStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames for another MAC, or too short to carry a header.
    pub link_dropped: u64,
    pub unknown_ethertype: u64,
    pub ip4_in: u64,
    pub ip6_in: u64,
    /// Malformed, not local, fragmented or of an unknown protocol.
    pub ip_dropped: u64,
    pub no_route: u64,
    /// Datagrams larger than the link MTU.
    pub too_big: u64,
    /// Datagrams delivered to the stack itself without touching the device.
    pub looped: u64,
    /// Times output stopped on a full device queue.
    pub tx_stalled: u64,
    pub tx_dropped: u64,
}

/// Masquerading of the stack's own IPv4 output.
struct Masquerade {
    ct: Rc<RefCell<Conntrack>>,
    napt: Napt,
    external: Ipv4Addr,
    /// TCP connections reclaimed since the last output pass.
    closed: Rc<RefCell<Vec<Quadruple>>>,
}

impl Masquerade {
    /// Track and translate an outbound packet (layer at its IP header).
    fn outbound(&mut self, ip: &mut [u8], timers: &mut NetTimers) {
        let Some(flow) = flow_of(ip) else {
            return;
        };
        let mut ct = self.ct.borrow_mut();
        let Some(id) = ct.track(&flow, timers) else {
            return;
        };
        ct.confirm(&flow.quad, flow.proto, timers.now());
        match ct.entry(id) {
            Some(e) if e.first == flow.quad => {}
            _ => return,
        }
        if let Err(e) = self.napt.masquerade(ip, &mut ct, id, self.external) {
            klog_debug!("nat: cannot masquerade {} {}: {}", flow.proto, flow.quad, e);
        }
    }

    /// Restore a reply to a masqueraded flow. Returns `true` if the packet
    /// was rewritten.
    fn inbound(&mut self, ip: &mut [u8], timers: &mut NetTimers) -> bool {
        let Some(flow) = flow_of(ip) else {
            return false;
        };
        let mut ct = self.ct.borrow_mut();
        let id = match ct.get(&flow.quad, flow.proto) {
            Some(e) if e.second == flow.quad && !e.is_mirrored() => e.id,
            _ => return false,
        };
        ct.track(&flow, timers);
        self.napt.demasquerade(ip, &ct, id)
    }

    /// Drop the conntrack entries of reclaimed TCP connections, releasing
    /// their ports.
    fn release_closed(&mut self) {
        let closed = core::mem::take(&mut *self.closed.borrow_mut());
        if closed.is_empty() {
            return;
        }
        let mut ct = self.ct.borrow_mut();
        for quad in closed {
            if ct.remove_quad(&quad, Protocol::Tcp) {
                klog_trace!("nat: released flow of closed connection {}", quad);
            }
        }
    }
}

pub struct Inet {
    nic: Rc<dyn Nic>,
    mac: MacAddr,
    config: StackConfig,
    store: Rc<BufferStore>,
    timers: NetTimers,

    ip4: Option<Ip4Config>,
    ip4_id: u16,
    arp: Arp,
    icmp4: Icmp4,

    ndp: Ndp,
    mld: Mld,
    icmp6: Icmp6,
    dns6: Option<Ipv6Addr>,

    pinger: Pinger,
    udp: Udp,
    tcp: Tcp,
    vlans: VlanManager,
    masq: Option<Masquerade>,

    /// Datagrams waiting for an IP header and a route.
    out: VecDeque<Datagram>,
    /// Datagrams addressed to the stack itself, layer at the IP header.
    looped: VecDeque<Packet>,
    /// Complete frames waiting for room in the device queue.
    frames: VecDeque<Packet>,
    stats: InetStats,
}

impl Inet {
    /// A stack over `nic`, unconfigured until [`Inet::network_config`] or an
    /// IPv6 address is added. Timers read `clock`.
    pub fn new(nic: Rc<dyn Nic>, config: StackConfig, clock: Rc<dyn Clock>) -> Self {
        let mac = nic.mac();
        let store = nic.buffer_store().clone();
        let ping_id = u16::from_be_bytes([mac.0[4], mac.0[5]]);
        klog_debug!("inet: stack on {} mtu {}", mac, nic.mtu());
        Self {
            mac,
            store,
            timers: NetTimers::new(clock),
            ip4: None,
            ip4_id: 0,
            arp: Arp::new(),
            icmp4: Icmp4::new(),
            ndp: Ndp::new(),
            mld: Mld::new(),
            icmp6: Icmp6::new(),
            dns6: None,
            pinger: Pinger::new(ping_id),
            udp: Udp::new(),
            tcp: Tcp::new(config.tcp.clone()),
            vlans: VlanManager::new(),
            masq: None,
            out: VecDeque::new(),
            looped: VecDeque::new(),
            frames: VecDeque::new(),
            stats: InetStats::default(),
            config,
            nic,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn nic(&self) -> &Rc<dyn Nic> {
        &self.nic
    }

    #[inline]
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    #[inline]
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &InetStats {
        &self.stats
    }

    #[inline]
    pub fn timers(&self) -> &NetTimers {
        &self.timers
    }

    /// For installing the hardware hooks with [`NetTimers::init`].
    #[inline]
    pub fn timers_mut(&mut self) -> &mut NetTimers {
        &mut self.timers
    }

    #[inline]
    pub fn ip4_config(&self) -> Option<&Ip4Config> {
        self.ip4.as_ref()
    }

    pub fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.ip4.map(|c| c.addr)
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.ip4.map(|c| c.gateway).filter(|g| !g.is_unspecified())
    }

    pub fn dns(&self) -> Option<Ipv4Addr> {
        self.ip4.and_then(|c| c.dns)
    }

    #[inline]
    pub fn dns6(&self) -> Option<Ipv6Addr> {
        self.dns6
    }

    #[inline]
    pub fn ip6_addrs(&self) -> &AddrList {
        self.ndp.addrs()
    }

    #[inline]
    pub fn arp(&self) -> &Arp {
        &self.arp
    }

    #[inline]
    pub fn ndp(&self) -> &Ndp {
        &self.ndp
    }

    #[inline]
    pub fn mld(&self) -> &Mld {
        &self.mld
    }

    #[inline]
    pub fn icmp4(&self) -> &Icmp4 {
        &self.icmp4
    }

    #[inline]
    pub fn icmp6(&self) -> &Icmp6 {
        &self.icmp6
    }

    #[inline]
    pub fn tcp(&self) -> &Tcp {
        &self.tcp
    }

    #[inline]
    pub fn udp(&self) -> &Udp {
        &self.udp
    }

    #[inline]
    pub fn vlans_mut(&mut self) -> &mut VlanManager {
        &mut self.vlans
    }

    /// The conntrack table, once masquerading is enabled.
    pub fn conntrack(&self) -> Option<&Rc<RefCell<Conntrack>>> {
        self.masq.as_ref().map(|m| &m.ct)
    }

    pub fn napt(&self) -> Option<&Napt> {
        self.masq.as_ref().map(|m| &m.napt)
    }

    /// Frames still waiting for the device.
    #[inline]
    pub fn tx_backlog(&self) -> usize {
        self.frames.len()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Static IPv4 configuration. A refused combination leaves the previous
    /// configuration in place.
    pub fn network_config(
        &mut self,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Option<Ipv4Addr>,
    ) -> Result<(), ConfigError> {
        let cfg = Ip4Config::new(addr, netmask, gateway, dns)?;
        klog_info!(
            "inet: {} configured {}/{} gw {}",
            self.mac,
            addr,
            netmask.mask_bits().unwrap_or(0),
            gateway
        );
        if let Some(old) = self.ip4 {
            if old.addr != addr {
                let mut io = link_io!(self);
                self.arp.clear(&mut io);
            }
        }
        self.ip4 = Some(cfg);
        // Tell the segment who we are.
        let mut io = link_io!(self);
        self.arp.request(addr, addr, &mut io);
        self.flush_frames();
        Ok(())
    }

    /// Assign a static IPv6 address and join its solicited-node group.
    pub fn add_addr6(
        &mut self,
        addr: Ipv6Addr,
        prefix_len: u8,
        preferred_lft: u32,
        valid_lft: u32,
    ) -> Result<(), ConfigError> {
        if prefix_len > 128 {
            return Err(ConfigError::InvalidPrefix);
        }
        if addr.is_unspecified() || addr.is_multicast() {
            return Err(ConfigError::BadAddress(alloc::format!("{}", addr)));
        }
        let mut io = link_io!(self);
        if self.ndp.add_addr(addr, prefix_len, preferred_lft, valid_lft, &mut io) {
            self.join_solicited(addr);
        }
        self.flush_frames();
        Ok(())
    }

    pub fn remove_addr6(&mut self, addr: &Ipv6Addr) -> bool {
        if !self.ndp.remove_addr(addr) {
            return false;
        }
        self.leave_solicited(*addr);
        self.flush_frames();
        true
    }

    /// Use `router` as the IPv6 default route for `lifetime`.
    pub fn add_router6(&mut self, router: Ipv6Addr, lifetime: Duration) {
        let mut io = link_io!(self);
        self.ndp.add_router(router, lifetime, &mut io);
    }

    pub fn set_dns6(&mut self, dns: Ipv6Addr) {
        klog_info!("inet: {} IPv6 name server {}", self.mac, dns);
        self.dns6 = Some(dns);
    }

    /// Stateless autoconfiguration: assign the link-local address, then ask
    /// for router advertisements whose prefixes form the global addresses.
    pub fn start_slaac(&mut self) {
        let ll = Ipv6Addr::link_local_from_mac(self.mac);
        let mut io = link_io!(self);
        if self
            .ndp
            .add_addr(ll, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, &mut io)
        {
            self.join_solicited(ll);
        }
        let mut io = link_io!(self);
        self.ndp.solicit_routers(&mut io);
        self.flush_frames();
    }

    /// Join a multicast group on this link.
    pub fn join_group(&mut self, group: Ipv6Addr) -> Result<(), NetError> {
        let src = self.mld_source();
        let mut io = link_io!(self);
        self.mld.join(group, src, &mut io)?;
        self.flush_frames();
        Ok(())
    }

    pub fn leave_group(&mut self, group: Ipv6Addr) -> Result<(), NetError> {
        let src = self.mld_source();
        let mut io = link_io!(self);
        self.mld.leave(group, src, &mut io)?;
        self.flush_frames();
        Ok(())
    }

    /// Pin a neighbor mapping.
    pub fn cache_static(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        let mut io = link_io!(self);
        self.arp.cache_static(ip, mac, &mut io);
        self.flush_frames();
    }

    /// Masquerade the stack's own IPv4 output behind its address, with
    /// conntrack following every flow. TCP connections release their
    /// translation when they are reclaimed.
    pub fn enable_masquerade(&mut self) -> Result<(), NetError> {
        if self.masq.is_some() {
            return Ok(());
        }
        let external = self.ip_addr().ok_or(NetError::AddressNotAvailable)?;
        let closed: Rc<RefCell<Vec<Quadruple>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = closed.clone();
        self.tcp
            .add_close_observer(move |quad| sink.borrow_mut().push(*quad));
        self.masq = Some(Masquerade {
            ct: Rc::new(RefCell::new(Conntrack::new(self.config.conntrack.clone()))),
            napt: Napt::new(),
            external,
            closed,
        });
        klog_info!("inet: masquerading output as {}", external);
        Ok(())
    }

    /// Source address the stack uses towards `dst`.
    pub fn source_for(&self, dst: &IpAddr) -> Option<IpAddr> {
        match dst {
            IpAddr::V4(d) if d.is_loopback() => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpAddr::V4(_) => self.ip_addr().map(IpAddr::V4),
            IpAddr::V6(d) if *d == Ipv6Addr::LOCALHOST => Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            IpAddr::V6(d) => self
                .ndp
                .addrs()
                .source_for(d, self.timers.now())
                .map(IpAddr::V6),
        }
    }

    fn mld_source(&self) -> Ipv6Addr {
        self.ndp.addrs().link_local().unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    fn join_solicited(&mut self, addr: Ipv6Addr) {
        let src = self.mld_source();
        let mut io = link_io!(self);
        if let Err(e) = self.mld.join(addr.solicited_node(), src, &mut io) {
            klog_debug!("mld: cannot join group of {}: {}", addr, e);
        }
    }

    fn leave_solicited(&mut self, addr: Ipv6Addr) {
        let group = addr.solicited_node();
        if self.ndp.addrs().iter().any(|e| e.addr.solicited_node() == group) {
            return;
        }
        let src = self.mld_source();
        let mut io = link_io!(self);
        if self.mld.leave(group, src, &mut io).is_err() {
            klog_trace!("mld: {} was not joined", group);
        }
    }

    // -------------------------------------------------------------------------
    // Application entry points
    // -------------------------------------------------------------------------

    /// Listen on `port` of every local IPv4 address.
    pub fn listen(
        &mut self,
        port: u16,
        on_connect: impl FnMut(&mut Connection) + 'static,
    ) -> Result<&mut Listener, NetError> {
        self.tcp
            .listen(Socket::v4(Ipv4Addr::UNSPECIFIED, port), on_connect)
    }

    /// Listen on an explicit local socket (use an unspecified IPv6 address
    /// for every IPv6 address).
    pub fn listen_on(
        &mut self,
        local: Socket,
        on_connect: impl FnMut(&mut Connection) + 'static,
    ) -> Result<&mut Listener, NetError> {
        self.tcp.listen(local, on_connect)
    }

    pub fn unlisten(&mut self, local: &Socket) -> bool {
        self.tcp.unlisten(local)
    }

    /// Open a connection to `remote`. The outcome arrives through
    /// `on_connect`.
    pub fn connect(
        &mut self,
        remote: Socket,
        on_connect: impl FnOnce(Result<&mut Connection, NetError>) + 'static,
    ) -> Result<Quadruple, NetError> {
        let src = self
            .source_for(&remote.addr)
            .ok_or(NetError::NetworkUnreachable)?;
        let mut tx = tx!(self);
        let quad = self.tcp.connect(src, remote, on_connect, &mut tx)?;
        self.process_output();
        Ok(quad)
    }

    /// Run `f` on a live connection and send whatever it queued.
    pub fn with_connection<R>(
        &mut self,
        quad: &Quadruple,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let mut tx = tx!(self);
        let r = self.tcp.with_connection(quad, f, &mut tx);
        self.process_output();
        r
    }

    pub fn udp_bind(&mut self, local: Socket) -> Result<&mut UdpSocket, NetError> {
        self.udp.bind(local)
    }

    pub fn udp_socket(&mut self, port: u16) -> Option<&mut UdpSocket> {
        self.udp.socket(port)
    }

    pub fn udp_close(&mut self, port: u16) -> bool {
        self.udp.close(port)
    }

    /// Send `data` from the UDP socket bound on `port` to `dst`.
    pub fn udp_sendto(&mut self, port: u16, dst: Socket, data: &[u8]) -> Result<(), NetError> {
        let bound = self
            .udp
            .socket(port)
            .map(|s| s.local().addr)
            .ok_or(NetError::NotConnected)?;
        let src = if bound.is_unspecified() {
            self.source_for(&dst.addr)
                .ok_or(NetError::NetworkUnreachable)?
        } else {
            bound
        };
        let mut tx = tx!(self);
        self.udp.sendto(port, src, dst, data, &mut tx)?;
        self.process_output();
        Ok(())
    }

    /// Send an echo request to `dst`. `cb` receives the reply, or `None`
    /// after `timeout`. Returns the sequence number used.
    pub fn ping(
        &mut self,
        dst: IpAddr,
        cb: impl FnOnce(Option<EchoReply>) + 'static,
        timeout: Duration,
    ) -> Result<u16, NetError> {
        let src = self.source_for(&dst).ok_or(NetError::NetworkUnreachable)?;
        let id = self.pinger.id();
        let seq = self
            .pinger
            .start(alloc::boxed::Box::new(cb), timeout, &mut self.timers);
        let payload = [0u8; 32];
        let mut tx = tx!(self);
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let pkt = icmp4::echo_request(&tx, id, seq, &payload)?;
                tx.out
                    .push_back(Datagram::new(IpAddr::V4(s), IpAddr::V4(d), Protocol::Icmp, pkt));
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let rest = ((id as u32) << 16) | seq as u32;
                icmp6::send(&mut tx, s, d, ICMP6_ECHO_REQUEST, 0, rest, &payload)?;
            }
            _ => return Err(NetError::AddressNotAvailable),
        }
        klog_trace!("icmp: echo request to {} seq {}", dst, seq);
        self.process_output();
        Ok(seq)
    }

    /// Take the interface down: every connection is aborted with
    /// [`NetError::InterfaceDown`], sockets are closed and caches emptied.
    /// The address configuration is kept.
    pub fn ifdown(&mut self) {
        klog_info!("inet: {} down", self.mac);
        let mut tx = tx!(self);
        self.tcp.ifdown(&mut tx);
        self.out.clear();
        self.looped.clear();
        self.udp.clear();
        self.pinger.clear(&mut self.timers);
        let mut io = link_io!(self);
        self.arp.clear(&mut io);
        self.ndp.clear(&mut io);
        self.mld.clear();
        if let Some(m) = self.masq.as_mut() {
            m.closed.borrow_mut().clear();
            m.ct.borrow_mut().clear(&mut self.timers);
        }
        self.frames.clear();
    }

    // -------------------------------------------------------------------------
    // Driver and timer entry points
    // -------------------------------------------------------------------------

    /// A frame from the device, `layer_begin` at its Ethernet header.
    pub fn receive(&mut self, pkt: Packet) {
        self.stats.frames_in += 1;
        self.receive_link(pkt);
        self.process_output();
    }

    /// Run every due timer. Returns how many fired.
    pub fn poll(&mut self) -> usize {
        let fired = self.timers.timers_handler();
        let count = fired.len();
        for timer in fired {
            self.on_timer(timer);
        }
        self.process_output();
        count
    }

    /// Let connections send what they held back and retry queued frames;
    /// called when the device queue has room again.
    pub fn flush(&mut self) {
        let mut tx = tx!(self);
        self.tcp.flush(&mut tx);
        self.process_output();
    }

    fn on_timer(&mut self, timer: FiredTimer<NetTimer>) {
        let id = timer.id;
        match timer.handler {
            t @ (NetTimer::TcpRetransmit(_)
            | NetTimer::TcpPersist(_)
            | NetTimer::TcpTimeWait(_)) => {
                let mut tx = tx!(self);
                self.tcp.on_timer(t, id, &mut tx);
            }
            NetTimer::ArpRetry(target) => {
                let own = self.ip_addr().unwrap_or(Ipv4Addr::UNSPECIFIED);
                let mut io = link_io!(self);
                self.arp.on_retry(target, id, own, &mut io);
            }
            NetTimer::ArpFlush => {
                let mut io = link_io!(self);
                self.arp.on_flush(&mut io);
            }
            NetTimer::NdpRetry(target) => {
                let mut io = link_io!(self);
                self.ndp.on_retry(target, id, &mut io);
            }
            NetTimer::NdpTick => {
                let mut io = link_io!(self);
                let expired = self.ndp.on_tick(&mut io);
                for addr in expired {
                    self.leave_solicited(addr);
                }
            }
            NetTimer::ConntrackFlush => {
                if let Some(m) = self.masq.as_ref() {
                    m.ct.borrow_mut().on_flush(&mut self.timers);
                }
            }
            NetTimer::PingTimeout { id: ping, seq } => self.pinger.on_timeout(ping, seq, id),
        }
    }

    // -------------------------------------------------------------------------
    // Ingress
    // -------------------------------------------------------------------------

    fn receive_link(&mut self, mut pkt: Packet) {
        let Some(eth) = ethernet::parse_header(pkt.data()) else {
            klog_debug!("eth: frame too short ({} < {})", pkt.len(), ETH_HEADER_LEN);
            self.stats.link_dropped += 1;
            return;
        };
        if !ethernet::accepts(&eth.dst, &self.mac) {
            self.stats.link_dropped += 1;
            return;
        }
        let ethertype = eth.ethertype();
        if ethertype == Some(EtherType::Vlan) {
            self.vlans.receive(pkt);
            return;
        }
        if pkt.increment_layer_begin(ETH_HEADER_LEN).is_err() {
            return;
        }
        pkt.mark_l3();
        match ethertype {
            Some(EtherType::Arp) => {
                let own: Vec<Ipv4Addr> = self.ip_addr().into_iter().collect();
                let mut io = link_io!(self);
                self.arp.receive(pkt.data(), &own, &mut io);
            }
            Some(EtherType::Ipv4) => self.receive_ip4(pkt, false),
            Some(EtherType::Ipv6) => self.receive_ip6(pkt, false),
            _ => {
                klog_debug!("eth: unknown EtherType 0x{:04x}, dropping", eth.ethertype);
                self.stats.unknown_ethertype += 1;
            }
        }
    }

    fn receive_ip4(&mut self, mut pkt: Packet, looped: bool) {
        self.stats.ip4_in += 1;
        let mut hdr = match ip4::parse_header(pkt.data()) {
            Ok(h) => h,
            Err(e) => {
                klog_debug!("ip4: {}, dropping", e);
                self.stats.ip_dropped += 1;
                return;
            }
        };
        let local = match self.ip4 {
            _ if looped => true,
            Some(cfg) => cfg.accepts(hdr.dst),
            None => false,
        };
        if !local {
            klog_trace!("ip4: {} -> {} not for us", hdr.src, hdr.dst);
            self.stats.ip_dropped += 1;
            return;
        }
        if hdr.is_fragment() {
            klog_debug!("ip4: fragment from {} id {}, no reassembly", hdr.src, hdr.id);
            self.stats.ip_dropped += 1;
            return;
        }
        if pkt.set_data_end(hdr.total_len as usize).is_err() {
            self.stats.ip_dropped += 1;
            return;
        }
        if let Some(m) = self.masq.as_mut() {
            if !looped && m.inbound(pkt.data_mut(), &mut self.timers) {
                match ip4::parse_header(pkt.data()) {
                    Ok(h) => hdr = h,
                    Err(e) => {
                        klog_warn!("nat: translated header invalid: {}", e);
                        return;
                    }
                }
            }
        }
        let Some(proto) = Protocol::from_u8(hdr.protocol) else {
            klog_debug!("ip4: unknown protocol {} from {}", hdr.protocol, hdr.src);
            self.stats.ip_dropped += 1;
            return;
        };
        if pkt.increment_layer_begin(hdr.ihl).is_err() {
            return;
        }
        pkt.mark_l4();
        let dgram = Datagram::new(IpAddr::V4(hdr.src), IpAddr::V4(hdr.dst), proto, pkt);
        match proto {
            Protocol::Icmp => {
                let own = self.ip_addr().unwrap_or(hdr.dst);
                let local = if looped { hdr.dst } else { own };
                let mut tx = tx!(self);
                let ev = self.icmp4.receive(&dgram, local, &mut tx);
                self.icmp_event(dgram.src, ev);
            }
            Protocol::Udp => self.deliver_udp(dgram),
            Protocol::Tcp => {
                let mut tx = tx!(self);
                self.tcp.receive(dgram, &mut tx);
            }
            p => {
                klog_debug!("ip4: {} from {} not handled", p, hdr.src);
                self.stats.ip_dropped += 1;
            }
        }
    }

    fn receive_ip6(&mut self, mut pkt: Packet, looped: bool) {
        self.stats.ip6_in += 1;
        let hdr = match ip6::parse_header(pkt.data()) {
            Ok(h) => h,
            Err(e) => {
                klog_debug!("ip6: {}, dropping", e);
                self.stats.ip_dropped += 1;
                return;
            }
        };
        let local = looped || self.ndp.accepts(&hdr.dst) || self.mld.is_member(&hdr.dst);
        if !local {
            klog_trace!("ip6: {} -> {} not for us", hdr.src, hdr.dst);
            self.stats.ip_dropped += 1;
            return;
        }
        if pkt.set_data_end(IP6_HEADER_LEN + hdr.payload_len as usize).is_err()
            || pkt.increment_layer_begin(IP6_HEADER_LEN).is_err()
        {
            self.stats.ip_dropped += 1;
            return;
        }
        let (next, off) = ip6::parse_extension_headers(pkt.data(), hdr.next_header);
        if pkt.increment_layer_begin(off).is_err() {
            return;
        }
        pkt.mark_l4();
        let proto = match Protocol::from_u8(next) {
            Some(p @ (Protocol::Icmpv6 | Protocol::Udp | Protocol::Tcp)) => p,
            _ => {
                klog_debug!("ip6: next header {} from {} not handled", next, hdr.src);
                self.stats.ip_dropped += 1;
                return;
            }
        };
        let dgram = Datagram::new(IpAddr::V6(hdr.src), IpAddr::V6(hdr.dst), proto, pkt);
        match proto {
            Protocol::Icmpv6 => self.receive_icmp6(dgram, hdr.hop_limit),
            Protocol::Udp => self.deliver_udp(dgram),
            _ => {
                let mut tx = tx!(self);
                self.tcp.receive(dgram, &mut tx);
            }
        }
    }

    fn receive_icmp6(&mut self, dgram: Datagram, hop_limit: u8) {
        let (IpAddr::V6(src), IpAddr::V6(dst)) = (dgram.src, dgram.dst) else {
            return;
        };
        let Some(ih) = icmp6::verify(&dgram) else {
            self.icmp6.count_drop();
            return;
        };
        let data = dgram.packet.data();
        match ih.typ {
            icmp6::NDP_ROUTER_SOLICITATION..=icmp6::NDP_REDIRECT => {
                let mut io = link_io!(self);
                let ev = self.ndp.receive(&ih, data, src, hop_limit, &mut io);
                if let NdpEvent::AddressesFormed(addrs) = ev {
                    for addr in addrs {
                        self.join_solicited(addr);
                    }
                }
            }
            icmp6::MLD_QUERY | icmp6::MLD_V1_REPORT | icmp6::MLD_V1_DONE | icmp6::MLD_V2_REPORT => {
                let local = self.mld_source();
                let mut io = link_io!(self);
                self.mld.receive(&ih, data, src, hop_limit, local, &mut io);
            }
            _ => {
                let local = if dst.is_multicast() {
                    self.ndp
                        .addrs()
                        .source_for(&src, self.timers.now())
                        .unwrap_or(Ipv6Addr::UNSPECIFIED)
                } else {
                    dst
                };
                let mut tx = tx!(self);
                let ev = self.icmp6.receive(&dgram, &ih, local, &mut tx);
                self.icmp_event(dgram.src, ev);
            }
        }
    }

    fn icmp_event(&mut self, from: IpAddr, ev: IcmpEvent) {
        match ev {
            IcmpEvent::EchoReply {
                id,
                seq,
                payload_len,
            } => {
                self.pinger
                    .reply(from, id, seq, payload_len, &mut self.timers);
            }
            IcmpEvent::Unreachable { code } => {
                klog_debug!("inet: {} unreachable, code {}", from, code);
            }
            IcmpEvent::None => {}
        }
    }

    fn deliver_udp(&mut self, dgram: Datagram) {
        if self.udp.receive(&dgram) != UdpRx::PortUnreachable {
            return;
        }
        let original = dgram.packet.from_l3();
        let mut tx = tx!(self);
        match (dgram.src, dgram.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                // Never answer broadcasts.
                if self.ip4.is_some_and(|c| c.addr == dst) || dst.is_loopback() {
                    self.icmp4.port_unreachable(original, dst, src, &mut tx);
                }
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                if !dst.is_multicast() {
                    self.icmp6.port_unreachable(original, dst, src, &mut tx);
                }
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Egress
    // -------------------------------------------------------------------------

    /// Route everything queued until no protocol has more to say, then hand
    /// the frames to the device.
    fn process_output(&mut self) {
        loop {
            while let Some(dgram) = self.out.pop_front() {
                self.route_out(dgram);
            }
            let Some(pkt) = self.looped.pop_front() else {
                break;
            };
            match pkt.data().first().map(|b| b >> 4) {
                Some(4) => self.receive_ip4(pkt, true),
                Some(6) => self.receive_ip6(pkt, true),
                _ => self.stats.ip_dropped += 1,
            }
        }
        if let Some(m) = self.masq.as_mut() {
            m.release_closed();
        }
        self.flush_frames();
    }

    fn route_out(&mut self, dgram: Datagram) {
        let Datagram {
            src,
            dst,
            protocol,
            packet,
        } = dgram;
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => self.output4(s, d, protocol, packet),
            (IpAddr::V6(s), IpAddr::V6(d)) => self.output6(s, d, protocol, packet),
            _ => {
                klog_debug!("inet: mixed families {} -> {}, dropping", src, dst);
                self.stats.no_route += 1;
            }
        }
    }

    fn output4(&mut self, src: Ipv4Addr, dst: Ipv4Addr, proto: Protocol, mut pkt: Packet) {
        if pkt.len() + ip4::IP4_HEADER_LEN > self.nic.mtu() as usize {
            klog_debug!("ip4: {} bytes to {} exceed the MTU, dropping", pkt.len(), dst);
            self.stats.too_big += 1;
            return;
        }
        self.ip4_id = self.ip4_id.wrapping_add(1);
        if let Err(e) = ip4::encapsulate(&mut pkt, src, dst, proto, self.config.ttl, self.ip4_id) {
            klog_debug!("ip4: cannot encapsulate for {}: {}", dst, e);
            return;
        }
        let cfg = self.ip4;
        if dst.is_loopback() || cfg.is_some_and(|c| c.addr == dst) {
            self.stats.looped += 1;
            self.looped.push_back(pkt);
            return;
        }
        let Some(cfg) = cfg else {
            klog_debug!("ip4: not configured, dropping datagram to {}", dst);
            self.stats.no_route += 1;
            return;
        };
        let next_hop = if dst == cfg.broadcast() {
            Some(Ipv4Addr::BROADCAST)
        } else {
            cfg.next_hop(dst)
        };
        let Some(next_hop) = next_hop else {
            klog_debug!("ip4: no route to {}", dst);
            self.stats.no_route += 1;
            return;
        };
        if let Some(m) = self.masq.as_mut() {
            m.outbound(pkt.data_mut(), &mut self.timers);
        }
        let mut io = link_io!(self);
        self.arp.transmit(pkt, next_hop, cfg.addr, &mut io);
    }

    fn output6(&mut self, src: Ipv6Addr, dst: Ipv6Addr, proto: Protocol, mut pkt: Packet) {
        if pkt.len() + IP6_HEADER_LEN > self.nic.mtu() as usize {
            klog_debug!("ip6: {} bytes to {} exceed the MTU, dropping", pkt.len(), dst);
            self.stats.too_big += 1;
            return;
        }
        if let Err(e) = ip6::encapsulate(&mut pkt, src, dst, proto.as_u8(), self.config.hop_limit) {
            klog_debug!("ip6: cannot encapsulate for {}: {}", dst, e);
            return;
        }
        if dst == Ipv6Addr::LOCALHOST || self.ndp.addrs().contains(&dst) {
            self.stats.looped += 1;
            self.looped.push_back(pkt);
            return;
        }
        let Some(next_hop) = self.ndp.next_hop(&dst) else {
            klog_debug!("ip6: no route to {}", dst);
            self.stats.no_route += 1;
            return;
        };
        let mut io = link_io!(self);
        self.ndp.transmit(pkt, next_hop, &mut io);
    }

    /// Hand queued frames to the device while it has room.
    fn flush_frames(&mut self) {
        while !self.frames.is_empty() {
            if self.nic.transmit_queue_available() == 0 {
                klog_trace!("inet: device queue full, {} frames wait", self.frames.len());
                self.stats.tx_stalled += 1;
                return;
            }
            let Some(frame) = self.frames.pop_front() else {
                return;
            };
            match self.nic.transmit(frame) {
                Ok(()) => self.stats.frames_out += 1,
                Err(e) => {
                    klog_debug!("inet: transmit failed: {}", e);
                    self.stats.tx_dropped += 1;
                }
            }
        }
    }
}
