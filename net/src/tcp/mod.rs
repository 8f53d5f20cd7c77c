//! TCP host: the connection and listener tables of one stack.
//!
//! Every entry point takes the stack's [`Tx`] context, feeds the event to the
//! connection it belongs to and finally reaps connections that reached
//! CLOSED. Reaping stops their timers, unbinds ephemeral ports and tells the
//! close observers (NAT uses this to drop conntrack entries).

extern crate alloc;

pub mod connection;
pub mod header;
pub mod listener;
pub mod rttm;
pub mod write_queue;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::{klog_debug, klog_trace};

use crate::buffer_store::{BufferStore, PACKET_HEADROOM};
use crate::checksum::transport_checksum;
use crate::ip::{Datagram, Tx};
use crate::packet::Packet;
use crate::port_util::PortUtil;
use crate::timer::{NetTimer, NetTimers};
use crate::types::{IpAddr, NetError, Protocol, Quadruple, Socket};

pub use connection::{Connection, Tcb, TcpState};
pub use header::{TcpFlags, TcpHeader};
pub use listener::Listener;

use header::{TCP_HEADER_LEN, parse_header, parse_mss_option, write_header};

/// IPv4 plus TCP header without options.
const TCP_IP4_OVERHEAD: u16 = 40;
/// The IPv6 header is 20 bytes longer than the IPv4 one.
const IP6_EXTRA: u16 = 20;

#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// MSS advertised on IPv4; IPv6 connections advertise 20 bytes less.
    pub mss: u16,
    /// Receive window (no window scaling).
    pub window: u32,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl: Duration,
    /// Retransmissions of one segment before the connection times out.
    pub max_retransmits: u32,
    /// Half-open children allowed per listener.
    pub backlog: usize,
    pub limited_tx: bool,
    /// Default read callback chunk size.
    pub read_chunk: usize,
    /// Secret mixed into initial sequence numbers.
    pub iss_secret: u32,
}

impl TcpConfig {
    pub fn for_mtu(mtu: u16) -> Self {
        Self {
            mss: mtu.saturating_sub(TCP_IP4_OVERHEAD),
            ..Self::default()
        }
    }

    pub fn mss_for(&self, local: &IpAddr) -> u16 {
        match local {
            IpAddr::V4(_) => self.mss,
            IpAddr::V6(_) => self.mss.saturating_sub(IP6_EXTRA),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            window: 0xffff,
            msl: Duration::from_secs(30),
            max_retransmits: 8,
            backlog: 64,
            limited_tx: true,
            read_chunk: 4096,
            iss_secret: 0x5eed_1234,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub segments_in: u64,
    pub segments_out: u64,
    pub retransmits: u64,
    pub fast_retransmits: u64,
    pub dup_acks: u64,
    pub resets_out: u64,
    pub checksum_errors: u64,
    /// Truncated or otherwise unusable segments.
    pub dropped: u64,
    pub active_opens: u64,
    pub passive_opens: u64,
    pub timeouts: u64,
    pub persist_sends: u64,
}

/// A parsed inbound segment.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    pub hdr: TcpHeader,
    /// MSS option, only looked at on SYNs.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl Segment<'_> {
    /// Sequence space consumed: payload plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32
            + self.hdr.has(TcpFlags::SYN) as u32
            + self.hdr.has(TcpFlags::FIN) as u32
    }
}

/// Per-call context handed to connections.
pub struct TcpIo<'a> {
    pub now: Duration,
    pub timers: &'a mut NetTimers,
    pub store: &'a Rc<BufferStore>,
    pub out: &'a mut VecDeque<Datagram>,
    pub stats: &'a mut TcpStats,
}

impl<'a> TcpIo<'a> {
    fn new(tx: &'a mut Tx<'_>, stats: &'a mut TcpStats) -> Self {
        Self {
            now: tx.timers.now(),
            timers: &mut *tx.timers,
            store: tx.store,
            out: &mut *tx.out,
            stats,
        }
    }
}

/// Build one segment for `quad` and queue it for the IP layer.
pub(crate) fn emit(
    io: &mut TcpIo<'_>,
    quad: &Quadruple,
    hdr: &TcpHeader,
    mss: Option<u16>,
    payload: &[u8],
) {
    let mut pkt = Packet::create(io.store, PACKET_HEADROOM);
    if pkt.append(payload).is_err() {
        klog_debug!("tcp: {} segment of {} bytes does not fit a buffer", quad, payload.len());
        return;
    }
    let hlen = TCP_HEADER_LEN + if mss.is_some() { 4 } else { 0 };
    match pkt.push_header(hlen) {
        Ok(h) => {
            write_header(hdr, mss, h);
        }
        Err(_) => return,
    }
    let csum = transport_checksum(quad.src.addr, quad.dst.addr, Protocol::Tcp.as_u8(), pkt.data());
    pkt.data_mut()[16..18].copy_from_slice(&csum.to_be_bytes());
    pkt.mark_l4();
    io.stats.segments_out += 1;
    io.out.push_back(Datagram::new(
        quad.src.addr,
        quad.dst.addr,
        Protocol::Tcp,
        pkt,
    ));
}

/// Initial sequence number in the manner of RFC 6528: a 4 microsecond clock
/// plus a keyed hash of the connection identifier.
fn generate_iss(secret: u32, now: Duration, quad: &Quadruple) -> u32 {
    let mut hash: u32 = 0x811c_9dc5 ^ secret;
    let mut mix = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
    };
    for sock in [&quad.src, &quad.dst] {
        match sock.addr {
            IpAddr::V4(a) => mix(&a.0),
            IpAddr::V6(a) => mix(&a.0),
        }
        mix(&sock.port.to_be_bytes());
    }
    ((now.as_micros() / 4) as u32).wrapping_add(hash)
}

pub type CloseObserver = Box<dyn FnMut(&Quadruple)>;

pub struct Tcp {
    config: TcpConfig,
    listeners: BTreeMap<Socket, Listener>,
    connections: BTreeMap<Quadruple, Connection>,
    ports: PortUtil,
    stats: TcpStats,
    close_observers: Vec<CloseObserver>,
}

fn find_listener<'a>(
    listeners: &'a mut BTreeMap<Socket, Listener>,
    local: &Socket,
) -> Option<&'a mut Listener> {
    if listeners.contains_key(local) {
        return listeners.get_mut(local);
    }
    let wildcard = Socket::new(local.addr.unspecified_like(), local.port);
    listeners.get_mut(&wildcard)
}

impl Tcp {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            listeners: BTreeMap::new(),
            connections: BTreeMap::new(),
            ports: PortUtil::new(),
            stats: TcpStats::default(),
            close_observers: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn set_mss(&mut self, mss: u16) {
        self.config.mss = mss;
    }

    #[inline]
    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    #[inline]
    pub fn ports(&self) -> &PortUtil {
        &self.ports
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn connection(&self, quad: &Quadruple) -> Option<&Connection> {
        self.connections.get(quad)
    }

    pub fn quads(&self) -> impl Iterator<Item = &Quadruple> {
        self.connections.keys()
    }

    pub fn listener(&mut self, local: &Socket) -> Option<&mut Listener> {
        self.listeners.get_mut(local)
    }

    /// Observe every connection reclaimed from now on.
    pub fn add_close_observer(&mut self, f: impl FnMut(&Quadruple) + 'static) {
        self.close_observers.push(Box::new(f));
    }

    // -------------------------------------------------------------------------
    // Application entry points
    // -------------------------------------------------------------------------

    /// Listen on `local`. An unspecified address accepts on every local
    /// address.
    pub fn listen(
        &mut self,
        local: Socket,
        on_connect: impl FnMut(&mut Connection) + 'static,
    ) -> Result<&mut Listener, NetError> {
        if local.port == 0 {
            return Err(NetError::InvalidArgument);
        }
        self.ports.bind(local.port)?;
        klog_debug!("tcp: listening on {}", local);
        let listener = Listener::new(local, self.config.backlog, Box::new(on_connect));
        Ok(self.listeners.entry(local).or_insert(listener))
    }

    /// Stop listening. Established children are not affected.
    pub fn unlisten(&mut self, local: &Socket) -> bool {
        match self.listeners.remove(local) {
            Some(_) => {
                self.ports.unbind(local.port);
                true
            }
            None => false,
        }
    }

    /// Active open from `local_addr` to `remote`.
    pub fn connect(
        &mut self,
        local_addr: IpAddr,
        remote: Socket,
        on_connect: impl FnOnce(Result<&mut Connection, NetError>) + 'static,
        tx: &mut Tx<'_>,
    ) -> Result<Quadruple, NetError> {
        if remote.port == 0 || remote.addr.is_unspecified() || local_addr.is_unspecified() {
            return Err(NetError::InvalidArgument);
        }
        if local_addr.is_v4() != remote.addr.is_v4() {
            return Err(NetError::AddressNotAvailable);
        }
        let port = self.ports.bind_ephemeral()?;
        let quad = Quadruple::new(Socket::new(local_addr, port), remote);
        let mut io = TcpIo::new(tx, &mut self.stats);
        let iss = generate_iss(self.config.iss_secret, io.now, &quad);
        let mut conn = Connection::new(quad, iss, false, &self.config);
        conn.set_owns_port();
        conn.set_on_connect(Box::new(on_connect));
        conn.open_active(&mut io);
        io.stats.active_opens += 1;
        self.connections.insert(quad, conn);
        Ok(quad)
    }

    /// Run `f` on a connection, then send whatever it queued.
    pub fn with_connection<R>(
        &mut self,
        quad: &Quadruple,
        f: impl FnOnce(&mut Connection) -> R,
        tx: &mut Tx<'_>,
    ) -> Option<R> {
        let conn = self.connections.get_mut(quad)?;
        let r = f(conn);
        let mut io = TcpIo::new(tx, &mut self.stats);
        conn.output(&mut io);
        self.reap(tx);
        Some(r)
    }

    /// Give every connection a chance to send.
    pub fn flush(&mut self, tx: &mut Tx<'_>) {
        let mut io = TcpIo::new(tx, &mut self.stats);
        for conn in self.connections.values_mut() {
            conn.output(&mut io);
        }
        self.reap(tx);
    }

    /// Abort every connection with [`NetError::InterfaceDown`].
    pub fn ifdown(&mut self, tx: &mut Tx<'_>) {
        let mut io = TcpIo::new(tx, &mut self.stats);
        for conn in self.connections.values_mut() {
            conn.interface_down(&mut io);
        }
        self.reap(tx);
    }

    // -------------------------------------------------------------------------
    // Network entry points
    // -------------------------------------------------------------------------

    /// An inbound segment from the IP layer.
    pub fn receive(&mut self, dgram: Datagram, tx: &mut Tx<'_>) {
        self.stats.segments_in += 1;
        let data = dgram.packet.data();
        if transport_checksum(dgram.src, dgram.dst, Protocol::Tcp.as_u8(), data) != 0 {
            klog_debug!("tcp: bad checksum from {}", dgram.src);
            self.stats.checksum_errors += 1;
            return;
        }
        let Some(hdr) = parse_header(data) else {
            klog_debug!("tcp: truncated header from {}", dgram.src);
            self.stats.dropped += 1;
            return;
        };
        let mss = if hdr.has(TcpFlags::SYN) {
            parse_mss_option(&data[TCP_HEADER_LEN..hdr.header_len()])
        } else {
            None
        };
        let seg = Segment {
            hdr,
            mss,
            payload: &data[hdr.header_len()..],
        };
        let quad = Quadruple::new(
            Socket::new(dgram.dst, hdr.dst_port),
            Socket::new(dgram.src, hdr.src_port),
        );
        klog_trace!(
            "tcp: {} in flags={:?} seq={} ack={} len={}",
            quad,
            hdr.flags,
            hdr.seq,
            hdr.ack,
            seg.payload.len()
        );

        let mut io = TcpIo::new(tx, &mut self.stats);
        if let Some(conn) = self.connections.get_mut(&quad) {
            if conn.segment_arrives(&seg, &mut io) && conn.is_passive() {
                if let Some(l) = find_listener(&mut self.listeners, &quad.src) {
                    l.connected(conn);
                }
                conn.output(&mut io);
            }
        } else if let Some(l) = find_listener(&mut self.listeners, &quad.src) {
            Self::listen_segment(l, &mut self.connections, &self.config, quad, &seg, &mut io);
        } else {
            Self::closed_segment(quad, &seg, &mut io);
        }
        self.reap(tx);
    }

    /// LISTEN state processing.
    fn listen_segment(
        listener: &mut Listener,
        connections: &mut BTreeMap<Quadruple, Connection>,
        config: &TcpConfig,
        quad: Quadruple,
        seg: &Segment<'_>,
        io: &mut TcpIo<'_>,
    ) {
        let h = &seg.hdr;
        if h.has(TcpFlags::RST) {
            return;
        }
        if h.has(TcpFlags::ACK) {
            klog_debug!("tcp: {} stray ACK to listener", quad);
            Self::send_reset(io, &quad, h.ack, None);
            return;
        }
        if !h.has(TcpFlags::SYN) {
            return;
        }
        if !listener.admit(&quad.dst) {
            return;
        }
        let iss = generate_iss(config.iss_secret, io.now, &quad);
        let mut conn = Connection::new(quad, iss, true, config);
        conn.open_passive(seg, io);
        listener.add_pending(quad);
        io.stats.passive_opens += 1;
        connections.insert(quad, conn);
    }

    /// No connection and no listener: answer anything but a RST with a RST.
    fn closed_segment(quad: Quadruple, seg: &Segment<'_>, io: &mut TcpIo<'_>) {
        let h = &seg.hdr;
        if h.has(TcpFlags::RST) {
            return;
        }
        klog_debug!("tcp: {} no socket, resetting", quad);
        if h.has(TcpFlags::ACK) {
            Self::send_reset(io, &quad, h.ack, None);
        } else {
            let ack = h.seq.wrapping_add(seg.seq_len());
            Self::send_reset(io, &quad, 0, Some(ack));
        }
    }

    fn send_reset(io: &mut TcpIo<'_>, quad: &Quadruple, seq: u32, ack: Option<u32>) {
        let mut flags = TcpFlags::RST;
        if ack.is_some() {
            flags |= TcpFlags::ACK;
        }
        let hdr = TcpHeader {
            src_port: quad.src.port,
            dst_port: quad.dst.port,
            seq,
            ack: ack.unwrap_or(0),
            data_offset: 5,
            flags,
            window: 0,
            checksum: 0,
            urgent: 0,
        };
        io.stats.resets_out += 1;
        emit(io, quad, &hdr, None, &[]);
    }

    /// A TCP timer fired.
    pub fn on_timer(&mut self, timer: NetTimer, id: TimerId, tx: &mut Tx<'_>) {
        let mut io = TcpIo::new(tx, &mut self.stats);
        match timer {
            NetTimer::TcpRetransmit(quad) => {
                if let Some(conn) = self.connections.get_mut(&quad) {
                    conn.rtx_timeout(id, &mut io);
                }
            }
            NetTimer::TcpPersist(quad) => {
                if let Some(conn) = self.connections.get_mut(&quad) {
                    conn.persist_timeout(id, &mut io);
                }
            }
            NetTimer::TcpTimeWait(quad) => {
                if let Some(conn) = self.connections.get_mut(&quad) {
                    conn.timewait_timeout(id);
                }
            }
            _ => return,
        }
        self.reap(tx);
    }

    /// Reclaim every connection in CLOSED.
    fn reap(&mut self, tx: &mut Tx<'_>) {
        let closed: Vec<Quadruple> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_closed())
            .map(|(q, _)| *q)
            .collect();
        for quad in closed {
            let Some(mut conn) = self.connections.remove(&quad) else {
                continue;
            };
            let mut io = TcpIo::new(tx, &mut self.stats);
            conn.reclaim(&mut io);
            if conn.owns_port() {
                self.ports.unbind(quad.src.port);
            }
            if conn.is_passive() {
                if let Some(l) = find_listener(&mut self.listeners, &quad.src) {
                    l.remove_pending(&quad);
                }
            }
            for observer in self.close_observers.iter_mut() {
                observer(&quad);
            }
            klog_debug!("tcp: {} reclaimed", quad);
        }
    }
}
