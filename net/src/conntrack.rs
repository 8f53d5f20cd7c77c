//! Connection tracking for IPv4 flows.
//!
//! An entry is created by the first packet of a flow ([`Conntrack::track`])
//! and indexed by that packet's quadruple (`first`). Once the packet is
//! accepted, [`Conntrack::confirm`] also indexes the expected reply
//! quadruple (`second`), so replies find the same entry. Address translation
//! rewrites `second` through [`Conntrack::update_entry`].
//!
//! Entries expire by idle timeout, checked from a periodic flush timer that
//! only runs while the table is non-empty. Removing an entry, for whatever
//! reason, runs its close handlers.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use bitflags::bitflags;
use unikos_core::TimerId;
use unikos_lib::{klog_debug, klog_trace};

use crate::ip4::{IP4_FRAG_OFFSET_MASK, IP4_HEADER_LEN, parse_header};
use crate::tcp::TcpFlags;
use crate::timer::{NetTimer, NetTimers};
use crate::types::{Ipv4Addr, Protocol, Quadruple, Socket};

/// Interval of the expiry sweep.
pub const CONNTRACK_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Lifetime of an entry that was created but never confirmed.
const UNCONFIRMED_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConntrackTimeouts {
    /// UDP and ICMP flows that saw one direction only.
    pub generic_new: Duration,
    pub generic_established: Duration,
    /// TCP handshake in progress.
    pub tcp_new: Duration,
    pub tcp_established: Duration,
    /// TCP teardown in progress (FIN seen).
    pub tcp_closing: Duration,
    /// TCP flow reset or fully closed.
    pub tcp_closed: Duration,
}

impl Default for ConntrackTimeouts {
    fn default() -> Self {
        Self {
            generic_new: Duration::from_secs(30),
            generic_established: Duration::from_secs(180),
            tcp_new: Duration::from_secs(60),
            tcp_established: Duration::from_secs(600),
            tcp_closing: Duration::from_secs(120),
            tcp_closed: Duration::from_secs(10),
        }
    }
}

/// Direction-level state of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtState {
    New,
    Established,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CtFlags: u8 {
        /// No packet of the reply direction seen yet.
        const UNREPLIED = 0x01;
        /// The TCP handshake completed.
        const ASSURED = 0x02;
    }
}

/// TCP tracker state, following the segments seen in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpCtState {
    None,
    SynSent,
    SynRecv,
    Established,
    /// The initiator sent a FIN.
    FinWait,
    /// The responder sent a FIN.
    CloseWait,
    LastAck,
    TimeWait,
    Close,
}

impl fmt::Display for TcpCtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
        };
        f.write_str(s)
    }
}

pub type EntryId = u32;

/// Called once when an entry is removed.
pub type CloseHandler = Box<dyn FnOnce(&Entry)>;

pub struct Entry {
    pub id: EntryId,
    /// Quadruple of the packet that created the entry.
    pub first: Quadruple,
    /// Quadruple expected on replies.
    pub second: Quadruple,
    pub proto: Protocol,
    pub state: CtState,
    pub flags: CtFlags,
    pub tcp: TcpCtState,
    /// Absolute expiry time.
    pub timeout: Duration,
    confirmed: bool,
    on_close: Vec<CloseHandler>,
}

impl Entry {
    fn new(id: EntryId, first: Quadruple, proto: Protocol) -> Self {
        Self {
            id,
            first,
            second: first.swapped(),
            proto,
            state: CtState::New,
            flags: CtFlags::UNREPLIED,
            tcp: TcpCtState::None,
            timeout: Duration::ZERO,
            confirmed: false,
            on_close: Vec::new(),
        }
    }

    /// Whether replies travel the exact reverse path, i.e. nothing was
    /// translated yet.
    #[inline]
    pub fn is_mirrored(&self) -> bool {
        self.first.src == self.second.dst && self.first.dst == self.second.src
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} | {} ({:?}, {})",
            self.id, self.proto, self.first, self.second, self.state, self.tcp
        )
    }
}

type Key = (Protocol, Quadruple);

/// What the tracker needs from a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowInfo {
    pub proto: Protocol,
    pub quad: Quadruple,
    /// Control bits, for TCP only.
    pub tcp_flags: Option<TcpFlags>,
}

/// Extract the flow of an IPv4 packet starting at its IP header. ICMP
/// flows use the echo identifier as both ports.
pub fn flow_of(ip: &[u8]) -> Option<FlowInfo> {
    let hdr = parse_header(ip).ok()?;
    // Only the first fragment carries the transport header.
    if hdr.flags_frag & IP4_FRAG_OFFSET_MASK != 0 {
        return None;
    }
    let l4 = &ip[hdr.ihl..hdr.total_len as usize];
    let sock = |a: Ipv4Addr, p: u16| Socket::v4(a, p);
    let proto = Protocol::from_u8(hdr.protocol)?;
    let (sp, dp, tcp_flags) = match proto {
        Protocol::Tcp if l4.len() >= 14 => (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
            Some(TcpFlags::from_bits_truncate(l4[13])),
        ),
        Protocol::Udp if l4.len() >= 4 => (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
            None,
        ),
        Protocol::Icmp if l4.len() >= 6 => {
            let id = u16::from_be_bytes([l4[4], l4[5]]);
            (id, id, None)
        }
        _ => return None,
    };
    Some(FlowInfo {
        proto,
        quad: Quadruple::new(sock(hdr.src, sp), sock(hdr.dst, dp)),
        tcp_flags,
    })
}

/// Offset of the transport header inside an IPv4 packet.
#[inline]
pub fn l4_offset(ip: &[u8]) -> usize {
    ip.first()
        .map(|b| ((b & 0x0f) as usize) * 4)
        .unwrap_or(IP4_HEADER_LEN)
}

pub struct Conntrack {
    timeouts: ConntrackTimeouts,
    entries: BTreeMap<EntryId, Entry>,
    index: BTreeMap<Key, EntryId>,
    next_id: EntryId,
    flush_timer: Option<TimerId>,
}

impl Conntrack {
    pub fn new(timeouts: ConntrackTimeouts) -> Self {
        Self {
            timeouts,
            entries: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: 1,
            flush_timer: None,
        }
    }

    #[inline]
    pub fn timeouts(&self) -> &ConntrackTimeouts {
        &self.timeouts
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, quad: &Quadruple, proto: Protocol) -> Option<&Entry> {
        let id = self.index.get(&(proto, *quad))?;
        self.entries.get(id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    /// Run `f` when entry `id` is removed.
    pub fn on_close(&mut self, id: EntryId, f: impl FnOnce(&Entry) + 'static) -> bool {
        match self.entries.get_mut(&id) {
            Some(e) => {
                e.on_close.push(Box::new(f));
                true
            }
            None => false,
        }
    }

    /// Track a packet of `flow`, creating the entry if needed. TCP flows
    /// are only created by a SYN; other TCP packets of unknown flows return
    /// `None`.
    pub fn track(&mut self, flow: &FlowInfo, timers: &mut NetTimers) -> Option<EntryId> {
        let now = timers.now();
        match (flow.proto, flow.tcp_flags) {
            (Protocol::Tcp, Some(flags)) => self.track_tcp(flow.quad, flags, timers),
            (Protocol::Tcp, None) => None,
            _ => {
                let Some(&id) = self.index.get(&(flow.proto, flow.quad)) else {
                    let id = self.add_entry(flow.quad, flow.proto, timers);
                    if let Some(e) = self.entries.get_mut(&id) {
                        e.timeout = now + self.timeouts.generic_new;
                    }
                    return Some(id);
                };
                let e = self.entries.get_mut(&id)?;
                if e.state == CtState::New && flow.quad == e.second {
                    e.state = CtState::Established;
                    e.flags.remove(CtFlags::UNREPLIED);
                    klog_trace!("conntrack: {:?} established", e);
                }
                e.timeout = now
                    + match e.state {
                        CtState::Established => self.timeouts.generic_established,
                        CtState::New => self.timeouts.generic_new,
                    };
                Some(id)
            }
        }
    }

    fn track_tcp(&mut self, quad: Quadruple, flags: TcpFlags, timers: &mut NetTimers) -> Option<EntryId> {
        let now = timers.now();
        let Some(&id) = self.index.get(&(Protocol::Tcp, quad)) else {
            if !flags.contains(TcpFlags::SYN) || flags.contains(TcpFlags::ACK) {
                return None;
            }
            let id = self.add_entry(quad, Protocol::Tcp, timers);
            if let Some(e) = self.entries.get_mut(&id) {
                Self::set_tcp_state(e, TcpCtState::SynSent, &self.timeouts, now);
            }
            return Some(id);
        };
        let timeouts = &self.timeouts;
        let e = self.entries.get_mut(&id)?;
        let from_first = quad == e.first;

        if flags.contains(TcpFlags::RST) {
            Self::set_tcp_state(e, TcpCtState::Close, timeouts, now);
            return Some(id);
        }
        let next = match e.tcp {
            TcpCtState::SynSent if !from_first => {
                if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
                    e.flags.remove(CtFlags::UNREPLIED);
                    e.state = CtState::Established;
                    Some(TcpCtState::SynRecv)
                } else {
                    None
                }
            }
            TcpCtState::SynRecv if from_first && flags.contains(TcpFlags::ACK) => {
                e.flags.insert(CtFlags::ASSURED);
                Some(TcpCtState::Established)
            }
            s if flags.contains(TcpFlags::FIN) => match s {
                TcpCtState::Established if from_first => Some(TcpCtState::FinWait),
                TcpCtState::Established => Some(TcpCtState::CloseWait),
                TcpCtState::FinWait => Some(TcpCtState::TimeWait),
                TcpCtState::CloseWait => Some(TcpCtState::LastAck),
                _ => None,
            },
            TcpCtState::LastAck | TcpCtState::TimeWait if flags.contains(TcpFlags::ACK) => {
                Some(TcpCtState::Close)
            }
            _ => None,
        };
        match next {
            Some(state) => Self::set_tcp_state(e, state, timeouts, now),
            None => e.timeout = now + Self::tcp_timeout(e.tcp, timeouts),
        }
        Some(id)
    }

    fn tcp_timeout(state: TcpCtState, t: &ConntrackTimeouts) -> Duration {
        match state {
            TcpCtState::None | TcpCtState::SynSent | TcpCtState::SynRecv => t.tcp_new,
            TcpCtState::Established => t.tcp_established,
            TcpCtState::FinWait
            | TcpCtState::CloseWait
            | TcpCtState::LastAck
            | TcpCtState::TimeWait => t.tcp_closing,
            TcpCtState::Close => t.tcp_closed,
        }
    }

    fn set_tcp_state(e: &mut Entry, state: TcpCtState, t: &ConntrackTimeouts, now: Duration) {
        if e.tcp != state {
            klog_trace!("conntrack: #{} {} -> {}", e.id, e.tcp, state);
        }
        e.tcp = state;
        e.timeout = now + Self::tcp_timeout(state, t);
    }

    /// Create an unconfirmed entry for `quad`, or return the existing one.
    pub fn add_entry(&mut self, quad: Quadruple, proto: Protocol, timers: &mut NetTimers) -> EntryId {
        if self.flush_timer.is_none() {
            self.flush_timer = Some(timers.periodic(
                CONNTRACK_FLUSH_INTERVAL,
                CONNTRACK_FLUSH_INTERVAL,
                NetTimer::ConntrackFlush,
            ));
        }
        if let Some(&id) = self.index.get(&(proto, quad)) {
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let mut entry = Entry::new(id, quad, proto);
        entry.timeout = timers.now() + UNCONFIRMED_TIMEOUT;
        klog_trace!("conntrack: added {:?}", entry);
        self.entries.insert(id, entry);
        self.index.insert((proto, quad), id);
        id
    }

    /// Accept the entry created by `quad`, indexing its reply direction.
    /// Returns `None` when there is nothing left to confirm.
    pub fn confirm(&mut self, quad: &Quadruple, proto: Protocol, now: Duration) -> Option<EntryId> {
        let id = *self.index.get(&(proto, *quad))?;
        let e = self.entries.get_mut(&id)?;
        if e.confirmed {
            return None;
        }
        e.confirmed = true;
        if e.proto != Protocol::Tcp {
            e.timeout = now + self.timeouts.generic_new;
        }
        let second = e.second;
        self.index.entry((proto, second)).or_insert(id);
        Some(id)
    }

    /// Replace the `old` quadruple of an entry with `new`.
    pub fn update_entry(&mut self, proto: Protocol, old: &Quadruple, new: Quadruple) -> bool {
        let indexed = self.index.remove(&(proto, *old));
        let id = match indexed {
            Some(id) => id,
            // The reply side of an unconfirmed entry is not indexed yet.
            None => match self
                .entries
                .values()
                .find(|e| e.proto == proto && e.second == *old)
            {
                Some(e) => e.id,
                None => return false,
            },
        };
        let Some(e) = self.entries.get_mut(&id) else {
            return false;
        };
        if e.first == *old {
            e.first = new;
        } else {
            e.second = new;
        }
        klog_trace!("conntrack: updated {:?}", e);
        if indexed.is_some() {
            self.index.insert((proto, new), id);
        }
        true
    }

    /// Remove an entry, running its close handlers.
    pub fn remove(&mut self, id: EntryId) -> bool {
        let Some(mut e) = self.entries.remove(&id) else {
            return false;
        };
        for key in [(e.proto, e.first), (e.proto, e.second)] {
            if self.index.get(&key) == Some(&id) {
                self.index.remove(&key);
            }
        }
        klog_debug!("conntrack: removed {:?}", e);
        for f in core::mem::take(&mut e.on_close) {
            f(&e);
        }
        true
    }

    /// Remove the entry `quad` belongs to, in either direction.
    pub fn remove_quad(&mut self, quad: &Quadruple, proto: Protocol) -> bool {
        match self.index.get(&(proto, *quad)) {
            Some(&id) => self.remove(id),
            None => false,
        }
    }

    /// Remove every entry whose timeout passed. Returns how many went.
    pub fn remove_expired(&mut self, now: Duration) -> usize {
        let expired: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.timeout <= now)
            .map(|e| e.id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired.len()
    }

    /// The periodic flush timer fired.
    pub fn on_flush(&mut self, timers: &mut NetTimers) {
        let n = self.remove_expired(timers.now());
        if n > 0 {
            klog_debug!("conntrack: {} entries expired, {} left", n, self.entries.len());
        }
        if self.entries.is_empty() {
            if let Some(id) = self.flush_timer.take() {
                timers.stop(id);
            }
        }
    }

    /// Remove every entry and stop the flush timer.
    pub fn clear(&mut self, timers: &mut NetTimers) {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
        if let Some(id) = self.flush_timer.take() {
            timers.stop(id);
        }
    }
}

impl Default for Conntrack {
    fn default() -> Self {
        Self::new(ConntrackTimeouts::default())
    }
}
