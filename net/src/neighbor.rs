//! Neighbor cache shared by ARP and NDP.
//!
//! Each entry walks `Incomplete` -> `Reachable` -> `Stale` -> expired, or
//! `Incomplete` -> `Failed` when nobody answers. Packets sent while an entry
//! is `Incomplete` are parked on it (bounded) and handed back to the caller
//! once the link address is known.
//!
//! Retries are one-shot timers on the stack's [`NetTimers`] carrying the
//! protocol's retry payload; aging runs from the protocol's periodic tick.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::klog_debug;

use crate::packet::Packet;
use crate::timer::{NetTimer, NetTimers};
use crate::types::MacAddr;

/// Entries kept before the least useful one is evicted.
pub const MAX_ENTRIES: usize = 256;
/// Packets parked per unresolved address; further ones are dropped.
pub const MAX_PENDING_PKTS: usize = 4;
/// Solicitations repeated before an address is declared unreachable.
pub const MAX_RETRIES: u8 = 3;
/// Interval between solicitations.
pub const RETRANSMIT_TIME: Duration = Duration::from_secs(1);
/// Confirmed entries age to `Stale` after this long.
pub const REACHABLE_TIME: Duration = Duration::from_secs(30);
/// `Stale` entries are forgotten after this long.
pub const STALE_TIME: Duration = Duration::from_secs(300);
/// `Failed` entries keep refusing traffic for this long.
pub const FAILED_HOLD: Duration = Duration::from_secs(20);

pub enum NeighborState {
    Incomplete { retries: u8, pending: Vec<Packet> },
    Reachable { mac: MacAddr, confirmed: Duration },
    Stale { mac: MacAddr, since: Duration },
    Failed { since: Duration },
}

impl NeighborState {
    pub fn mac(&self) -> Option<MacAddr> {
        match self {
            Self::Reachable { mac, .. } | Self::Stale { mac, .. } => Some(*mac),
            _ => None,
        }
    }
}

impl fmt::Debug for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete { retries, pending } => {
                write!(f, "Incomplete(retries={}, pending={})", retries, pending.len())
            }
            Self::Reachable { mac, .. } => write!(f, "Reachable({})", mac),
            Self::Stale { mac, .. } => write!(f, "Stale({})", mac),
            Self::Failed { .. } => write!(f, "Failed"),
        }
    }
}

struct NeighborEntry {
    state: NeighborState,
    timer: Option<TimerId>,
}

/// Outcome of asking the cache for a link address.
pub enum Resolve {
    /// Known; send the packet to `mac` now.
    Resolved(MacAddr, Packet),
    /// Parked behind a solicitation already in flight.
    Queued,
    /// Parked on a new entry; the caller must send the first solicitation.
    Solicit,
    /// The address is known to be unreachable; the packet was dropped.
    Failed,
}

/// Outcome of a retry timer.
pub enum Retry {
    /// Send another solicitation.
    Solicit,
    /// Out of retries; these parked packets are dropped.
    GaveUp(Vec<Packet>),
    /// Stale timer or the entry is no longer waiting.
    Ignore,
}

pub struct NeighborCache<A> {
    entries: BTreeMap<A, NeighborEntry>,
}

impl<A: Ord + Copy + fmt::Display> NeighborCache<A> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, addr: &A) -> Option<MacAddr> {
        self.entries.get(addr).and_then(|e| e.state.mac())
    }

    pub fn state(&self, addr: &A) -> Option<&NeighborState> {
        self.entries.get(addr).map(|e| &e.state)
    }

    /// Whether a packet for `addr` would be parked or dropped.
    pub fn is_resolving(&self, addr: &A) -> bool {
        matches!(
            self.state(addr),
            Some(NeighborState::Incomplete { .. })
        )
    }

    /// Record a confirmed mapping. Returns the packets that were waiting for it.
    pub fn update(
        &mut self,
        addr: A,
        mac: MacAddr,
        now: Duration,
        timers: &mut NetTimers,
    ) -> Vec<Packet> {
        if !self.entries.contains_key(&addr) && self.entries.len() >= MAX_ENTRIES {
            self.evict_one(timers);
        }
        let entry = self.entries.entry(addr).or_insert(NeighborEntry {
            state: NeighborState::Failed { since: now },
            timer: None,
        });
        if let Some(id) = entry.timer.take() {
            timers.stop(id);
        }
        let old = core::mem::replace(
            &mut entry.state,
            NeighborState::Reachable { mac, confirmed: now },
        );
        match old {
            NeighborState::Incomplete { pending, .. } => {
                if !pending.is_empty() {
                    klog_debug!("neighbor: {} resolved, flushing {} packets", addr, pending.len());
                }
                pending
            }
            NeighborState::Reachable { mac: prev, .. } | NeighborState::Stale { mac: prev, .. }
                if prev != mac =>
            {
                klog_debug!("neighbor: {} moved from {} to {}", addr, prev, mac);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Refresh an existing entry only (RFC 826 merge rule). Returns the
    /// packets that were waiting, or `None` if `addr` is not cached.
    pub fn refresh(
        &mut self,
        addr: A,
        mac: MacAddr,
        now: Duration,
        timers: &mut NetTimers,
    ) -> Option<Vec<Packet>> {
        if !self.entries.contains_key(&addr) {
            return None;
        }
        Some(self.update(addr, mac, now, timers))
    }

    /// Find the link address for `addr`, parking `pkt` if it is unknown.
    pub fn resolve(
        &mut self,
        addr: A,
        pkt: Packet,
        now: Duration,
        timers: &mut NetTimers,
        retry: NetTimer,
    ) -> Resolve {
        if let Some(entry) = self.entries.get_mut(&addr) {
            return match &mut entry.state {
                NeighborState::Reachable { mac, .. } | NeighborState::Stale { mac, .. } => {
                    Resolve::Resolved(*mac, pkt)
                }
                NeighborState::Incomplete { pending, .. } => {
                    if pending.len() < MAX_PENDING_PKTS {
                        pending.push(pkt);
                    } else {
                        klog_debug!("neighbor: pending queue full for {}, dropping", addr);
                    }
                    Resolve::Queued
                }
                NeighborState::Failed { .. } => {
                    klog_debug!("neighbor: {} unreachable, dropping", addr);
                    Resolve::Failed
                }
            };
        }

        if self.entries.len() >= MAX_ENTRIES {
            self.evict_one(timers);
        }
        let mut pending = Vec::with_capacity(MAX_PENDING_PKTS);
        pending.push(pkt);
        let timer = timers.oneshot(RETRANSMIT_TIME, retry);
        self.entries.insert(
            addr,
            NeighborEntry {
                state: NeighborState::Incomplete { retries: 0, pending },
                timer: Some(timer),
            },
        );
        klog_debug!("neighbor: resolving {} at {:?}", addr, now);
        Resolve::Solicit
    }

    /// The retry timer `id` of `addr` fired.
    pub fn on_retry(
        &mut self,
        addr: A,
        id: TimerId,
        now: Duration,
        timers: &mut NetTimers,
        retry: NetTimer,
    ) -> Retry {
        let Some(entry) = self.entries.get_mut(&addr) else {
            return Retry::Ignore;
        };
        if entry.timer != Some(id) {
            return Retry::Ignore;
        }
        entry.timer = None;
        let NeighborState::Incomplete { retries, pending } = &mut entry.state else {
            return Retry::Ignore;
        };
        if *retries < MAX_RETRIES {
            *retries += 1;
            klog_debug!("neighbor: retry {}/{} for {}", retries, MAX_RETRIES, addr);
            entry.timer = Some(timers.oneshot(RETRANSMIT_TIME, retry));
            return Retry::Solicit;
        }
        let dropped = core::mem::take(pending);
        klog_debug!(
            "neighbor: {} failed, dropping {} pending packets",
            addr,
            dropped.len()
        );
        entry.state = NeighborState::Failed { since: now };
        Retry::GaveUp(dropped)
    }

    /// Age entries: `Reachable` -> `Stale`, and forget old `Stale` and
    /// `Failed` ones.
    pub fn age(&mut self, now: Duration) {
        self.entries.retain(|addr, entry| match entry.state {
            NeighborState::Reachable { mac, confirmed } => {
                if now.saturating_sub(confirmed) >= REACHABLE_TIME {
                    entry.state = NeighborState::Stale { mac, since: now };
                }
                true
            }
            NeighborState::Stale { since, .. } => {
                let keep = now.saturating_sub(since) < STALE_TIME;
                if !keep {
                    klog_debug!("neighbor: {} expired", addr);
                }
                keep
            }
            NeighborState::Failed { since } => now.saturating_sub(since) < FAILED_HOLD,
            NeighborState::Incomplete { .. } => true,
        });
    }

    /// Drop every entry, stopping retry timers.
    pub fn clear(&mut self, timers: &mut NetTimers) {
        for entry in self.entries.values_mut() {
            if let Some(id) = entry.timer.take() {
                timers.stop(id);
            }
        }
        self.entries.clear();
    }

    /// Evict the least useful entry: failed first, then stale, then the
    /// oldest confirmed one, never one that is still resolving.
    fn evict_one(&mut self, timers: &mut NetTimers) {
        let victim = self
            .entries
            .iter()
            .filter_map(|(addr, e)| {
                let rank = match e.state {
                    NeighborState::Failed { since } => (0u8, since),
                    NeighborState::Stale { since, .. } => (1, since),
                    NeighborState::Reachable { confirmed, .. } => (2, confirmed),
                    NeighborState::Incomplete { .. } => return None,
                };
                Some((rank, *addr))
            })
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, addr)| addr);
        if let Some(addr) = victim {
            if let Some(entry) = self.entries.remove(&addr) {
                if let Some(id) = entry.timer {
                    timers.stop(id);
                }
            }
            klog_debug!("neighbor: evicted {}", addr);
        }
    }
}

impl<A: Ord + Copy + fmt::Display> Default for NeighborCache<A> {
    fn default() -> Self {
        Self::new()
    }
}
