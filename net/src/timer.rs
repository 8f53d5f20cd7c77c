//! Data-driven timers of the network stack.
//!
//! Every network timer is scheduled on one [`Timers`] engine with a
//! [`NetTimer`] payload naming the resource it belongs to. When the engine
//! reports a timer as fired, [`Inet`](crate::inet::Inet) matches on the
//! payload and calls the owning subsystem. Handlers never capture stack state,
//! so a timer outliving its resource is harmless: the lookup by key simply
//! finds nothing, and owners additionally stop their timers when reclaimed.

use unikos_core::Timers;

use crate::types::{Ipv4Addr, Ipv6Addr, Quadruple};

/// What a fired network timer refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetTimer {
    /// Retransmission timer of a TCP connection.
    TcpRetransmit(Quadruple),
    /// Query a peer window too small to send into.
    TcpPersist(Quadruple),
    /// 2*MSL elapsed for a connection in TIME_WAIT.
    TcpTimeWait(Quadruple),
    /// Resend the ARP request for an unresolved address.
    ArpRetry(Ipv4Addr),
    /// Periodic ARP cache expiry.
    ArpFlush,
    /// Resend the neighbor solicitation for an unresolved address.
    NdpRetry(Ipv6Addr),
    /// Periodic neighbor cache and address lifetime maintenance.
    NdpTick,
    /// Periodic conntrack expiry.
    ConntrackFlush,
    /// No echo reply arrived in time.
    PingTimeout { id: u16, seq: u16 },
}

/// The timer engine instance owned by a stack.
pub type NetTimers = Timers<NetTimer>;
