//! Outstanding echo requests of one stack, for both address families.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::klog_debug;

use crate::timer::{NetTimer, NetTimers};
use crate::types::IpAddr;

/// A matching echo reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoReply {
    pub from: IpAddr,
    pub id: u16,
    pub seq: u16,
    /// Bytes of echo data carried back.
    pub payload_len: usize,
    pub rtt: Duration,
}

/// Receives the reply, or `None` once the timeout passed.
pub type PingCallback = Box<dyn FnOnce(Option<EchoReply>)>;

struct PendingPing {
    cb: PingCallback,
    timer: TimerId,
    sent: Duration,
}

pub struct Pinger {
    id: u16,
    next_seq: u16,
    pending: BTreeMap<u16, PendingPing>,
}

impl Pinger {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            next_seq: 1,
            pending: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Register a new request; returns its sequence number.
    pub fn start(&mut self, cb: PingCallback, timeout: Duration, timers: &mut NetTimers) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let timer = timers.oneshot(timeout, NetTimer::PingTimeout { id: self.id, seq });
        let sent = timers.now();
        self.pending.insert(seq, PendingPing { cb, timer, sent });
        seq
    }

    /// An echo reply arrived. Returns `false` if it matched nothing.
    pub fn reply(
        &mut self,
        from: IpAddr,
        id: u16,
        seq: u16,
        payload_len: usize,
        timers: &mut NetTimers,
    ) -> bool {
        if id != self.id {
            return false;
        }
        let Some(p) = self.pending.remove(&seq) else {
            klog_debug!("icmp: unsolicited echo reply from {} seq {}", from, seq);
            return false;
        };
        timers.stop(p.timer);
        let rtt = timers.now().saturating_sub(p.sent);
        (p.cb)(Some(EchoReply {
            from,
            id,
            seq,
            payload_len,
            rtt,
        }));
        true
    }

    /// The timeout of request `seq` fired.
    pub fn on_timeout(&mut self, id: u16, seq: u16, timer: TimerId) {
        if id != self.id {
            return;
        }
        match self.pending.get(&seq) {
            Some(p) if p.timer == timer => {}
            _ => return,
        }
        if let Some(p) = self.pending.remove(&seq) {
            klog_debug!("icmp: echo seq {} timed out", seq);
            (p.cb)(None);
        }
    }

    /// Fail every outstanding request.
    pub fn clear(&mut self, timers: &mut NetTimers) {
        let pending = core::mem::take(&mut self.pending);
        for (_, p) in pending {
            timers.stop(p.timer);
            (p.cb)(None);
        }
    }
}
