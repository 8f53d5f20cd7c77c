//! Passive endpoints.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeSet;

use unikos_lib::klog_debug;

use super::connection::Connection;
use crate::types::{Quadruple, Socket};

/// Decides whether a SYN from the given remote is answered.
pub type AcceptCallback = Box<dyn FnMut(&Socket) -> bool>;
/// A child connection completed the handshake.
pub type ListenCallback = Box<dyn FnMut(&mut Connection)>;

/// A socket in LISTEN. Children live in the host's connection table; the
/// listener only remembers which of them are still half-open so the SYN
/// backlog can be enforced.
pub struct Listener {
    local: Socket,
    backlog: usize,
    syn_queue: BTreeSet<Quadruple>,
    on_accept: Option<AcceptCallback>,
    on_connect: Option<ListenCallback>,
    accepted: u64,
}

impl Listener {
    pub(crate) fn new(local: Socket, backlog: usize, on_connect: ListenCallback) -> Self {
        Self {
            local,
            backlog,
            syn_queue: BTreeSet::new(),
            on_accept: None,
            on_connect: Some(on_connect),
            accepted: 0,
        }
    }

    #[inline]
    pub fn local(&self) -> Socket {
        self.local
    }

    #[inline]
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn set_backlog(&mut self, backlog: usize) {
        self.backlog = backlog;
    }

    /// Children still in SYN_RECEIVED.
    #[inline]
    pub fn syn_queue_len(&self) -> usize {
        self.syn_queue.len()
    }

    /// Children handed to the application so far.
    #[inline]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn on_accept(&mut self, cb: impl FnMut(&Socket) -> bool + 'static) {
        self.on_accept = Some(Box::new(cb));
    }

    /// Whether a SYN from `remote` may create a child.
    pub(crate) fn admit(&mut self, remote: &Socket) -> bool {
        if self.syn_queue.len() >= self.backlog {
            klog_debug!("tcp: {} SYN backlog full, dropping SYN from {}", self.local, remote);
            return false;
        }
        match self.on_accept.as_mut() {
            Some(cb) => cb(remote),
            None => true,
        }
    }

    pub(crate) fn add_pending(&mut self, quad: Quadruple) {
        self.syn_queue.insert(quad);
    }

    pub(crate) fn remove_pending(&mut self, quad: &Quadruple) -> bool {
        self.syn_queue.remove(quad)
    }

    /// `conn` reached ESTABLISHED.
    pub(crate) fn connected(&mut self, conn: &mut Connection) {
        self.remove_pending(conn.quad());
        self.accepted += 1;
        if let Some(cb) = self.on_connect.as_mut() {
            cb(conn);
        }
    }
}
