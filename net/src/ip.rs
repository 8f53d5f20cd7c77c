//! The hand-off between the IP layers and the transport protocols.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::rc::Rc;

use crate::buffer_store::BufferStore;
use crate::packet::Packet;
use crate::timer::NetTimers;
use crate::types::{IpAddr, Protocol};

/// A transport payload with the addressing the IP layer resolved for it.
///
/// Inbound, `packet` starts at the transport header and ends where the IP
/// payload ends. Outbound, `packet` starts at the transport header with
/// enough headroom left for the IP and link headers.
#[derive(Debug)]
pub struct Datagram {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: Protocol,
    pub packet: Packet,
}

impl Datagram {
    pub fn new(src: IpAddr, dst: IpAddr, protocol: Protocol, packet: Packet) -> Self {
        Self {
            src,
            dst,
            protocol,
            packet,
        }
    }
}

/// What a transport protocol needs to emit datagrams and arm timers.
pub struct Tx<'a> {
    pub timers: &'a mut NetTimers,
    pub store: &'a Rc<BufferStore>,
    pub out: &'a mut VecDeque<Datagram>,
}

impl<'a> Tx<'a> {
    pub fn new(
        timers: &'a mut NetTimers,
        store: &'a Rc<BufferStore>,
        out: &'a mut VecDeque<Datagram>,
    ) -> Self {
        Self { timers, store, out }
    }
}
