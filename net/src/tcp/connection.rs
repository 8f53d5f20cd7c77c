//! One TCP connection: the RFC 793 state machine, Reno congestion control
//! (RFC 5681 / RFC 6582) with limited transmit (RFC 3042), and the
//! application callbacks.
//!
//! Application calls ([`write`](Connection::write), [`close`](Connection::close),
//! [`abort`](Connection::abort)) only record intent. The owning [`Tcp`] host
//! turns that intent into segments on its next pass over the connection, so
//! a callback can freely write or close the connection it was handed.
//!
//! [`Tcp`]: super::Tcp

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use unikos_core::TimerId;
use unikos_lib::{klog_debug, klog_trace};

use super::header::{TcpFlags, TcpHeader, seq_ge, seq_gt, seq_in, seq_le, seq_lt};
use super::rttm::{RTO_MAX, RTO_SYN, Rttm};
use super::write_queue::{WriteBuffer, WriteCallback, WriteQueue};
use super::{Segment, TcpConfig, TcpIo, emit};
use crate::timer::NetTimer;
use crate::types::{NetError, Quadruple, Socket};

/// MSS assumed when the peer sends no MSS option (RFC 1122 4.2.2.6).
pub const DEFAULT_PEER_MSS: u16 = 536;

/// Consecutive duplicate ACKs that trigger fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Initial congestion window, in segments.
const INITIAL_CWND_SEGMENTS: u32 = 3;

/// Doublings of the persist interval before it stays at [`RTO_MAX`].
const PERSIST_MAX_SHIFT: u32 = 6;

/// Connection state per RFC 793 section 3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Human-readable name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// Data can still flow in at least one direction.
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::CloseWait
        )
    }

    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            Self::FinWait1
                | Self::FinWait2
                | Self::CloseWait
                | Self::Closing
                | Self::LastAck
                | Self::TimeWait
        )
    }

    /// Whether the application may still queue data.
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Self::SynSent | Self::SynReceived | Self::Established | Self::CloseWait
        )
    }

    /// Whether a FIN from the peer has already been consumed.
    const fn fin_received(self) -> bool {
        matches!(
            self,
            Self::CloseWait | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transmission control block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tcb {
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    /// Segment sequence number used for the last window update.
    pub snd_wl1: u32,
    /// Segment acknowledgment number used for the last window update.
    pub snd_wl2: u32,
    pub iss: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub irs: u32,
    pub cwnd: u32,
    pub ssthresh: u32,
    /// Highest sequence number sent when the last recovery began (RFC 6582).
    pub recover: u32,
}

impl Tcb {
    #[inline]
    pub fn flight_size(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    #[inline]
    pub fn slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// Completion of an active open.
pub type ConnectCallback = Box<dyn FnOnce(Result<&mut Connection, NetError>)>;
/// Received bytes, in order, at most the registered chunk size at a time.
pub type ReadCallback = Box<dyn FnMut(&mut Connection, &[u8])>;
/// The peer closed its sending side.
pub type DisconnectCallback = Box<dyn FnMut(&mut Connection)>;
/// Reset, timeout or interface loss.
pub type ErrorCallback = Box<dyn FnMut(&mut Connection, NetError)>;
/// Bytes newly acknowledged by the peer.
pub type WriteAckCallback = Box<dyn FnMut(&mut Connection, usize)>;
/// The connection is being reclaimed.
pub type CloseCallback = Box<dyn FnOnce()>;

pub struct Connection {
    quad: Quadruple,
    state: TcpState,
    passive: bool,
    tcb: Tcb,
    /// Our MSS, advertised in the SYN.
    mss: u16,
    /// Sender MSS after negotiation.
    smss: u16,
    window: u32,
    msl: Duration,
    max_retransmits: u32,
    limited_tx: bool,

    writeq: WriteQueue,
    rttm: Rttm,
    read_buf: Vec<u8>,
    read_chunk: usize,

    rtx_timer: Option<TimerId>,
    timewait_timer: Option<TimerId>,
    persist_timer: Option<TimerId>,
    rtx_attempt: u32,
    persist_shift: u32,
    /// Receive window carried by the last segment we sent.
    adv_wnd: u32,

    dup_acks: u32,
    fast_recovery: bool,
    reno_fpack_seen: bool,
    highest_ack: u32,
    prev_highest_ack: u32,

    close_requested: bool,
    abort_requested: bool,
    fin_sent: bool,
    ack_pending: bool,
    owns_port: bool,

    on_connect: Option<ConnectCallback>,
    on_read: Option<ReadCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
    on_write: Option<WriteAckCallback>,
    on_close: Option<CloseCallback>,
}

impl Connection {
    pub(crate) fn new(quad: Quadruple, iss: u32, passive: bool, config: &TcpConfig) -> Self {
        let mss = config.mss_for(&quad.src.addr);
        let tcb = Tcb {
            snd_una: iss,
            snd_nxt: iss,
            iss,
            rcv_wnd: config.window,
            cwnd: INITIAL_CWND_SEGMENTS * mss as u32,
            ssthresh: config.window,
            recover: iss,
            ..Tcb::default()
        };
        Self {
            quad,
            state: TcpState::Closed,
            passive,
            tcb,
            mss,
            smss: mss,
            window: config.window,
            msl: config.msl,
            max_retransmits: config.max_retransmits,
            limited_tx: config.limited_tx,
            writeq: WriteQueue::new(),
            rttm: Rttm::new(),
            read_buf: Vec::new(),
            read_chunk: config.read_chunk,
            rtx_timer: None,
            timewait_timer: None,
            persist_timer: None,
            rtx_attempt: 0,
            persist_shift: 0,
            adv_wnd: config.window,
            dup_acks: 0,
            fast_recovery: false,
            reno_fpack_seen: false,
            highest_ack: iss,
            prev_highest_ack: iss,
            close_requested: false,
            abort_requested: false,
            fin_sent: false,
            ack_pending: false,
            owns_port: false,
            on_connect: None,
            on_read: None,
            on_disconnect: None,
            on_error: None,
            on_write: None,
            on_close: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn quad(&self) -> &Quadruple {
        &self.quad
    }

    #[inline]
    pub fn local(&self) -> Socket {
        self.quad.src
    }

    #[inline]
    pub fn remote(&self) -> Socket {
        self.quad.dst
    }

    #[inline]
    pub fn state(&self) -> TcpState {
        self.state
    }

    #[inline]
    pub fn tcb(&self) -> &Tcb {
        &self.tcb
    }

    /// Whether the connection was accepted by a listener.
    #[inline]
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    #[inline]
    pub fn smss(&self) -> u16 {
        self.smss
    }

    #[inline]
    pub fn rto(&self) -> Duration {
        self.rttm.rto()
    }

    #[inline]
    pub fn srtt(&self) -> Option<Duration> {
        self.rttm.srtt()
    }

    #[inline]
    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    #[inline]
    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    #[inline]
    pub fn reno_fpack_seen(&self) -> bool {
        self.reno_fpack_seen
    }

    #[inline]
    pub fn rtx_attempts(&self) -> u32 {
        self.rtx_attempt
    }

    /// Whether the sender is probing a window too small to send into.
    #[inline]
    pub fn is_persisting(&self) -> bool {
        self.persist_timer.is_some()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state.is_open()
    }

    /// Bytes written by the application and not yet acknowledged.
    pub fn bytes_unacknowledged(&self) -> usize {
        self.writeq.bytes_unacknowledged()
    }

    /// Bytes written by the application and not yet sent.
    pub fn sendq_remaining(&self) -> usize {
        self.writeq.bytes_remaining()
    }

    /// Received bytes waiting for a read callback.
    pub fn readq_len(&self) -> usize {
        self.read_buf.len()
    }

    /// `min(SND.WND, cwnd)` minus what is in flight.
    pub fn usable_window(&self) -> u32 {
        self.tcb
            .snd_wnd
            .min(self.tcb.cwnd)
            .saturating_sub(self.tcb.flight_size())
    }

    #[inline]
    pub(crate) fn owns_port(&self) -> bool {
        self.owns_port
    }

    #[inline]
    pub(crate) fn set_owns_port(&mut self) {
        self.owns_port = true;
    }

    pub(crate) fn set_on_connect(&mut self, cb: ConnectCallback) {
        self.on_connect = Some(cb);
    }

    // -------------------------------------------------------------------------
    // Application interface
    // -------------------------------------------------------------------------

    /// Deliver received data to `cb` in chunks of at most `size` bytes.
    /// Anything already buffered is delivered immediately.
    pub fn on_read(&mut self, size: usize, cb: impl FnMut(&mut Connection, &[u8]) + 'static) {
        self.read_chunk = size.max(1);
        self.on_read = Some(Box::new(cb));
        self.deliver();
    }

    /// Called when the peer closes its side. Without a callback the
    /// connection closes ours in turn.
    pub fn on_disconnect(&mut self, cb: impl FnMut(&mut Connection) + 'static) {
        self.on_disconnect = Some(Box::new(cb));
    }

    pub fn on_error(&mut self, cb: impl FnMut(&mut Connection, NetError) + 'static) {
        self.on_error = Some(Box::new(cb));
    }

    pub fn on_write(&mut self, cb: impl FnMut(&mut Connection, usize) + 'static) {
        self.on_write = Some(Box::new(cb));
    }

    pub fn on_close(&mut self, cb: impl FnOnce() + 'static) {
        self.on_close = Some(Box::new(cb));
    }

    pub fn set_limited_tx(&mut self, enabled: bool) {
        self.limited_tx = enabled;
    }

    /// Queue `data` for sending.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        self.queue_write(data.to_vec(), None)
    }

    /// Queue `data`; `on_written` receives the byte count once the whole
    /// buffer has been handed to the network (or what was sent of it, if the
    /// connection goes away first).
    pub fn write_with(
        &mut self,
        data: Vec<u8>,
        on_written: impl FnOnce(usize) + 'static,
    ) -> Result<(), NetError> {
        self.queue_write(data, Some(Box::new(on_written)))
    }

    fn queue_write(&mut self, data: Vec<u8>, cb: Option<WriteCallback>) -> Result<(), NetError> {
        if self.state == TcpState::Closed {
            return Err(NetError::NotConnected);
        }
        if self.close_requested || !self.state.is_writable() {
            return Err(NetError::Shutdown);
        }
        if data.is_empty() {
            return Err(NetError::InvalidArgument);
        }
        self.writeq.push_back(WriteBuffer::new(data, true), cb);
        Ok(())
    }

    /// Graceful close: the FIN follows the data already queued.
    pub fn close(&mut self) {
        match self.state {
            TcpState::SynSent | TcpState::Listen => {
                self.on_connect = None;
                self.set_state(TcpState::Closed);
            }
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Drop the connection, sending RST to a synchronized peer.
    pub fn abort(&mut self) {
        if self.state != TcpState::Closed {
            self.abort_requested = true;
        }
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Active open: send our SYN.
    pub(crate) fn open_active(&mut self, io: &mut TcpIo<'_>) {
        self.set_state(TcpState::SynSent);
        self.send_syn(io);
        self.tcb.snd_nxt = self.tcb.iss.wrapping_add(1);
        self.rttm.start(io.now, self.tcb.snd_nxt);
        self.rtx_start(io);
    }

    /// Passive open: `seg` is the SYN a listener received.
    pub(crate) fn open_passive(&mut self, seg: &Segment<'_>, io: &mut TcpIo<'_>) {
        let h = &seg.hdr;
        self.tcb.irs = h.seq;
        self.tcb.rcv_nxt = h.seq.wrapping_add(1);
        self.tcb.snd_wnd = h.window as u32;
        self.tcb.snd_wl1 = h.seq;
        self.negotiate_mss(seg.mss);
        self.set_state(TcpState::SynReceived);
        self.send_syn(io);
        self.tcb.snd_nxt = self.tcb.iss.wrapping_add(1);
        self.rttm.start(io.now, self.tcb.snd_nxt);
        self.rtx_start(io);
    }

    fn negotiate_mss(&mut self, peer: Option<u16>) {
        let peer = peer.unwrap_or(DEFAULT_PEER_MSS);
        self.smss = self.mss.min(peer).max(1);
        self.tcb.cwnd = INITIAL_CWND_SEGMENTS * self.smss as u32;
    }

    // -------------------------------------------------------------------------
    // Segment arrival (RFC 793 3.9)
    // -------------------------------------------------------------------------

    /// Process one inbound segment. Returns `true` if it completed a passive
    /// open, so the host can hand the connection to its listener.
    pub(crate) fn segment_arrives(&mut self, seg: &Segment<'_>, io: &mut TcpIo<'_>) -> bool {
        match self.state {
            TcpState::Closed | TcpState::Listen => return false,
            TcpState::SynSent => {
                self.process_syn_sent(seg, io);
                return false;
            }
            _ => {}
        }
        let h = &seg.hdr;

        // Step 1: sequence number check.
        if !self.acceptable(seg) {
            klog_trace!(
                "tcp: {} unacceptable seq={} len={} rcv_nxt={}",
                self.quad,
                h.seq,
                seg.seq_len(),
                self.tcb.rcv_nxt
            );
            if !h.has(TcpFlags::RST) {
                self.send_ack(io);
            }
            return false;
        }

        // Step 2: RST.
        if h.has(TcpFlags::RST) {
            self.on_reset(io);
            return false;
        }

        // Step 4: SYN inside the window is an error.
        if h.has(TcpFlags::SYN) {
            klog_debug!("tcp: {} SYN in window, resetting", self.quad);
            self.send_reset_at(io, self.tcb.snd_nxt);
            self.signal_error(NetError::ConnectionReset);
            self.enter_closed(io);
            return false;
        }

        // Step 5: ACK.
        if !h.has(TcpFlags::ACK) {
            return false;
        }
        let mut established = false;
        if self.state == TcpState::SynReceived {
            if seq_lt(self.tcb.snd_una, h.ack) && seq_le(h.ack, self.tcb.snd_nxt) {
                self.tcb.snd_wnd = h.window as u32;
                self.tcb.snd_wl1 = h.seq;
                self.tcb.snd_wl2 = h.ack;
                self.tcb.ssthresh = self.tcb.snd_wnd;
                self.set_state(TcpState::Established);
                established = true;
            } else {
                self.send_reset_at(io, h.ack);
                return false;
            }
        }
        if !self.process_ack(seg, io) {
            return established;
        }
        match self.state {
            TcpState::FinWait1 if self.fin_acked() => self.set_state(TcpState::FinWait2),
            TcpState::Closing if self.fin_acked() => self.enter_time_wait(io),
            TcpState::LastAck if self.fin_acked() => {
                self.enter_closed(io);
                return established;
            }
            _ => {}
        }

        // Step 7: segment text. Only in-order data is accepted; anything past
        // RCV.NXT is answered with an immediate (duplicate) ACK.
        let mut payload = seg.payload;
        let mut seq = h.seq;
        if seq_lt(seq, self.tcb.rcv_nxt) {
            let skip = (self.tcb.rcv_nxt.wrapping_sub(seq) as usize).min(payload.len());
            payload = &payload[skip..];
            seq = seq.wrapping_add(skip as u32);
        }
        if !payload.is_empty()
            && matches!(
                self.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            if seq != self.tcb.rcv_nxt {
                klog_trace!(
                    "tcp: {} out of order seq={} rcv_nxt={}",
                    self.quad,
                    seq,
                    self.tcb.rcv_nxt
                );
                self.send_ack(io);
                self.output(io);
                return established;
            }
            let take = payload.len().min(self.tcb.rcv_wnd as usize);
            self.read_buf.extend_from_slice(&payload[..take]);
            self.tcb.rcv_nxt = self.tcb.rcv_nxt.wrapping_add(take as u32);
            self.ack_pending = true;
            self.deliver();
        }

        // Step 8: FIN.
        if h.has(TcpFlags::FIN) && !self.is_closed() {
            let fin_seq = h.seq.wrapping_add(seg.payload.len() as u32);
            if fin_seq == self.tcb.rcv_nxt {
                self.tcb.rcv_nxt = self.tcb.rcv_nxt.wrapping_add(1);
                self.ack_pending = true;
                match self.state {
                    TcpState::Established => {
                        self.set_state(TcpState::CloseWait);
                        self.send_ack(io);
                        self.disconnected();
                    }
                    TcpState::FinWait1 => {
                        if self.fin_acked() {
                            self.enter_time_wait(io);
                        } else {
                            self.set_state(TcpState::Closing);
                        }
                    }
                    TcpState::FinWait2 => self.enter_time_wait(io),
                    _ => {}
                }
            } else if self.state.fin_received() && fin_seq.wrapping_add(1) == self.tcb.rcv_nxt {
                self.ack_pending = true;
                if self.state == TcpState::TimeWait {
                    self.enter_time_wait(io);
                }
            }
        }

        self.output(io);
        established
    }

    /// RFC 793 segment acceptability test.
    fn acceptable(&self, seg: &Segment<'_>) -> bool {
        let seq = seg.hdr.seq;
        let len = seg.seq_len();
        let nxt = self.tcb.rcv_nxt;
        let wnd = self.tcb.rcv_wnd;
        match (len, wnd) {
            (0, 0) => seq == nxt,
            (0, _) => seq_in(seq, nxt, nxt.wrapping_add(wnd)),
            (_, 0) => false,
            _ => {
                let end = seq.wrapping_add(len - 1);
                seq_in(seq, nxt, nxt.wrapping_add(wnd)) || seq_in(end, nxt, nxt.wrapping_add(wnd))
            }
        }
    }

    fn process_syn_sent(&mut self, seg: &Segment<'_>, io: &mut TcpIo<'_>) {
        let h = &seg.hdr;

        // Step 1: check ACK.
        let mut ack_ok = false;
        if h.has(TcpFlags::ACK) {
            if seq_le(h.ack, self.tcb.iss) || seq_gt(h.ack, self.tcb.snd_nxt) {
                // An RST carrying a bogus ACK is dropped; anything else is
                // answered with a reset.
                if !h.has(TcpFlags::RST) {
                    self.send_reset_at(io, h.ack);
                }
                return;
            }
            ack_ok = true;
        }

        // Step 2: check RST.
        if h.has(TcpFlags::RST) {
            if ack_ok {
                klog_debug!("tcp: {} SYN_SENT RST, connection refused", self.quad);
                self.signal_error(NetError::ConnectionRefused);
                self.enter_closed(io);
            }
            return;
        }

        // Step 3: check SYN.
        if !h.has(TcpFlags::SYN) {
            return;
        }
        self.tcb.irs = h.seq;
        self.tcb.rcv_nxt = h.seq.wrapping_add(1);
        self.negotiate_mss(seg.mss);

        if ack_ok {
            self.tcb.snd_una = h.ack;
            self.tcb.snd_wnd = h.window as u32;
            self.tcb.snd_wl1 = h.seq;
            self.tcb.snd_wl2 = h.ack;
            self.tcb.ssthresh = self.tcb.snd_wnd;
            self.highest_ack = h.ack;
            self.prev_highest_ack = h.ack;
            self.rttm.on_ack(io.now, h.ack);
            self.rtx_stop(io);
            self.rtx_attempt = 0;
            self.set_state(TcpState::Established);
            self.ack_pending = true;
            if let Some(cb) = self.on_connect.take() {
                cb(Ok(&mut *self));
            }
            self.output(io);
        } else {
            // Simultaneous open.
            self.set_state(TcpState::SynReceived);
            self.send_syn(io);
        }
    }

    fn on_reset(&mut self, io: &mut TcpIo<'_>) {
        match self.state {
            TcpState::SynReceived => {
                // A passive child simply goes away; the listener stays.
                if !self.passive {
                    self.signal_error(NetError::ConnectionRefused);
                }
            }
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                klog_debug!("tcp: {} reset by peer", self.quad);
                self.signal_error(NetError::ConnectionReset);
            }
            _ => {}
        }
        self.enter_closed(io);
    }

    // -------------------------------------------------------------------------
    // ACK processing and Reno
    // -------------------------------------------------------------------------

    /// Returns `false` if the rest of the segment must be ignored.
    fn process_ack(&mut self, seg: &Segment<'_>, io: &mut TcpIo<'_>) -> bool {
        let h = &seg.hdr;
        let ack = h.ack;

        if seq_gt(ack, self.tcb.snd_nxt) {
            // Acknowledges something not yet sent.
            self.send_ack(io);
            return false;
        }
        if seq_lt(ack, self.tcb.snd_una) {
            return true;
        }

        if ack == self.tcb.snd_una {
            if self.tcb.flight_size() > 0
                && seg.payload.is_empty()
                && h.window as u32 == self.tcb.snd_wnd
                && !h.has(TcpFlags::SYN)
                && !h.has(TcpFlags::FIN)
            {
                self.dup_acks += 1;
                io.stats.dup_acks += 1;
                self.on_dup_ack(io);
            } else {
                self.update_window(h);
            }
            return true;
        }

        // New ACK.
        self.update_window(h);
        self.prev_highest_ack = self.tcb.snd_una;
        self.highest_ack = ack;
        let acked = ack.wrapping_sub(self.tcb.snd_una);
        let syn_acked = self.tcb.snd_una == self.tcb.iss;
        self.tcb.snd_una = ack;

        if let Some(rtt) = self.rttm.on_ack(io.now, ack) {
            klog_trace!("tcp: {} rtt={:?} rto={:?}", self.quad, rtt, self.rttm.rto());
        }

        let data_acked = acked - syn_acked as u32;
        let freed = self.writeq.acknowledge(data_acked as usize);

        let partial = self.fast_recovery && !self.reno_full_ack(ack);
        if self.tcb.snd_una == self.tcb.snd_nxt {
            self.rtx_stop(io);
            self.rtx_attempt = 0;
        } else if !partial {
            self.rtx_reset(io);
            self.rtx_attempt = 0;
        }

        if !self.fast_recovery {
            self.dup_acks = 0;
            self.tcb.recover = self.tcb.snd_nxt;
            let smss = self.smss as u32;
            if self.tcb.slow_start() {
                self.tcb.cwnd += acked.min(smss);
            } else {
                self.tcb.cwnd += (smss * smss / self.tcb.cwnd.max(1)).max(1);
            }
        } else if partial {
            klog_trace!("tcp: {} partial ACK in recovery", self.quad);
            self.reno_deflate_cwnd(acked);
            self.retransmit(io);
            if !self.reno_fpack_seen {
                self.rtx_reset(io);
                self.reno_fpack_seen = true;
            }
            if self.can_send() {
                let room = self.usable_window() as usize;
                self.send_data_segment(io, room);
            }
        } else {
            self.dup_acks = 0;
            self.finish_fast_recovery();
        }

        if freed > 0 {
            if let Some(mut cb) = self.on_write.take() {
                cb(self, freed);
                if self.on_write.is_none() {
                    self.on_write = Some(cb);
                }
            }
        }
        true
    }

    fn update_window(&mut self, h: &TcpHeader) {
        let t = &mut self.tcb;
        if seq_lt(t.snd_wl1, h.seq) || (t.snd_wl1 == h.seq && seq_le(t.snd_wl2, h.ack)) {
            t.snd_wnd = h.window as u32;
            t.snd_wl1 = h.seq;
            t.snd_wl2 = h.ack;
        }
    }

    fn on_dup_ack(&mut self, io: &mut TcpIo<'_>) {
        let smss = self.smss as u32;
        if self.dup_acks < DUP_ACK_THRESHOLD {
            if self.limited_tx
                && self.tcb.snd_wnd >= smss
                && self.tcb.flight_size() <= self.tcb.cwnd + 2 * smss
                && self.writeq.remaining_requests()
            {
                self.send_data_segment(io, smss as usize);
            }
        } else if self.dup_acks == DUP_ACK_THRESHOLD {
            let recent = self.highest_ack.wrapping_sub(self.prev_highest_ack);
            if seq_gt(self.tcb.snd_una.wrapping_sub(1), self.tcb.recover)
                || (self.tcb.cwnd > smss && recent <= 4 * smss)
            {
                self.tcb.recover = self.tcb.snd_nxt;
                self.fast_retransmit(io);
            }
        } else if self.fast_recovery {
            self.tcb.cwnd += smss;
            if self.can_send() {
                let room = self.usable_window() as usize;
                self.send_data_segment(io, room);
            }
        }
    }

    fn fast_retransmit(&mut self, io: &mut TcpIo<'_>) {
        klog_debug!(
            "tcp: {} fast retransmit, flight={}",
            self.quad,
            self.tcb.flight_size()
        );
        io.stats.fast_retransmits += 1;
        self.reduce_ssthresh();
        self.retransmit(io);
        self.tcb.cwnd = self.tcb.ssthresh + 3 * self.smss as u32;
        self.fast_recovery = true;
        self.reno_fpack_seen = false;
    }

    fn finish_fast_recovery(&mut self) {
        self.reno_fpack_seen = false;
        self.fast_recovery = false;
        let smss = self.smss as u32;
        self.tcb.cwnd = self
            .tcb
            .ssthresh
            .min(self.tcb.flight_size().max(smss) + smss);
        klog_trace!("tcp: {} recovery done, cwnd={}", self.quad, self.tcb.cwnd);
    }

    fn reduce_ssthresh(&mut self) {
        let two_seg = 2 * self.smss as u32;
        let mut fs = self.tcb.flight_size();
        if self.limited_tx {
            fs = fs.saturating_sub(two_seg);
        }
        self.tcb.ssthresh = (fs / 2).max(two_seg);
    }

    /// Deflate by the amount acknowledged, giving back one segment if at
    /// least a full one was acknowledged.
    fn reno_deflate_cwnd(&mut self, n: u32) {
        let smss = self.smss as u32;
        let by = if n >= smss { n - smss } else { n };
        self.tcb.cwnd = self.tcb.cwnd.saturating_sub(by).max(smss);
    }

    fn reno_full_ack(&self, ack: u32) -> bool {
        seq_ge(ack, self.tcb.recover)
    }

    fn fin_acked(&self) -> bool {
        self.fin_sent && self.tcb.snd_una == self.tcb.snd_nxt
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    fn can_send(&self) -> bool {
        let want = match self.writeq.nxt() {
            Some(b) => b.remaining().min(self.smss as usize),
            None => return false,
        };
        want > 0 && self.usable_window() as usize >= want
    }

    /// Send whatever the windows and the application's intent allow.
    pub(crate) fn output(&mut self, io: &mut TcpIo<'_>) {
        if self.abort_requested {
            self.abort_requested = false;
            if matches!(
                self.state,
                TcpState::SynReceived
                    | TcpState::Established
                    | TcpState::FinWait1
                    | TcpState::FinWait2
                    | TcpState::CloseWait
            ) {
                self.send_reset_at(io, self.tcb.snd_nxt);
            }
            klog_debug!("tcp: {} aborted", self.quad);
            self.enter_closed(io);
            return;
        }
        if matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            while self.can_send() {
                let room = self.usable_window() as usize;
                if self.send_data_segment(io, room) == 0 {
                    break;
                }
            }
            self.persist_check(io);
            if self.close_requested && !self.fin_sent && !self.writeq.remaining_requests() {
                self.send_fin(io);
                let next = if self.state == TcpState::Established {
                    TcpState::FinWait1
                } else {
                    TcpState::LastAck
                };
                self.set_state(next);
            }
        }
        if self.ack_pending {
            self.send_ack(io);
        }
    }

    /// Send up to `max` new bytes from the current write. Returns the bytes
    /// sent.
    fn send_data_segment(&mut self, io: &mut TcpIo<'_>, max: usize) -> usize {
        let n = match self.writeq.nxt() {
            Some(b) => b.remaining().min(self.smss as usize).min(max),
            None => 0,
        };
        if n == 0 {
            return 0;
        }
        let seq = self.tcb.snd_nxt;
        let mut flags = TcpFlags::ACK;
        if self.writeq.push_after(n) {
            flags |= TcpFlags::PSH;
        }
        let hdr = self.header(flags, seq);
        emit(io, &self.quad, &hdr, None, self.writeq.nxt_data(n));
        self.writeq.advance(n);
        self.tcb.snd_nxt = seq.wrapping_add(n as u32);
        self.ack_sent();
        self.rttm.start(io.now, self.tcb.snd_nxt);
        self.rtx_start(io);
        n
    }

    /// Resend the earliest unacknowledged segment.
    fn retransmit(&mut self, io: &mut TcpIo<'_>) {
        io.stats.retransmits += 1;
        self.rttm.cancel();
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => self.send_syn(io),
            _ => {
                let mut data = Vec::new();
                self.writeq.una_data(self.smss as usize, &mut data);
                let mut flags = TcpFlags::ACK;
                let end = self.tcb.snd_una.wrapping_add(data.len() as u32);
                if self.fin_sent && end.wrapping_add(1) == self.tcb.snd_nxt {
                    flags |= TcpFlags::FIN;
                }
                let hdr = self.header(flags, self.tcb.snd_una);
                emit(io, &self.quad, &hdr, None, &data);
                self.ack_sent();
            }
        }
        self.rtx_start(io);
    }

    fn send_syn(&mut self, io: &mut TcpIo<'_>) {
        let flags = if self.state == TcpState::SynSent {
            TcpFlags::SYN
        } else {
            TcpFlags::SYN | TcpFlags::ACK
        };
        let hdr = self.header(flags, self.tcb.iss);
        emit(io, &self.quad, &hdr, Some(self.mss), &[]);
        self.ack_sent();
    }

    fn send_fin(&mut self, io: &mut TcpIo<'_>) {
        let hdr = self.header(TcpFlags::FIN | TcpFlags::ACK, self.tcb.snd_nxt);
        emit(io, &self.quad, &hdr, None, &[]);
        self.tcb.snd_nxt = self.tcb.snd_nxt.wrapping_add(1);
        self.fin_sent = true;
        self.ack_sent();
        self.rtx_start(io);
    }

    fn send_ack(&mut self, io: &mut TcpIo<'_>) {
        let hdr = self.header(TcpFlags::ACK, self.tcb.snd_nxt);
        emit(io, &self.quad, &hdr, None, &[]);
        self.ack_sent();
    }

    /// Persist segment: an already acknowledged sequence number forces
    /// the peer to answer with its current window.
    fn send_persist_ack(&mut self, io: &mut TcpIo<'_>) {
        io.stats.persist_sends += 1;
        let hdr = self.header(TcpFlags::ACK, self.tcb.snd_una.wrapping_sub(1));
        emit(io, &self.quad, &hdr, None, &[]);
        self.ack_sent();
    }

    fn ack_sent(&mut self) {
        self.ack_pending = false;
        self.adv_wnd = self.tcb.rcv_wnd;
    }

    fn send_reset_at(&self, io: &mut TcpIo<'_>, seq: u32) {
        io.stats.resets_out += 1;
        let hdr = self.header(TcpFlags::RST, seq);
        emit(io, &self.quad, &hdr, None, &[]);
    }

    fn header(&self, flags: TcpFlags, seq: u32) -> TcpHeader {
        TcpHeader {
            src_port: self.quad.src.port,
            dst_port: self.quad.dst.port,
            seq,
            ack: if flags.contains(TcpFlags::ACK) {
                self.tcb.rcv_nxt
            } else {
                0
            },
            data_offset: 5,
            flags,
            window: self.tcb.rcv_wnd.min(u16::MAX as u32) as u16,
            checksum: 0,
            urgent: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn rtx_start(&mut self, io: &mut TcpIo<'_>) {
        if self.rtx_timer.is_none() {
            let id = io
                .timers
                .oneshot(self.rttm.rto(), NetTimer::TcpRetransmit(self.quad));
            self.rtx_timer = Some(id);
        }
    }

    fn rtx_stop(&mut self, io: &mut TcpIo<'_>) {
        if let Some(id) = self.rtx_timer.take() {
            io.timers.stop(id);
        }
    }

    fn rtx_reset(&mut self, io: &mut TcpIo<'_>) {
        self.rtx_stop(io);
        self.rtx_start(io);
    }

    /// The retransmission timer `id` fired.
    pub(crate) fn rtx_timeout(&mut self, id: TimerId, io: &mut TcpIo<'_>) {
        if self.rtx_timer != Some(id) {
            return;
        }
        self.rtx_timer = None;
        klog_debug!(
            "tcp: {} RTO fired (attempt {}, rto {:?}, flight {})",
            self.quad,
            self.rtx_attempt,
            self.rttm.rto(),
            self.tcb.flight_size()
        );

        if self.rtx_attempt >= self.max_retransmits {
            klog_debug!("tcp: {} retransmit limit reached", self.quad);
            io.stats.timeouts += 1;
            self.signal_error(NetError::TimedOut);
            self.enter_closed(io);
            return;
        }

        if self.tcb.snd_una == self.tcb.iss && self.rtx_attempt == 0 {
            self.rttm.set_rto(RTO_SYN);
        } else {
            self.rttm.backoff();
        }
        self.retransmit(io);

        if self.rtx_attempt == 0 {
            self.reduce_ssthresh();
        }
        self.rtx_attempt += 1;

        self.tcb.recover = self.tcb.snd_nxt;
        if self.fast_recovery {
            self.finish_fast_recovery();
        }
        self.dup_acks = 0;
        self.tcb.cwnd = self.smss as u32;
    }

    /// Keep the persist timer running exactly while unsent data is held back
    /// by a window that admits no segment and nothing is in flight.
    fn persist_check(&mut self, io: &mut TcpIo<'_>) {
        let blocked = self.writeq.bytes_remaining() > 0
            && self.tcb.flight_size() == 0
            && !self.can_send();
        if !blocked {
            self.persist_stop(io);
            self.persist_shift = 0;
            return;
        }
        if self.persist_timer.is_none() {
            let delay = (self.rttm.rto() * (1 << self.persist_shift)).min(RTO_MAX);
            let id = io.timers.oneshot(delay, NetTimer::TcpPersist(self.quad));
            self.persist_timer = Some(id);
        }
    }

    fn persist_stop(&mut self, io: &mut TcpIo<'_>) {
        if let Some(id) = self.persist_timer.take() {
            io.timers.stop(id);
        }
    }

    /// The persist timer `id` fired.
    pub(crate) fn persist_timeout(&mut self, id: TimerId, io: &mut TcpIo<'_>) {
        if self.persist_timer != Some(id) {
            return;
        }
        self.persist_timer = None;
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        klog_trace!(
            "tcp: {} persisting, snd_wnd={}",
            self.quad,
            self.tcb.snd_wnd
        );
        self.send_persist_ack(io);
        self.persist_shift = (self.persist_shift + 1).min(PERSIST_MAX_SHIFT);
        self.persist_check(io);
    }

    /// The TIME_WAIT timer `id` fired.
    pub(crate) fn timewait_timeout(&mut self, id: TimerId) {
        if self.timewait_timer != Some(id) {
            return;
        }
        self.timewait_timer = None;
        self.set_state(TcpState::Closed);
    }

    fn enter_time_wait(&mut self, io: &mut TcpIo<'_>) {
        if self.state != TcpState::TimeWait {
            self.set_state(TcpState::TimeWait);
        }
        self.rtx_stop(io);
        self.persist_stop(io);
        if let Some(id) = self.timewait_timer.take() {
            io.timers.stop(id);
        }
        let id = io
            .timers
            .oneshot(self.msl * 2, NetTimer::TcpTimeWait(self.quad));
        self.timewait_timer = Some(id);
    }

    fn enter_closed(&mut self, io: &mut TcpIo<'_>) {
        self.rtx_stop(io);
        self.persist_stop(io);
        if let Some(id) = self.timewait_timer.take() {
            io.timers.stop(id);
        }
        self.set_state(TcpState::Closed);
    }

    /// The interface went away underneath the connection.
    pub(crate) fn interface_down(&mut self, io: &mut TcpIo<'_>) {
        if self.state == TcpState::Closed {
            return;
        }
        self.signal_error(NetError::InterfaceDown);
        self.enter_closed(io);
    }

    /// Release everything the connection holds. Called once, by the host,
    /// after the connection reached CLOSED.
    pub(crate) fn reclaim(&mut self, io: &mut TcpIo<'_>) {
        self.rtx_stop(io);
        self.persist_stop(io);
        if let Some(id) = self.timewait_timer.take() {
            io.timers.stop(id);
        }
        self.writeq.reset();
        self.on_read = None;
        if let Some(cb) = self.on_close.take() {
            cb();
        }
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    fn set_state(&mut self, next: TcpState) {
        if self.state != next {
            klog_debug!("tcp: {} -> {} {}", self.state, next, self.quad);
            self.state = next;
        }
    }

    /// Hand buffered bytes to the read callback. A window that grew by at
    /// least `min(MSS, window / 2)` since it was last advertised is
    /// announced right away (RFC 1122 4.2.3.3).
    fn deliver(&mut self) {
        let Some(mut cb) = self.on_read.take() else {
            self.tcb.rcv_wnd = self.window.saturating_sub(self.read_buf.len() as u32);
            return;
        };
        while !self.read_buf.is_empty() {
            let n = self.read_chunk.min(self.read_buf.len());
            let chunk: Vec<u8> = self.read_buf.drain(..n).collect();
            cb(self, &chunk);
        }
        if self.on_read.is_none() {
            self.on_read = Some(cb);
        }
        self.tcb.rcv_wnd = self.window.saturating_sub(self.read_buf.len() as u32);
        let threshold = (self.mss as u32).min(self.window / 2).max(1);
        if self.state.is_open() && self.tcb.rcv_wnd >= self.adv_wnd.saturating_add(threshold) {
            self.ack_pending = true;
        }
    }

    fn disconnected(&mut self) {
        match self.on_disconnect.take() {
            Some(mut cb) => {
                cb(self);
                if self.on_disconnect.is_none() {
                    self.on_disconnect = Some(cb);
                }
            }
            None => self.close(),
        }
    }

    fn signal_error(&mut self, err: NetError) {
        if let Some(cb) = self.on_connect.take() {
            cb(Err(err));
            return;
        }
        if let Some(mut cb) = self.on_error.take() {
            cb(self, err);
            if self.on_error.is_none() {
                self.on_error = Some(cb);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("quad", &self.quad)
            .field("state", &self.state)
            .field("snd_una", &self.tcb.snd_una)
            .field("snd_nxt", &self.tcb.snd_nxt)
            .field("rcv_nxt", &self.tcb.rcv_nxt)
            .field("cwnd", &self.tcb.cwnd)
            .field("ssthresh", &self.tcb.ssthresh)
            .finish()
    }
}
