//! Buffer-backed packet with layered header offsets.
//!
//! `Packet` is the single currency exchanged between the NIC and the protocol
//! layers. It owns one [`Buffer`] and tracks the active region inside it:
//!
//! ```text
//! |<-- headroom -->|<-- data (layer_begin..data_end) -->|<-- tailroom -->|
//! 0          layer_begin                           data_end        capacity
//! ```
//!
//! * TX path: [`Packet::create`] starts with `layer_begin = data_end =
//!   link_offset`. Payload is appended, then each layer prepends its header
//!   with [`push_header`](Packet::push_header).
//! * RX path: [`Packet::from_bytes`] starts at offset 0 and each layer
//!   consumes its header with [`increment_layer_begin`](Packet::increment_layer_begin).
//!
//! Packets are move-only; dropping one returns its buffer (and the buffers of
//! every chained packet) to the store.

extern crate alloc;

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::fmt;

use crate::buffer_store::{Buffer, BufferStore};
use crate::types::NetError;

pub struct Packet {
    buf: Buffer,
    layer_begin: usize,
    data_end: usize,
    l3_offset: usize,
    l4_offset: usize,
    chain: Option<Box<Packet>>,
}

impl Packet {
    /// Fresh packet reserving `link_offset` bytes in front of the payload.
    pub fn create(store: &Rc<BufferStore>, link_offset: usize) -> Self {
        let buf = store.get_buffer();
        let link_offset = link_offset.min(buf.len());
        Self {
            buf,
            layer_begin: link_offset,
            data_end: link_offset,
            l3_offset: 0,
            l4_offset: 0,
            chain: None,
        }
    }

    /// Packet holding a copy of a received frame, starting at offset 0.
    pub fn from_bytes(store: &Rc<BufferStore>, frame: &[u8]) -> Result<Self, NetError> {
        let mut pkt = Self::create(store, 0);
        pkt.append(frame)?;
        Ok(pkt)
    }

    #[inline]
    pub fn store(&self) -> &Rc<BufferStore> {
        self.buf.store()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn layer_begin(&self) -> usize {
        self.layer_begin
    }

    #[inline]
    pub fn data_end(&self) -> usize {
        self.data_end
    }

    /// Bytes in the active region.
    #[inline]
    pub fn len(&self) -> usize {
        self.data_end - self.layer_begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_end == self.layer_begin
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.layer_begin
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.capacity() - self.data_end
    }

    /// Active region `layer_begin..data_end`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf.as_slice()[self.layer_begin..self.data_end]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (b, e) = (self.layer_begin, self.data_end);
        &mut self.buf.as_mut_slice()[b..e]
    }

    /// Extend the active region backwards by `len` bytes and return them.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        if len > self.layer_begin {
            return Err(NetError::NoBufferSpace);
        }
        self.layer_begin -= len;
        let b = self.layer_begin;
        Ok(&mut self.buf.as_mut_slice()[b..b + len])
    }

    /// Move the start of the active region forward by `n` bytes, consuming
    /// the current layer's header.
    pub fn increment_layer_begin(&mut self, n: usize) -> Result<(), NetError> {
        if n > self.len() {
            return Err(NetError::InvalidArgument);
        }
        self.layer_begin += n;
        Ok(())
    }

    /// Append `src` after the active region.
    pub fn append(&mut self, src: &[u8]) -> Result<(), NetError> {
        let end = self.data_end + src.len();
        if end > self.capacity() {
            return Err(NetError::NoBufferSpace);
        }
        let start = self.data_end;
        self.buf.as_mut_slice()[start..end].copy_from_slice(src);
        self.data_end = end;
        Ok(())
    }

    /// Make the active region exactly `len` bytes long.
    ///
    /// Used to drop link-layer padding once a header reveals the real length.
    pub fn set_data_end(&mut self, len: usize) -> Result<(), NetError> {
        let end = self.layer_begin + len;
        if end > self.capacity() {
            return Err(NetError::NoBufferSpace);
        }
        self.data_end = end;
        Ok(())
    }

    /// Remember that the network header starts at the current layer.
    #[inline]
    pub fn mark_l3(&mut self) {
        self.l3_offset = self.layer_begin;
    }

    /// Remember that the transport header starts at the current layer.
    #[inline]
    pub fn mark_l4(&mut self) {
        self.l4_offset = self.layer_begin;
    }

    #[inline]
    pub fn l3_offset(&self) -> usize {
        self.l3_offset
    }

    #[inline]
    pub fn l4_offset(&self) -> usize {
        self.l4_offset
    }

    /// Bytes from the marked network header to the end of the data.
    pub fn from_l3(&self) -> &[u8] {
        if self.l3_offset > self.data_end {
            return &[];
        }
        &self.buf.as_slice()[self.l3_offset..self.data_end]
    }

    // -------------------------------------------------------------------------
    // Chaining
    // -------------------------------------------------------------------------

    /// Attach `next` at the end of this packet's chain.
    pub fn chain(&mut self, next: Packet) {
        match self.chain {
            Some(ref mut tail) => tail.chain(next),
            None => self.chain = Some(Box::new(next)),
        }
    }

    /// Detach everything after this packet.
    pub fn detach_tail(&mut self) -> Option<Packet> {
        self.chain.take().map(|b| *b)
    }

    #[inline]
    pub fn next(&self) -> Option<&Packet> {
        self.chain.as_deref()
    }

    /// Number of packets in the chain, this one included.
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.next();
        while let Some(p) = cur {
            n += 1;
            cur = p.next();
        }
        n
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {{ begin={}, end={}, len={}, l3={}, l4={}, chain={} }}",
            self.layer_begin,
            self.data_end,
            self.len(),
            self.l3_offset,
            self.l4_offset,
            self.chain_len()
        )
    }
}
