//! Send-side buffering of a TCP connection.
//!
//! Every application write becomes one [`WriteBuffer`] span. Sending and
//! acknowledging are tracked separately per span: [`WriteQueue::advance`]
//! moves the send cursor (data handed to IP, consuming window) while
//! [`WriteQueue::acknowledge`] consumes cumulative ACKs from the front and
//! frees spans once they are fully acknowledged. Bytes between the two
//! cursors are exactly what a retransmission has to resend.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Called once per write with the number of bytes handed to the network:
/// the full length when the span has been completely sent, or the partial
/// count if the queue is reset first.
pub type WriteCallback = Box<dyn FnOnce(usize)>;

/// One application write.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    sent: usize,
    acknowledged: usize,
    push: bool,
}

impl WriteBuffer {
    pub fn new(data: Vec<u8>, push: bool) -> Self {
        Self {
            data,
            sent: 0,
            acknowledged: 0,
            push,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet sent.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }

    #[inline]
    pub fn sent(&self) -> usize {
        self.sent
    }

    #[inline]
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }

    /// Whether the whole span is acknowledged.
    #[inline]
    pub fn done(&self) -> bool {
        self.acknowledged == self.data.len()
    }

    #[inline]
    pub fn push(&self) -> bool {
        self.push
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Move the send cursor by up to `n` bytes. Returns how far it moved.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.remaining());
        self.sent += n;
        n
    }

    /// Count up to `n` more bytes as acknowledged, never past the end of the
    /// span. Returns the amount taken; the rest belongs to the next span.
    pub fn acknowledge(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len() - self.acknowledged);
        self.acknowledged += n;
        if self.sent < self.acknowledged {
            self.sent = self.acknowledged;
        }
        n
    }
}

struct WriteRequest {
    buf: WriteBuffer,
    on_written: Option<WriteCallback>,
}

/// Ordered spans of unacknowledged and unsent data.
#[derive(Default)]
pub struct WriteQueue {
    q: VecDeque<WriteRequest>,
    /// Index of the span currently being sent.
    current: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, buf: WriteBuffer, on_written: Option<WriteCallback>) {
        self.q.push_back(WriteRequest { buf, on_written });
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Spans held, sent or not.
    #[inline]
    pub fn size(&self) -> usize {
        self.q.len()
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Whether some span still has unsent bytes.
    #[inline]
    pub fn remaining_requests(&self) -> bool {
        self.current < self.q.len()
    }

    /// The span being sent.
    pub fn nxt(&self) -> Option<&WriteBuffer> {
        self.q.get(self.current).map(|r| &r.buf)
    }

    /// The oldest unacknowledged span.
    pub fn una(&self) -> Option<&WriteBuffer> {
        self.q.front().map(|r| &r.buf)
    }

    pub fn bytes_total(&self) -> usize {
        self.q.iter().map(|r| r.buf.len()).sum()
    }

    pub fn bytes_remaining(&self) -> usize {
        self.q.iter().skip(self.current).map(|r| r.buf.remaining()).sum()
    }

    pub fn bytes_unacknowledged(&self) -> usize {
        self.q.iter().map(|r| r.buf.len() - r.buf.acknowledged()).sum()
    }

    /// Up to `max` unsent bytes of the current span, without advancing.
    pub fn nxt_data(&self, max: usize) -> &[u8] {
        match self.nxt() {
            Some(b) => {
                let end = b.len().min(b.sent + max);
                &b.data[b.sent..end]
            }
            None => &[],
        }
    }

    /// Up to `max` unacknowledged bytes starting at the send-unacknowledged
    /// point. Spans are copied across boundaries so a retransmission can fill
    /// a whole segment.
    pub fn una_data(&self, max: usize, out: &mut Vec<u8>) {
        let mut left = max;
        for r in self.q.iter() {
            if left == 0 {
                break;
            }
            let b = &r.buf;
            let end = b.sent.min(b.acknowledged + left);
            if end > b.acknowledged {
                out.extend_from_slice(&b.data[b.acknowledged..end]);
                left -= end - b.acknowledged;
            }
            if b.sent < b.len() {
                break;
            }
        }
    }

    /// Whether the current span asked for PSH and `n` more bytes finish it.
    pub fn push_after(&self, n: usize) -> bool {
        self.nxt().is_some_and(|b| b.push && n >= b.remaining())
    }

    /// Mark `n` bytes as sent, crossing spans as needed. A span's callback
    /// fires as soon as its last byte is sent.
    pub fn advance(&mut self, mut n: usize) -> usize {
        let mut moved = 0;
        while n > 0 && self.current < self.q.len() {
            let req = &mut self.q[self.current];
            let step = req.buf.advance(n);
            n -= step;
            moved += step;
            if req.buf.remaining() == 0 {
                if let Some(cb) = req.on_written.take() {
                    cb(req.buf.len());
                }
                self.current += 1;
            }
        }
        moved
    }

    /// Consume `n` acknowledged bytes from the front, freeing finished spans.
    /// Returns the bytes actually taken, which never exceeds what is queued.
    pub fn acknowledge(&mut self, mut n: usize) -> usize {
        let mut acked = 0;
        while n > 0 {
            let Some(front) = self.q.front_mut() else {
                break;
            };
            let step = front.buf.acknowledge(n);
            n -= step;
            acked += step;
            if !front.buf.done() {
                break;
            }
            if let Some(req) = self.q.pop_front() {
                if let Some(cb) = req.on_written {
                    cb(req.buf.len());
                }
            }
            self.current = self.current.saturating_sub(1);
        }
        acked
    }

    /// Drop every span. Callbacks not yet called receive the number of bytes
    /// that had been sent.
    pub fn reset(&mut self) {
        for req in self.q.drain(..) {
            if let Some(cb) = req.on_written {
                cb(req.buf.sent);
            }
        }
        self.current = 0;
    }
}
