//! Port allocator for one address of one transport protocol.

extern crate alloc;

use alloc::boxed::Box;

use crate::types::NetError;

pub const EPHEMERAL_FIRST: u16 = 49152;
pub const EPHEMERAL_LAST: u16 = 65535;
const EPHEMERAL_COUNT: usize = (EPHEMERAL_LAST - EPHEMERAL_FIRST) as usize + 1;

/// Bitmap over the full 16-bit port space plus a round-robin cursor for
/// ephemeral allocation.
pub struct PortUtil {
    bound: Box<[u64; 1024]>,
    next_ephemeral: u16,
    ephemeral_bound: usize,
    total_bound: usize,
}

impl PortUtil {
    pub fn new() -> Self {
        Self::with_start(EPHEMERAL_FIRST)
    }

    /// Allocator whose first ephemeral candidate is `start` (clamped into the
    /// ephemeral range).
    pub fn with_start(start: u16) -> Self {
        Self {
            bound: Box::new([0; 1024]),
            next_ephemeral: start.max(EPHEMERAL_FIRST),
            ephemeral_bound: 0,
            total_bound: 0,
        }
    }

    #[inline]
    pub fn is_bound(&self, port: u16) -> bool {
        let p = port as usize;
        self.bound[p / 64] & (1u64 << (p % 64)) != 0
    }

    /// Mark `port` as used. Fails if it already is.
    pub fn bind(&mut self, port: u16) -> Result<(), NetError> {
        if self.is_bound(port) {
            return Err(NetError::AddressInUse);
        }
        let p = port as usize;
        self.bound[p / 64] |= 1u64 << (p % 64);
        self.total_bound += 1;
        if port >= EPHEMERAL_FIRST {
            self.ephemeral_bound += 1;
        }
        Ok(())
    }

    /// Release `port`. Returns `false` if it was not bound.
    pub fn unbind(&mut self, port: u16) -> bool {
        if !self.is_bound(port) {
            return false;
        }
        let p = port as usize;
        self.bound[p / 64] &= !(1u64 << (p % 64));
        self.total_bound -= 1;
        if port >= EPHEMERAL_FIRST {
            self.ephemeral_bound -= 1;
        }
        true
    }

    #[inline]
    pub fn has_free_ephemeral(&self) -> bool {
        self.ephemeral_bound < EPHEMERAL_COUNT
    }

    /// Next free ephemeral port, scanning from the cursor and wrapping around
    /// the range once. The port is not bound.
    pub fn get_next_ephemeral(&mut self) -> Result<u16, NetError> {
        if !self.has_free_ephemeral() {
            return Err(NetError::PortsExhausted);
        }
        let mut port = self.next_ephemeral;
        for _ in 0..EPHEMERAL_COUNT {
            let candidate = port;
            port = if port == EPHEMERAL_LAST { EPHEMERAL_FIRST } else { port + 1 };
            if !self.is_bound(candidate) {
                self.next_ephemeral = port;
                return Ok(candidate);
            }
        }
        Err(NetError::PortsExhausted)
    }

    /// Find and bind an ephemeral port in one step.
    pub fn bind_ephemeral(&mut self) -> Result<u16, NetError> {
        let port = self.get_next_ephemeral()?;
        self.bind(port)?;
        Ok(port)
    }

    /// Ports currently bound.
    #[inline]
    pub fn bound_count(&self) -> usize {
        self.total_bound
    }

    /// Ephemeral ports currently bound.
    #[inline]
    pub fn ephemeral_bound(&self) -> usize {
        self.ephemeral_bound
    }
}

impl Default for PortUtil {
    fn default() -> Self {
        Self::new()
    }
}
