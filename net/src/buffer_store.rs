//! Pre-allocated network buffer store.
//!
//! A store owns a chain of equally sized pools. Every chunk is allocated up
//! front when its pool is created; after that `get_buffer` and the release
//! path only move chunks between a free list and a [`Buffer`] token, so the
//! packet hot path never touches the allocator.
//!
//! # Ownership
//!
//! A [`Buffer`] is the only handle to an outstanding chunk. It is move-only
//! and returns its chunk to the originating pool when dropped, so a chunk is
//! always either on a free list or owned by exactly one `Buffer`.
//!
//! # Exhaustion
//!
//! Running out of chunks after the last pool of the chain has been grown is a
//! configuration error: [`BufferStore::get_buffer`] panics rather than falling
//! back to dynamic allocation.

extern crate alloc;

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use unikos_lib::klog_debug;

/// Alignment and granularity of every chunk.
pub const CACHE_LINE: usize = 64;

/// Smallest and largest chunk size handed out by [`bufsize_for_mtu`].
pub const MIN_BUFSIZE: usize = 4096;
pub const MAX_BUFSIZE: usize = 65536;

/// Bytes reserved in front of the link header of every outgoing packet.
pub const PACKET_HEADROOM: usize = 128;

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct CacheLine([u8; CACHE_LINE]);

type Chunk = Box<[CacheLine]>;

static NEXT_STORE_ID: AtomicU32 = AtomicU32::new(1);

/// Chunk size for a link with the given MTU: headroom plus MTU, rounded up
/// to the next power-of-two bucket between 4 KiB and 64 KiB.
pub fn bufsize_for_mtu(mtu: usize) -> usize {
    (PACKET_HEADROOM + mtu)
        .next_power_of_two()
        .clamp(MIN_BUFSIZE, MAX_BUFSIZE)
}

struct Pool {
    free: Vec<Chunk>,
}

impl Pool {
    fn new(count: usize, lines: usize) -> Self {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(alloc::vec![CacheLine([0; CACHE_LINE]); lines].into_boxed_slice());
        }
        Self { free }
    }
}

/// Fixed-size buffer allocator shared by every packet of one stack.
pub struct BufferStore {
    id: u32,
    bufsize: usize,
    per_pool: usize,
    max_pools: usize,
    pools: RefCell<Vec<Pool>>,
}

impl BufferStore {
    /// A store with a single pool of `count` buffers.
    pub fn new(bufsize: usize, count: usize) -> Rc<Self> {
        Self::with_chain(bufsize, count, 1)
    }

    /// A store that starts with one pool of `per_pool` buffers and grows by
    /// one pool at a time, up to `max_pools`.
    pub fn with_chain(bufsize: usize, per_pool: usize, max_pools: usize) -> Rc<Self> {
        assert!(bufsize > 0 && per_pool > 0 && max_pools > 0, "empty buffer store");
        let bufsize = bufsize.div_ceil(CACHE_LINE) * CACHE_LINE;
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        let first = Pool::new(per_pool, bufsize / CACHE_LINE);
        klog_debug!(
            "bufstore {}: {} x {} bytes, up to {} pools",
            id,
            per_pool,
            bufsize,
            max_pools
        );
        Rc::new(Self {
            id,
            bufsize,
            per_pool,
            max_pools,
            pools: RefCell::new(alloc::vec![first]),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Usable bytes in each buffer.
    #[inline]
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Buffers currently on a free list.
    pub fn available(&self) -> usize {
        self.pools.borrow().iter().map(|p| p.free.len()).sum()
    }

    /// Buffers in the pools grown so far.
    pub fn capacity(&self) -> usize {
        self.pools.borrow().len() * self.per_pool
    }

    /// Buffers the store may ever hand out.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_pools * self.per_pool
    }

    /// Number of pools grown so far.
    pub fn pool_count(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Take a free buffer, growing the chain when every pool is empty.
    ///
    /// # Panics
    ///
    /// When the chain is at `max_pools` and every chunk is outstanding.
    pub fn get_buffer(self: &Rc<Self>) -> Buffer {
        let mut pools = self.pools.borrow_mut();
        let found = pools
            .iter_mut()
            .enumerate()
            .find_map(|(i, p)| p.free.pop().map(|c| (i, c)));
        let (pool, chunk) = match found {
            Some(hit) => hit,
            None => {
                assert!(
                    pools.len() < self.max_pools,
                    "bufstore {}: exhausted ({} buffers outstanding)",
                    self.id,
                    self.max_capacity()
                );
                let mut fresh = Pool::new(self.per_pool, self.bufsize / CACHE_LINE);
                let chunk = fresh.free.pop();
                pools.push(fresh);
                klog_debug!("bufstore {}: grew to {} pools", self.id, pools.len());
                match chunk {
                    Some(c) => (pools.len() - 1, c),
                    None => unreachable!("fresh pool is never empty"),
                }
            }
        };
        Buffer {
            chunk: Some(chunk),
            pool,
            store: Rc::clone(self),
        }
    }

    /// Give a buffer back explicitly.
    ///
    /// Dropping a [`Buffer`] has the same effect; this form exists to assert
    /// that the buffer belongs to this store.
    pub fn release(&self, buf: Buffer) {
        assert_eq!(
            buf.store.id, self.id,
            "buffer of store {} released into store {}",
            buf.store.id, self.id
        );
        drop(buf);
    }

    /// `true` if `buf` was handed out by this store.
    #[inline]
    pub fn owns(&self, buf: &Buffer) -> bool {
        buf.store.id == self.id
    }

    fn put_back(&self, pool: usize, chunk: Chunk) {
        let mut pools = self.pools.borrow_mut();
        pools[pool].free.push(chunk);
    }
}

impl fmt::Debug for BufferStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferStore#{} {{ bufsize={}, available={}/{}, pools={}/{} }}",
            self.id,
            self.bufsize,
            self.available(),
            self.capacity(),
            self.pool_count(),
            self.max_pools
        )
    }
}

/// Exclusive lease on one chunk of a [`BufferStore`].
pub struct Buffer {
    chunk: Option<Chunk>,
    pool: usize,
    store: Rc<BufferStore>,
}

impl Buffer {
    #[inline]
    pub fn len(&self) -> usize {
        self.store.bufsize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn store(&self) -> &Rc<BufferStore> {
        &self.store
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.chunk {
            // SAFETY: `CacheLine` is a `repr(C)` wrapper around `[u8; 64]`
            // without padding, so the boxed slice is `len * 64` initialized bytes.
            Some(c) => unsafe {
                core::slice::from_raw_parts(c.as_ptr() as *const u8, c.len() * CACHE_LINE)
            },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.chunk {
            // SAFETY: as in `as_slice`; `&mut self` guarantees exclusivity.
            Some(c) => unsafe {
                core::slice::from_raw_parts_mut(c.as_mut_ptr() as *mut u8, c.len() * CACHE_LINE)
            },
            None => &mut [],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.store.put_back(self.pool, chunk);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer(store={}, pool={}, len={})", self.store.id, self.pool, self.len())
    }
}
