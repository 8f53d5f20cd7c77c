//! Deferred event processing.
//!
//! Interrupt handlers never run protocol code.  They set a bit in the
//! current CPU's [`EventBits`] and return; the CPU's event loop later calls
//! [`Events::process_events`], which scans the pending bits low to high and
//! runs each subscribed handler to completion.  A handler is expected to
//! drain everything its source has queued (e.g. every buffered RX frame of a
//! NIC) before returning, which gives FIFO ordering per source.
//!
//! Handlers may re-enter the loop (for example through
//! [`Os::block`](crate::os::Os::block)); a handler is taken out of its slot
//! while it runs so that a nested pass never invokes it recursively.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use unikos_lib::{MAX_CPUS, klog_debug, klog_trace};

/// Number of distinct event numbers per CPU.
pub const NUM_EVENTS: usize = 128;

const EVENT_WORDS: usize = NUM_EVENTS / 64;

/// Event numbers below this are reserved for hardware IRQ lines.
pub const FIRST_SOFT_EVENT: u8 = 32;

pub type EventHandler = Box<dyn FnMut()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventError {
    /// Every event number is taken.
    Exhausted,
    /// The event number is outside `0..NUM_EVENTS`.
    OutOfRange,
    /// A handler is already subscribed to this event.
    AlreadySubscribed,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "no free event numbers"),
            Self::OutOfRange => write!(f, "event number out of range"),
            Self::AlreadySubscribed => write!(f, "event already has a handler"),
        }
    }
}

// =============================================================================
// Pending bits (interrupt side)
// =============================================================================

/// Pending-event bitmap. The only part of the event system touched from
/// interrupt context.
pub struct EventBits {
    words: [AtomicU64; EVENT_WORDS],
}

impl EventBits {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; EVENT_WORDS],
        }
    }

    /// Mark `event` pending. Safe from interrupt context.
    #[inline]
    pub fn set(&self, event: u8) {
        let event = event as usize;
        if event >= NUM_EVENTS {
            return;
        }
        self.words[event / 64].fetch_or(1u64 << (event % 64), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_set(&self, event: u8) -> bool {
        let event = event as usize;
        event < NUM_EVENTS && self.words[event / 64].load(Ordering::Acquire) & (1u64 << (event % 64)) != 0
    }

    /// Whether any event is pending.
    #[inline]
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }

    #[inline]
    fn take_word(&self, word: usize) -> u64 {
        self.words[word].swap(0, Ordering::AcqRel)
    }
}

impl Default for EventBits {
    fn default() -> Self {
        Self::new()
    }
}

static CPU_EVENT_BITS: [EventBits; MAX_CPUS] = [const { EventBits::new() }; MAX_CPUS];

/// Pending bits for `cpu`. Panics if `cpu >= MAX_CPUS`.
#[inline]
pub fn cpu_event_bits(cpu: usize) -> &'static EventBits {
    &CPU_EVENT_BITS[cpu]
}

// =============================================================================
// Event loop side
// =============================================================================

pub struct Events {
    bits: &'static EventBits,
    handlers: RefCell<Vec<Option<EventHandler>>>,
    subscribed: RefCell<[u64; EVENT_WORDS]>,
}

impl Events {
    pub fn new(bits: &'static EventBits) -> Self {
        let mut handlers = Vec::with_capacity(NUM_EVENTS);
        handlers.resize_with(NUM_EVENTS, || None);
        Self {
            bits,
            handlers: RefCell::new(handlers),
            subscribed: RefCell::new([0; EVENT_WORDS]),
        }
    }

    /// Event loop for `cpu`, bound to that CPU's pending bits.
    pub fn for_cpu(cpu: usize) -> Self {
        Self::new(cpu_event_bits(cpu))
    }

    #[inline]
    pub fn bits(&self) -> &'static EventBits {
        self.bits
    }

    /// Subscribe `handler` to the lowest free software event number.
    pub fn subscribe(&self, handler: EventHandler) -> Result<u8, EventError> {
        let event = {
            let subscribed = self.subscribed.borrow();
            (FIRST_SOFT_EVENT as usize..NUM_EVENTS)
                .find(|&ev| subscribed[ev / 64] & (1u64 << (ev % 64)) == 0)
                .ok_or(EventError::Exhausted)?
        };
        self.subscribe_to(event as u8, handler)?;
        Ok(event as u8)
    }

    /// Subscribe `handler` to a fixed event number (an IRQ line).
    pub fn subscribe_to(&self, event: u8, handler: EventHandler) -> Result<(), EventError> {
        let ev = event as usize;
        if ev >= NUM_EVENTS {
            return Err(EventError::OutOfRange);
        }
        let mut subscribed = self.subscribed.borrow_mut();
        if subscribed[ev / 64] & (1u64 << (ev % 64)) != 0 {
            return Err(EventError::AlreadySubscribed);
        }
        subscribed[ev / 64] |= 1u64 << (ev % 64);
        self.handlers.borrow_mut()[ev] = Some(handler);
        klog_debug!("events: subscribed event {}", event);
        Ok(())
    }

    /// Remove the handler for `event`. A pending bit is left to be dropped.
    pub fn unsubscribe(&self, event: u8) {
        let ev = event as usize;
        if ev >= NUM_EVENTS {
            return;
        }
        self.subscribed.borrow_mut()[ev / 64] &= !(1u64 << (ev % 64));
        self.handlers.borrow_mut()[ev] = None;
    }

    /// Mark `event` pending from normal context.
    #[inline]
    pub fn trigger_event(&self, event: u8) {
        self.bits.set(event);
    }

    pub fn is_subscribed(&self, event: u8) -> bool {
        let ev = event as usize;
        ev < NUM_EVENTS && self.subscribed.borrow()[ev / 64] & (1u64 << (ev % 64)) != 0
    }

    /// Run handlers for every pending event, repeating until no bit is set.
    /// Returns how many handler invocations happened.
    pub fn process_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut snapshot = [0u64; EVENT_WORDS];
            let mut any = false;
            for (word, slot) in snapshot.iter_mut().enumerate() {
                *slot = self.bits.take_word(word);
                any |= *slot != 0;
            }
            if !any {
                return handled;
            }

            for (word, mut bits) in snapshot.into_iter().enumerate() {
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    let event = word * 64 + bit;
                    if self.run_handler(event) {
                        handled += 1;
                    } else {
                        klog_trace!("events: event {} pending without handler", event);
                    }
                }
            }
        }
    }

    fn run_handler(&self, event: usize) -> bool {
        let taken = self.handlers.borrow_mut()[event].take();
        let Some(mut handler) = taken else {
            return false;
        };
        handler();
        // Put it back unless it was unsubscribed or replaced while running.
        if self.is_subscribed(event as u8) {
            let mut handlers = self.handlers.borrow_mut();
            if handlers[event].is_none() {
                handlers[event] = Some(handler);
            }
        }
        true
    }
}
