//! Per-CPU event loop and the blocking primitive.

extern crate alloc;

use alloc::boxed::Box;
use core::cell::Cell;

use unikos_lib::klog_debug;

use crate::events::Events;
use crate::smp;

/// Puts the CPU to sleep until the next interrupt.
pub type HaltFn = Box<dyn Fn()>;

/// The event loop of one CPU.
pub struct Os {
    cpu: usize,
    events: Events,
    halt: HaltFn,
    blocking_depth: Cell<u32>,
    highest_blocking_depth: Cell<u32>,
}

impl Os {
    pub fn new(cpu: usize, events: Events, halt: HaltFn) -> Self {
        Self {
            cpu,
            events,
            halt,
            blocking_depth: Cell::new(0),
            highest_blocking_depth: Cell::new(0),
        }
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[inline]
    pub fn events(&self) -> &Events {
        &self.events
    }

    /// One turn of the loop: drain cross-CPU tasks and pending events.
    /// Returns the amount of work done.
    pub fn poll(&self) -> usize {
        smp::process_tasks(self.cpu) + self.events.process_events()
    }

    /// Run the loop until `running` returns false, halting whenever idle.
    pub fn event_loop(&self, mut running: impl FnMut() -> bool) {
        while running() {
            if self.poll() == 0 {
                (self.halt)();
            }
        }
    }

    /// Re-enter the event loop until `done` holds.
    ///
    /// This is the only blocking primitive: callers nest, so the current
    /// nesting is tracked and exposed through [`blocking_depth`](Self::blocking_depth).
    pub fn block(&self, mut done: impl FnMut() -> bool) {
        let depth = self.blocking_depth.get() + 1;
        self.blocking_depth.set(depth);
        if depth > self.highest_blocking_depth.get() {
            self.highest_blocking_depth.set(depth);
            klog_debug!("os: cpu{} new highest blocking depth {}", self.cpu, depth);
        }

        while !done() {
            if self.poll() == 0 && !done() {
                (self.halt)();
            }
        }

        self.blocking_depth.set(depth - 1);
    }

    /// Current nesting of [`block`](Self::block) calls.
    #[inline]
    pub fn blocking_depth(&self) -> u32 {
        self.blocking_depth.get()
    }

    /// Deepest nesting seen since boot.
    #[inline]
    pub fn highest_blocking_depth(&self) -> u32 {
        self.highest_blocking_depth.get()
    }
}
