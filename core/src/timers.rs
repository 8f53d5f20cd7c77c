//! One-shot and periodic timers driven by an injected clock.
//!
//! The engine is data-driven: [`Timers::timers_handler`] does not call into
//! protocol code, it hands back the payloads of every timer that came due
//! ([`FiredTimer`]) and the owner dispatches them once its own borrows are
//! released.  A stale payload (for example a TCP retransmit for a connection
//! that has since been reclaimed) is therefore harmless: the owner looks the
//! key up and ignores it.
//!
//! # Invariants
//!
//! * A [`TimerId`] is scheduled at most once at any time.
//! * [`Timers::stop`] unschedules the timer and pushes its id onto a LIFO
//!   free-list, so "stop, then schedule" reuses the same id deterministically.
//! * One-shot timers free their id when they fire; periodic timers are
//!   re-armed at `deadline + period`, never at `now + period`, so they do
//!   not drift.
//!
//! Hardware is only told about the earliest deadline: after every change to
//! the schedule the engine calls the `start` hook with the delay until the
//! next deadline, or `stop` when nothing is scheduled.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use unikos_lib::{Clock, klog_trace};

/// Handle to a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u32);

impl TimerId {
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Arms the hardware timer to fire after the given delay.
pub type StartFn = Box<dyn FnMut(Duration)>;
/// Disarms the hardware timer.
pub type StopFn = Box<dyn FnMut()>;

/// A timer that came due during [`Timers::timers_handler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiredTimer<H> {
    pub id: TimerId,
    pub handler: H,
}

struct TimerSlot<H> {
    handler: Option<H>,
    deadline: Duration,
    period: Option<Duration>,
    seq: u64,
}

impl<H> TimerSlot<H> {
    const fn vacant() -> Self {
        Self {
            handler: None,
            deadline: Duration::ZERO,
            period: None,
            seq: 0,
        }
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.handler.is_some()
    }
}

pub struct Timers<H> {
    clock: Rc<dyn Clock>,
    slots: Vec<TimerSlot<H>>,
    free: Vec<TimerId>,
    /// Ordered by deadline, then by scheduling order for equal deadlines.
    schedule: BTreeSet<(Duration, u64, TimerId)>,
    next_seq: u64,
    start: Option<StartFn>,
    stop: Option<StopFn>,
    armed_for: Option<Duration>,
}

impl<H: Clone> Timers<H> {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Vec::new(),
            free: Vec::new(),
            schedule: BTreeSet::new(),
            next_seq: 0,
            start: None,
            stop: None,
            armed_for: None,
        }
    }

    /// Install the hardware hooks. Re-arms immediately if timers are pending.
    pub fn init(&mut self, start: StartFn, stop: StopFn) {
        self.start = Some(start);
        self.stop = Some(stop);
        self.armed_for = None;
        self.rearm();
    }

    /// Whether hardware hooks have been installed.
    pub fn is_ready(&self) -> bool {
        self.start.is_some()
    }

    #[inline]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Fire `handler` once, `delay` from now.
    pub fn oneshot(&mut self, delay: Duration, handler: H) -> TimerId {
        self.insert(delay, None, handler)
    }

    /// Fire `handler` after `delay`, then every `period`.
    ///
    /// Panics on a zero period: it would fire unboundedly within one
    /// handler pass.
    pub fn periodic(&mut self, delay: Duration, period: Duration, handler: H) -> TimerId {
        assert!(!period.is_zero(), "periodic timer with zero period");
        self.insert(delay, Some(period), handler)
    }

    /// Unschedule `id` and release it. Returns `false` if it was not active.
    pub fn stop(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.slots.get_mut(id.0 as usize) else {
            return false;
        };
        if !slot.is_active() {
            return false;
        }
        self.schedule.remove(&(slot.deadline, slot.seq, id));
        slot.handler = None;
        slot.period = None;
        self.free.push(id);
        klog_trace!("timers: stop {}", id);
        self.rearm();
        true
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map(|slot| slot.is_active())
            .unwrap_or(false)
    }

    /// Number of currently scheduled timers.
    pub fn active(&self) -> usize {
        self.schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.schedule.first().map(|(deadline, _, _)| *deadline)
    }

    /// Time left until `id` fires, or `None` if it is not active.
    pub fn time_left(&self, id: TimerId) -> Option<Duration> {
        let slot = self.slots.get(id.0 as usize)?;
        if !slot.is_active() {
            return None;
        }
        Some(slot.deadline.saturating_sub(self.clock.now()))
    }

    /// Timer interrupt entry point: collect every timer whose deadline has
    /// passed.
    ///
    /// Calling it with nothing due is a no-op returning an empty list.
    pub fn timers_handler(&mut self) -> Vec<FiredTimer<H>> {
        let now = self.clock.now();
        let mut fired = Vec::new();

        while let Some(&(deadline, seq, id)) = self.schedule.first() {
            if deadline > now {
                break;
            }
            self.schedule.remove(&(deadline, seq, id));
            let slot = &mut self.slots[id.0 as usize];

            match slot.period {
                Some(period) => {
                    let Some(handler) = slot.handler.clone() else {
                        continue;
                    };
                    slot.deadline = deadline + period;
                    slot.seq = self.next_seq;
                    self.next_seq += 1;
                    self.schedule.insert((slot.deadline, slot.seq, id));
                    fired.push(FiredTimer { id, handler });
                }
                None => {
                    let Some(handler) = slot.handler.take() else {
                        continue;
                    };
                    self.free.push(id);
                    fired.push(FiredTimer { id, handler });
                }
            }
        }

        if !fired.is_empty() {
            klog_trace!("timers: {} fired at {:?}", fired.len(), now);
            self.rearm();
        }
        fired
    }

    fn insert(&mut self, delay: Duration, period: Option<Duration>, handler: H) -> TimerId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(TimerSlot::vacant());
                TimerId((self.slots.len() - 1) as u32)
            }
        };
        let deadline = self.clock.now() + delay;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(!slot.is_active(), "free-list handed out an active id");
        slot.handler = Some(handler);
        slot.deadline = deadline;
        slot.period = period;
        slot.seq = seq;
        self.schedule.insert((deadline, seq, id));

        klog_trace!("timers: schedule {} in {:?}", id, delay);
        self.rearm();
        id
    }

    fn rearm(&mut self) {
        match self.next_deadline() {
            Some(deadline) => {
                if self.armed_for == Some(deadline) {
                    return;
                }
                if let Some(start) = self.start.as_mut() {
                    start(deadline.saturating_sub(self.clock.now()));
                    self.armed_for = Some(deadline);
                }
            }
            None => {
                if self.armed_for.take().is_some() {
                    if let Some(stop) = self.stop.as_mut() {
                        stop();
                    }
                }
            }
        }
    }
}

/// Payload type for service-level timers that run a closure.
pub type TimerCallback = Rc<dyn Fn(TimerId)>;

impl Timers<TimerCallback> {
    /// Run every due callback. Returns how many ran.
    pub fn run_due(&mut self) -> usize {
        let fired = self.timers_handler();
        let count = fired.len();
        for timer in fired {
            (timer.handler)(timer.id);
        }
        count
    }
}
