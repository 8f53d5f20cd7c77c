#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod events;
pub mod os;
pub mod smp;
pub mod timers;

#[cfg(test)]
mod events_tests;
#[cfg(test)]
mod timers_tests;

pub use events::{EventBits, EventError, Events, cpu_event_bits};
pub use os::Os;
pub use timers::{FiredTimer, TimerCallback, TimerId, Timers};
