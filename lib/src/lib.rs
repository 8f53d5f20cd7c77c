#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod klog;
pub mod spinlock;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use clock::{Clock, FnClock, ManualClock};
pub use klog::{
    KlogBackend, KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level,
    klog_unregister_backend,
};
pub use spinlock::{IrqMutex, IrqMutexGuard, register_irq_control};

/// Maximum number of CPUs with their own event loop.
pub const MAX_CPUS: usize = 16;
