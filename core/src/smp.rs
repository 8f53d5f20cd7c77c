//! Cross-CPU work hand-off.
//!
//! Network stacks are sharded per CPU and never shared, so the only
//! cross-CPU interaction is "run this closure on that CPU": the task goes
//! into the target's lock-protected queue and the target is signalled with
//! an inter-processor interrupt, which lands in its event loop.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicPtr, Ordering};

use unikos_lib::{IrqMutex, MAX_CPUS, klog_trace};

use crate::events::cpu_event_bits;

/// Work item executed on the target CPU's event loop.
pub type Task = Box<dyn FnOnce() + Send>;

/// Sends the wake-up IPI to a CPU.
pub type SignalFn = fn(usize);

/// Event number the IPI handler raises on the target CPU.
pub const SMP_TASK_EVENT: u8 = 31;

static TASK_QUEUES: [IrqMutex<VecDeque<Task>>; MAX_CPUS] =
    [const { IrqMutex::new(VecDeque::new()) }; MAX_CPUS];

static SIGNAL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidCpu(pub usize);

/// Install the platform's IPI sender.
pub fn register_signal(signal: SignalFn) {
    SIGNAL.store(signal as *mut (), Ordering::Release);
}

/// Queue `task` for `cpu` without waking it.
pub fn add_task(cpu: usize, task: Task) -> Result<(), InvalidCpu> {
    let queue = TASK_QUEUES.get(cpu).ok_or(InvalidCpu(cpu))?;
    queue.lock().push_back(task);
    Ok(())
}

/// Wake `cpu`: raise its task event and send the IPI if one is registered.
pub fn signal(cpu: usize) -> Result<(), InvalidCpu> {
    if cpu >= MAX_CPUS {
        return Err(InvalidCpu(cpu));
    }
    cpu_event_bits(cpu).set(SMP_TASK_EVENT);
    let ptr = SIGNAL.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only `register_signal` stores into SIGNAL, always a valid `SignalFn`.
        let send: SignalFn = unsafe { core::mem::transmute(ptr) };
        send(cpu);
    }
    Ok(())
}

pub fn add_task_and_signal(cpu: usize, task: Task) -> Result<(), InvalidCpu> {
    add_task(cpu, task)?;
    signal(cpu)
}

/// Number of tasks waiting for `cpu`.
pub fn pending_tasks(cpu: usize) -> usize {
    TASK_QUEUES.get(cpu).map(|q| q.lock().len()).unwrap_or(0)
}

/// Run every task queued for `cpu`. The lock is only held while popping,
/// so a task may queue more work (it runs in the same pass).
pub fn process_tasks(cpu: usize) -> usize {
    let Some(queue) = TASK_QUEUES.get(cpu) else {
        return 0;
    };
    let mut ran = 0;
    loop {
        let task = queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                ran += 1;
            }
            None => break,
        }
    }
    if ran > 0 {
        klog_trace!("smp: cpu{} ran {} tasks", cpu, ran);
    }
    ran
}
