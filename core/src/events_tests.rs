//! Tests for the event loop, `Os::block` and the per-CPU task queues.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use unikos_lib::testing::TestResult;
use unikos_lib::{assert_eq_test, assert_test, pass};

use crate::events::{EventBits, EventError, Events, FIRST_SOFT_EVENT, NUM_EVENTS};
use crate::os::Os;
use crate::smp;

fn private_events() -> Events {
    Events::new(Box::leak(Box::new(EventBits::new())))
}

// =============================================================================
// Events
// =============================================================================

pub fn test_events_scan_low_to_high() -> TestResult {
    let events = private_events();
    let order = Rc::new(RefCell::new(Vec::new()));
    for ev in [40u8, 33, 100] {
        let sink = order.clone();
        assert_test!(events.subscribe_to(ev, Box::new(move || sink.borrow_mut().push(ev))).is_ok());
    }
    events.trigger_event(100);
    events.trigger_event(40);
    events.trigger_event(33);

    assert_eq_test!(events.process_events(), 3);
    assert_eq_test!(order.borrow().clone(), vec![33, 40, 100], "low bits first");
    assert_eq_test!(events.process_events(), 0, "nothing left pending");
    pass!()
}

pub fn test_subscribe_allocates_soft_events() -> TestResult {
    let events = private_events();
    let first = events.subscribe(Box::new(|| {}));
    let second = events.subscribe(Box::new(|| {}));
    assert_eq_test!(first, Ok(FIRST_SOFT_EVENT));
    assert_eq_test!(second, Ok(FIRST_SOFT_EVENT + 1));
    assert_eq_test!(
        events.subscribe_to(FIRST_SOFT_EVENT, Box::new(|| {})),
        Err(EventError::AlreadySubscribed)
    );
    assert_eq_test!(
        events.subscribe_to(NUM_EVENTS as u8, Box::new(|| {})),
        Err(EventError::OutOfRange)
    );
    pass!()
}

pub fn test_retrigger_from_handler_runs_again() -> TestResult {
    let events = Rc::new(private_events());
    let runs = Rc::new(Cell::new(0));
    let bits = events.bits();
    let counter = runs.clone();
    let ev = match events.subscribe(Box::new(move || {
        counter.set(counter.get() + 1);
        if counter.get() < 3 {
            bits.set(FIRST_SOFT_EVENT);
        }
    })) {
        Ok(ev) => ev,
        Err(_) => return unikos_lib::fail!("subscribe failed"),
    };
    events.trigger_event(ev);
    assert_eq_test!(events.process_events(), 3);
    assert_eq_test!(runs.get(), 3);
    pass!()
}

pub fn test_unsubscribed_event_is_dropped() -> TestResult {
    let events = private_events();
    events.trigger_event(50);
    assert_eq_test!(events.process_events(), 0);
    assert_test!(!events.bits().any(), "bit cleared even without a handler");
    pass!()
}

// =============================================================================
// Os::block
// =============================================================================

pub fn test_block_tracks_depth_and_returns() -> TestResult {
    let events = private_events();
    let bits = events.bits();
    let ready = Rc::new(Cell::new(false));
    let flag = ready.clone();
    let ev = match events.subscribe(Box::new(move || flag.set(true))) {
        Ok(ev) => ev,
        Err(_) => return unikos_lib::fail!("subscribe failed"),
    };
    // "Hardware" raises the event when the CPU halts.
    let os = Os::new(3, events, Box::new(move || bits.set(ev)));

    let seen_depth = Cell::new(0);
    os.block(|| {
        seen_depth.set(os.blocking_depth());
        ready.get()
    });
    assert_eq_test!(seen_depth.get(), 1, "depth visible while blocked");
    assert_eq_test!(os.blocking_depth(), 0, "depth restored");
    assert_eq_test!(os.highest_blocking_depth(), 1);
    pass!()
}

// =============================================================================
// SMP task queues
// =============================================================================

pub fn test_tasks_run_on_target_cpu_loop() -> TestResult {
    const CPU: usize = 9;
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let hits = hits.clone();
        assert_test!(smp::add_task(CPU, Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }))
        .is_ok());
    }
    assert_eq_test!(smp::pending_tasks(CPU), 4);
    assert_eq_test!(smp::process_tasks(CPU), 4);
    assert_eq_test!(hits.load(Ordering::SeqCst), 4);
    assert_eq_test!(smp::pending_tasks(CPU), 0);
    pass!()
}

pub fn test_invalid_cpu_rejected() -> TestResult {
    assert_test!(smp::add_task(unikos_lib::MAX_CPUS, Box::new(|| {})).is_err());
    assert_test!(smp::signal(unikos_lib::MAX_CPUS).is_err());
    pass!()
}

unikos_lib::define_test_suite!(
    events,
    [
        test_events_scan_low_to_high,
        test_subscribe_allocates_soft_events,
        test_retrigger_from_handler_runs_again,
        test_unsubscribed_event_is_dropped,
        test_block_tracks_depth_and_returns,
        test_tasks_run_on_target_cpu_loop,
        test_invalid_cpu_rejected,
    ]
);
