//! Tests for the one-shot/periodic timer engine.
//!
//! Covers: oneshot dispatch, periodic re-arming without drift, stop and
//! id reuse, idempotent handler calls, and the hardware start/stop hooks.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use unikos_lib::testing::TestResult;
use unikos_lib::{ManualClock, assert_eq_test, assert_test, pass};

use crate::timers::{TimerCallback, TimerId, Timers};

// =============================================================================
// Helpers
// =============================================================================

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn fresh() -> (Rc<ManualClock>, Timers<u32>) {
    let clock = Rc::new(ManualClock::new());
    let timers = Timers::new(clock.clone());
    (clock, timers)
}

fn keys(fired: &[crate::timers::FiredTimer<u32>]) -> Vec<u32> {
    fired.iter().map(|t| t.handler).collect()
}

// =============================================================================
// Oneshot
// =============================================================================

pub fn test_oneshot_fires_once_at_deadline() -> TestResult {
    let (clock, mut timers) = fresh();
    let id = timers.oneshot(ms(10), 7);
    assert_test!(timers.is_active(id), "scheduled timer is active");

    clock.advance(ms(9));
    assert_test!(timers.timers_handler().is_empty(), "not due at 9ms");

    clock.advance(ms(1));
    let fired = timers.timers_handler();
    assert_eq_test!(keys(&fired), vec![7], "fires at 10ms");
    assert_eq_test!(fired[0].id, id, "fired id matches");
    assert_test!(!timers.is_active(id), "oneshot released after firing");

    clock.advance(ms(100));
    assert_test!(timers.timers_handler().is_empty(), "never fires twice");
    pass!()
}

pub fn test_fires_in_deadline_order() -> TestResult {
    let (clock, mut timers) = fresh();
    timers.oneshot(ms(30), 3);
    timers.oneshot(ms(10), 1);
    timers.oneshot(ms(20), 2);
    timers.oneshot(ms(20), 22);

    clock.advance(ms(50));
    let fired = timers.timers_handler();
    assert_eq_test!(keys(&fired), vec![1, 2, 22, 3], "deadline order, FIFO on ties");
    assert_eq_test!(timers.active(), 0);
    pass!()
}

pub fn test_handler_with_nothing_due_is_noop() -> TestResult {
    let (_clock, mut timers) = fresh();
    assert_test!(timers.timers_handler().is_empty());
    timers.oneshot(ms(5), 1);
    for _ in 0..3 {
        assert_test!(timers.timers_handler().is_empty(), "repeated calls fire nothing");
    }
    assert_eq_test!(timers.active(), 1, "pending timer untouched");
    pass!()
}

// =============================================================================
// Periodic
// =============================================================================

pub fn test_periodic_does_not_drift() -> TestResult {
    let (clock, mut timers) = fresh();
    let id = timers.periodic(ms(10), ms(10), 5);

    // Late by 3ms: next deadline is still 20ms, not 23ms.
    clock.set(ms(13));
    assert_eq_test!(timers.timers_handler().len(), 1);
    assert_eq_test!(timers.time_left(id), Some(ms(7)), "rearmed at deadline + period");

    clock.set(ms(20));
    assert_eq_test!(timers.timers_handler().len(), 1);
    assert_test!(timers.is_active(id), "periodic stays active");
    pass!()
}

pub fn test_periodic_catches_up_missed_periods() -> TestResult {
    let (clock, mut timers) = fresh();
    timers.periodic(ms(10), ms(10), 9);
    clock.set(ms(35));
    let fired = timers.timers_handler();
    assert_eq_test!(fired.len(), 3, "10, 20 and 30ms all due");
    pass!()
}

// =============================================================================
// Stop and id reuse
// =============================================================================

pub fn test_stop_removes_and_frees_id() -> TestResult {
    let (clock, mut timers) = fresh();
    let id = timers.oneshot(ms(10), 1);
    assert_test!(timers.stop(id), "stop active timer");
    assert_test!(!timers.stop(id), "second stop is a no-op");
    assert_eq_test!(timers.active(), 0);

    clock.advance(ms(20));
    assert_test!(timers.timers_handler().is_empty(), "stopped timer never fires");
    pass!()
}

pub fn test_stop_then_schedule_reuses_id() -> TestResult {
    let (clock, mut timers) = fresh();
    let first = timers.oneshot(ms(10), 1);
    let _other = timers.oneshot(ms(50), 2);
    timers.stop(first);
    let again = timers.oneshot(ms(5), 3);
    assert_eq_test!(again, first, "freed id handed out next");

    clock.advance(ms(10));
    let fired = timers.timers_handler();
    assert_eq_test!(keys(&fired), vec![3], "only the new incarnation fires");
    pass!()
}

pub fn test_stop_periodic() -> TestResult {
    let (clock, mut timers) = fresh();
    let id = timers.periodic(ms(1), ms(1), 4);
    clock.advance(ms(1));
    assert_eq_test!(timers.timers_handler().len(), 1);
    assert_test!(timers.stop(id));
    clock.advance(ms(10));
    assert_test!(timers.timers_handler().is_empty());
    pass!()
}

pub fn test_unknown_id_stop_is_false() -> TestResult {
    let (_clock, mut timers) = fresh();
    let id = timers.oneshot(ms(1), 1);
    timers.stop(id);
    assert_test!(!timers.is_active(id));
    assert_test!(!timers.stop(id));
    pass!()
}

// =============================================================================
// Hardware hooks
// =============================================================================

pub fn test_hardware_armed_for_earliest_deadline() -> TestResult {
    let (clock, mut timers) = fresh();
    let log: Rc<RefCell<Vec<Option<Duration>>>> = Rc::new(RefCell::new(Vec::new()));
    let start_log = log.clone();
    let stop_log = log.clone();
    timers.init(
        Box::new(move |d| start_log.borrow_mut().push(Some(d))),
        Box::new(move || stop_log.borrow_mut().push(None)),
    );
    assert_test!(timers.is_ready());

    timers.oneshot(ms(20), 1);
    timers.oneshot(ms(10), 2);
    timers.oneshot(ms(30), 3);
    assert_eq_test!(
        log.borrow().clone(),
        vec![Some(ms(20)), Some(ms(10))],
        "rearmed only when the earliest deadline moves"
    );

    clock.advance(ms(30));
    timers.timers_handler();
    assert_eq_test!(log.borrow().last().copied(), Some(None), "stopped when empty");
    pass!()
}

pub fn test_run_due_invokes_callbacks() -> TestResult {
    let clock = Rc::new(ManualClock::new());
    let mut timers: Timers<TimerCallback> = Timers::new(clock.clone());
    let seen: Rc<RefCell<Vec<TimerId>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let id = timers.oneshot(ms(1), Rc::new(move |id| sink.borrow_mut().push(id)));
    clock.advance(ms(1));
    assert_eq_test!(timers.run_due(), 1);
    assert_eq_test!(seen.borrow().clone(), vec![id]);
    pass!()
}

unikos_lib::define_test_suite!(
    timers,
    [
        test_oneshot_fires_once_at_deadline,
        test_fires_in_deadline_order,
        test_handler_with_nothing_due_is_noop,
        test_periodic_does_not_drift,
        test_periodic_catches_up_missed_periods,
        test_stop_removes_and_frees_id,
        test_stop_then_schedule_reuses_id,
        test_stop_periodic,
        test_unknown_id_stop_is_false,
        test_hardware_armed_for_earliest_deadline,
        test_run_due_invokes_callbacks,
    ]
);
