//! TCP send buffering: span cursors and queue-level accounting.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use unikos_lib::testing::TestResult;
use unikos_lib::{assert_eq_test, assert_test, pass};

use crate::tcp::write_queue::{WriteBuffer, WriteQueue};

fn bytes(n: usize) -> Vec<u8> {
    (0..n).map(|i| i as u8).collect()
}

// =============================================================================
// WriteBuffer
// =============================================================================

pub fn test_buffer_ack_never_exceeds_length() -> TestResult {
    let mut buf = WriteBuffer::new(bytes(1000), false);
    assert_eq_test!(buf.advance(300), 300);
    assert_eq_test!(buf.remaining(), 700);
    assert_eq_test!(buf.advance(700), 700);
    assert_eq_test!(buf.remaining(), 0);
    assert_test!(!buf.done());
    assert_eq_test!(buf.acknowledge(1200), 1000);
    assert_eq_test!(buf.acknowledged(), 1000);
    assert_test!(buf.done());
    pass!()
}

pub fn test_buffer_advance_clamped() -> TestResult {
    let mut buf = WriteBuffer::new(bytes(10), true);
    assert_eq_test!(buf.advance(25), 10);
    assert_eq_test!(buf.advance(1), 0);
    assert_test!(buf.push());
    pass!()
}

// =============================================================================
// WriteQueue
// =============================================================================

pub fn test_queue_advance_crosses_spans() -> TestResult {
    let written: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let mut q = WriteQueue::new();
    for len in [100, 50] {
        let w = written.clone();
        q.push_back(
            WriteBuffer::new(bytes(len), false),
            Some(Box::new(move |n: usize| w.borrow_mut().push(n))),
        );
    }
    assert_eq_test!(q.bytes_total(), 150);
    assert_eq_test!(q.nxt_data(40).len(), 40);
    assert_eq_test!(q.advance(120), 120);
    assert_eq_test!(written.borrow().clone(), vec![100], "first span fully sent");
    assert_eq_test!(q.current(), 1);
    assert_eq_test!(q.bytes_remaining(), 30);
    let second = bytes(50);
    assert_eq_test!(q.nxt_data(1000), &second[20..]);

    // Retransmission data spans the boundary.
    let mut out = Vec::new();
    q.una_data(110, &mut out);
    assert_eq_test!(out.len(), 110);
    assert_eq_test!(&out[100..], &second[..10]);
    pass!()
}

pub fn test_queue_acknowledge_frees_spans() -> TestResult {
    let mut q = WriteQueue::new();
    q.push_back(WriteBuffer::new(bytes(100), false), None);
    q.push_back(WriteBuffer::new(bytes(100), false), None);
    q.advance(200);
    assert_eq_test!(q.acknowledge(150), 150);
    assert_eq_test!(q.size(), 1);
    assert_eq_test!(q.bytes_unacknowledged(), 50);
    assert_eq_test!(q.una().map(|b| b.acknowledged()), Some(50));
    assert_eq_test!(q.acknowledge(500), 50, "only what is queued");
    assert_test!(q.is_empty());
    assert_test!(!q.remaining_requests());
    pass!()
}

pub fn test_queue_push_flag() -> TestResult {
    let mut q = WriteQueue::new();
    q.push_back(WriteBuffer::new(bytes(10), true), None);
    assert_test!(!q.push_after(5));
    assert_test!(q.push_after(10));
    pass!()
}

pub fn test_queue_reset_reports_partial() -> TestResult {
    let written: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let mut q = WriteQueue::new();
    let w = written.clone();
    q.push_back(
        WriteBuffer::new(bytes(100), false),
        Some(Box::new(move |n: usize| w.borrow_mut().push(n))),
    );
    q.advance(40);
    q.reset();
    assert_eq_test!(written.borrow().clone(), vec![40]);
    assert_test!(q.is_empty());
    assert_eq_test!(q.current(), 0);
    pass!()
}

unikos_lib::define_test_suite!(
    write_queue,
    [
        test_buffer_ack_never_exceeds_length,
        test_buffer_advance_clamped,
        test_queue_advance_crosses_spans,
        test_queue_acknowledge_frees_spans,
        test_queue_push_flag,
        test_queue_reset_reports_partial,
    ]
);

proptest! {
    #[test]
    fn buffer_ack_bounded(len in 0usize..4096, a in 0usize..5000, b in 0usize..5000) {
        let mut buf = WriteBuffer::new(vec![0; len], false);
        let advanced = buf.advance(a);
        prop_assert_eq!(advanced, a.min(len));
        let acked = buf.acknowledge(b.min(advanced));
        prop_assert!(acked <= b.min(len));
        prop_assert_eq!(buf.done(), buf.acknowledged() == len);
    }

    #[test]
    fn queue_accounting_conserved(
        spans in proptest::collection::vec(1usize..600, 1..8),
        steps in proptest::collection::vec((0usize..700, 0usize..700), 0..16),
    ) {
        let mut q = WriteQueue::new();
        let total: usize = spans.iter().sum();
        for len in &spans {
            q.push_back(WriteBuffer::new(vec![0; *len], false), None);
        }
        let mut sent = 0;
        let mut acked = 0;
        for (adv, ack) in steps {
            sent += q.advance(adv);
            acked += q.acknowledge(ack.min(sent - acked));
            prop_assert!(acked <= sent);
            prop_assert!(sent <= total);
            prop_assert_eq!(q.bytes_unacknowledged(), total - acked);
            prop_assert_eq!(q.bytes_remaining(), total - sent);
        }
    }
}
