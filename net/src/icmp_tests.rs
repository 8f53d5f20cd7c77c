//! ICMP echo handling for both families and the pinger.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use unikos_lib::testing::TestResult;
use unikos_lib::{ManualClock, assert_eq_test, assert_test, pass};

use crate::buffer_store::BufferStore;
use crate::checksum::checksum;
use crate::icmp4::{
    ICMP_CODE_PORT_UNREACHABLE, ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_HEADER_LEN, Icmp4,
    IcmpEvent, echo_request, parse_header,
};
use crate::icmp6::{self, ICMP6_ECHO_REPLY, ICMP6_ECHO_REQUEST, Icmp6};
use crate::ip::{Datagram, Tx};
use crate::ping::{EchoReply, Pinger};
use crate::timer::{NetTimer, NetTimers};
use crate::types::{IpAddr, Ipv4Addr, Ipv6Addr, Protocol};

struct Rig {
    clock: Rc<ManualClock>,
    timers: NetTimers,
    store: Rc<BufferStore>,
    out: VecDeque<Datagram>,
}

impl Rig {
    fn new() -> Self {
        let clock = Rc::new(ManualClock::new());
        Self {
            timers: NetTimers::new(clock.clone()),
            clock,
            store: BufferStore::new(2048, 16),
            out: VecDeque::new(),
        }
    }

    fn tx(&mut self) -> Tx<'_> {
        Tx::new(&mut self.timers, &self.store, &mut self.out)
    }
}

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

// =============================================================================
// ICMPv4
// =============================================================================

pub fn test_echo_request_is_answered() -> TestResult {
    let mut rig = Rig::new();
    let req = match echo_request(&rig.tx(), 0x1234, 9, b"abcdefgh") {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let dgram = Datagram::new(IpAddr::V4(PEER), IpAddr::V4(LOCAL), Protocol::Icmp, req);
    let mut icmp = Icmp4::new();
    let ev = icmp.receive(&dgram, LOCAL, &mut rig.tx());
    assert_eq_test!(ev, IcmpEvent::None);
    assert_eq_test!(rig.out.len(), 1);
    let reply = &rig.out[0];
    assert_eq_test!(reply.dst, IpAddr::V4(PEER));
    assert_eq_test!(reply.src, IpAddr::V4(LOCAL));
    let data = reply.packet.data();
    assert_eq_test!(checksum(data), 0);
    let hdr = parse_header(data).map(|h| (h.typ, h.id(), h.seq()));
    assert_eq_test!(hdr, Some((ICMP_ECHO_REPLY, 0x1234, 9)));
    assert_eq_test!(&data[ICMP_HEADER_LEN..], b"abcdefgh");
    assert_eq_test!(icmp.stats().echo_replies_out, 1);
    pass!()
}

pub fn test_echo_reply_becomes_event() -> TestResult {
    let mut rig = Rig::new();
    let pkt = match crate::icmp4::build(&rig.tx(), ICMP_ECHO_REPLY, 0, (7 << 16) | 3, &[0; 32]) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let dgram = Datagram::new(IpAddr::V4(PEER), IpAddr::V4(LOCAL), Protocol::Icmp, pkt);
    let ev = Icmp4::new().receive(&dgram, LOCAL, &mut rig.tx());
    assert_eq_test!(ev, IcmpEvent::EchoReply { id: 7, seq: 3, payload_len: 32 });
    assert_test!(rig.out.is_empty());
    pass!()
}

pub fn test_bad_checksum_dropped() -> TestResult {
    let mut rig = Rig::new();
    let mut req = match echo_request(&rig.tx(), 1, 1, b"x") {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    req.data_mut()[ICMP_HEADER_LEN] ^= 0xff;
    let dgram = Datagram::new(IpAddr::V4(PEER), IpAddr::V4(LOCAL), Protocol::Icmp, req);
    let mut icmp = Icmp4::new();
    assert_eq_test!(icmp.receive(&dgram, LOCAL, &mut rig.tx()), IcmpEvent::None);
    assert_test!(rig.out.is_empty());
    assert_eq_test!(icmp.stats().dropped, 1);
    pass!()
}

pub fn test_port_unreachable_quotes_header_and_8_bytes() -> TestResult {
    let mut rig = Rig::new();
    let mut original = vec![0u8; 20 + 100];
    original[0] = 0x45;
    let mut icmp = Icmp4::new();
    icmp.port_unreachable(&original, LOCAL, PEER, &mut rig.tx());
    assert_eq_test!(rig.out.len(), 1);
    let data = rig.out[0].packet.data();
    assert_eq_test!(data.len(), ICMP_HEADER_LEN + 28);
    assert_eq_test!(data[0], ICMP_DEST_UNREACHABLE);
    assert_eq_test!(data[1], ICMP_CODE_PORT_UNREACHABLE);
    pass!()
}

// =============================================================================
// ICMPv6
// =============================================================================

pub fn test_icmp6_echo_request_is_answered() -> TestResult {
    let mut rig = Rig::new();
    let local = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 1]);
    let peer = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 2]);
    let req = match icmp6::build(&rig.store, peer, local, ICMP6_ECHO_REQUEST, 0, (5 << 16) | 1, b"hi") {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let dgram = Datagram::new(IpAddr::V6(peer), IpAddr::V6(local), Protocol::Icmpv6, req);
    let hdr = match icmp6::verify(&dgram) {
        Some(h) => h,
        None => return TestResult::Fail,
    };
    let mut icmp = Icmp6::new();
    assert_eq_test!(icmp.receive(&dgram, &hdr, local, &mut rig.tx()), IcmpEvent::None);
    assert_eq_test!(rig.out.len(), 1);
    let reply = match rig.out.pop_front() {
        Some(d) => d,
        None => return TestResult::Fail,
    };
    let verified = icmp6::verify(&reply).map(|h| (h.typ, h.id(), h.seq()));
    assert_eq_test!(verified, Some((ICMP6_ECHO_REPLY, 5, 1)));
    pass!()
}

pub fn test_icmp6_checksum_covers_pseudo_header() -> TestResult {
    let store = BufferStore::new(2048, 4);
    let a = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 1]);
    let b = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 2]);
    let c = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 3]);
    let pkt = match icmp6::build(&store, a, b, ICMP6_ECHO_REQUEST, 0, 0, b"x") {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let misaddressed = Datagram::new(IpAddr::V6(a), IpAddr::V6(c), Protocol::Icmpv6, pkt);
    assert_test!(icmp6::verify(&misaddressed).is_none());
    pass!()
}

// =============================================================================
// Pinger
// =============================================================================

pub fn test_ping_reply_reports_rtt() -> TestResult {
    let mut rig = Rig::new();
    let got: Rc<RefCell<Option<Option<EchoReply>>>> = Rc::new(RefCell::new(None));
    let sink = got.clone();
    let mut pinger = Pinger::new(0xbeef);
    let seq = pinger.start(
        Box::new(move |r: Option<EchoReply>| *sink.borrow_mut() = Some(r)),
        Duration::from_secs(1),
        &mut rig.timers,
    );
    rig.clock.advance(Duration::from_millis(25));
    let from = IpAddr::V4(PEER);
    assert_test!(!pinger.reply(from, 0xdead, seq, 0, &mut rig.timers), "foreign id");
    assert_test!(pinger.reply(from, 0xbeef, seq, 32, &mut rig.timers));
    let reply = got.borrow().and_then(|r| r);
    assert_eq_test!(reply.map(|r| r.rtt), Some(Duration::from_millis(25)));
    assert_eq_test!(reply.map(|r| r.payload_len), Some(32));
    assert_eq_test!(pinger.pending(), 0);
    assert_test!(rig.timers.is_empty(), "timeout timer stopped");
    assert_test!(!pinger.reply(from, 0xbeef, seq, 32, &mut rig.timers), "duplicate reply");
    pass!()
}

pub fn test_ping_timeout_reports_none() -> TestResult {
    let mut rig = Rig::new();
    let got: Rc<RefCell<Option<Option<EchoReply>>>> = Rc::new(RefCell::new(None));
    let sink = got.clone();
    let mut pinger = Pinger::new(1);
    pinger.start(
        Box::new(move |r: Option<EchoReply>| *sink.borrow_mut() = Some(r)),
        Duration::from_millis(100),
        &mut rig.timers,
    );
    rig.clock.advance(Duration::from_millis(100));
    for fired in rig.timers.timers_handler() {
        if let NetTimer::PingTimeout { id, seq } = fired.handler {
            pinger.on_timeout(id, seq, fired.id);
        }
    }
    assert_eq_test!(*got.borrow(), Some(None));
    assert_eq_test!(pinger.pending(), 0);
    pass!()
}

pub fn test_ping_clear_fails_outstanding() -> TestResult {
    let mut rig = Rig::new();
    let failures = Rc::new(RefCell::new(0u32));
    let mut pinger = Pinger::new(1);
    for _ in 0..3 {
        let f = failures.clone();
        pinger.start(
            Box::new(move |r: Option<EchoReply>| {
                if r.is_none() {
                    *f.borrow_mut() += 1;
                }
            }),
            Duration::from_secs(5),
            &mut rig.timers,
        );
    }
    pinger.clear(&mut rig.timers);
    assert_eq_test!(*failures.borrow(), 3);
    assert_test!(rig.timers.is_empty());
    pass!()
}

unikos_lib::define_test_suite!(
    icmp,
    [
        test_echo_request_is_answered,
        test_echo_reply_becomes_event,
        test_bad_checksum_dropped,
        test_port_unreachable_quotes_header_and_8_bytes,
        test_icmp6_echo_request_is_answered,
        test_icmp6_checksum_covers_pseudo_header,
        test_ping_reply_reports_rtt,
        test_ping_timeout_reports_none,
        test_ping_clear_fails_outstanding,
    ]
);
