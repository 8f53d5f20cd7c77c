//! UDP sockets: binding, sending, delivery and the unreachable path.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use unikos_lib::testing::TestResult;
use unikos_lib::{ManualClock, assert_eq_test, assert_test, pass};

use crate::buffer_store::BufferStore;
use crate::ip::{Datagram, Tx};
use crate::port_util::EPHEMERAL_FIRST;
use crate::timer::NetTimers;
use crate::types::{IpAddr, Ipv4Addr, Ipv6Addr, NetError, Protocol, Socket};
use crate::udp::{UDP_HEADER_LEN, Udp, UdpRx, parse_header};

const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

struct Rig {
    timers: NetTimers,
    store: Rc<BufferStore>,
    out: VecDeque<Datagram>,
}

impl Rig {
    fn new() -> Self {
        Self {
            timers: NetTimers::new(Rc::new(ManualClock::new())),
            store: BufferStore::new(2048, 16),
            out: VecDeque::new(),
        }
    }

    fn tx(&mut self) -> Tx<'_> {
        Tx::new(&mut self.timers, &self.store, &mut self.out)
    }
}

type Inbox = Rc<RefCell<Vec<(Socket, Vec<u8>)>>>;

fn listening(udp: &mut Udp, port: u16) -> Inbox {
    let inbox: Inbox = Rc::new(RefCell::new(Vec::new()));
    let sink = inbox.clone();
    if let Ok(sock) = udp.bind(Socket::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)) {
        sock.on_read(move |from, data| sink.borrow_mut().push((from, data.to_vec())));
    }
    inbox
}

pub fn test_send_and_deliver() -> TestResult {
    let mut rig = Rig::new();
    let mut client = Udp::new();
    let mut server = Udp::new();
    let inbox = listening(&mut server, 53);
    assert_test!(client.bind(Socket::new(A, 4000)).is_ok());
    assert_test!(client.sendto(4000, A, Socket::new(B, 53), b"query", &mut rig.tx()).is_ok());

    let dgram = match rig.out.pop_front() {
        Some(d) => d,
        None => return TestResult::Fail,
    };
    assert_eq_test!(dgram.protocol, Protocol::Udp);
    let hdr = parse_header(dgram.packet.data());
    assert_eq_test!(hdr.map(|h| (h.src_port, h.dst_port, h.length)), Some((4000, 53, 13)));
    assert_test!(hdr.is_some_and(|h| h.checksum != 0));

    assert_eq_test!(server.receive(&dgram), UdpRx::Delivered);
    let inbox = inbox.borrow();
    assert_eq_test!(inbox.len(), 1);
    assert_eq_test!(inbox[0].0, Socket::new(A, 4000));
    assert_eq_test!(inbox[0].1.as_slice(), b"query");
    assert_eq_test!(server.socket(53).map(|s| s.rx_datagrams()), Some(1));
    pass!()
}

pub fn test_unbound_port_is_unreachable() -> TestResult {
    let mut rig = Rig::new();
    let mut client = Udp::new();
    let mut server = Udp::new();
    assert_test!(client.bind(Socket::new(A, 4000)).is_ok());
    assert_test!(client.sendto(4000, A, Socket::new(B, 9), b"x", &mut rig.tx()).is_ok());
    let dgram = match rig.out.pop_front() {
        Some(d) => d,
        None => return TestResult::Fail,
    };
    assert_eq_test!(server.receive(&dgram), UdpRx::PortUnreachable);
    assert_eq_test!(server.stats().no_port, 1);
    pass!()
}

pub fn test_corrupt_datagram_dropped() -> TestResult {
    let mut rig = Rig::new();
    let mut client = Udp::new();
    let mut server = Udp::new();
    let inbox = listening(&mut server, 53);
    assert_test!(client.bind(Socket::new(A, 4000)).is_ok());
    assert_test!(client.sendto(4000, A, Socket::new(B, 53), b"query", &mut rig.tx()).is_ok());
    let mut dgram = match rig.out.pop_front() {
        Some(d) => d,
        None => return TestResult::Fail,
    };
    dgram.packet.data_mut()[UDP_HEADER_LEN] ^= 0x20;
    assert_eq_test!(server.receive(&dgram), UdpRx::Dropped);
    assert_eq_test!(server.stats().checksum_errors, 1);

    // A length field beyond the packet is refused before the checksum.
    dgram.packet.data_mut()[4..6].copy_from_slice(&200u16.to_be_bytes());
    assert_eq_test!(server.receive(&dgram), UdpRx::Dropped);
    assert_test!(inbox.borrow().is_empty());
    pass!()
}

pub fn test_zero_checksum_accepted_on_v4_only() -> TestResult {
    let store = BufferStore::new(2048, 4);
    let mut server = Udp::new();
    let inbox = listening(&mut server, 7);
    let mut pkt = crate::packet::Packet::create(&store, 64);
    pkt.append(&[0x10, 0x00, 0x00, 0x07, 0x00, 0x0a, 0x00, 0x00, b'o', b'k']).ok();
    let dgram = Datagram::new(B, A, Protocol::Udp, pkt);
    assert_eq_test!(server.receive(&dgram), UdpRx::Delivered);
    assert_eq_test!(inbox.borrow().len(), 1);

    let mut server6 = Udp::new();
    listening(&mut server6, 7);
    let mut pkt = crate::packet::Packet::create(&store, 64);
    pkt.append(&[0x10, 0x00, 0x00, 0x07, 0x00, 0x0a, 0x00, 0x00, b'o', b'k']).ok();
    let v6 = |last| IpAddr::V6(Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, last]));
    let dgram = Datagram::new(v6(2), v6(1), Protocol::Udp, pkt);
    assert_eq_test!(server6.receive(&dgram), UdpRx::Dropped, "IPv6 requires a checksum");
    pass!()
}

pub fn test_bind_conflicts_and_ephemeral() -> TestResult {
    let mut udp = Udp::new();
    assert_test!(udp.bind(Socket::new(A, 5000)).is_ok());
    assert_eq_test!(
        udp.bind(Socket::new(A, 5000)).err(),
        Some(NetError::AddressInUse),
        "second bind of the same port"
    );
    let port = match udp.bind(Socket::new(A, 0)) {
        Ok(s) => s.local().port,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(port >= EPHEMERAL_FIRST);
    assert_eq_test!(udp.socket_count(), 2);
    assert_test!(udp.close(port));
    assert_test!(!udp.close(port));
    assert_test!(!udp.ports().is_bound(port));
    pass!()
}

pub fn test_sendto_validates_arguments() -> TestResult {
    let mut rig = Rig::new();
    let mut udp = Udp::new();
    assert_eq_test!(
        udp.sendto(1234, A, Socket::new(B, 53), b"x", &mut rig.tx()).err(),
        Some(NetError::NotConnected)
    );
    assert_test!(udp.bind(Socket::new(A, 1234)).is_ok());
    assert_eq_test!(
        udp.sendto(1234, A, Socket::new(B, 0), b"x", &mut rig.tx()).err(),
        Some(NetError::InvalidArgument)
    );
    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    assert_eq_test!(
        udp.sendto(1234, A, Socket::new(v6, 53), b"x", &mut rig.tx()).err(),
        Some(NetError::InvalidArgument),
        "family mismatch"
    );
    assert_test!(rig.out.is_empty());
    pass!()
}

unikos_lib::define_test_suite!(
    udp,
    [
        test_send_and_deliver,
        test_unbound_port_is_unreachable,
        test_corrupt_datagram_dropped,
        test_zero_checksum_accepted_on_v4_only,
        test_bind_conflicts_and_ephemeral,
        test_sendto_validates_arguments,
    ]
);
