//! Address translation: in-place rewriting with checksum patching, and
//! masquerading on top of conntrack.

use std::rc::Rc;

use proptest::prelude::*;
use unikos_lib::testing::TestResult;
use unikos_lib::{ManualClock, assert_eq_test, assert_test, pass};

use crate::checksum::{checksum, transport_checksum};
use crate::conntrack::{Conntrack, flow_of};
use crate::ip4::{IP4_DF, IP4_HEADER_LEN, Ip4Header, parse_header, write_header};
use crate::nat::{NAPT_PORT_START, Napt, NatTarget, PortMap, dnat, snat};
use crate::timer::NetTimers;
use crate::types::{IpAddr, Ipv4Addr, NetError, Protocol, Socket};

const INTERNAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const EXTERNAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const REMOTE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

/// IPv4 packet around a transport header with a valid checksum.
fn packet(proto: Protocol, src: Socket, dst: Socket, payload: &[u8]) -> Vec<u8> {
    let (hlen, csum_at) = match proto {
        Protocol::Tcp => (20, 16),
        _ => (8, 6),
    };
    let mut l4 = vec![0u8; hlen];
    l4[0..2].copy_from_slice(&src.port.to_be_bytes());
    l4[2..4].copy_from_slice(&dst.port.to_be_bytes());
    match proto {
        Protocol::Tcp => {
            l4[12] = 5 << 4;
            l4[13] = 0x02;
        }
        _ => {
            let len = (hlen + payload.len()) as u16;
            l4[4..6].copy_from_slice(&len.to_be_bytes());
        }
    }
    l4.extend_from_slice(payload);
    let csum = transport_checksum(src.addr, dst.addr, proto.as_u8(), &l4);
    l4[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes());

    let (IpAddr::V4(s), IpAddr::V4(d)) = (src.addr, dst.addr) else {
        return Vec::new();
    };
    let mut out = vec![0u8; IP4_HEADER_LEN];
    let hdr = Ip4Header {
        ihl: IP4_HEADER_LEN,
        tos: 0,
        total_len: (IP4_HEADER_LEN + l4.len()) as u16,
        id: 9,
        flags_frag: IP4_DF,
        ttl: 64,
        protocol: proto.as_u8(),
        checksum: 0,
        src: s,
        dst: d,
    };
    write_header(&hdr, &mut out);
    out.extend_from_slice(&l4);
    out
}

/// Both checksums verify against the addresses now in the header.
fn checksums_valid(ip: &[u8]) -> bool {
    let Ok(hdr) = parse_header(ip) else {
        return false;
    };
    let l4 = &ip[IP4_HEADER_LEN..];
    checksum(&ip[..IP4_HEADER_LEN]) == 0
        && transport_checksum(IpAddr::V4(hdr.src), IpAddr::V4(hdr.dst), hdr.protocol, l4) == 0
}

fn endpoints(ip: &[u8]) -> Option<(Socket, Socket)> {
    flow_of(ip).map(|f| (f.quad.src, f.quad.dst))
}

// =============================================================================
// Stateless rewriting
// =============================================================================

pub fn test_snat_udp_patches_checksums() -> TestResult {
    let src = Socket::v4(INTERNAL, 5353);
    let dst = Socket::v4(REMOTE, 53);
    let mut ip = packet(Protocol::Udp, src, dst, b"query");
    assert_test!(checksums_valid(&ip));
    let to = Socket::v4(EXTERNAL, 61000);
    assert_test!(snat(&mut ip, NatTarget::Socket(to)));
    assert_eq_test!(endpoints(&ip), Some((to, dst)));
    assert_test!(checksums_valid(&ip));
    pass!()
}

pub fn test_dnat_tcp_port_only() -> TestResult {
    let src = Socket::v4(REMOTE, 40000);
    let dst = Socket::v4(EXTERNAL, 80);
    let mut ip = packet(Protocol::Tcp, src, dst, b"GET /");
    assert_test!(dnat(&mut ip, NatTarget::Port(8080)));
    assert_eq_test!(endpoints(&ip), Some((src, Socket::v4(EXTERNAL, 8080))));
    assert_test!(checksums_valid(&ip));
    assert_test!(dnat(&mut ip, NatTarget::Addr(INTERNAL)));
    assert_eq_test!(endpoints(&ip), Some((src, Socket::v4(INTERNAL, 8080))));
    assert_test!(checksums_valid(&ip));
    pass!()
}

pub fn test_zero_udp_checksum_left_alone() -> TestResult {
    let mut ip = packet(Protocol::Udp, Socket::v4(INTERNAL, 1), Socket::v4(REMOTE, 2), b"x");
    ip[IP4_HEADER_LEN + 6] = 0;
    ip[IP4_HEADER_LEN + 7] = 0;
    assert_test!(snat(&mut ip, NatTarget::Addr(EXTERNAL)));
    assert_eq_test!(&ip[IP4_HEADER_LEN + 6..IP4_HEADER_LEN + 8], &[0, 0]);
    assert_eq_test!(checksum(&ip[..IP4_HEADER_LEN]), 0);
    pass!()
}

pub fn test_icmp_takes_address_only() -> TestResult {
    let mut ip = vec![0u8; IP4_HEADER_LEN];
    let hdr = Ip4Header {
        ihl: IP4_HEADER_LEN,
        tos: 0,
        total_len: (IP4_HEADER_LEN + 8) as u16,
        id: 1,
        flags_frag: 0,
        ttl: 64,
        protocol: Protocol::Icmp.as_u8(),
        checksum: 0,
        src: INTERNAL,
        dst: REMOTE,
    };
    write_header(&hdr, &mut ip);
    let mut echo = [8u8, 0, 0, 0, 0, 7, 0, 1];
    let c = checksum(&echo);
    echo[2..4].copy_from_slice(&c.to_be_bytes());
    ip.extend_from_slice(&echo);

    assert_test!(snat(&mut ip, NatTarget::Socket(Socket::v4(EXTERNAL, 61000))));
    assert_eq_test!(parse_header(&ip).map(|h| h.src).ok(), Some(EXTERNAL));
    assert_eq_test!(&ip[IP4_HEADER_LEN..], &echo, "ICMP body untouched");
    pass!()
}

pub fn test_ipv6_target_refused() -> TestResult {
    let mut ip = packet(Protocol::Udp, Socket::v4(INTERNAL, 1), Socket::v4(REMOTE, 2), b"");
    let before = ip.clone();
    let v6 = Socket::new(IpAddr::V6(crate::types::Ipv6Addr::LOCALHOST), 1);
    assert_test!(!snat(&mut ip, NatTarget::Socket(v6)));
    assert_eq_test!(ip, before);
    pass!()
}

// =============================================================================
// Masquerading
// =============================================================================

struct Rig {
    timers: NetTimers,
    ct: Conntrack,
    napt: Napt,
}

impl Rig {
    fn new() -> Self {
        Self {
            timers: NetTimers::new(Rc::new(ManualClock::new())),
            ct: Conntrack::default(),
            napt: Napt::new(),
        }
    }

    /// Outbound path: track, translate, confirm.
    fn outbound(&mut self, ip: &mut [u8]) -> Option<u32> {
        let flow = flow_of(ip)?;
        let id = self.ct.track(&flow, &mut self.timers)?;
        self.napt.masquerade(ip, &mut self.ct, id, EXTERNAL).ok()?;
        self.ct.confirm(&flow.quad, flow.proto, self.timers.now());
        Some(id)
    }

    /// Inbound path: find the entry by the reply quadruple and restore.
    fn inbound(&mut self, ip: &mut [u8]) -> Option<u32> {
        let flow = flow_of(ip)?;
        let id = self.ct.track(&flow, &mut self.timers)?;
        self.napt.demasquerade(ip, &self.ct, id).then_some(id)
    }

    fn udp_ports(&self) -> Option<(usize, bool)> {
        self.napt
            .table(Protocol::Udp)
            .map(|t| (t.borrow().len(), t.borrow().is_consistent()))
    }
}

pub fn test_masquerade_round_trip() -> TestResult {
    let mut rig = Rig::new();
    let internal = Socket::v4(INTERNAL, 5353);
    let remote = Socket::v4(REMOTE, 53);
    let mut out = packet(Protocol::Udp, internal, remote, b"query");
    let id = match rig.outbound(&mut out) {
        Some(id) => id,
        None => return TestResult::Fail,
    };
    let public = Socket::v4(EXTERNAL, NAPT_PORT_START);
    assert_eq_test!(endpoints(&out), Some((public, remote)));
    assert_test!(checksums_valid(&out));
    assert_eq_test!(rig.udp_ports(), Some((1, true)));

    let mut reply = packet(Protocol::Udp, remote, public, b"answer");
    assert_eq_test!(rig.inbound(&mut reply), Some(id));
    assert_eq_test!(endpoints(&reply), Some((remote, internal)));
    assert_test!(checksums_valid(&reply));

    // Later packets of the flow reuse the translation.
    let mut again = packet(Protocol::Udp, internal, remote, b"query 2");
    assert_eq_test!(rig.outbound(&mut again), Some(id));
    assert_eq_test!(endpoints(&again), Some((public, remote)));
    assert_eq_test!(rig.udp_ports(), Some((1, true)));
    pass!()
}

pub fn test_masquerade_port_released_with_entry() -> TestResult {
    let mut rig = Rig::new();
    let remote = Socket::v4(REMOTE, 53);
    let mut ids = Vec::new();
    for port in [1000, 1001, 1002] {
        let mut ip = packet(Protocol::Udp, Socket::v4(INTERNAL, port), remote, b"x");
        match rig.outbound(&mut ip) {
            Some(id) => ids.push(id),
            None => return TestResult::Fail,
        }
    }
    assert_eq_test!(rig.udp_ports(), Some((3, true)));
    assert_test!(rig.ct.remove(ids[1]));
    assert_eq_test!(rig.udp_ports(), Some((2, true)));
    let freed = rig
        .napt
        .table(Protocol::Udp)
        .map(|t| t.borrow().ports().is_bound(NAPT_PORT_START + 1));
    assert_eq_test!(freed, Some(false));
    rig.ct.clear(&mut rig.timers);
    assert_eq_test!(rig.udp_ports(), Some((0, true)));
    pass!()
}

pub fn test_unrelated_reply_not_demasqueraded() -> TestResult {
    let mut rig = Rig::new();
    let internal = Socket::v4(INTERNAL, 5353);
    let remote = Socket::v4(REMOTE, 53);
    let mut out = packet(Protocol::Udp, internal, remote, b"q");
    let id = match rig.outbound(&mut out) {
        Some(id) => id,
        None => return TestResult::Fail,
    };
    // The original first-direction packet is not a reply.
    let mut stray = packet(Protocol::Udp, internal, remote, b"q");
    assert_test!(!rig.napt.demasquerade(&mut stray, &rig.ct, id));
    assert_eq_test!(endpoints(&stray), Some((internal, remote)));
    pass!()
}

pub fn test_failed_masquerade_holds_no_port() -> TestResult {
    let mut rig = Rig::new();
    let internal = Socket::v4(INTERNAL, 5353);
    let remote = Socket::v4(REMOTE, 53);
    let mut ip = packet(Protocol::Udp, internal, remote, b"q");
    let flow = match flow_of(&ip) {
        Some(f) => f,
        None => return TestResult::Fail,
    };
    let id = match rig.ct.track(&flow, &mut rig.timers) {
        Some(id) => id,
        None => return TestResult::Fail,
    };

    let mut other = packet(Protocol::Udp, Socket::v4(INTERNAL, 6000), remote, b"q");
    assert_eq_test!(
        rig.napt.masquerade(&mut other, &mut rig.ct, id, EXTERNAL),
        Err(NetError::InvalidArgument),
        "packet of another flow"
    );
    assert_test!(rig.ct.remove(id));
    assert_eq_test!(
        rig.napt.masquerade(&mut ip, &mut rig.ct, id, EXTERNAL),
        Err(NetError::InvalidState),
        "entry already gone"
    );
    assert_eq_test!(endpoints(&ip), Some((internal, remote)), "left untouched");
    assert_eq_test!(rig.udp_ports(), Some((0, true)));
    pass!()
}

// =============================================================================
// Port tables
// =============================================================================

pub fn test_port_map_basics() -> TestResult {
    let mut map = PortMap::new();
    let a = Socket::v4(INTERNAL, 1);
    assert_eq_test!(map.add_entry(a), Ok(NAPT_PORT_START));
    assert_test!(map.add_entry_port(NAPT_PORT_START, a).is_err());
    assert_test!(map.add_entry_port(2000, a).is_ok());
    assert_eq_test!(map.lookup(2000), Some(a));
    assert_eq_test!(map.remove_entry(2000), Some(a));
    assert_eq_test!(map.remove_entry(2000), None);
    assert_test!(map.is_consistent());
    pass!()
}

unikos_lib::define_test_suite!(
    nat,
    [
        test_snat_udp_patches_checksums,
        test_dnat_tcp_port_only,
        test_zero_udp_checksum_left_alone,
        test_icmp_takes_address_only,
        test_ipv6_target_refused,
        test_masquerade_round_trip,
        test_masquerade_port_released_with_entry,
        test_unrelated_reply_not_demasqueraded,
        test_failed_masquerade_holds_no_port,
        test_port_map_basics,
    ]
);

#[derive(Clone, Debug)]
enum Op {
    Add(u16),
    AddPort(u16),
    Remove(u16),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u16>().prop_map(Op::Add),
        (1024u16..2048).prop_map(Op::AddPort),
        (0u16..64).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn port_map_stays_consistent(ops in proptest::collection::vec(op(), 0..200)) {
        let mut map = PortMap::new();
        let mut live: Vec<u16> = Vec::new();
        for op in ops {
            match op {
                Op::Add(p) => {
                    if let Ok(port) = map.add_entry(Socket::v4(INTERNAL, p)) {
                        prop_assert!(!live.contains(&port));
                        live.push(port);
                    }
                }
                Op::AddPort(port) => {
                    let fresh = !live.contains(&port);
                    prop_assert_eq!(map.add_entry_port(port, Socket::v4(INTERNAL, 1)).is_ok(), fresh);
                    if fresh {
                        live.push(port);
                    }
                }
                Op::Remove(i) => {
                    if !live.is_empty() {
                        let port = live.swap_remove(i as usize % live.len());
                        prop_assert!(map.remove_entry(port).is_some());
                    }
                }
            }
            prop_assert!(map.is_consistent());
            prop_assert_eq!(map.len(), live.len());
        }
    }
}
