//! Neighbor resolution: ARP, IPv6 neighbor discovery with address
//! autoconfiguration, and MLD group membership.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use unikos_lib::testing::TestResult;
use unikos_lib::{ManualClock, assert_eq_test, assert_test, pass};

use crate::arp::{ARP_OP_REPLY, ARP_OP_REQUEST, ARP_PACKET_LEN, Arp, ArpPacket};
use crate::buffer_store::{BufferStore, PACKET_HEADROOM};
use crate::ethernet::{ETH_HEADER_LEN, LinkIo, parse_header};
use crate::icmp4::parse_header as icmp_header;
use crate::icmp6::{MLD_QUERY, MLD_V2_REPORT, NDP_NEIGHBOR_ADVERTISEMENT, NDP_NEIGHBOR_SOLICITATION};
use crate::ip6::IP6_HEADER_LEN;
use crate::mld::Mld;
use crate::ndp::{AddrList, INFINITE_LIFETIME, Ndp, NdpEvent, TWO_HOURS};
use crate::neighbor::MAX_RETRIES;
use crate::packet::Packet;
use crate::timer::{NetTimer, NetTimers};
use crate::types::{EtherType, Ipv4Addr, Ipv6Addr, MacAddr};

const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
const PEER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

struct Link {
    clock: Rc<ManualClock>,
    timers: NetTimers,
    store: Rc<BufferStore>,
    frames: VecDeque<Packet>,
}

impl Link {
    fn new() -> Self {
        let clock = Rc::new(ManualClock::new());
        Self {
            timers: NetTimers::new(clock.clone()),
            clock,
            store: BufferStore::new(2048, 32),
            frames: VecDeque::new(),
        }
    }

    fn io(&mut self) -> LinkIo<'_> {
        LinkIo {
            mac: OUR_MAC,
            store: &self.store,
            timers: &mut self.timers,
            frames: &mut self.frames,
        }
    }

    fn payload(&self, len: usize) -> Packet {
        let mut pkt = Packet::create(&self.store, PACKET_HEADROOM);
        pkt.append(&vec![0x45; len]).ok();
        pkt
    }

    /// Ethernet destination and type of every queued frame, draining them.
    fn drain(&mut self) -> Vec<(MacAddr, u16, Vec<u8>)> {
        self.frames
            .drain(..)
            .filter_map(|f| {
                let hdr = parse_header(f.data())?;
                Some((hdr.dst, hdr.ethertype, f.data()[ETH_HEADER_LEN..].to_vec()))
            })
            .collect()
    }
}

fn ll(last: u16) -> Ipv6Addr {
    Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, last])
}

fn arp_bytes(p: &ArpPacket) -> [u8; ARP_PACKET_LEN] {
    let mut buf = [0u8; ARP_PACKET_LEN];
    crate::arp::write(p, &mut buf);
    buf
}

// =============================================================================
// ARP
// =============================================================================

pub fn test_arp_answers_request_for_own_address() -> TestResult {
    let mut link = Link::new();
    let mut arp = Arp::new();
    let req = arp_bytes(&ArpPacket {
        op: ARP_OP_REQUEST,
        sender_mac: PEER_MAC,
        sender_ip: PEER_IP,
        target_mac: MacAddr::ZERO,
        target_ip: OUR_IP,
    });
    arp.receive(&req, &[OUR_IP], &mut link.io());
    assert_eq_test!(arp.lookup(&PEER_IP), Some(PEER_MAC), "requester cached");
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1);
    let (dst, ethertype, body) = &frames[0];
    assert_eq_test!(*dst, PEER_MAC);
    assert_eq_test!(*ethertype, EtherType::Arp.as_u16());
    let reply = crate::arp::parse(body);
    assert_eq_test!(reply.map(|r| (r.op, r.sender_ip, r.sender_mac)), Some((ARP_OP_REPLY, OUR_IP, OUR_MAC)));
    pass!()
}

pub fn test_arp_ignores_request_for_other_host() -> TestResult {
    let mut link = Link::new();
    let mut arp = Arp::new();
    let req = arp_bytes(&ArpPacket {
        op: ARP_OP_REQUEST,
        sender_mac: PEER_MAC,
        sender_ip: PEER_IP,
        target_mac: MacAddr::ZERO,
        target_ip: Ipv4Addr::new(10, 0, 0, 99),
    });
    arp.receive(&req, &[OUR_IP], &mut link.io());
    assert_test!(link.frames.is_empty());
    assert_eq_test!(arp.lookup(&PEER_IP), None, "no new entry for third-party traffic");
    pass!()
}

pub fn test_arp_parks_then_flushes_on_reply() -> TestResult {
    let mut link = Link::new();
    let mut arp = Arp::new();
    let pkt = link.payload(20);
    arp.transmit(pkt, PEER_IP, OUR_IP, &mut link.io());
    let pkt = link.payload(20);
    arp.transmit(pkt, PEER_IP, OUR_IP, &mut link.io());
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1, "one who-has for two packets");
    assert_eq_test!(frames[0].0, MacAddr::BROADCAST);

    let reply = arp_bytes(&ArpPacket {
        op: ARP_OP_REPLY,
        sender_mac: PEER_MAC,
        sender_ip: PEER_IP,
        target_mac: OUR_MAC,
        target_ip: OUR_IP,
    });
    arp.receive(&reply, &[OUR_IP], &mut link.io());
    let frames = link.drain();
    assert_eq_test!(frames.len(), 2);
    assert_test!(frames.iter().all(|f| f.0 == PEER_MAC && f.1 == EtherType::Ipv4.as_u16()));
    pass!()
}

pub fn test_arp_gives_up_after_retries() -> TestResult {
    let mut link = Link::new();
    let mut arp = Arp::new();
    let pkt = link.payload(20);
    arp.transmit(pkt, PEER_IP, OUR_IP, &mut link.io());
    for _ in 0..=MAX_RETRIES {
        link.clock.advance(Duration::from_secs(1));
        let fired = link.timers.timers_handler();
        for t in fired {
            if let NetTimer::ArpRetry(ip) = t.handler {
                arp.on_retry(ip, t.id, OUR_IP, &mut link.io());
            }
        }
    }
    assert_eq_test!(arp.stats().requests_out, 1 + MAX_RETRIES as u64);
    assert_eq_test!(arp.stats().unresolved, 1);
    assert_eq_test!(link.store.available() + link.frames.len(), 32, "parked packet released");

    let pkt = link.payload(20);
    arp.transmit(pkt, PEER_IP, OUR_IP, &mut link.io());
    assert_eq_test!(arp.stats().unresolved, 2, "failed entry refuses traffic");
    pass!()
}

pub fn test_arp_multicast_and_broadcast_skip_resolution() -> TestResult {
    let mut link = Link::new();
    let mut arp = Arp::new();
    let pkt = link.payload(20);
    arp.transmit(pkt, Ipv4Addr::BROADCAST, OUR_IP, &mut link.io());
    let pkt = link.payload(20);
    arp.transmit(pkt, Ipv4Addr::new(224, 0, 0, 251), OUR_IP, &mut link.io());
    let frames = link.drain();
    assert_eq_test!(frames[0].0, MacAddr::BROADCAST);
    assert_eq_test!(frames[1].0, MacAddr([0x01, 0x00, 0x5e, 0, 0, 251]));
    assert_eq_test!(arp.cache().len(), 0);
    pass!()
}

// =============================================================================
// Neighbor discovery
// =============================================================================

fn solicitation(target: Ipv6Addr, source_ll: MacAddr) -> Vec<u8> {
    let mut data = vec![NDP_NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
    data.extend_from_slice(&target.0);
    data.extend_from_slice(&[1, 1]);
    data.extend_from_slice(source_ll.as_bytes());
    data
}

fn advertisement(target: Ipv6Addr, target_ll: MacAddr) -> Vec<u8> {
    let mut data = vec![NDP_NEIGHBOR_ADVERTISEMENT, 0, 0, 0, 0x60, 0, 0, 0];
    data.extend_from_slice(&target.0);
    data.extend_from_slice(&[2, 1]);
    data.extend_from_slice(target_ll.as_bytes());
    data
}

fn router_advertisement(lifetime: u16, prefix: Ipv6Addr, valid: u32, preferred: u32) -> Vec<u8> {
    let mut data = vec![134, 0, 0, 0, 64, 0];
    data.extend_from_slice(&lifetime.to_be_bytes());
    data.extend_from_slice(&[0; 8]);
    data.extend_from_slice(&[3, 4, 64, 0xc0]);
    data.extend_from_slice(&valid.to_be_bytes());
    data.extend_from_slice(&preferred.to_be_bytes());
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&prefix.0);
    data
}

fn ndp_receive(ndp: &mut Ndp, data: &[u8], src: Ipv6Addr, hop_limit: u8, link: &mut Link) -> NdpEvent {
    match icmp_header(data) {
        Some(hdr) => ndp.receive(&hdr, data, src, hop_limit, &mut link.io()),
        None => NdpEvent::None,
    }
}

pub fn test_ndp_answers_solicitation() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    let ours = Ipv6Addr::link_local_from_mac(OUR_MAC);
    ndp.add_addr(ours, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, &mut link.io());

    let ns = solicitation(ours, PEER_MAC);
    ndp_receive(&mut ndp, &ns, ll(2), 255, &mut link);
    assert_eq_test!(ndp.cache().lookup(&ll(2)), Some(PEER_MAC));
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1);
    let (dst, ethertype, body) = &frames[0];
    assert_eq_test!(*dst, PEER_MAC);
    assert_eq_test!(*ethertype, EtherType::Ipv6.as_u16());
    assert_eq_test!(body[IP6_HEADER_LEN], NDP_NEIGHBOR_ADVERTISEMENT);
    assert_eq_test!(&body[IP6_HEADER_LEN + 8..IP6_HEADER_LEN + 24], &ours.0);
    pass!()
}

pub fn test_ndp_drops_forwarded_messages() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    let ours = Ipv6Addr::link_local_from_mac(OUR_MAC);
    ndp.add_addr(ours, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, &mut link.io());
    let ns = solicitation(ours, PEER_MAC);
    ndp_receive(&mut ndp, &ns, ll(2), 64, &mut link);
    assert_test!(link.frames.is_empty());
    assert_eq_test!(ndp.stats().dropped, 1);
    pass!()
}

pub fn test_ndp_resolves_and_flushes() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    ndp.add_addr(Ipv6Addr::link_local_from_mac(OUR_MAC), 64, INFINITE_LIFETIME, INFINITE_LIFETIME, &mut link.io());
    let pkt = link.payload(40);
    ndp.transmit(pkt, ll(2), &mut link.io());
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1);
    assert_eq_test!(frames[0].0, ll(2).solicited_node().multicast_mac());
    assert_eq_test!(frames[0].2[IP6_HEADER_LEN], NDP_NEIGHBOR_SOLICITATION);

    let na = advertisement(ll(2), PEER_MAC);
    ndp_receive(&mut ndp, &na, ll(2), 255, &mut link);
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1, "parked packet sent");
    assert_eq_test!(frames[0].0, PEER_MAC);
    pass!()
}

pub fn test_router_advertisement_autoconfigures() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    let prefix = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 0]);
    let ra = router_advertisement(1800, prefix, 86400, 14400);
    let ev = ndp_receive(&mut ndp, &ra, ll(0xfe), 255, &mut link);
    let expected = Ipv6Addr::from_prefix_and_mac(&prefix, OUR_MAC);
    assert_eq_test!(ev, NdpEvent::AddressesFormed(vec![expected]));
    assert_eq_test!(ndp.default_router(), Some(ll(0xfe)));
    assert_test!(ndp.accepts(&expected));
    assert_test!(ndp.accepts(&expected.solicited_node()));
    let dst = Ipv6Addr::from_segments([0x2001, 0xdb8, 0xffff, 0, 0, 0, 0, 1]);
    assert_eq_test!(ndp.next_hop(&dst), Some(ll(0xfe)), "off-link goes via router");

    let again = ndp_receive(&mut ndp, &ra, ll(0xfe), 255, &mut link);
    assert_eq_test!(again, NdpEvent::None, "refresh forms nothing new");

    let withdraw = router_advertisement(0, prefix, 86400, 14400);
    ndp_receive(&mut ndp, &withdraw, ll(0xfe), 255, &mut link);
    assert_eq_test!(ndp.default_router(), None);
    pass!()
}

pub fn test_router_advertisement_from_global_source_dropped() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    let prefix = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 0]);
    let ra = router_advertisement(1800, prefix, 86400, 14400);
    let src = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 1]);
    assert_eq_test!(ndp_receive(&mut ndp, &ra, src, 255, &mut link), NdpEvent::None);
    assert_eq_test!(ndp.addrs().len(), 0);
    assert_eq_test!(ndp.default_router(), None);
    pass!()
}

pub fn test_valid_lifetime_two_hour_rule() -> TestResult {
    let prefix = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 0]);
    let hours = |h: u64| Duration::from_secs(h * 3600);
    let now = Duration::ZERO;
    let mut list = AddrList::new();
    let addr = match list.add_autoconf(&prefix, 64, 3600, 3 * 3600, OUR_MAC, now) {
        Some(a) => a,
        None => return TestResult::Fail,
    };
    let left = |l: &AddrList| l.get(&addr).and_then(|e| e.remaining_valid(now));

    // 3h left, 1h advertised: cut to two hours.
    list.add_autoconf(&prefix, 64, 600, 3600, OUR_MAC, now);
    assert_eq_test!(left(&list), Some(TWO_HOURS));

    // 2h left, 30min advertised: the time left is kept.
    list.add_autoconf(&prefix, 64, 600, 1800, OUR_MAC, now);
    assert_eq_test!(left(&list), Some(TWO_HOURS));

    // Longer than two hours is always taken.
    list.add_autoconf(&prefix, 64, 600, 5 * 3600, OUR_MAC, now);
    assert_eq_test!(left(&list), Some(hours(5)));

    // Longer than the time left is taken too.
    let mut short = AddrList::new();
    short.add_autoconf(&prefix, 64, 60, 600, OUR_MAC, now);
    short.add_autoconf(&prefix, 64, 60, 1800, OUR_MAC, now);
    assert_eq_test!(left(&short), Some(Duration::from_secs(1800)));

    // Infinite stays infinite.
    list.add_autoconf(&prefix, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, OUR_MAC, now);
    assert_eq_test!(list.get(&addr).map(|e| e.valid_until), Some(None));
    pass!()
}

pub fn test_addresses_expire_on_tick() -> TestResult {
    let mut link = Link::new();
    let mut ndp = Ndp::new();
    let global = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 9]);
    ndp.add_addr(global, 64, 5, 10, &mut link.io());
    link.clock.advance(Duration::from_secs(6));
    let now = link.timers.now();
    assert_test!(!ndp.addrs().get(&global).is_some_and(|e| e.is_preferred(now)), "deprecated");
    assert_eq_test!(ndp.on_tick(&mut link.io()), Vec::<Ipv6Addr>::new());
    link.clock.advance(Duration::from_secs(4));
    assert_eq_test!(ndp.on_tick(&mut link.io()), vec![global]);
    assert_test!(link.timers.is_empty(), "tick stops with nothing left to maintain");
    pass!()
}

pub fn test_source_address_selection() -> TestResult {
    let mut list = AddrList::new();
    let now = Duration::ZERO;
    let link_local = Ipv6Addr::link_local_from_mac(OUR_MAC);
    let global = Ipv6Addr::from_segments([0x2001, 0xdb8, 0, 1, 0, 0, 0, 9]);
    list.add(link_local, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, now);
    list.add(global, 64, INFINITE_LIFETIME, INFINITE_LIFETIME, now);
    assert_eq_test!(list.source_for(&ll(7), now), Some(link_local));
    let remote = Ipv6Addr::from_segments([0x2600, 0, 0, 0, 0, 0, 0, 1]);
    assert_eq_test!(list.source_for(&remote, now), Some(global));
    pass!()
}

// =============================================================================
// MLD
// =============================================================================

pub fn test_mld_join_reports_and_answers_queries() -> TestResult {
    let mut link = Link::new();
    let mut mld = Mld::new();
    let group = Ipv6Addr::from_segments([0xff02, 0, 0, 0, 0, 0, 0, 0xfb]);
    let src = Ipv6Addr::link_local_from_mac(OUR_MAC);
    assert_test!(mld.join(group, src, &mut link.io()).is_ok());
    assert_test!(mld.is_member(&group));
    let frames = link.drain();
    assert_eq_test!(frames.len(), 1);
    assert_eq_test!(frames[0].0, Ipv6Addr::ALL_MLDV2_ROUTERS.multicast_mac());
    // Hop-by-hop router alert, then the report.
    assert_eq_test!(frames[0].2[6], 0, "next header is hop-by-hop");
    assert_eq_test!(frames[0].2[IP6_HEADER_LEN + 8], MLD_V2_REPORT);

    let mut query = vec![MLD_QUERY, 0, 0, 0, 0, 0, 0, 0];
    query.extend_from_slice(&[0; 16]);
    query.extend_from_slice(&[0; 4]);
    if let Some(hdr) = icmp_header(&query) {
        mld.receive(&hdr, &query, ll(0xfe), 1, src, &mut link.io());
    }
    assert_eq_test!(mld.stats().queries_in, 1);
    assert_eq_test!(link.drain().len(), 1, "general query answered");

    assert_test!(mld.join(Ipv6Addr::from_segments([0x2001, 0, 0, 0, 0, 0, 0, 1]), src, &mut link.io()).is_err());
    assert_test!(mld.leave(group, src, &mut link.io()).is_ok());
    assert_test!(!mld.is_member(&group));
    pass!()
}

unikos_lib::define_test_suite!(
    neighbor,
    [
        test_arp_answers_request_for_own_address,
        test_arp_ignores_request_for_other_host,
        test_arp_parks_then_flushes_on_reply,
        test_arp_gives_up_after_retries,
        test_arp_multicast_and_broadcast_skip_resolution,
        test_ndp_answers_solicitation,
        test_ndp_drops_forwarded_messages,
        test_ndp_resolves_and_flushes,
        test_router_advertisement_autoconfigures,
        test_router_advertisement_from_global_source_dropped,
        test_valid_lifetime_two_hour_rule,
        test_addresses_expire_on_tick,
        test_source_address_selection,
        test_mld_join_reports_and_answers_queries,
    ]
);
