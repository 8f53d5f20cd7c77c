use std::rc::Rc;
use std::time::Duration;

use unikos_lib::testing::TestResult;
use unikos_lib::{Clock, ManualClock, assert_eq_test, assert_test, pass};

use crate::autoconf::{DEFAULT_DHCP_TIMEOUT, DEFAULT_PREFIX_LEN, DhcpRequest, Method, parse};
use crate::buffer_store::BufferStore;
use crate::config::{ConfigError, StackConfig};
use crate::inet::Inet;
use crate::loopback::LinkedNic;
use crate::nic::Nic;
use crate::types::{Ipv4Addr, Ipv6Addr, MacAddr};

const DOCUMENT: &str = r#"[
  { "iface": 0, "config": "static",
    "address": ["10.0.0.42/24", "fe80::42/64"],
    "gateway": "10.0.0.1", "dns": "10.0.0.1" },
  { "iface": 1, "config": ["dhcp-with-fallback", "slaac"],
    "address": "192.168.1.2", "netmask": "255.255.255.0", "timeout": 5 }
]"#;

fn stacks() -> Vec<Inet> {
    let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
    let config = StackConfig::default();
    let (a, b) = LinkedNic::pair(
        MacAddr([0x02, 0, 0, 0, 0, 0x10]),
        BufferStore::new(2048, 32),
        MacAddr([0x02, 0, 0, 0, 0, 0x11]),
        BufferStore::new(2048, 32),
        config.mtu,
    );
    [a, b]
        .into_iter()
        .map(|nic| {
            let nic: Rc<dyn Nic> = Rc::new(nic);
            Inet::new(nic, config.clone(), clock.clone())
        })
        .collect()
}

fn err_of(json: &str) -> Option<ConfigError> {
    parse(json).err()
}

// =============================================================================
// Parsing
// =============================================================================

pub fn test_parse_document() -> TestResult {
    let plan = match parse(DOCUMENT) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(plan.ifaces.len(), 2);

    let first = &plan.ifaces[0];
    assert_eq_test!(first.methods.clone(), vec![Method::Static]);
    let v4 = match first.v4 {
        Some(c) => c,
        None => return TestResult::Fail,
    };
    assert_eq_test!(v4.addr, Ipv4Addr::new(10, 0, 0, 42));
    assert_eq_test!(v4.netmask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq_test!(v4.gateway, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq_test!(v4.dns, Some(Ipv4Addr::new(10, 0, 0, 1)));
    let ll = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 0x42]);
    assert_eq_test!(first.v6.addrs.clone(), vec![(ll, 64)]);
    assert_eq_test!(first.timeout, DEFAULT_DHCP_TIMEOUT);

    let second = &plan.ifaces[1];
    assert_eq_test!(second.methods.clone(), vec![Method::DhcpWithFallback, Method::Slaac]);
    assert_eq_test!(second.v4.map(|c| c.addr), Some(Ipv4Addr::new(192, 168, 1, 2)));
    assert_eq_test!(second.timeout, Duration::from_secs(5));
    assert_test!(second.v6.is_empty());
    pass!()
}

pub fn test_method_names() -> TestResult {
    assert_eq_test!("static6".parse::<Method>(), Ok(Method::Static6));
    assert_eq_test!("dhcp-with-fallback".parse::<Method>(), Ok(Method::DhcpWithFallback));
    assert_eq_test!(
        "dhcp9".parse::<Method>(),
        Err(ConfigError::UnknownMethod("dhcp9".to_string()))
    );
    pass!()
}

pub fn test_v6_only_and_defaults() -> TestResult {
    let json = r#"[{ "iface": 0, "config": "static6",
        "address": "fd00::5", "gateway": ["fd00::1"], "dns": ["fd00::53", "fd00::54"] }]"#;
    let plan = match parse(json) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let iface = &plan.ifaces[0];
    assert_eq_test!(iface.v4, None, "no IPv4 method, no IPv4 settings needed");
    let addr = Ipv6Addr::from_segments([0xfd00, 0, 0, 0, 0, 0, 0, 5]);
    assert_eq_test!(iface.v6.addrs.clone(), vec![(addr, DEFAULT_PREFIX_LEN)]);
    assert_eq_test!(iface.v6.gateways.len(), 1);
    assert_eq_test!(iface.v6.dns.len(), 2);
    pass!()
}

pub fn test_entries_without_method_are_skipped() -> TestResult {
    let plan = match parse(r#"[{ "iface": 0 }, { "iface": 1, "config": "dhcp" }]"#) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(plan.ifaces.len(), 1);
    assert_eq_test!(plan.ifaces[0].iface, 1);
    pass!()
}

pub fn test_extra_ipv4_values_skipped() -> TestResult {
    let json = r#"[{ "iface": 0, "config": "static4",
        "address": ["10.0.0.2/24", "10.0.0.3/24"], "dns": ["10.0.0.53", "10.0.0.54"] }]"#;
    let plan = match parse(json) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let v4 = plan.ifaces[0].v4;
    assert_eq_test!(v4.map(|c| c.addr), Some(Ipv4Addr::new(10, 0, 0, 2)));
    assert_eq_test!(v4.and_then(|c| c.dns), Some(Ipv4Addr::new(10, 0, 0, 53)));
    pass!()
}

pub fn test_parse_errors() -> TestResult {
    assert_test!(matches!(err_of("{ not json"), Some(ConfigError::Json(_))));
    assert_test!(matches!(err_of(r#"{"iface": 0}"#), Some(ConfigError::Json(_))), "not an array");
    assert_eq_test!(
        err_of(r#"[{ "config": "dhcp" }]"#),
        Some(ConfigError::MissingField("iface"))
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static", "address": "10.0.0.2" }]"#),
        Some(ConfigError::MissingField("netmask"))
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static4" }]"#),
        Some(ConfigError::MissingField("address"))
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static", "address": "10.0.0.300/24" }]"#),
        Some(ConfigError::BadAddress("10.0.0.300/24".to_string()))
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static", "address": "10.0.0.2/33" }]"#),
        Some(ConfigError::InvalidNetmask)
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static6", "address": "fd00::1/129" }]"#),
        Some(ConfigError::InvalidPrefix)
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "static",
            "address": "10.0.0.2/24", "gateway": "192.168.0.1" }]"#),
        Some(ConfigError::GatewayOutsideSubnet)
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": ["dhcp", "bootp"] }]"#),
        Some(ConfigError::UnknownMethod("bootp".to_string()))
    );
    assert_eq_test!(
        err_of(r#"[{ "iface": 0, "config": "dhcp" }, { "iface": 0, "config": "slaac" }]"#),
        Some(ConfigError::DuplicateInterface(0))
    );
    assert_test!(matches!(
        err_of(r#"[{ "iface": 0, "config": "dhcp", "timeout": -1 }]"#),
        Some(ConfigError::Json(_))
    ));
    pass!()
}

// =============================================================================
// Applying
// =============================================================================

pub fn test_apply_configures_stacks() -> TestResult {
    let plan = match parse(DOCUMENT) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let mut stacks = stacks();
    let requests = match plan.apply(&mut stacks) {
        Ok(r) => r,
        Err(_) => return TestResult::Fail,
    };

    assert_eq_test!(stacks[0].ip_addr(), Some(Ipv4Addr::new(10, 0, 0, 42)));
    assert_eq_test!(stacks[0].gateway(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq_test!(stacks[0].dns(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    let ll = Ipv6Addr::from_segments([0xfe80, 0, 0, 0, 0, 0, 0, 0x42]);
    assert_test!(stacks[0].ip6_addrs().contains(&ll));

    // Interface 1 waits for DHCP; SLAAC already gave it a link-local address.
    assert_eq_test!(requests.len(), 1);
    let req: DhcpRequest = requests[0];
    assert_eq_test!(req.iface, 1);
    assert_eq_test!(req.timeout, Duration::from_secs(5));
    assert_eq_test!(stacks[1].ip_addr(), None);
    let mac = stacks[1].mac();
    assert_eq_test!(
        stacks[1].ip6_addrs().link_local(),
        Some(Ipv6Addr::link_local_from_mac(mac))
    );

    assert_eq_test!(req.timed_out(&mut stacks[1]), Ok(true));
    assert_eq_test!(stacks[1].ip_addr(), Some(Ipv4Addr::new(192, 168, 1, 2)));
    pass!()
}

pub fn test_plain_dhcp_has_no_fallback() -> TestResult {
    let plan = match parse(r#"[{ "iface": 0, "config": "dhcp4", "timeout": 2.5 }]"#) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let mut stacks = stacks();
    let requests = match plan.apply(&mut stacks) {
        Ok(r) => r,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(
        requests.clone(),
        vec![DhcpRequest {
            iface: 0,
            timeout: Duration::from_millis(2500),
            fallback: None,
        }]
    );
    assert_eq_test!(requests[0].timed_out(&mut stacks[0]), Ok(false));
    assert_eq_test!(stacks[0].ip_addr(), None);
    pass!()
}

pub fn test_apply_unknown_interface_changes_nothing() -> TestResult {
    let json = r#"[{ "iface": 0, "config": "static", "address": "10.0.0.2/24" },
                   { "iface": 3, "config": "dhcp" }]"#;
    let plan = match parse(json) {
        Ok(p) => p,
        Err(_) => return TestResult::Fail,
    };
    let mut stacks = stacks();
    assert_eq_test!(plan.apply(&mut stacks), Err(ConfigError::NoSuchInterface(3)));
    assert_eq_test!(stacks[0].ip_addr(), None);
    pass!()
}

unikos_lib::define_test_suite!(
    autoconf,
    [
        test_parse_document,
        test_method_names,
        test_v6_only_and_defaults,
        test_entries_without_method_are_skipped,
        test_extra_ipv4_values_skipped,
        test_parse_errors,
        test_apply_configures_stacks,
        test_plain_dhcp_has_no_fallback,
        test_apply_unknown_interface_changes_nothing,
    ]
);
