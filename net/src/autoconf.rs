//! Interface configuration from a JSON document.
//!
//! The document is an array with one object per interface:
//!
//! ```json
//! [
//!   { "iface": 0, "config": "static",
//!     "address": ["10.0.0.42/24", "fe80::42/64"],
//!     "gateway": "10.0.0.1", "dns": "10.0.0.1" },
//!   { "iface": 1, "config": ["dhcp-with-fallback", "slaac"],
//!     "address": "192.168.1.2", "netmask": "255.255.255.0", "timeout": 5 }
//! ]
//! ```
//!
//! [`parse`] checks the whole document and produces a [`NetPlan`]; only a
//! plan that parsed completely can be applied, so a bad document never
//! leaves interfaces half configured. DHCP itself runs elsewhere: applying a
//! plan returns the [`DhcpRequest`]s the caller has to negotiate.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::str::FromStr;
use core::time::Duration;

use serde::Deserialize;
use unikos_lib::{klog_info, klog_warn};

use crate::config::ConfigError;
use crate::inet::Inet;
use crate::ip4::Ip4Config;
use crate::ndp::INFINITE_LIFETIME;
use crate::types::{Ipv4Addr, Ipv6Addr};

/// Used when `timeout` is absent.
pub const DEFAULT_DHCP_TIMEOUT: Duration = Duration::from_secs(10);
/// Prefix length of an IPv6 address given without one.
pub const DEFAULT_PREFIX_LEN: u8 = 64;
/// Lifetime of a configured IPv6 default router.
pub const STATIC_ROUTER_LIFETIME: Duration = Duration::from_secs(0xffff);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// IPv4 and IPv6 static settings.
    Static,
    Static4,
    Static6,
    Dhcp,
    Dhcp4,
    Dhcp6,
    Slaac,
    /// DHCP, falling back to the static IPv4 settings on timeout.
    DhcpWithFallback,
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "static" => Self::Static,
            "static4" => Self::Static4,
            "static6" => Self::Static6,
            "dhcp" => Self::Dhcp,
            "dhcp4" => Self::Dhcp4,
            "dhcp6" => Self::Dhcp6,
            "slaac" => Self::Slaac,
            "dhcp-with-fallback" => Self::DhcpWithFallback,
            other => return Err(ConfigError::UnknownMethod(other.to_string())),
        })
    }
}

impl Method {
    fn needs_v4(self) -> bool {
        matches!(self, Self::Static | Self::Static4 | Self::DhcpWithFallback)
    }
}

/// Static IPv6 settings of one interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ip6Static {
    pub addrs: Vec<(Ipv6Addr, u8)>,
    pub gateways: Vec<Ipv6Addr>,
    pub dns: Vec<Ipv6Addr>,
}

impl Ip6Static {
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.gateways.is_empty() && self.dns.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfacePlan {
    pub iface: u8,
    pub methods: Vec<Method>,
    /// Present whenever a method needs it.
    pub v4: Option<Ip4Config>,
    pub v6: Ip6Static,
    pub timeout: Duration,
}

/// A checked configuration document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetPlan {
    pub ifaces: Vec<IfacePlan>,
}

/// DHCP negotiation the caller has to run for an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpRequest {
    pub iface: u8,
    pub timeout: Duration,
    /// Applied by [`DhcpRequest::timed_out`].
    pub fallback: Option<Ip4Config>,
}

impl DhcpRequest {
    /// Negotiation gave up. Applies the fallback, if there is one; returns
    /// whether it did.
    pub fn timed_out(&self, stack: &mut Inet) -> Result<bool, ConfigError> {
        let Some(cfg) = self.fallback else {
            return Ok(false);
        };
        klog_info!(
            "autoconf: DHCP timeout on iface {}, falling back to static configuration",
            self.iface
        );
        stack.network_config(cfg.addr, cfg.netmask, cfg.gateway, cfg.dns)?;
        Ok(true)
    }
}

/// A string or an array of strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => alloc::vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Deserialize)]
struct RawIface {
    iface: Option<u8>,
    #[serde(default)]
    config: Option<OneOrMany>,
    #[serde(default)]
    address: Option<OneOrMany>,
    #[serde(default)]
    netmask: Option<String>,
    #[serde(default)]
    gateway: Option<OneOrMany>,
    #[serde(default)]
    dns: Option<OneOrMany>,
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Default)]
struct V4Parts {
    addr: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    dns: Option<Ipv4Addr>,
}

fn is_v6(s: &str) -> bool {
    s.contains(':')
}

fn bad(s: &str) -> ConfigError {
    ConfigError::BadAddress(s.to_string())
}

/// `a.b.c.d[/bits]`
fn parse_addr4(s: &str) -> Result<(Ipv4Addr, Option<Ipv4Addr>), ConfigError> {
    let (addr, bits) = match s.rsplit_once('/') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    };
    let addr = Ipv4Addr::from_str(addr).map_err(|_| bad(s))?;
    let mask = match bits {
        Some(b) => {
            let bits: u8 = b.parse().map_err(|_| bad(s))?;
            if bits > 32 {
                return Err(ConfigError::InvalidNetmask);
            }
            Some(Ipv4Addr::netmask(bits))
        }
        None => None,
    };
    Ok((addr, mask))
}

/// `x:y::z[/prefix]`
fn parse_addr6(s: &str) -> Result<(Ipv6Addr, Option<u8>), ConfigError> {
    let (addr, prefix) = match s.rsplit_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };
    let addr = Ipv6Addr::from_str(addr).map_err(|_| bad(s))?;
    let prefix = match prefix {
        Some(p) => {
            let p: u8 = p.parse().map_err(|_| bad(s))?;
            if p > 128 {
                return Err(ConfigError::InvalidPrefix);
            }
            Some(p)
        }
        None => None,
    };
    Ok((addr, prefix))
}

/// Keep the first IPv4 value of a field; later ones are reported and skipped.
fn set_once(slot: &mut Option<Ipv4Addr>, val: Ipv4Addr, field: &str) {
    match slot {
        Some(_) => klog_warn!("autoconf: multiple IPv4 {} not supported, skipping {}", field, val),
        None => *slot = Some(val),
    }
}

fn parse_iface(raw: RawIface) -> Result<Option<IfacePlan>, ConfigError> {
    let iface = raw.iface.ok_or(ConfigError::MissingField("iface"))?;
    let Some(config) = raw.config else {
        klog_warn!("autoconf: no config method for iface {}, ignoring", iface);
        return Ok(None);
    };
    let methods = config
        .into_vec()
        .iter()
        .map(|m| Method::from_str(m))
        .collect::<Result<Vec<_>, _>>()?;

    let mut v4 = V4Parts::default();
    let mut v6 = Ip6Static::default();

    for s in raw.address.map(OneOrMany::into_vec).unwrap_or_default() {
        if is_v6(&s) {
            let (addr, prefix) = parse_addr6(&s)?;
            v6.addrs.push((addr, prefix.unwrap_or(DEFAULT_PREFIX_LEN)));
        } else {
            let (addr, mask) = parse_addr4(&s)?;
            if v4.addr.is_some() {
                klog_warn!("autoconf: multiple IPv4 addresses not supported, skipping {}", s);
                continue;
            }
            v4.addr = Some(addr);
            v4.netmask = mask;
        }
    }
    if v4.netmask.is_none() {
        if let Some(m) = raw.netmask.as_deref() {
            v4.netmask = Some(Ipv4Addr::from_str(m).map_err(|_| bad(m))?);
        }
    }
    for s in raw.gateway.map(OneOrMany::into_vec).unwrap_or_default() {
        if is_v6(&s) {
            v6.gateways.push(parse_addr6(&s)?.0);
        } else {
            set_once(&mut v4.gateway, parse_addr4(&s)?.0, "gateways");
        }
    }
    for s in raw.dns.map(OneOrMany::into_vec).unwrap_or_default() {
        if is_v6(&s) {
            v6.dns.push(parse_addr6(&s)?.0);
        } else {
            set_once(&mut v4.dns, parse_addr4(&s)?.0, "name servers");
        }
    }

    let v4 = if methods.iter().any(|m| m.needs_v4()) {
        let addr = v4.addr.ok_or(ConfigError::MissingField("address"))?;
        let netmask = v4.netmask.ok_or(ConfigError::MissingField("netmask"))?;
        Some(Ip4Config::new(
            addr,
            netmask,
            v4.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            v4.dns,
        )?)
    } else {
        None
    };

    let timeout = match raw.timeout {
        Some(t) if t.is_finite() && t >= 0.0 => Duration::from_millis((t * 1000.0) as u64),
        Some(_) => return Err(ConfigError::Json("timeout must be a positive number".to_string())),
        None => DEFAULT_DHCP_TIMEOUT,
    };

    Ok(Some(IfacePlan {
        iface,
        methods,
        v4,
        v6,
        timeout,
    }))
}

/// Parse and check a configuration document.
pub fn parse(json: &str) -> Result<NetPlan, ConfigError> {
    let raw: Vec<RawIface> =
        serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
    let mut plan = NetPlan::default();
    for entry in raw {
        let Some(iface) = parse_iface(entry)? else {
            continue;
        };
        if plan.ifaces.iter().any(|p| p.iface == iface.iface) {
            return Err(ConfigError::DuplicateInterface(iface.iface));
        }
        plan.ifaces.push(iface);
    }
    Ok(plan)
}

impl NetPlan {
    /// Configure `stacks`, indexed by interface number. Nothing is applied
    /// if the plan names an interface that does not exist.
    pub fn apply(&self, stacks: &mut [Inet]) -> Result<Vec<DhcpRequest>, ConfigError> {
        if self.ifaces.len() > stacks.len() {
            klog_warn!("autoconf: more configs than interfaces");
        }
        if let Some(p) = self.ifaces.iter().find(|p| p.iface as usize >= stacks.len()) {
            return Err(ConfigError::NoSuchInterface(p.iface));
        }
        klog_info!("autoconf: configuring {} interfaces", self.ifaces.len());
        let mut dhcp = Vec::new();
        for plan in &self.ifaces {
            let stack = &mut stacks[plan.iface as usize];
            for method in &plan.methods {
                match method {
                    Method::Static => {
                        apply_v4(stack, plan)?;
                        apply_v6(stack, &plan.v6)?;
                    }
                    Method::Static4 => apply_v4(stack, plan)?,
                    Method::Static6 => apply_v6(stack, &plan.v6)?,
                    Method::Dhcp | Method::Dhcp4 => dhcp.push(DhcpRequest {
                        iface: plan.iface,
                        timeout: plan.timeout,
                        fallback: None,
                    }),
                    Method::Dhcp6 => {
                        klog_warn!("autoconf: DHCPv6 not supported (iface {})", plan.iface)
                    }
                    Method::Slaac => stack.start_slaac(),
                    Method::DhcpWithFallback => dhcp.push(DhcpRequest {
                        iface: plan.iface,
                        timeout: plan.timeout,
                        fallback: plan.v4,
                    }),
                }
            }
        }
        klog_info!("autoconf: configuration complete");
        Ok(dhcp)
    }
}

fn apply_v4(stack: &mut Inet, plan: &IfacePlan) -> Result<(), ConfigError> {
    match plan.v4 {
        Some(c) => stack.network_config(c.addr, c.netmask, c.gateway, c.dns),
        None => Err(ConfigError::MissingField("address")),
    }
}

fn apply_v6(stack: &mut Inet, v6: &Ip6Static) -> Result<(), ConfigError> {
    for (addr, prefix) in &v6.addrs {
        stack.add_addr6(*addr, *prefix, INFINITE_LIFETIME, INFINITE_LIFETIME)?;
    }
    for router in &v6.gateways {
        stack.add_router6(*router, STATIC_ROUTER_LIFETIME);
    }
    if let Some(dns) = v6.dns.first() {
        stack.set_dns6(*dns);
    }
    Ok(())
}
