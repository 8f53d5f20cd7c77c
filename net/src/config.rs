//! Stack tunables and configuration errors.

extern crate alloc;

use alloc::rc::Rc;
use alloc::string::String;
use core::fmt;

use crate::buffer_store::{BufferStore, bufsize_for_mtu};
use crate::conntrack::ConntrackTimeouts;
use crate::tcp::TcpConfig;

pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Tunables of one IP stack instance.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub mtu: u16,
    /// Chunks per buffer pool and the number of pools a store may grow to.
    pub buffers_per_pool: usize,
    pub max_pools: usize,
    pub ttl: u8,
    pub hop_limit: u8,
    pub tcp: TcpConfig,
    pub conntrack: ConntrackTimeouts,
}

impl StackConfig {
    pub fn for_mtu(mtu: u16) -> Self {
        Self {
            mtu,
            tcp: TcpConfig::for_mtu(mtu),
            ..Self::default()
        }
    }

    /// A buffer store sized for this configuration's MTU.
    pub fn buffer_store(&self) -> Rc<BufferStore> {
        BufferStore::with_chain(
            bufsize_for_mtu(self.mtu as usize),
            self.buffers_per_pool,
            self.max_pools,
        )
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            buffers_per_pool: 256,
            max_pools: 4,
            ttl: DEFAULT_TTL,
            hop_limit: DEFAULT_HOP_LIMIT,
            tcp: TcpConfig::for_mtu(DEFAULT_MTU),
            conntrack: ConntrackTimeouts::default(),
        }
    }
}

/// Why a configuration was refused. The stack is left untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    UnspecifiedAddress,
    /// Netmask bits are not contiguous.
    InvalidNetmask,
    /// IPv6 prefix length above 128.
    InvalidPrefix,
    GatewayOutsideSubnet,
    /// An address string that does not parse.
    BadAddress(String),
    UnknownMethod(String),
    MissingField(&'static str),
    DuplicateInterface(u8),
    NoSuchInterface(u8),
    /// The document is not valid JSON or has the wrong shape.
    Json(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnspecifiedAddress => write!(f, "address is unspecified"),
            Self::InvalidNetmask => write!(f, "netmask is not contiguous"),
            Self::InvalidPrefix => write!(f, "prefix length out of range"),
            Self::GatewayOutsideSubnet => write!(f, "gateway is outside the subnet"),
            Self::BadAddress(s) => write!(f, "bad address '{}'", s),
            Self::UnknownMethod(s) => write!(f, "unknown config method '{}'", s),
            Self::MissingField(name) => write!(f, "missing field '{}'", name),
            Self::DuplicateInterface(i) => write!(f, "interface {} configured twice", i),
            Self::NoSuchInterface(i) => write!(f, "no interface {}", i),
            Self::Json(e) => write!(f, "malformed config: {}", e),
        }
    }
}
