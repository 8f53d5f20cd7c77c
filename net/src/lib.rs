//! Network core of the unikernel.
//!
//! Packets live in pre-allocated [`buffer_store`] chunks and move up and
//! down the stack as [`packet::Packet`]s. One [`inet::Inet`] per link device
//! owns every protocol: Ethernet/VLAN, ARP, IPv4, IPv6 with NDP and MLD,
//! ICMP, UDP, TCP, and optionally conntrack with NAPT for its own output.
//! All timers are data-driven entries on one [`timer::NetTimers`] engine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod autoconf;
pub mod buffer_store;
pub mod checksum;
pub mod config;
pub mod conntrack;
pub mod ethernet;
pub mod icmp4;
pub mod icmp6;
pub mod inet;
pub mod ip;
pub mod ip4;
pub mod ip6;
pub mod loopback;
pub mod mld;
pub mod nat;
pub mod ndp;
pub mod neighbor;
pub mod nic;
pub mod packet;
pub mod ping;
pub mod port_util;
pub mod tcp;
pub mod timer;
pub mod types;
pub mod udp;
pub mod vlan;

#[cfg(test)]
mod autoconf_tests;
#[cfg(test)]
mod icmp_tests;
#[cfg(test)]
mod nat_tests;
#[cfg(test)]
mod neighbor_tests;
#[cfg(test)]
mod port_util_tests;
#[cfg(test)]
mod udp_tests;
#[cfg(test)]
mod write_queue_tests;

pub use buffer_store::{Buffer, BufferStore};
pub use config::{ConfigError, StackConfig};
pub use inet::Inet;
pub use loopback::LinkedNic;
pub use nic::{Nic, NicFeatures, NicStats};
pub use packet::Packet;
pub use tcp::{Connection, Tcp, TcpConfig, TcpState};
pub use types::{EtherType, IpAddr, Ipv4Addr, Ipv6Addr, MacAddr, NetError, Protocol, Quadruple, Socket};
