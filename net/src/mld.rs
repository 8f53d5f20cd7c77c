//! Multicast listener discovery, version 2 (RFC 3810), listener side.

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use unikos_lib::{klog_debug, klog_trace};

use crate::ethernet::LinkIo;
use crate::icmp4::IcmpHeader;
use crate::icmp6::{self, MLD_QUERY, MLD_V1_DONE, MLD_V1_REPORT, MLD_V2_REPORT};
use crate::ip6;
use crate::types::{EtherType, Ipv6Addr, NetError, Protocol};

/// Multicast address record types.
pub const MODE_IS_INCLUDE: u8 = 1;
pub const MODE_IS_EXCLUDE: u8 = 2;
pub const CHANGE_TO_INCLUDE: u8 = 3;
pub const CHANGE_TO_EXCLUDE: u8 = 4;

const RECORD_LEN: usize = 20;
/// Records per report, keeping reports inside the minimum IPv6 MTU.
const MAX_RECORDS: usize = 56;

/// Hop-by-hop header carrying the router alert option (value 0, MLD),
/// padded to 8 bytes. The next-header byte is filled in when sent.
const ROUTER_ALERT_HBH: [u8; 8] = [0, 0, 0x05, 0x02, 0x00, 0x00, 0x01, 0x00];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MldStats {
    pub queries_in: u64,
    pub reports_out: u64,
    pub dropped: u64,
}

/// Groups joined on one interface.
#[derive(Default)]
pub struct Mld {
    groups: BTreeSet<Ipv6Addr>,
    stats: MldStats,
}

impl Mld {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> &MldStats {
        &self.stats
    }

    pub fn is_member(&self, group: &Ipv6Addr) -> bool {
        self.groups.contains(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Ipv6Addr> {
        self.groups.iter()
    }

    /// Start listening on `group` and announce it.
    pub fn join(&mut self, group: Ipv6Addr, src: Ipv6Addr, io: &mut LinkIo<'_>) -> Result<(), NetError> {
        if !group.is_multicast() {
            return Err(NetError::InvalidArgument);
        }
        if !self.groups.insert(group) {
            return Ok(());
        }
        klog_debug!("mld: joined {}", group);
        self.report(&[(CHANGE_TO_EXCLUDE, group)], src, io)
    }

    /// Stop listening on `group`.
    pub fn leave(&mut self, group: Ipv6Addr, src: Ipv6Addr, io: &mut LinkIo<'_>) -> Result<(), NetError> {
        if !self.groups.remove(&group) {
            return Err(NetError::InvalidArgument);
        }
        klog_debug!("mld: left {}", group);
        self.report(&[(CHANGE_TO_INCLUDE, group)], src, io)
    }

    /// A verified MLD message. `data` starts at the ICMPv6 header; reports
    /// are sent from `local`.
    pub fn receive(
        &mut self,
        hdr: &IcmpHeader,
        data: &[u8],
        src: Ipv6Addr,
        hop_limit: u8,
        local: Ipv6Addr,
        io: &mut LinkIo<'_>,
    ) {
        if hop_limit != 1 || !src.is_link_local() {
            klog_debug!("mld: type {} from {} hop limit {}, dropping", hdr.typ, src, hop_limit);
            self.stats.dropped += 1;
            return;
        }
        match hdr.typ {
            MLD_QUERY => {
                if data.len() < 24 {
                    self.stats.dropped += 1;
                    return;
                }
                self.stats.queries_in += 1;
                let mut g = [0u8; 16];
                g.copy_from_slice(&data[8..24]);
                let group = Ipv6Addr(g);
                let records: Vec<(u8, Ipv6Addr)> = if group.is_unspecified() {
                    self.groups.iter().map(|g| (MODE_IS_EXCLUDE, *g)).collect()
                } else if self.groups.contains(&group) {
                    alloc::vec![(MODE_IS_EXCLUDE, group)]
                } else {
                    return;
                };
                klog_trace!("mld: query from {}, reporting {} groups", src, records.len());
                for chunk in records.chunks(MAX_RECORDS) {
                    if let Err(e) = self.report(chunk, local, io) {
                        klog_debug!("mld: report failed: {}", e);
                    }
                }
            }
            MLD_V1_REPORT | MLD_V1_DONE | MLD_V2_REPORT => {
                klog_trace!("mld: listener message from {} ignored", src);
            }
            _ => {}
        }
    }

    /// Forget every group (interface down).
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    fn report(
        &mut self,
        records: &[(u8, Ipv6Addr)],
        src: Ipv6Addr,
        io: &mut LinkIo<'_>,
    ) -> Result<(), NetError> {
        let mut body = Vec::with_capacity(records.len() * RECORD_LEN);
        for (typ, group) in records {
            body.extend_from_slice(&[*typ, 0, 0, 0]);
            body.extend_from_slice(&group.0);
        }
        let dst = Ipv6Addr::ALL_MLDV2_ROUTERS;
        let mut pkt = icmp6::build(io.store, src, dst, MLD_V2_REPORT, 0, records.len() as u32, &body)?;
        let hbh = pkt.push_header(ROUTER_ALERT_HBH.len())?;
        hbh.copy_from_slice(&ROUTER_ALERT_HBH);
        hbh[0] = Protocol::Icmpv6.as_u8();
        ip6::encapsulate(&mut pkt, src, dst, Protocol::HopByHop.as_u8(), 1)?;
        io.send(pkt, dst.multicast_mac(), EtherType::Ipv6);
        self.stats.reports_out += 1;
        Ok(())
    }
}
