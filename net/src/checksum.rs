//! Internet checksum (RFC 1071) and incremental update (RFC 1624).

use crate::types::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Accumulate the ones'-complement sum of `data` into `sum`.
///
/// An odd trailing byte is padded with zero on the right.
pub fn ones_complement_sum(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold a 32-bit running sum into 16 bits and complement it.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of `data` from scratch.
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    fold(ones_complement_sum(data, 0))
}

/// Pseudo-header sum for TCP/UDP/ICMPv6 over either IP version.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, len: usize) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => pseudo_header_sum_v4(s, d, protocol, len),
        (IpAddr::V6(s), IpAddr::V6(d)) => pseudo_header_sum_v6(s, d, protocol, len),
        // Mixed families never reach a checksum; sum the protocol fields only.
        _ => (protocol as u32).wrapping_add(len as u32),
    }
}

pub fn pseudo_header_sum_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = ones_complement_sum(&src.0, 0);
    sum = ones_complement_sum(&dst.0, sum);
    sum = sum.wrapping_add(protocol as u32);
    sum.wrapping_add(len as u32)
}

pub fn pseudo_header_sum_v6(src: Ipv6Addr, dst: Ipv6Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = ones_complement_sum(&src.0, 0);
    sum = ones_complement_sum(&dst.0, sum);
    sum = sum.wrapping_add((len as u32) >> 16).wrapping_add(len as u32 & 0xFFFF);
    sum.wrapping_add(protocol as u32)
}

/// Transport checksum: pseudo-header plus `segment` (with its checksum field
/// zeroed, or intact when verifying).
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    fold(ones_complement_sum(
        segment,
        pseudo_header_sum(src, dst, protocol, segment.len()),
    ))
}

/// Update `checksum` in place after a field changed from `old` to `new`.
///
/// Implements RFC 1624 eqn. 3: `HC' = ~(~HC + ~m + m')`. Both fields must be
/// the same even length; anything else is a caller bug and panics.
pub fn checksum_adjust(checksum: &mut u16, old: &[u8], new: &[u8]) {
    assert!(
        old.len() == new.len() && old.len() % 2 == 0,
        "checksum_adjust: fields must be the same even length ({} vs {})",
        old.len(),
        new.len()
    );
    let mut sum = (!*checksum) as u32;
    for (o, n) in old.chunks_exact(2).zip(new.chunks_exact(2)) {
        sum = sum.wrapping_add((!u16::from_be_bytes([o[0], o[1]])) as u32);
        sum = sum.wrapping_add(u16::from_be_bytes([n[0], n[1]]) as u32);
    }
    *checksum = fold(sum);
}

/// Read the big-endian checksum at `offset`, adjust it and write it back.
pub fn adjust_at(buf: &mut [u8], offset: usize, old: &[u8], new: &[u8]) {
    let mut sum = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    checksum_adjust(&mut sum, old, new);
    buf[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}
