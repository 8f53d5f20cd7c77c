//! TCP header layout (RFC 793) and sequence-space arithmetic.

use bitflags::bitflags;

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_HEADER_MAX_LEN: usize = 60;

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

bitflags! {
    /// Control bits of byte 13.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Parsed TCP header, multi-byte fields in host order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset in 32-bit words (5-15).
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub fn has(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// Parse the fixed header. `None` if the slice is shorter than the header it
/// announces or the data offset is invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = data[12] >> 4;
    if data_offset < 5 || (data_offset as usize) * 4 > data.len() {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: TcpFlags::from_bits_truncate(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// MSS option value from the options area, if present.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if i + 3 < options.len() && options[i + 1] == TCP_OPT_MSS_LEN {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break;
                }
                i += len;
            }
        }
    }
    None
}

/// Write `hdr` (plus an MSS option if `mss` is set) into `out`. The checksum
/// field is written as zero. Returns the header length.
pub fn write_header(hdr: &TcpHeader, mss: Option<u16>, out: &mut [u8]) -> usize {
    let len = TCP_HEADER_LEN + if mss.is_some() { 4 } else { 0 };
    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&hdr.seq.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack.to_be_bytes());
    out[12] = ((len / 4) as u8) << 4;
    out[13] = hdr.flags.bits();
    out[14..16].copy_from_slice(&hdr.window.to_be_bytes());
    out[16..18].fill(0);
    out[18..20].copy_from_slice(&hdr.urgent.to_be_bytes());
    if let Some(mss) = mss {
        out[20] = TCP_OPT_MSS;
        out[21] = TCP_OPT_MSS_LEN;
        out[22..24].copy_from_slice(&mss.to_be_bytes());
    }
    len
}

// =============================================================================
// Sequence number arithmetic (RFC 793 section 3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// `lo <= x < hi` in sequence space.
#[inline]
pub fn seq_in(x: u32, lo: u32, hi: u32) -> bool {
    seq_le(lo, x) && seq_lt(x, hi)
}
