//! UDP (RFC 768): sockets bound to a local port.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use unikos_lib::{klog_debug, klog_trace};

use crate::buffer_store::PACKET_HEADROOM;
use crate::checksum::transport_checksum;
use crate::ip::{Datagram, Tx};
use crate::packet::Packet;
use crate::port_util::PortUtil;
use crate::types::{IpAddr, NetError, Protocol, Socket};

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload.
    pub length: u16,
    pub checksum: u16,
}

pub fn parse_header(data: &[u8]) -> Option<UdpHeader> {
    if data.len() < UDP_HEADER_LEN {
        return None;
    }
    Some(UdpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        checksum: u16::from_be_bytes([data[6], data[7]]),
    })
}

pub fn write_header(hdr: &UdpHeader, out: &mut [u8]) {
    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..6].copy_from_slice(&hdr.length.to_be_bytes());
    out[6..8].copy_from_slice(&hdr.checksum.to_be_bytes());
}

/// Called with the sender and the payload of each datagram.
pub type ReadCallback = Box<dyn FnMut(Socket, &[u8])>;

pub struct UdpSocket {
    local: Socket,
    on_read: Option<ReadCallback>,
    rx_datagrams: u64,
    tx_datagrams: u64,
}

impl UdpSocket {
    fn new(local: Socket) -> Self {
        Self {
            local,
            on_read: None,
            rx_datagrams: 0,
            tx_datagrams: 0,
        }
    }

    #[inline]
    pub fn local(&self) -> Socket {
        self.local
    }

    pub fn on_read(&mut self, cb: impl FnMut(Socket, &[u8]) + 'static) -> &mut Self {
        self.on_read = Some(Box::new(cb));
        self
    }

    #[inline]
    pub fn rx_datagrams(&self) -> u64 {
        self.rx_datagrams
    }

    #[inline]
    pub fn tx_datagrams(&self) -> u64 {
        self.tx_datagrams
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub checksum_errors: u64,
    pub dropped: u64,
    pub no_port: u64,
}

/// Outcome of an inbound datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpRx {
    Delivered,
    /// Malformed or failed its checksum.
    Dropped,
    /// Nobody is bound to the destination port.
    PortUnreachable,
}

pub struct Udp {
    sockets: BTreeMap<u16, UdpSocket>,
    ports: PortUtil,
    stats: UdpStats,
}

impl Udp {
    pub fn new() -> Self {
        Self {
            sockets: BTreeMap::new(),
            ports: PortUtil::new(),
            stats: UdpStats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &UdpStats {
        &self.stats
    }

    #[inline]
    pub fn ports(&self) -> &PortUtil {
        &self.ports
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Bind `local`. Port 0 picks an ephemeral port.
    pub fn bind(&mut self, local: Socket) -> Result<&mut UdpSocket, NetError> {
        if local.port == 0 {
            return self.bind_ephemeral(local.addr);
        }
        self.ports.bind(local.port)?;
        klog_debug!("udp: bound {}", local);
        Ok(self.sockets.entry(local.port).or_insert(UdpSocket::new(local)))
    }

    pub fn bind_ephemeral(&mut self, addr: IpAddr) -> Result<&mut UdpSocket, NetError> {
        let port = self.ports.bind_ephemeral()?;
        let local = Socket::new(addr, port);
        klog_debug!("udp: bound {}", local);
        Ok(self.sockets.entry(port).or_insert(UdpSocket::new(local)))
    }

    pub fn socket(&mut self, port: u16) -> Option<&mut UdpSocket> {
        self.sockets.get_mut(&port)
    }

    /// Close the socket on `port`, releasing the port.
    pub fn close(&mut self, port: u16) -> bool {
        if self.sockets.remove(&port).is_none() {
            return false;
        }
        self.ports.unbind(port);
        klog_debug!("udp: closed port {}", port);
        true
    }

    /// Close every socket (interface down).
    pub fn clear(&mut self) {
        let ports: alloc::vec::Vec<u16> = self.sockets.keys().copied().collect();
        for port in ports {
            self.close(port);
        }
    }

    /// Send `data` from the socket on `port` to `dst`, with `src` as the
    /// source address.
    pub fn sendto(
        &mut self,
        port: u16,
        src: IpAddr,
        dst: Socket,
        data: &[u8],
        tx: &mut Tx<'_>,
    ) -> Result<(), NetError> {
        let sock = self.sockets.get_mut(&port).ok_or(NetError::NotConnected)?;
        if dst.port == 0 || src.is_v4() != dst.addr.is_v4() {
            return Err(NetError::InvalidArgument);
        }
        let length = UDP_HEADER_LEN + data.len();
        if length > u16::MAX as usize {
            return Err(NetError::InvalidArgument);
        }
        let mut pkt = Packet::create(tx.store, PACKET_HEADROOM);
        pkt.append(data).map_err(|_| NetError::NoBufferSpace)?;
        let hdr = UdpHeader {
            src_port: port,
            dst_port: dst.port,
            length: length as u16,
            checksum: 0,
        };
        write_header(&hdr, pkt.push_header(UDP_HEADER_LEN)?);
        let mut csum = transport_checksum(src, dst.addr, Protocol::Udp.as_u8(), pkt.data());
        // Zero on the wire means "no checksum".
        if csum == 0 {
            csum = 0xffff;
        }
        pkt.data_mut()[6..8].copy_from_slice(&csum.to_be_bytes());
        pkt.mark_l4();
        sock.tx_datagrams += 1;
        self.stats.datagrams_out += 1;
        tx.out
            .push_back(Datagram::new(src, dst.addr, Protocol::Udp, pkt));
        Ok(())
    }

    /// An inbound datagram from the IP layer.
    pub fn receive(&mut self, dgram: &Datagram) -> UdpRx {
        self.stats.datagrams_in += 1;
        let data = dgram.packet.data();
        let Some(hdr) = parse_header(data) else {
            klog_debug!("udp: truncated header from {}", dgram.src);
            self.stats.dropped += 1;
            return UdpRx::Dropped;
        };
        let len = hdr.length as usize;
        if len < UDP_HEADER_LEN || len > data.len() {
            klog_debug!("udp: bad length {} from {}", len, dgram.src);
            self.stats.dropped += 1;
            return UdpRx::Dropped;
        }
        let data = &data[..len];
        let optional = hdr.checksum == 0 && dgram.src.is_v4();
        if !optional && transport_checksum(dgram.src, dgram.dst, Protocol::Udp.as_u8(), data) != 0 {
            klog_debug!("udp: bad checksum from {}", dgram.src);
            self.stats.checksum_errors += 1;
            return UdpRx::Dropped;
        }
        let from = Socket::new(dgram.src, hdr.src_port);
        let Some(sock) = self.sockets.get_mut(&hdr.dst_port) else {
            klog_trace!("udp: {} -> port {} not bound", from, hdr.dst_port);
            self.stats.no_port += 1;
            return UdpRx::PortUnreachable;
        };
        if !sock.local.addr.is_unspecified() && sock.local.addr != dgram.dst {
            self.stats.no_port += 1;
            return UdpRx::PortUnreachable;
        }
        sock.rx_datagrams += 1;
        if let Some(cb) = sock.on_read.as_mut() {
            cb(from, &data[UDP_HEADER_LEN..]);
        }
        UdpRx::Delivered
    }
}

impl Default for Udp {
    fn default() -> Self {
        Self::new()
    }
}
