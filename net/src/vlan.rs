//! IEEE 802.1Q tagging and per-VLAN demultiplexing.
//!
//! A VLAN interface is a [`VlanNic`] stacked on the physical device: it tags
//! every frame on the way out and shares the parent's MAC and buffer store.
//! Inbound, the physical stack hands tagged frames to its [`VlanManager`],
//! which strips the tag and passes the now untagged frame to the receiver
//! registered for the VLAN id, normally another stack's `receive`.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;

use unikos_lib::klog_debug;

use crate::buffer_store::BufferStore;
use crate::ethernet::{ETH_HEADER_LEN, ETH_TYPE_OFFSET};
use crate::nic::{Nic, NicFeatures, NicStats};
use crate::packet::Packet;
use crate::types::{EtherType, MacAddr, NetError};

pub const VLAN_TAG_LEN: usize = 4;
pub const VLAN_VID_MASK: u16 = 0x0fff;
/// Largest usable id; 0 and 4095 are reserved.
pub const VLAN_VID_MAX: u16 = 4094;

/// Tag control information of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanTag {
    pub vid: u16,
    pub pcp: u8,
}

impl VlanTag {
    fn tci(&self) -> u16 {
        ((self.pcp as u16 & 0x7) << 13) | (self.vid & VLAN_VID_MASK)
    }

    fn from_tci(tci: u16) -> Self {
        Self {
            vid: tci & VLAN_VID_MASK,
            pcp: (tci >> 13) as u8,
        }
    }
}

/// Insert a tag into an Ethernet frame, between the source MAC and the type.
pub fn tag(pkt: &mut Packet, tag: VlanTag) -> Result<(), NetError> {
    if pkt.len() < ETH_HEADER_LEN {
        return Err(NetError::InvalidArgument);
    }
    pkt.push_header(VLAN_TAG_LEN)?;
    let data = pkt.data_mut();
    data.copy_within(VLAN_TAG_LEN..VLAN_TAG_LEN + ETH_TYPE_OFFSET, 0);
    data[12..14].copy_from_slice(&EtherType::Vlan.as_u16().to_be_bytes());
    data[14..16].copy_from_slice(&tag.tci().to_be_bytes());
    Ok(())
}

/// Remove the tag of a tagged Ethernet frame and return it.
pub fn untag(pkt: &mut Packet) -> Option<VlanTag> {
    let data = pkt.data_mut();
    if data.len() < ETH_HEADER_LEN + VLAN_TAG_LEN {
        return None;
    }
    if u16::from_be_bytes([data[12], data[13]]) != EtherType::Vlan.as_u16() {
        return None;
    }
    let tag = VlanTag::from_tci(u16::from_be_bytes([data[14], data[15]]));
    data.copy_within(0..ETH_TYPE_OFFSET, VLAN_TAG_LEN);
    pkt.increment_layer_begin(VLAN_TAG_LEN).ok()?;
    Some(tag)
}

/// Receives untagged frames of one VLAN.
pub type VlanReceiver = Box<dyn FnMut(Packet)>;

#[derive(Default)]
pub struct VlanManager {
    links: BTreeMap<u16, VlanReceiver>,
    dropped: u64,
}

impl VlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vid: u16, rx: impl FnMut(Packet) + 'static) -> Result<(), NetError> {
        if vid == 0 || vid > VLAN_VID_MAX {
            return Err(NetError::InvalidArgument);
        }
        if self.links.contains_key(&vid) {
            return Err(NetError::AddressInUse);
        }
        self.links.insert(vid, Box::new(rx));
        klog_debug!("vlan: registered id {}", vid);
        Ok(())
    }

    pub fn remove(&mut self, vid: u16) -> bool {
        self.links.remove(&vid).is_some()
    }

    pub fn contains(&self, vid: u16) -> bool {
        self.links.contains_key(&vid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Frames dropped for a malformed tag or an unregistered id.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// A tagged frame, `layer_begin` at its Ethernet header.
    pub fn receive(&mut self, mut pkt: Packet) {
        let Some(tag) = untag(&mut pkt) else {
            klog_debug!("vlan: malformed tag, dropping");
            self.dropped += 1;
            return;
        };
        match self.links.get_mut(&tag.vid) {
            Some(rx) => rx(pkt),
            None => {
                klog_debug!("vlan: no interface for id {}, dropping", tag.vid);
                self.dropped += 1;
            }
        }
    }
}

/// A VLAN interface over a physical device.
pub struct VlanNic {
    parent: Rc<dyn Nic>,
    tag: VlanTag,
}

impl VlanNic {
    pub fn new(parent: Rc<dyn Nic>, vid: u16) -> Result<Self, NetError> {
        if vid == 0 || vid > VLAN_VID_MAX {
            return Err(NetError::InvalidArgument);
        }
        Ok(Self {
            parent,
            tag: VlanTag { vid, pcp: 0 },
        })
    }

    #[inline]
    pub fn vid(&self) -> u16 {
        self.tag.vid
    }
}

impl Nic for VlanNic {
    fn transmit(&self, mut pkt: Packet) -> Result<(), NetError> {
        if !self.parent.features().contains(NicFeatures::VLAN_TAG) {
            tag(&mut pkt, self.tag)?;
        }
        self.parent.transmit(pkt)
    }

    fn transmit_queue_available(&self) -> usize {
        self.parent.transmit_queue_available()
    }

    fn mtu(&self) -> u16 {
        self.parent.mtu()
    }

    fn mac(&self) -> MacAddr {
        self.parent.mac()
    }

    fn stats(&self) -> NicStats {
        self.parent.stats()
    }

    fn is_up(&self) -> bool {
        self.parent.is_up()
    }

    fn buffer_store(&self) -> &Rc<BufferStore> {
        self.parent.buffer_store()
    }
}
