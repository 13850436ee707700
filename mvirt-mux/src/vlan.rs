//! 802.1Q tag handling.
//!
//! A VIF with a non-zero VLAN id inserts a tag after the source address of
//! every outbound frame. Inbound tags are stripped before the frame is
//! indicated and handed to the upper edge as [`TagInfo`].

use smoltcp::wire::EthernetFrame;
use thiserror::Error;

use crate::error::{MuxError, Result};

/// Tag protocol identifier.
pub const TPID: u16 = 0x8100;
/// Size of the tag inserted after the source address.
pub const VLAN_TAG_LEN: usize = 4;
/// Destination + source + ethertype.
pub const ETH_HEADER_LEN: usize = 14;
/// Largest untagged Ethernet frame without FCS.
pub const ETH_MAX_FRAME_LEN: usize = 1514;

const ADDRS_LEN: usize = 12;
const VLAN_ID_MASK: u16 = 0x0fff;
const CFI_BIT: u16 = 0x1000;

/// Tag control information of an 802.1Q header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagInfo {
    /// User priority, 0..=7.
    pub priority: u8,
    /// Canonical format indicator. Frames with it set are not supported.
    pub cfi: bool,
    pub vlan_id: u16,
}

impl TagInfo {
    pub fn new(priority: u8, vlan_id: u16) -> Self {
        Self {
            priority: priority & 0x07,
            cfi: false,
            vlan_id: vlan_id & VLAN_ID_MASK,
        }
    }

    pub fn from_tci(tci: u16) -> Self {
        Self {
            priority: (tci >> 13) as u8,
            cfi: tci & CFI_BIT != 0,
            vlan_id: tci & VLAN_ID_MASK,
        }
    }

    pub fn tci(&self) -> u16 {
        (u16::from(self.priority & 0x07) << 13)
            | if self.cfi { CFI_BIT } else { 0 }
            | (self.vlan_id & VLAN_ID_MASK)
    }
}

/// Why an inbound tag was refused by a VIF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("tag carries routing information")]
    Format,
    #[error("tag vlan id {found} does not match {expected}")]
    VlanId { expected: u16, found: u16 },
}

/// Prepare an outbound frame for a VIF configured with `vlan_id`.
///
/// With `vlan_id == 0` the frame is passed through untouched. Otherwise the
/// requested tag (if any) must not carry CFI and its VLAN id must be zero or
/// equal to `vlan_id`; the returned frame carries a tag with the requested
/// priority and the VIF's VLAN id.
pub fn tag_outbound(frame: Vec<u8>, vlan_id: u16, requested: Option<TagInfo>) -> Result<Vec<u8>> {
    if vlan_id == 0 {
        return Ok(frame);
    }

    let requested = requested.unwrap_or_default();
    if requested.cfi {
        return Err(MuxError::InvalidPacket("tag with canonical format id"));
    }
    if requested.vlan_id != 0 && requested.vlan_id != vlan_id {
        return Err(MuxError::InvalidPacket("tag vlan id mismatch"));
    }
    if frame.len() < ETH_HEADER_LEN {
        return Err(MuxError::InvalidPacket("frame shorter than ethernet header"));
    }

    let tag = TagInfo::new(requested.priority, vlan_id);
    let mut tagged = Vec::with_capacity(frame.len() + VLAN_TAG_LEN);
    tagged.extend_from_slice(&frame[..ADDRS_LEN]);
    tagged.extend_from_slice(&TPID.to_be_bytes());
    tagged.extend_from_slice(&tag.tci().to_be_bytes());
    tagged.extend_from_slice(&frame[ADDRS_LEN..]);
    Ok(tagged)
}

/// Read the 802.1Q tag of an inbound frame, if it has one.
pub fn peek_tag(frame: &[u8]) -> Option<TagInfo> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if u16::from(eth.ethertype()) != TPID {
        return None;
    }
    let tci = frame.get(ETH_HEADER_LEN..ETH_HEADER_LEN + 2)?;
    Some(TagInfo::from_tci(u16::from_be_bytes([tci[0], tci[1]])))
}

/// Check whether a VIF configured with `vlan_id` accepts an inbound tag.
pub fn accept_inbound(tag: &TagInfo, vlan_id: u16) -> std::result::Result<(), TagError> {
    if tag.cfi {
        return Err(TagError::Format);
    }
    if tag.vlan_id != 0 && vlan_id != 0 && tag.vlan_id != vlan_id {
        return Err(TagError::VlanId {
            expected: vlan_id,
            found: tag.vlan_id,
        });
    }
    Ok(())
}

/// Copy of `frame` with its tag removed. Untagged frames are copied as-is.
pub fn strip_tag(frame: &[u8]) -> Vec<u8> {
    if peek_tag(frame).is_none() || frame.len() < ETH_HEADER_LEN + VLAN_TAG_LEN {
        return frame.to_vec();
    }
    let mut out = Vec::with_capacity(frame.len() - VLAN_TAG_LEN);
    out.extend_from_slice(&frame[..ADDRS_LEN]);
    out.extend_from_slice(&frame[ADDRS_LEN + VLAN_TAG_LEN..]);
    out
}
