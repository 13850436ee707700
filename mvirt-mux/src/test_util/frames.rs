//! Ethernet frame builders for tests.
//!
//! Uses smoltcp for header construction, matching the forwarder's parser.

use smoltcp::wire::{EthernetFrame, EthernetProtocol, EthernetRepr};

use crate::mac::MacAddr;
use crate::vlan::{TPID, TagInfo};

/// IPv4 ethertype
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Build an untagged Ethernet frame.
pub fn ethernet_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src.into(),
        dst_addr: dst.into(),
        ethertype: EthernetProtocol::from(ethertype),
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buf
}

/// Build an IPv4-typed frame with `payload`.
pub fn ipv4_frame(dst: MacAddr, src: MacAddr, payload: &[u8]) -> Vec<u8> {
    ethernet_frame(dst, src, ETHERTYPE_IPV4, payload)
}

/// Build an 802.1Q tagged frame carrying `ethertype` after the tag.
pub fn tagged_frame(
    dst: MacAddr,
    src: MacAddr,
    tag: TagInfo,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.extend_from_slice(&tag.tci().to_be_bytes());
    inner.extend_from_slice(&ethertype.to_be_bytes());
    inner.extend_from_slice(payload);
    ethernet_frame(dst, src, TPID, &inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vlan::{peek_tag, strip_tag};

    #[test]
    fn test_tagged_frame_strips_to_untagged() {
        let dst = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let src = MacAddr([0x02, 0, 0, 0, 0, 2]);
        let tagged = tagged_frame(dst, src, TagInfo::new(2, 7), ETHERTYPE_IPV4, &[1, 2]);
        assert_eq!(peek_tag(&tagged), Some(TagInfo::new(2, 7)));
        assert_eq!(strip_tag(&tagged), ipv4_frame(dst, src, &[1, 2]));
    }
}
