//! Packet filters and multicast lists.
//!
//! Each VIF selects which frame classes it wants to receive. The binding
//! keeps the union of all VIF filters so it can tell cheaply whether a
//! frame can match anyone at all.

use bitflags::bitflags;

use crate::error::{MuxError, Result};
use crate::mac::{ETH_ADDR_LEN, MacAddr};

/// Maximum multicast addresses per VIF.
pub const MAX_MULTICAST_LIST: usize = 32;

bitflags! {
    /// Frame classes a VIF wants to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFilter: u32 {
        const DIRECTED = 0x0001;
        const MULTICAST = 0x0002;
        const ALL_MULTICAST = 0x0004;
        const BROADCAST = 0x0008;
        const PROMISCUOUS = 0x0020;
    }
}

impl PacketFilter {
    /// Filter pushed to the lower binding while any VIF has a non-zero
    /// filter. VIF addresses differ from the adapter's, so the lower
    /// binding has to see every frame.
    pub const LOWER_ACTIVE: PacketFilter = PacketFilter::PROMISCUOUS;

    /// Validate raw filter bits.
    pub fn from_raw(bits: u32) -> Result<Self> {
        PacketFilter::from_bits(bits)
            .ok_or(MuxError::FilterNotSupported(bits & !PacketFilter::all().bits()))
    }
}

/// Bounded list of multicast addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MulticastList {
    addrs: Vec<MacAddr>,
}

impl MulticastList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list. Fails without touching the current list if the new
    /// one exceeds [`MAX_MULTICAST_LIST`].
    pub fn set(&mut self, addrs: &[MacAddr]) -> Result<()> {
        if addrs.len() > MAX_MULTICAST_LIST {
            return Err(MuxError::MulticastFull {
                max: MAX_MULTICAST_LIST,
            });
        }
        self.addrs.clear();
        self.addrs.extend_from_slice(addrs);
        Ok(())
    }

    /// Parse a packed array of 6-byte addresses.
    pub fn parse(buf: &[u8]) -> Result<Vec<MacAddr>> {
        if buf.len() % ETH_ADDR_LEN != 0 {
            return Err(MuxError::InvalidLength {
                needed: ETH_ADDR_LEN,
            });
        }
        if buf.len() > MAX_MULTICAST_LIST * ETH_ADDR_LEN {
            return Err(MuxError::MulticastFull {
                max: MAX_MULTICAST_LIST,
            });
        }
        Ok(buf
            .chunks_exact(ETH_ADDR_LEN)
            .filter_map(MacAddr::from_slice)
            .collect())
    }

    pub fn contains(&self, addr: &MacAddr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn as_slice(&self) -> &[MacAddr] {
        &self.addrs
    }
}

/// Decide whether a frame with destination `dst` is received by a VIF with
/// the given filter, station address and multicast list.
pub fn frame_matches(
    filter: PacketFilter,
    station: MacAddr,
    multicast: &MulticastList,
    dst: MacAddr,
) -> bool {
    if filter.contains(PacketFilter::PROMISCUOUS) {
        return true;
    }

    if !dst.is_multicast() {
        return filter.contains(PacketFilter::DIRECTED) && dst == station;
    }

    if dst.is_broadcast() {
        return filter.contains(PacketFilter::BROADCAST);
    }

    filter.contains(PacketFilter::ALL_MULTICAST)
        || (filter.contains(PacketFilter::MULTICAST) && multicast.contains(&dst))
}
