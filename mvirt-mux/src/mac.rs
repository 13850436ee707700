//! Station (MAC) addresses and locally-administered address generation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;

/// Length of an Ethernet station address.
pub const ETH_ADDR_LEN: usize = 6;

/// Default vendor prefix for generated addresses.
pub const DEFAULT_VENDOR_PREFIX: [u8; 3] = [0x02, 0x6d, 0x78];

/// Odd multiplier, so the seed mix is a bijection on 24 bits.
const SEED_MULTIPLIER: u32 = 0x9e_3779;
const SEED_XOR: u32 = 0x5a_c35a;
const LOW_24: u32 = 0x00ff_ffff;

/// A 48-bit Ethernet station address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; ETH_ADDR_LEN]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; ETH_ADDR_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ETH_ADDR_LEN] = bytes.get(..ETH_ADDR_LEN)?.try_into().ok()?;
        Some(MacAddr(arr))
    }

    pub fn octets(&self) -> [u8; ETH_ADDR_LEN] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl From<EthernetAddress> for MacAddr {
    fn from(addr: EthernetAddress) -> Self {
        MacAddr(addr.0)
    }
}

impl From<MacAddr> for EthernetAddress {
    fn from(addr: MacAddr) -> Self {
        EthernetAddress(addr.0)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

/// Error parsing a textual station address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != ETH_ADDR_LEN {
            return Err(ParseMacError(s.to_string()));
        }
        let mut mac = [0u8; ETH_ADDR_LEN];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseMacError(s.to_string()));
            }
            mac[i] = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(MacAddr(mac))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Derive a locally-administered unicast address from a VIF creation seed.
///
/// The low 24 bits of `seed` are mixed with a bijective function, so any
/// 2^24 consecutive seeds map to distinct addresses. The first octet of
/// `prefix` always gets the locally-administered bit set and the
/// multicast bit cleared.
pub fn generate_station_address(seed: u32, prefix: [u8; 3]) -> MacAddr {
    let mixed = ((seed & LOW_24).wrapping_mul(SEED_MULTIPLIER) & LOW_24) ^ SEED_XOR;
    MacAddr([
        (prefix[0] | 0x02) & !0x01,
        prefix[1],
        prefix[2],
        (mixed >> 16) as u8,
        (mixed >> 8) as u8,
        mixed as u8,
    ])
}
