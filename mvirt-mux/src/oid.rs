//! Control request identifiers and local request handling.
//!
//! Most queries against a VIF are answered from the VIF's own state. A small
//! set (link speed, media connect status, PnP capabilities and wake-up
//! patterns) is forwarded to the lower binding through the request
//! forwarder.

use std::fmt;
use std::sync::Arc;

use crate::error::{MuxError, Result};
use crate::filter::{MAX_MULTICAST_LIST, MulticastList, PacketFilter};
use crate::lower::{DevicePowerState, Medium};
use crate::mac::DEFAULT_VENDOR_PREFIX;
use crate::stats::Statistic;
use crate::vif::Vif;
use crate::vlan::{ETH_HEADER_LEN, ETH_MAX_FRAME_LEN, VLAN_TAG_LEN};

/// Object identifier of a control request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const GEN_SUPPORTED_LIST: Oid = Oid(0x0001_0101);
    pub const GEN_HARDWARE_STATUS: Oid = Oid(0x0001_0102);
    pub const GEN_MEDIA_SUPPORTED: Oid = Oid(0x0001_0103);
    pub const GEN_MEDIA_IN_USE: Oid = Oid(0x0001_0104);
    pub const GEN_MAXIMUM_LOOKAHEAD: Oid = Oid(0x0001_0105);
    pub const GEN_MAXIMUM_FRAME_SIZE: Oid = Oid(0x0001_0106);
    pub const GEN_LINK_SPEED: Oid = Oid(0x0001_0107);
    pub const GEN_VENDOR_ID: Oid = Oid(0x0001_010c);
    pub const GEN_CURRENT_PACKET_FILTER: Oid = Oid(0x0001_010e);
    pub const GEN_CURRENT_LOOKAHEAD: Oid = Oid(0x0001_010f);
    pub const GEN_DRIVER_VERSION: Oid = Oid(0x0001_0110);
    pub const GEN_MAXIMUM_TOTAL_SIZE: Oid = Oid(0x0001_0111);
    pub const GEN_MAC_OPTIONS: Oid = Oid(0x0001_0113);
    pub const GEN_MEDIA_CONNECT_STATUS: Oid = Oid(0x0001_0114);
    pub const GEN_MAXIMUM_SEND_PACKETS: Oid = Oid(0x0001_0115);
    pub const GEN_VLAN_ID: Oid = Oid(0x0001_021c);

    pub const GEN_XMIT_OK: Oid = Oid(0x0002_0101);
    pub const GEN_RCV_OK: Oid = Oid(0x0002_0102);
    pub const GEN_XMIT_ERROR: Oid = Oid(0x0002_0103);
    pub const GEN_RCV_ERROR: Oid = Oid(0x0002_0104);
    pub const GEN_RCV_NO_BUFFER: Oid = Oid(0x0002_0105);

    pub const ETH_PERMANENT_ADDRESS: Oid = Oid(0x0101_0101);
    pub const ETH_CURRENT_ADDRESS: Oid = Oid(0x0101_0102);
    pub const ETH_MULTICAST_LIST: Oid = Oid(0x0101_0103);
    pub const ETH_MAXIMUM_LIST_SIZE: Oid = Oid(0x0101_0104);

    pub const PNP_CAPABILITIES: Oid = Oid(0xfd01_0100);
    pub const PNP_SET_POWER: Oid = Oid(0xfd01_0101);
    pub const PNP_QUERY_POWER: Oid = Oid(0xfd01_0102);
    pub const PNP_ADD_WAKE_UP_PATTERN: Oid = Oid(0xfd01_0103);
    pub const PNP_REMOVE_WAKE_UP_PATTERN: Oid = Oid(0xfd01_0104);
    pub const PNP_WAKE_UP_PATTERN_LIST: Oid = Oid(0xfd01_0105);
    pub const PNP_ENABLE_WAKE_UP: Oid = Oid(0xfd01_0106);

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Oid::GEN_SUPPORTED_LIST => "GEN_SUPPORTED_LIST",
            Oid::GEN_HARDWARE_STATUS => "GEN_HARDWARE_STATUS",
            Oid::GEN_MEDIA_SUPPORTED => "GEN_MEDIA_SUPPORTED",
            Oid::GEN_MEDIA_IN_USE => "GEN_MEDIA_IN_USE",
            Oid::GEN_MAXIMUM_LOOKAHEAD => "GEN_MAXIMUM_LOOKAHEAD",
            Oid::GEN_MAXIMUM_FRAME_SIZE => "GEN_MAXIMUM_FRAME_SIZE",
            Oid::GEN_LINK_SPEED => "GEN_LINK_SPEED",
            Oid::GEN_VENDOR_ID => "GEN_VENDOR_ID",
            Oid::GEN_CURRENT_PACKET_FILTER => "GEN_CURRENT_PACKET_FILTER",
            Oid::GEN_CURRENT_LOOKAHEAD => "GEN_CURRENT_LOOKAHEAD",
            Oid::GEN_DRIVER_VERSION => "GEN_DRIVER_VERSION",
            Oid::GEN_MAXIMUM_TOTAL_SIZE => "GEN_MAXIMUM_TOTAL_SIZE",
            Oid::GEN_MAC_OPTIONS => "GEN_MAC_OPTIONS",
            Oid::GEN_MEDIA_CONNECT_STATUS => "GEN_MEDIA_CONNECT_STATUS",
            Oid::GEN_MAXIMUM_SEND_PACKETS => "GEN_MAXIMUM_SEND_PACKETS",
            Oid::GEN_VLAN_ID => "GEN_VLAN_ID",
            Oid::GEN_XMIT_OK => "GEN_XMIT_OK",
            Oid::GEN_RCV_OK => "GEN_RCV_OK",
            Oid::GEN_XMIT_ERROR => "GEN_XMIT_ERROR",
            Oid::GEN_RCV_ERROR => "GEN_RCV_ERROR",
            Oid::GEN_RCV_NO_BUFFER => "GEN_RCV_NO_BUFFER",
            Oid::ETH_PERMANENT_ADDRESS => "802_3_PERMANENT_ADDRESS",
            Oid::ETH_CURRENT_ADDRESS => "802_3_CURRENT_ADDRESS",
            Oid::ETH_MULTICAST_LIST => "802_3_MULTICAST_LIST",
            Oid::ETH_MAXIMUM_LIST_SIZE => "802_3_MAXIMUM_LIST_SIZE",
            Oid::PNP_CAPABILITIES => "PNP_CAPABILITIES",
            Oid::PNP_SET_POWER => "PNP_SET_POWER",
            Oid::PNP_QUERY_POWER => "PNP_QUERY_POWER",
            Oid::PNP_ADD_WAKE_UP_PATTERN => "PNP_ADD_WAKE_UP_PATTERN",
            Oid::PNP_REMOVE_WAKE_UP_PATTERN => "PNP_REMOVE_WAKE_UP_PATTERN",
            Oid::PNP_WAKE_UP_PATTERN_LIST => "PNP_WAKE_UP_PATTERN_LIST",
            Oid::PNP_ENABLE_WAKE_UP => "PNP_ENABLE_WAKE_UP",
            _ => return None,
        })
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({self})")
    }
}

/// OIDs a VIF reports in `GEN_SUPPORTED_LIST`.
pub const SUPPORTED_OIDS: &[Oid] = &[
    Oid::GEN_SUPPORTED_LIST,
    Oid::GEN_HARDWARE_STATUS,
    Oid::GEN_MEDIA_SUPPORTED,
    Oid::GEN_MEDIA_IN_USE,
    Oid::GEN_MAXIMUM_LOOKAHEAD,
    Oid::GEN_MAXIMUM_FRAME_SIZE,
    Oid::GEN_LINK_SPEED,
    Oid::GEN_VENDOR_ID,
    Oid::GEN_CURRENT_PACKET_FILTER,
    Oid::GEN_CURRENT_LOOKAHEAD,
    Oid::GEN_DRIVER_VERSION,
    Oid::GEN_MAXIMUM_TOTAL_SIZE,
    Oid::GEN_MAC_OPTIONS,
    Oid::GEN_MEDIA_CONNECT_STATUS,
    Oid::GEN_MAXIMUM_SEND_PACKETS,
    Oid::GEN_VLAN_ID,
    Oid::GEN_XMIT_OK,
    Oid::GEN_RCV_OK,
    Oid::GEN_XMIT_ERROR,
    Oid::GEN_RCV_ERROR,
    Oid::GEN_RCV_NO_BUFFER,
    Oid::ETH_PERMANENT_ADDRESS,
    Oid::ETH_CURRENT_ADDRESS,
    Oid::ETH_MULTICAST_LIST,
    Oid::ETH_MAXIMUM_LIST_SIZE,
    Oid::PNP_CAPABILITIES,
    Oid::PNP_SET_POWER,
    Oid::PNP_QUERY_POWER,
    Oid::PNP_ADD_WAKE_UP_PATTERN,
    Oid::PNP_REMOVE_WAKE_UP_PATTERN,
    Oid::PNP_ENABLE_WAKE_UP,
];

/// Vendor id reported by every VIF (the generated-address prefix).
pub const VENDOR_ID: u32 = u32::from_be_bytes([
    0,
    DEFAULT_VENDOR_PREFIX[0],
    DEFAULT_VENDOR_PREFIX[1],
    DEFAULT_VENDOR_PREFIX[2],
]);
/// Major version in the high byte, minor in the low byte.
pub const DRIVER_VERSION: u16 = 0x0001;
/// Frames the upper edge may hand over in one `send_frames` call.
pub const MAX_SEND_PACKETS: u32 = 10;

const HARDWARE_STATUS_READY: u32 = 0;

/// MAC option bits reported by a VIF.
pub mod mac_options {
    pub const COPY_LOOKAHEAD_DATA: u32 = 0x0001;
    pub const TRANSFERS_NOT_PEND: u32 = 0x0004;
    pub const NO_LOOPBACK: u32 = 0x0008;
    pub const PRIORITY_8021P: u32 = 0x0040;
    pub const VLAN_8021Q: u32 = 0x0200;
}

/// Query or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Query,
    Set,
}

/// One control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `oid` into a buffer of `len` bytes.
    Query { oid: Oid, len: usize },
    /// Write `data` to `oid`.
    Set { oid: Oid, data: Vec<u8> },
}

impl Request {
    pub fn query(oid: Oid, len: usize) -> Self {
        Request::Query { oid, len }
    }

    pub fn set(oid: Oid, data: impl Into<Vec<u8>>) -> Self {
        Request::Set {
            oid,
            data: data.into(),
        }
    }

    pub fn set_u32(oid: Oid, value: u32) -> Self {
        Request::set(oid, value.to_le_bytes())
    }

    pub fn oid(&self) -> Oid {
        match self {
            Request::Query { oid, .. } | Request::Set { oid, .. } => *oid,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Query { .. } => RequestKind::Query,
            Request::Set { .. } => RequestKind::Set,
        }
    }
}

/// Successful result of a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub oid: Oid,
    /// Answer of a query. Empty for sets.
    pub data: Vec<u8>,
    /// Bytes written (query) or read (set).
    pub bytes: usize,
}

impl RequestOutcome {
    pub fn answered(oid: Oid, data: Vec<u8>) -> Self {
        let bytes = data.len();
        Self { oid, data, bytes }
    }

    pub fn accepted(oid: Oid, bytes: usize) -> Self {
        Self {
            oid,
            data: Vec::new(),
            bytes,
        }
    }

    /// First four bytes of the answer as a little-endian `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Layout of a PnP capabilities answer: flags followed by the minimum
/// device states for magic packet, pattern and link change wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpCapabilities {
    pub flags: u32,
    pub min_magic_packet_wake_up: DevicePowerState,
    pub min_pattern_wake_up: DevicePowerState,
    pub min_link_change_wake_up: DevicePowerState,
}

impl PnpCapabilities {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let word = |i: usize| -> Option<u32> {
            let bytes: [u8; 4] = buf.get(i * 4..i * 4 + 4)?.try_into().ok()?;
            Some(u32::from_le_bytes(bytes))
        };
        Some(Self {
            flags: word(0)?,
            min_magic_packet_wake_up: DevicePowerState::from_raw(word(1)?),
            min_pattern_wake_up: DevicePowerState::from_raw(word(2)?),
            min_link_change_wake_up: DevicePowerState::from_raw(word(3)?),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(self.min_magic_packet_wake_up as u32).to_le_bytes());
        out.extend_from_slice(&(self.min_pattern_wake_up as u32).to_le_bytes());
        out.extend_from_slice(&(self.min_link_change_wake_up as u32).to_le_bytes());
        out
    }

    /// VIFs cannot wake the system, so every minimum wake-up state is
    /// reported as unspecified.
    pub fn without_wake_up(mut self) -> Self {
        self.min_magic_packet_wake_up = DevicePowerState::Unspecified;
        self.min_pattern_wake_up = DevicePowerState::Unspecified;
        self.min_link_change_wake_up = DevicePowerState::Unspecified;
        self
    }
}

/// Result of handling a query locally.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QueryAction {
    Answer(Vec<u8>),
    Forward,
}

/// Result of handling a set locally.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SetAction {
    Done { bytes_read: usize },
    /// Forward to the lower binding with the (possibly rewritten) payload.
    Forward(Vec<u8>),
}

fn u32_answer(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// 64-bit counters are truncated to 32 bits when the caller offers a
/// buffer shorter than eight bytes.
fn counter_answer(value: u64, len: usize) -> Vec<u8> {
    if len >= 8 || len == 0 {
        value.to_le_bytes().to_vec()
    } else {
        (value as u32).to_le_bytes().to_vec()
    }
}

fn read_u32(data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| MuxError::InvalidLength { needed: 4 })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Answer a query from VIF state, or decide it must be forwarded.
pub(crate) fn query_local(vif: &Vif, oid: Oid, len: usize) -> Result<QueryAction> {
    let answer = match oid {
        Oid::GEN_SUPPORTED_LIST => SUPPORTED_OIDS
            .iter()
            .flat_map(|o| o.0.to_le_bytes())
            .collect(),
        Oid::GEN_HARDWARE_STATUS => u32_answer(HARDWARE_STATUS_READY),
        Oid::GEN_MEDIA_SUPPORTED | Oid::GEN_MEDIA_IN_USE => u32_answer(Medium::Ethernet as u32),
        Oid::GEN_CURRENT_LOOKAHEAD | Oid::GEN_MAXIMUM_LOOKAHEAD => {
            u32_answer(vif.lookahead().saturating_sub(ETH_HEADER_LEN as u32))
        }
        Oid::GEN_MAXIMUM_FRAME_SIZE => {
            u32_answer((ETH_MAX_FRAME_LEN - ETH_HEADER_LEN - VLAN_TAG_LEN) as u32)
        }
        Oid::GEN_MAXIMUM_TOTAL_SIZE => u32_answer((ETH_MAX_FRAME_LEN - VLAN_TAG_LEN) as u32),
        Oid::GEN_MAC_OPTIONS => u32_answer(
            mac_options::COPY_LOOKAHEAD_DATA
                | mac_options::TRANSFERS_NOT_PEND
                | mac_options::NO_LOOPBACK
                | mac_options::PRIORITY_8021P
                | mac_options::VLAN_8021Q,
        ),
        Oid::GEN_VENDOR_ID => u32_answer(VENDOR_ID),
        Oid::GEN_DRIVER_VERSION => DRIVER_VERSION.to_le_bytes().to_vec(),
        Oid::ETH_PERMANENT_ADDRESS => vif.permanent_address().octets().to_vec(),
        Oid::ETH_CURRENT_ADDRESS => vif.current_address().octets().to_vec(),
        Oid::ETH_MAXIMUM_LIST_SIZE => u32_answer(MAX_MULTICAST_LIST as u32),
        Oid::ETH_MULTICAST_LIST => vif
            .multicast_list()
            .iter()
            .flat_map(|m| m.octets())
            .collect(),
        Oid::GEN_CURRENT_PACKET_FILTER => u32_answer(vif.packet_filter().bits()),
        Oid::GEN_MAXIMUM_SEND_PACKETS => u32_answer(MAX_SEND_PACKETS),
        Oid::PNP_QUERY_POWER => Vec::new(),
        Oid::GEN_XMIT_OK => counter_answer(vif.stats().get(Statistic::GoodTransmits), len),
        Oid::GEN_RCV_OK => counter_answer(vif.stats().get(Statistic::GoodReceives), len),
        Oid::GEN_XMIT_ERROR => u32_answer(vif.stats().get(Statistic::TransmitErrors) as u32),
        Oid::GEN_RCV_ERROR => u32_answer(vif.stats().receive_errors() as u32),
        Oid::GEN_RCV_NO_BUFFER => {
            u32_answer(vif.stats().get(Statistic::ReceiveResourceErrors) as u32)
        }
        Oid::GEN_VLAN_ID => u32_answer(u32::from(vif.vlan_id())),
        Oid::GEN_LINK_SPEED
        | Oid::GEN_MEDIA_CONNECT_STATUS
        | Oid::PNP_CAPABILITIES
        | Oid::PNP_WAKE_UP_PATTERN_LIST => return Ok(QueryAction::Forward),
        _ => return Err(MuxError::InvalidOid(oid)),
    };

    if answer.len() > len {
        return Err(MuxError::BufferTooShort {
            needed: answer.len(),
        });
    }
    Ok(QueryAction::Answer(answer))
}

/// Apply a set to VIF state, or decide it must be forwarded.
pub(crate) fn set_local(vif: &Arc<Vif>, oid: Oid, data: &[u8]) -> Result<SetAction> {
    match oid {
        Oid::PNP_ADD_WAKE_UP_PATTERN
        | Oid::PNP_REMOVE_WAKE_UP_PATTERN
        | Oid::PNP_ENABLE_WAKE_UP => Ok(SetAction::Forward(data.to_vec())),
        Oid::PNP_SET_POWER => {
            let raw = data
                .get(..4)
                .ok_or(MuxError::InvalidLength { needed: 4 })?;
            let state = DevicePowerState::from_raw(read_u32(raw)?);
            vif.set_power_state(state);
            Ok(SetAction::Done { bytes_read: 4 })
        }
        Oid::ETH_MULTICAST_LIST => {
            let addrs = MulticastList::parse(data)?;
            vif.set_multicast_list(&addrs)?;
            Ok(SetAction::Done {
                bytes_read: data.len(),
            })
        }
        Oid::GEN_CURRENT_PACKET_FILTER => {
            let filter = PacketFilter::from_raw(read_u32(data)?)?;
            vif.set_packet_filter(filter)?;
            Ok(SetAction::Done { bytes_read: 4 })
        }
        Oid::GEN_CURRENT_LOOKAHEAD => {
            // The lower binding must include the tag in the lookahead.
            let lookahead = read_u32(data)?.saturating_add(VLAN_TAG_LEN as u32);
            Ok(SetAction::Forward(lookahead.to_le_bytes().to_vec()))
        }
        Oid::GEN_VLAN_ID => {
            let vlan_id = read_u32(data)?;
            vif.set_vlan_id((vlan_id & 0x0fff) as u16);
            Ok(SetAction::Done { bytes_read: 4 })
        }
        _ => Err(MuxError::InvalidOid(oid)),
    }
}
