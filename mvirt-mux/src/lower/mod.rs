//! Boundary with the lower (physical adapter) binding.
//!
//! The multiplexer never talks to hardware itself. Everything below a
//! [`Binding`] goes through a [`LowerBinding`]:
//! - control requests via `submit_request`, completed through a [`RequestDone`]
//! - frame batches via `submit_frames`, each frame completed through its
//!   own [`LowerFrame::complete`]
//! - inbound frames, status and power events are pushed back into the
//!   binding with [`Binding::indicate_receive`], [`Binding::indicate_status`]
//!   and [`Binding::set_power`]

pub mod loopback;

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use thiserror::Error;

use crate::binding::Binding;
use crate::forward::SendCompletion;
use crate::mac::MacAddr;
use crate::oid::{Oid, Request, RequestOutcome};
use crate::vif::VifId;

pub use loopback::{LoopbackAdapter, LoopbackOpener};

/// Errors reported by the lower binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("failed to open adapter {adapter}: {reason}")]
    Open { adapter: String, reason: String },

    #[error("adapter medium {0:?} is not supported")]
    UnsupportedMedium(Medium),

    #[error("adapter is closed")]
    Closed,

    #[error("request {oid} failed: {reason}")]
    Request { oid: Oid, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    /// The operation was dropped without being completed.
    #[error("operation aborted")]
    Aborted,
}

pub type LowerResult<T> = std::result::Result<T, LowerError>;

/// Link-layer medium of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Medium {
    Ethernet = 0,
    TokenRing = 1,
    Fddi = 2,
    Wan = 3,
    Wireless = 4,
}

/// Device power state. Anything above D0 is a low power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum DevicePowerState {
    Unspecified = 0,
    #[default]
    D0 = 1,
    D1 = 2,
    D2 = 3,
    D3 = 4,
}

impl DevicePowerState {
    /// Unknown raw values map to `Unspecified`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DevicePowerState::D0,
            2 => DevicePowerState::D1,
            3 => DevicePowerState::D2,
            4 => DevicePowerState::D3,
            _ => DevicePowerState::Unspecified,
        }
    }

    pub fn is_low_power(self) -> bool {
        self > DevicePowerState::D0
    }
}

/// Media connect status reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MediaStatus {
    Connected = 0,
    Disconnected = 1,
}

/// Capabilities of an adapter as queried at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerInfo {
    pub medium: Medium,
    /// Link speed in units of 100 bit/s.
    pub link_speed: u32,
    /// Largest lookahead the adapter can indicate.
    pub max_lookahead: u32,
    pub current_address: MacAddr,
}

bitflags! {
    /// Per-frame flags passed down with a send.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SendFlags: u32 {
        /// Do not loop the frame back to the sending binding.
        const NO_LOOPBACK = 0x0080;
    }
}

/// Continuation for a submitted request. Must be called exactly once.
pub type RequestDone = Box<dyn FnOnce(LowerResult<RequestOutcome>) + Send>;

/// Opaque cookie chosen by the upper edge to correlate send completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameCookie(pub u64);

impl fmt::Display for FrameCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// One frame handed to the lower binding.
///
/// Tagged with its originating VIF. Dropping it without calling
/// [`LowerFrame::complete`] completes it with [`LowerError::Aborted`].
pub struct LowerFrame {
    pub data: Vec<u8>,
    pub flags: SendFlags,
    completion: SendCompletion,
}

impl LowerFrame {
    pub(crate) fn new(data: Vec<u8>, flags: SendFlags, completion: SendCompletion) -> Self {
        Self {
            data,
            flags,
            completion,
        }
    }

    /// VIF the frame was sent on.
    pub fn source_vif(&self) -> VifId {
        self.completion.vif_id()
    }

    pub fn cookie(&self) -> FrameCookie {
        self.completion.cookie()
    }

    /// Report the result of the send back to the originating VIF.
    pub fn complete(self, result: LowerResult<()>) {
        self.completion.complete(result);
    }
}

impl fmt::Debug for LowerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerFrame")
            .field("vif", &self.source_vif())
            .field("cookie", &self.cookie())
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// The physical adapter binding below the multiplexer.
pub trait LowerBinding: Send + Sync {
    /// Query medium, speed, lookahead and address.
    fn query_info(&self) -> LowerResult<LowerInfo>;

    /// Issue a control request. `done` runs once the request completes,
    /// possibly before this call returns.
    fn submit_request(&self, request: Request, done: RequestDone);

    /// Hand a batch of frames to the adapter.
    fn submit_frames(&self, frames: Vec<LowerFrame>);

    /// Close the binding. No further calls are made afterwards.
    fn close(&self) -> LowerResult<()>;

    /// Called once the binding object exists, so the adapter can push
    /// inbound frames and events into it.
    fn attach(&self, _binding: Weak<Binding>) {}
}

/// Opens lower bindings by adapter name.
pub trait LowerOpener: Send + Sync {
    fn open_binding(&self, adapter: &str) -> LowerResult<Arc<dyn LowerBinding>>;
}
