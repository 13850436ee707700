//! Error types for the multiplexer core.

use thiserror::Error;

use crate::lower::LowerError;
use crate::mac::MacAddr;
use crate::oid::Oid;
use crate::vif::{VifId, VifState};

/// Errors reported synchronously by multiplexer operations, or carried
/// by asynchronous completions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// A forwarded request is already outstanding on this VIF.
    #[error("request already pending on {0}")]
    RequestPending(VifId),

    /// The VIF has started halting and admits no new work.
    #[error("{0} is halting")]
    Halting(VifId),

    /// The VIF is not in a state that accepts the operation yet.
    #[error("{0} is not initialized")]
    NotInitialized(VifId),

    /// The operation is not valid in the VIF's current state.
    #[error("{0} is {1}")]
    InvalidState(VifId, VifState),

    /// A VIF with this device key already exists on the binding.
    #[error("vif {0} already exists")]
    VifExists(String),

    /// Configured station address is not a usable unicast address.
    #[error("invalid station address {0}")]
    InvalidAddress(MacAddr),

    /// The VIF itself is in a low power state.
    #[error("adapter not ready")]
    AdapterNotReady,

    /// The adapter already has a binding.
    #[error("adapter {0} is already bound")]
    AdapterBound(String),

    /// No binding exists for the adapter.
    #[error("adapter {0} is not bound")]
    UnknownAdapter(String),

    /// The owning binding has gone away.
    #[error("binding is closing")]
    BindingClosing,

    /// A per-VIF pool or queue is exhausted.
    #[error("out of resources")]
    Resources,

    /// Packet filter contains bits this driver does not support.
    #[error("unsupported packet filter bits {0:#x}")]
    FilterNotSupported(u32),

    /// Multicast list exceeds the per-VIF bound.
    #[error("multicast list full (max {max} entries)")]
    MulticastFull { max: usize },

    /// Information buffer has the wrong size.
    #[error("invalid length, {needed} bytes needed")]
    InvalidLength { needed: usize },

    /// Query buffer is too small for the answer.
    #[error("buffer too short, {needed} bytes needed")]
    BufferTooShort { needed: usize },

    /// OID is not handled by the virtual interface.
    #[error("invalid oid {0}")]
    InvalidOid(Oid),

    /// OID is recognized but deliberately not supported.
    #[error("oid {0} not supported")]
    OidNotSupported(Oid),

    /// Outbound frame is malformed or carries a conflicting tag.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    /// The lower binding rejected or failed the operation.
    #[error("lower binding: {0}")]
    Lower(#[from] LowerError),
}

pub type Result<T> = std::result::Result<T, MuxError>;
