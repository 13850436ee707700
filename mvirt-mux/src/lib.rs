pub mod binding;
pub mod config;
pub mod error;
pub mod filter;
pub mod forward;
pub mod lower;
pub mod mac;
pub mod mux;
pub mod oid;
pub mod registry;
pub mod request;
pub mod stats;
pub mod sync;
pub mod test_util;
pub mod vif;
pub mod vlan;

pub use binding::{Binding, BindingId, BindingRef, BootstrapReport, Capabilities};
pub use config::{BindingConfig, MuxConfig, VifDefinition};
pub use error::{MuxError, Result};
pub use filter::PacketFilter;
pub use forward::OutboundFrame;
pub use lower::{FrameCookie, LowerBinding, LowerOpener};
pub use mac::MacAddr;
pub use mux::Multiplexer;
pub use oid::{Oid, Request, RequestOutcome};
pub use registry::BindingRegistry;
pub use request::{Completion, RequestStatus};
pub use stats::Statistic;
pub use vif::{ReceivedFrame, Vif, VifHandler, VifId, VifState};
