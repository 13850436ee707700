//! Test utilities for driving a binding without real hardware.
//!
//! - [`StubBinding`] / [`StubOpener`]: lower-binding doubles that record
//!   every submission and complete them automatically or on demand.
//! - [`RecordingHandler`]: upper-edge double that keeps indicated frames,
//!   send completions and status indications.
//! - [`frames`]: Ethernet frame builders.

pub mod frames;
pub mod handler;
pub mod stub;

pub use handler::{Indication, RecordingHandler};
pub use stub::{SentFrame, StubBinding, StubOpener};
