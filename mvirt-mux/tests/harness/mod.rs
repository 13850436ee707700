//! Shared setup for integration tests.
//!
//! Builds a binding over a `StubBinding` and active VIFs with
//! `RecordingHandler`s attached.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mvirt_mux::test_util::frames::ipv4_frame;
use mvirt_mux::test_util::{RecordingHandler, StubBinding};
use mvirt_mux::{Binding, BindingRegistry, MacAddr, PacketFilter, Vif, VifDefinition};

/// Address of a host on the wire beyond the adapter.
pub const PEER: MacAddr = MacAddr([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

pub struct Setup {
    pub registry: Arc<BindingRegistry>,
    pub stub: Arc<StubBinding>,
    pub binding: Arc<Binding>,
}

pub fn setup() -> Setup {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Arc::new(BindingRegistry::new());
    let stub = StubBinding::new();
    let binding = Binding::create(&registry, "eth0", stub.clone()).expect("create binding");
    Setup {
        registry,
        stub,
        binding,
    }
}

/// Create and initialize a VIF receiving directed and broadcast frames.
pub fn active_vif_with(
    binding: &Arc<Binding>,
    def: VifDefinition,
    handler: Arc<RecordingHandler>,
) -> Arc<Vif> {
    let vif = binding.create_vif(&def).expect("create vif");
    vif.initialize(handler).expect("initialize vif");
    vif.set_packet_filter(PacketFilter::DIRECTED | PacketFilter::BROADCAST)
        .expect("set filter");
    vif
}

pub fn active_vif(binding: &Arc<Binding>, key: &str, handler: Arc<RecordingHandler>) -> Arc<Vif> {
    active_vif_with(binding, VifDefinition::new(key), handler)
}

/// A frame from the peer addressed to `vif`.
pub fn frame_to(vif: &Vif, payload: &[u8]) -> Vec<u8> {
    ipv4_frame(vif.current_address(), PEER, payload)
}

/// A frame from `vif` to the peer.
pub fn frame_from(vif: &Vif, payload: &[u8]) -> Vec<u8> {
    ipv4_frame(PEER, vif.current_address(), payload)
}

/// Poll `cond` until it holds or two seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
