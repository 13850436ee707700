//! Software hub adapter.
//!
//! Every frame sent through a [`LoopbackAdapter`] completes successfully and
//! is re-indicated into the same binding from a worker thread, so the VIFs
//! of one binding can reach each other. The sender does not see its own
//! frames (see `indicate_frame`'s source address check).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::{
    DevicePowerState, LowerBinding, LowerError, LowerFrame, LowerInfo, LowerOpener, LowerResult,
    MediaStatus, Medium, RequestDone,
};
use crate::binding::Binding;
use crate::mac::generate_station_address;
use crate::oid::{Oid, PnpCapabilities, Request, RequestOutcome};
use crate::vlan::ETH_MAX_FRAME_LEN;

/// Vendor prefix of loopback adapter addresses.
const LOOPBACK_PREFIX: [u8; 3] = [0x02, 0x4c, 0x42];
/// 10 Gbit/s in units of 100 bit/s.
const LOOPBACK_LINK_SPEED: u32 = 100_000_000;
/// Frames queued towards the worker before sends start failing.
const QUEUE_DEPTH: usize = 1024;

pub struct LoopbackAdapter {
    name: String,
    info: LowerInfo,
    filter: AtomicU32,
    lookahead: AtomicU32,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    frames: AtomicU64,
}

impl LoopbackAdapter {
    pub fn new(name: &str, seed: u32) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        Arc::new(Self {
            name: name.to_string(),
            info: LowerInfo {
                medium: Medium::Ethernet,
                link_speed: LOOPBACK_LINK_SPEED,
                max_lookahead: ETH_MAX_FRAME_LEN as u32,
                current_address: generate_station_address(seed, LOOPBACK_PREFIX),
            },
            filter: AtomicU32::new(0),
            lookahead: AtomicU32::new(ETH_MAX_FRAME_LEN as u32),
            tx: Mutex::new(Some(tx)),
            rx,
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
            frames: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packet filter last set by the binding.
    pub fn packet_filter(&self) -> u32 {
        self.filter.load(Ordering::Relaxed)
    }

    /// Frames accepted for sending so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn answer(&self, request: &Request) -> LowerResult<RequestOutcome> {
        let unsupported = |oid: Oid| LowerError::Request {
            oid,
            reason: "not supported".into(),
        };
        match request {
            Request::Query { oid, len } => {
                let data = match *oid {
                    Oid::GEN_LINK_SPEED => self.info.link_speed.to_le_bytes().to_vec(),
                    Oid::GEN_MAXIMUM_LOOKAHEAD => self.info.max_lookahead.to_le_bytes().to_vec(),
                    Oid::GEN_CURRENT_LOOKAHEAD => {
                        self.lookahead.load(Ordering::Relaxed).to_le_bytes().to_vec()
                    }
                    Oid::ETH_CURRENT_ADDRESS | Oid::ETH_PERMANENT_ADDRESS => {
                        self.info.current_address.octets().to_vec()
                    }
                    Oid::GEN_MEDIA_CONNECT_STATUS => {
                        (MediaStatus::Connected as u32).to_le_bytes().to_vec()
                    }
                    Oid::PNP_CAPABILITIES => PnpCapabilities {
                        flags: 0,
                        min_magic_packet_wake_up: DevicePowerState::D3,
                        min_pattern_wake_up: DevicePowerState::D3,
                        min_link_change_wake_up: DevicePowerState::D3,
                    }
                    .to_bytes(),
                    Oid::PNP_WAKE_UP_PATTERN_LIST => Vec::new(),
                    other => return Err(unsupported(other)),
                };
                if data.len() > *len {
                    return Err(LowerError::Request {
                        oid: *oid,
                        reason: format!("buffer too short, {} bytes needed", data.len()),
                    });
                }
                Ok(RequestOutcome::answered(*oid, data))
            }
            Request::Set { oid, data } => {
                let value = <[u8; 4]>::try_from(data.as_slice())
                    .ok()
                    .map(u32::from_le_bytes);
                match (*oid, value) {
                    (Oid::GEN_CURRENT_PACKET_FILTER, Some(filter)) => {
                        self.filter.store(filter, Ordering::Relaxed);
                        debug!(adapter = %self.name, filter, "packet filter set");
                    }
                    (Oid::GEN_CURRENT_LOOKAHEAD, Some(lookahead)) => {
                        self.lookahead.store(lookahead, Ordering::Relaxed);
                    }
                    (
                        Oid::PNP_ADD_WAKE_UP_PATTERN
                        | Oid::PNP_REMOVE_WAKE_UP_PATTERN
                        | Oid::PNP_ENABLE_WAKE_UP,
                        _,
                    ) => {}
                    (oid, _) => return Err(unsupported(oid)),
                }
                Ok(RequestOutcome::accepted(*oid, data.len()))
            }
        }
    }
}

impl LowerBinding for LoopbackAdapter {
    fn query_info(&self) -> LowerResult<LowerInfo> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LowerError::Closed);
        }
        Ok(self.info.clone())
    }

    fn submit_request(&self, request: Request, done: RequestDone) {
        let result = if self.closed.load(Ordering::Acquire) {
            Err(LowerError::Closed)
        } else {
            self.answer(&request)
        };
        done(result);
    }

    fn submit_frames(&self, frames: Vec<LowerFrame>) {
        let tx = self.tx.lock().unwrap().clone();
        for mut frame in frames {
            let Some(tx) = &tx else {
                frame.complete(Err(LowerError::Closed));
                continue;
            };
            let data = std::mem::take(&mut frame.data);
            if self.filter.load(Ordering::Relaxed) != 0 && tx.try_send(data).is_err() {
                frame.complete(Err(LowerError::Send("loopback queue full".into())));
                continue;
            }
            self.frames.fetch_add(1, Ordering::Relaxed);
            frame.complete(Ok(()));
        }
    }

    fn close(&self) -> LowerResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(LowerError::Closed);
        }
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take()
            && worker.join().is_err()
        {
            warn!(adapter = %self.name, "loopback worker panicked");
        }
        info!(adapter = %self.name, frames = self.frames_sent(), "loopback adapter closed");
        Ok(())
    }

    fn attach(&self, binding: Weak<Binding>) {
        let rx = self.rx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("loopback-{}", self.name))
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let Some(binding) = binding.upgrade() else {
                        break;
                    };
                    binding.indicate_frame(&frame);
                }
            });
        match spawned {
            Ok(handle) => *self.worker.lock().unwrap() = Some(handle),
            Err(e) => warn!(adapter = %self.name, error = %e, "failed to spawn loopback worker"),
        }
    }
}

/// Opens a fresh [`LoopbackAdapter`] for every adapter name.
#[derive(Default)]
pub struct LoopbackOpener {
    opened: AtomicU32,
}

impl LoopbackOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LowerOpener for LoopbackOpener {
    fn open_binding(&self, adapter: &str) -> LowerResult<Arc<dyn LowerBinding>> {
        let seed = self.opened.fetch_add(1, Ordering::Relaxed);
        let lower = LoopbackAdapter::new(adapter, seed);
        info!(adapter, mac = %lower.info.current_address, "loopback adapter opened");
        Ok(lower)
    }
}
