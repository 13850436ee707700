//! Lower-binding doubles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::binding::Binding;
use crate::lower::{
    FrameCookie, LowerBinding, LowerError, LowerFrame, LowerInfo, LowerOpener, LowerResult,
    Medium, RequestDone, SendFlags,
};
use crate::mac::MacAddr;
use crate::oid::{Oid, Request, RequestOutcome};
use crate::vif::VifId;

/// Link speed reported by [`StubBinding::new`].
pub const STUB_LINK_SPEED: u32 = 100_000;
/// Lookahead reported by [`StubBinding::new`].
pub const STUB_MAX_LOOKAHEAD: u32 = 1514;
/// Station address reported by [`StubBinding::new`].
pub const STUB_ADDRESS: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// A frame as the stub saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub vif: VifId,
    pub cookie: FrameCookie,
    pub data: Vec<u8>,
    pub flags: SendFlags,
}

/// Lower binding double.
///
/// Records every request and frame. With auto-complete on (the default)
/// requests are answered and frames completed successfully before the
/// submit call returns; with it off they are held until the test completes
/// them.
pub struct StubBinding {
    info: LowerInfo,
    auto_complete: AtomicBool,
    answers: Mutex<HashMap<Oid, Vec<u8>>>,
    requests: Mutex<Vec<Request>>,
    held_requests: Mutex<VecDeque<(Request, RequestDone)>>,
    sent: Mutex<Vec<SentFrame>>,
    held_frames: Mutex<VecDeque<LowerFrame>>,
    closed: AtomicBool,
    binding: Mutex<Weak<Binding>>,
}

impl StubBinding {
    /// Ethernet adapter at 100000 (100 bit/s units).
    pub fn new() -> Arc<Self> {
        Self::with_info(LowerInfo {
            medium: Medium::Ethernet,
            link_speed: STUB_LINK_SPEED,
            max_lookahead: STUB_MAX_LOOKAHEAD,
            current_address: STUB_ADDRESS,
        })
    }

    pub fn with_medium(medium: Medium) -> Arc<Self> {
        Self::with_info(LowerInfo {
            medium,
            link_speed: STUB_LINK_SPEED,
            max_lookahead: STUB_MAX_LOOKAHEAD,
            current_address: STUB_ADDRESS,
        })
    }

    pub fn with_info(info: LowerInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            auto_complete: AtomicBool::new(true),
            answers: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            held_requests: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            held_frames: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            binding: Mutex::new(Weak::new()),
        })
    }

    /// Complete submissions immediately (`true`) or hold them (`false`).
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::SeqCst);
    }

    /// Answer queries for `oid` with `data`.
    pub fn set_answer(&self, oid: Oid, data: Vec<u8>) {
        self.answers.lock().unwrap().insert(oid, data);
    }

    /// Binding attached to this stub, if it is still alive.
    pub fn binding(&self) -> Option<Arc<Binding>> {
        self.binding.lock().unwrap().upgrade()
    }

    /// Every request submitted so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests submitted for `oid`.
    pub fn requests_for(&self, oid: Oid) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.oid() == oid)
            .cloned()
            .collect()
    }

    pub fn held_request_count(&self) -> usize {
        self.held_requests.lock().unwrap().len()
    }

    /// Complete the oldest held request with the stub's default answer.
    pub fn complete_next_request(&self) -> Option<Request> {
        let (request, done) = self.held_requests.lock().unwrap().pop_front()?;
        done(self.answer(&request));
        Some(request)
    }

    /// Complete the oldest held request with `result`.
    pub fn complete_next_request_with(
        &self,
        result: LowerResult<RequestOutcome>,
    ) -> Option<Request> {
        let (request, done) = self.held_requests.lock().unwrap().pop_front()?;
        done(result);
        Some(request)
    }

    /// Every frame submitted so far, in order.
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn held_frame_count(&self) -> usize {
        self.held_frames.lock().unwrap().len()
    }

    /// Complete every held frame with `result`. Returns how many.
    pub fn complete_frames(&self, result: LowerResult<()>) -> usize {
        let frames: Vec<_> = self.held_frames.lock().unwrap().drain(..).collect();
        let count = frames.len();
        for frame in frames {
            frame.complete(result.clone());
        }
        count
    }

    /// Drop every held frame without completing it.
    pub fn drop_frames(&self) -> usize {
        let frames: Vec<_> = self.held_frames.lock().unwrap().drain(..).collect();
        frames.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &Request) -> LowerResult<RequestOutcome> {
        match request {
            Request::Query { oid, len } => {
                let configured = self.answers.lock().unwrap().get(oid).cloned();
                let data = match (configured, *oid) {
                    (Some(data), _) => data,
                    (None, Oid::GEN_LINK_SPEED) => self.info.link_speed.to_le_bytes().to_vec(),
                    (None, Oid::GEN_MAXIMUM_LOOKAHEAD) => {
                        self.info.max_lookahead.to_le_bytes().to_vec()
                    }
                    (None, Oid::ETH_CURRENT_ADDRESS) => self.info.current_address.octets().to_vec(),
                    (None, _) => vec![0; (*len).min(4)],
                };
                Ok(RequestOutcome::answered(*oid, data))
            }
            Request::Set { oid, data } => Ok(RequestOutcome::accepted(*oid, data.len())),
        }
    }
}

impl LowerBinding for StubBinding {
    fn query_info(&self) -> LowerResult<LowerInfo> {
        if self.is_closed() {
            return Err(LowerError::Closed);
        }
        Ok(self.info.clone())
    }

    fn submit_request(&self, request: Request, done: RequestDone) {
        self.requests.lock().unwrap().push(request.clone());
        if self.auto_complete.load(Ordering::SeqCst) {
            done(self.answer(&request));
        } else {
            self.held_requests.lock().unwrap().push_back((request, done));
        }
    }

    fn submit_frames(&self, frames: Vec<LowerFrame>) {
        let auto = self.auto_complete.load(Ordering::SeqCst);
        for frame in frames {
            self.sent.lock().unwrap().push(SentFrame {
                vif: frame.source_vif(),
                cookie: frame.cookie(),
                data: frame.data.clone(),
                flags: frame.flags,
            });
            if auto {
                frame.complete(Ok(()));
            } else {
                self.held_frames.lock().unwrap().push_back(frame);
            }
        }
    }

    fn close(&self) -> LowerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(LowerError::Closed);
        }
        Ok(())
    }

    fn attach(&self, binding: Weak<Binding>) {
        *self.binding.lock().unwrap() = binding;
    }
}

/// Opener handing out [`StubBinding`]s, optionally failing for some names.
#[derive(Default)]
pub struct StubOpener {
    opened: Mutex<HashMap<String, Arc<StubBinding>>>,
    failing: Mutex<HashSet<String>>,
}

impl StubOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make opening `adapter` fail.
    pub fn fail(&self, adapter: &str) {
        self.failing.lock().unwrap().insert(adapter.to_string());
    }

    /// Stub most recently opened for `adapter`.
    pub fn stub(&self, adapter: &str) -> Option<Arc<StubBinding>> {
        self.opened.lock().unwrap().get(adapter).cloned()
    }
}

impl LowerOpener for StubOpener {
    fn open_binding(&self, adapter: &str) -> LowerResult<Arc<dyn LowerBinding>> {
        if self.failing.lock().unwrap().contains(adapter) {
            return Err(LowerError::Open {
                adapter: adapter.to_string(),
                reason: "no such adapter".into(),
            });
        }
        let stub = StubBinding::new();
        self.opened
            .lock()
            .unwrap()
            .insert(adapter.to_string(), Arc::clone(&stub));
        Ok(stub)
    }
}
