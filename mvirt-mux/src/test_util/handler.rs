//! Upper-edge double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::lower::{FrameCookie, MediaStatus};
use crate::vif::{ReceivedFrame, VifHandler, VifId};
use crate::vlan::TagInfo;

/// Copy of an indicated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    pub vif: VifId,
    pub data: Vec<u8>,
    pub tag: Option<TagInfo>,
}

/// Records everything the multiplexer passes up.
///
/// By default indicated frames are kept (occupying their receive queue
/// slot) until [`RecordingHandler::return_frames`] is called.
pub struct RecordingHandler {
    retain: AtomicBool,
    indications: Mutex<Vec<Indication>>,
    held: Mutex<Vec<ReceivedFrame>>,
    completions: Mutex<Vec<(VifId, FrameCookie, Result<()>)>>,
    statuses: Mutex<Vec<(VifId, MediaStatus)>>,
}

impl RecordingHandler {
    /// Handler that keeps indicated frames.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            retain: AtomicBool::new(true),
            indications: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
        })
    }

    /// Handler that returns every frame as soon as it is indicated.
    pub fn returning() -> Arc<Self> {
        let handler = Self::new();
        handler.retain.store(false, Ordering::SeqCst);
        handler
    }

    pub fn indications(&self) -> Vec<Indication> {
        self.indications.lock().unwrap().clone()
    }

    pub fn indication_count(&self) -> usize {
        self.indications.lock().unwrap().len()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Return every held frame. Returns how many.
    pub fn return_frames(&self) -> usize {
        let frames: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        frames.len()
    }

    pub fn completions(&self) -> Vec<(VifId, FrameCookie, Result<()>)> {
        self.completions.lock().unwrap().clone()
    }

    /// Completions that reported success.
    pub fn successful_completions(&self) -> usize {
        self.completions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, r)| r.is_ok())
            .count()
    }

    pub fn statuses(&self) -> Vec<(VifId, MediaStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

impl VifHandler for RecordingHandler {
    fn frame_indicated(&self, frame: ReceivedFrame) {
        self.indications.lock().unwrap().push(Indication {
            vif: frame.vif_id(),
            data: frame.data().to_vec(),
            tag: frame.tag(),
        });
        if self.retain.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(frame);
        }
    }

    fn send_complete(&self, vif: VifId, cookie: FrameCookie, result: Result<()>) {
        self.completions.lock().unwrap().push((vif, cookie, result));
    }

    fn status_indicated(&self, vif: VifId, status: MediaStatus) {
        self.statuses.lock().unwrap().push((vif, status));
    }
}
