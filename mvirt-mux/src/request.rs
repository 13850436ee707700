//! Request forwarder.
//!
//! Each VIF has exactly one request slot. A forwarded request occupies it
//! from admission until its completion has been demultiplexed back to the
//! VIF; a second request in the meantime is rejected with
//! [`MuxError::RequestPending`]. While the binding is in low power the
//! request is parked in the slot instead and replayed on the way back to D0.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingRef};
use crate::error::{MuxError, Result};
use crate::lower::{LowerError, LowerResult};
use crate::oid::{Oid, PnpCapabilities, Request, RequestKind, RequestOutcome};
use crate::vif::{Vif, VifRef, VifState};

/// Where the result of a forwarded request goes.
pub enum Completion {
    Callback(Box<dyn FnOnce(Result<RequestOutcome>) + Send>),
    /// Used by blocking callers; see [`Completion::channel`].
    Channel(Sender<Result<RequestOutcome>>),
    Discard,
}

impl Completion {
    pub fn callback(f: impl FnOnce(Result<RequestOutcome>) + Send + 'static) -> Self {
        Completion::Callback(Box::new(f))
    }

    /// A completion paired with the receiver it will be delivered on.
    pub fn channel() -> (Self, Receiver<Result<RequestOutcome>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Completion::Channel(tx), rx)
    }

    pub(crate) fn complete(self, result: Result<RequestOutcome>) {
        match self {
            Completion::Callback(f) => f(result),
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::Discard => {
                if let Err(e) = result {
                    debug!(error = %e, "discarded request failed");
                }
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Callback(_) => f.write_str("Completion::Callback"),
            Completion::Channel(_) => f.write_str("Completion::Channel"),
            Completion::Discard => f.write_str("Completion::Discard"),
        }
    }
}

/// Synchronous status of an issued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Answered without involving the lower binding. The completion is
    /// not invoked.
    Complete(RequestOutcome),
    /// Submitted below; the completion runs once the lower binding answers.
    Pending,
    /// Parked until the binding returns to full power.
    Queued,
}

impl RequestStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RequestStatus::Complete(_))
    }
}

/// Block until a request issued with [`Completion::channel`] finishes.
pub fn wait(
    status: RequestStatus,
    rx: &Receiver<Result<RequestOutcome>>,
) -> Result<RequestOutcome> {
    match status {
        RequestStatus::Complete(outcome) => Ok(outcome),
        RequestStatus::Pending | RequestStatus::Queued => rx
            .recv()
            .map_err(|_| MuxError::Lower(LowerError::Aborted))?,
    }
}

/// One request in flight, or parked for power.
pub(crate) struct RequestEnvelope {
    /// Issuing VIF. `None` for requests the binding makes on its own behalf.
    vif: Option<VifRef>,
    request: Request,
    completion: Completion,
}

impl RequestEnvelope {
    fn oid(&self) -> Oid {
        self.request.oid()
    }

    /// Release the issuing VIF's slot and deliver `result`.
    fn finish(self, result: Result<RequestOutcome>) {
        let RequestEnvelope {
            vif, completion, ..
        } = self;
        if let Some(vif) = &vif {
            vif.pending.clear();
        }
        completion.complete(result);
        // The VIF leaves its gate only after the caller has seen the result.
        drop(vif);
    }
}

enum Slot {
    Empty,
    InFlight(Oid),
    Queued(RequestEnvelope),
}

/// Per-VIF request slot.
pub(crate) struct PendingSlot {
    slot: Mutex<Slot>,
}

impl PendingSlot {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap()
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(*self.lock(), Slot::Empty)
    }

    pub(crate) fn is_queued(&self) -> bool {
        matches!(*self.lock(), Slot::Queued(_))
    }

    /// OID of the request occupying the slot, if any.
    pub(crate) fn oid(&self) -> Option<Oid> {
        match &*self.lock() {
            Slot::Empty => None,
            Slot::InFlight(oid) => Some(*oid),
            Slot::Queued(envelope) => Some(envelope.oid()),
        }
    }

    fn clear(&self) {
        *self.lock() = Slot::Empty;
    }
}

/// Forward `request` from `vif` to the lower binding.
pub(crate) fn forward_request(
    vif: &Arc<Vif>,
    request: Request,
    completion: Completion,
) -> Result<RequestStatus> {
    let vif_ref = vif.enter()?;
    forward_admitted(vif, vif_ref, request, completion)
}

fn forward_admitted(
    vif: &Arc<Vif>,
    vif_ref: VifRef,
    request: Request,
    completion: Completion,
) -> Result<RequestStatus> {
    if vif.power_state().is_low_power() {
        return Err(MuxError::AdapterNotReady);
    }
    let binding = vif.binding().ok_or(MuxError::BindingClosing)?;

    let mut slot = vif.pending.lock();
    // A stop that began after admission has already swept the slot.
    if matches!(vif.state(), VifState::Halting | VifState::Destroyed) {
        return Err(MuxError::Halting(vif.id()));
    }
    if !matches!(*slot, Slot::Empty) {
        debug!(vif = %vif.id(), oid = %request.oid(), "request rejected, slot occupied");
        return Err(MuxError::RequestPending(vif.id()));
    }

    let oid = request.oid();
    let envelope = RequestEnvelope {
        vif: Some(vif_ref),
        request,
        completion,
    };

    // Checked under the slot lock so a concurrent return to D0 either sees
    // the parked request or we see the new power state.
    if binding.power_state().is_low_power() {
        debug!(vif = %vif.id(), oid = %oid, "binding in low power, request queued");
        *slot = Slot::Queued(envelope);
        return Ok(RequestStatus::Queued);
    }

    let Some(binding_ref) = binding.pin() else {
        return Err(MuxError::BindingClosing);
    };
    *slot = Slot::InFlight(oid);
    drop(slot);

    debug!(vif = %vif.id(), oid = %oid, "forwarding request");
    submit(binding_ref, envelope);
    Ok(RequestStatus::Pending)
}

/// Issue a request on the binding's own behalf.
pub(crate) fn binding_request(
    binding: &Arc<Binding>,
    request: Request,
    completion: Completion,
) -> Result<RequestStatus> {
    let binding_ref = binding.pin().ok_or(MuxError::BindingClosing)?;
    let envelope = RequestEnvelope {
        vif: None,
        request,
        completion,
    };
    submit(binding_ref, envelope);
    Ok(RequestStatus::Pending)
}

/// Issue a request on the binding's own behalf and wait for it.
pub(crate) fn binding_request_sync(
    binding: &Arc<Binding>,
    request: Request,
) -> Result<RequestOutcome> {
    let (completion, rx) = Completion::channel();
    let status = binding_request(binding, request, completion)?;
    wait(status, &rx)
}

fn submit(binding: BindingRef, envelope: RequestEnvelope) {
    let request = envelope.request.clone();
    let lower = Arc::clone(binding.lower());
    lower.submit_request(
        request,
        Box::new(move |result| complete(binding, envelope, result)),
    );
}

fn complete(binding: BindingRef, envelope: RequestEnvelope, result: LowerResult<RequestOutcome>) {
    let result = match result {
        Ok(outcome) => Ok(post_process(
            &binding,
            envelope.vif.as_deref(),
            &envelope.request,
            outcome,
        )),
        Err(e) => {
            warn!(binding = %binding.id(), oid = %envelope.oid(), error = %e, "request failed");
            Err(MuxError::from(e))
        }
    };
    drop(binding);
    envelope.finish(result);
}

/// Update cached state from a successful answer.
fn post_process(
    binding: &Binding,
    vif: Option<&Vif>,
    request: &Request,
    mut outcome: RequestOutcome,
) -> RequestOutcome {
    match (request.kind(), request.oid()) {
        (RequestKind::Query, Oid::GEN_LINK_SPEED) => {
            if let Some(speed) = outcome.as_u32() {
                if let Some(vif) = vif {
                    vif.set_link_speed(speed);
                }
                binding.cache_link_speed(speed);
            }
        }
        (RequestKind::Query, Oid::PNP_CAPABILITIES) => {
            if let Some(caps) = PnpCapabilities::parse(&outcome.data) {
                outcome.data[..PnpCapabilities::LEN]
                    .copy_from_slice(&caps.without_wake_up().to_bytes());
            }
        }
        (RequestKind::Set, Oid::GEN_CURRENT_LOOKAHEAD) => {
            if let (Some(vif), Request::Set { data, .. }) = (vif, request)
                && let Some(bytes) = data.get(..4)
                && let Ok(bytes) = <[u8; 4]>::try_from(bytes)
            {
                vif.set_lookahead(u32::from_le_bytes(bytes));
            }
        }
        _ => {}
    }
    outcome
}

/// Submit the request parked on `vif`, if any. Returns whether one was.
pub(crate) fn replay_queued(binding: &Arc<Binding>, vif: &Vif) -> bool {
    let envelope = {
        let mut slot = vif.pending.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Queued(envelope) => {
                *slot = Slot::InFlight(envelope.oid());
                envelope
            }
            other => {
                *slot = other;
                return false;
            }
        }
    };

    info!(vif = %vif.id(), oid = %envelope.oid(), "replaying queued request");
    match binding.pin() {
        Some(binding_ref) => submit(binding_ref, envelope),
        None => envelope.finish(Err(MuxError::BindingClosing)),
    }
    true
}

/// Fail the request parked on `vif`, if any, with `error`.
pub(crate) fn fail_queued(vif: &Vif, error: MuxError) -> bool {
    let envelope = {
        let mut slot = vif.pending.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Queued(envelope) => envelope,
            other => {
                *slot = other;
                return false;
            }
        }
    };
    debug!(vif = %vif.id(), oid = %envelope.oid(), error = %error, "failing queued request");
    envelope.finish(Err(error));
    true
}
