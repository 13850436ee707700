//! Virtual interfaces multiplexed over a binding.
//!
//! A VIF moves through `Created -> Active -> Halting -> Destroyed`. Every
//! operation on a VIF first enters the VIF's [`Gate`]; halting closes the
//! gate and waits for it to drain, so nothing admitted before the halt is
//! cut short and nothing is admitted after it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, info};

use crate::binding::{Binding, BindingRef};
use crate::error::{MuxError, Result};
use crate::filter::{self, MulticastList, PacketFilter};
use crate::forward::{self, OutboundFrame};
use crate::lower::{DevicePowerState, FrameCookie, MediaStatus};
use crate::mac::MacAddr;
use crate::oid::{self, Oid, QueryAction, Request, RequestOutcome, SetAction};
use crate::request::{self, Completion, PendingSlot, RequestStatus};
use crate::stats::{Statistic, StatsSnapshot, VifStats};
use crate::sync::{Event, Gate, Slots};
use crate::vlan::TagInfo;

/// Frames that may be indicated and not yet returned, per VIF.
pub const DEFAULT_RECEIVE_QUEUE_CAPACITY: usize = 64;
/// Sends that may be outstanding below, per VIF.
pub const DEFAULT_MAX_BUSY_SENDS: usize = 64;

/// Process-unique VIF number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VifId(pub u32);

impl VifId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VifId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vif({})", self.0)
    }
}

/// Lifecycle state of a VIF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VifState {
    /// Linked into the binding, waiting for the upper edge to initialize it.
    Created = 0,
    Active = 1,
    /// Stop requested; in-flight work is draining.
    Halting = 2,
    Destroyed = 3,
}

impl VifState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => VifState::Created,
            1 => VifState::Active,
            2 => VifState::Halting,
            _ => VifState::Destroyed,
        }
    }
}

impl fmt::Display for VifState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VifState::Created => "created",
            VifState::Active => "active",
            VifState::Halting => "halting",
            VifState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Upper edge of a VIF: the protocol stack sitting on top of it.
///
/// Callbacks may arrive on any thread, including the one that issued the
/// operation being completed.
pub trait VifHandler: Send + Sync {
    /// A frame passed the VIF's filters. Dropping the frame returns it.
    fn frame_indicated(&self, frame: ReceivedFrame);

    /// Result of one frame handed to [`Vif::send_frames`].
    fn send_complete(&self, vif: VifId, cookie: FrameCookie, result: Result<()>);

    fn status_indicated(&self, _vif: VifId, _status: MediaStatus) {}
}

/// Creation parameters, resolved by the binding from a VIF definition.
#[derive(Debug, Clone)]
pub(crate) struct VifParams {
    pub id: VifId,
    pub device_key: String,
    pub permanent_address: MacAddr,
    pub current_address: MacAddr,
    pub vlan_id: u16,
    pub receive_queue_capacity: usize,
    pub max_busy_sends: usize,
    pub link_speed: u32,
    pub lookahead: u32,
}

#[derive(Debug, Default)]
struct RxFilter {
    filter: PacketFilter,
    multicast: MulticastList,
}

#[derive(Debug, Default)]
struct PowerStatus {
    state: DevicePowerState,
    last_indicated: Option<MediaStatus>,
    /// Latest media status seen while in low power.
    latest_unindicated: Option<MediaStatus>,
}

/// One virtual interface.
pub struct Vif {
    id: VifId,
    device_key: String,
    binding: Weak<Binding>,
    state: AtomicU8,
    gate: Gate,
    destroyed: Event,
    permanent_address: MacAddr,
    current_address: MacAddr,
    rx: RwLock<RxFilter>,
    link_speed: AtomicU32,
    lookahead: AtomicU32,
    vlan_id: AtomicU16,
    power: Mutex<PowerStatus>,
    pub(crate) pending: PendingSlot,
    pub(crate) sends: Slots,
    pub(crate) receive_queue: Slots,
    stats: VifStats,
    handler: RwLock<Option<Arc<dyn VifHandler>>>,
}

impl Vif {
    pub(crate) fn new(binding: Weak<Binding>, params: VifParams) -> Arc<Self> {
        Arc::new(Self {
            id: params.id,
            device_key: params.device_key,
            binding,
            state: AtomicU8::new(VifState::Created as u8),
            gate: Gate::new(),
            destroyed: Event::new(),
            permanent_address: params.permanent_address,
            current_address: params.current_address,
            rx: RwLock::new(RxFilter::default()),
            link_speed: AtomicU32::new(params.link_speed),
            lookahead: AtomicU32::new(params.lookahead),
            vlan_id: AtomicU16::new(params.vlan_id),
            power: Mutex::new(PowerStatus::default()),
            pending: PendingSlot::new(),
            sends: Slots::new(params.max_busy_sends),
            receive_queue: Slots::new(params.receive_queue_capacity),
            stats: VifStats::new(),
            handler: RwLock::new(None),
        })
    }

    pub fn id(&self) -> VifId {
        self.id
    }

    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    pub fn state(&self) -> VifState {
        VifState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == VifState::Active
    }

    /// Owning binding, if it still exists.
    pub fn binding(&self) -> Option<Arc<Binding>> {
        self.binding.upgrade()
    }

    pub fn permanent_address(&self) -> MacAddr {
        self.permanent_address
    }

    pub fn current_address(&self) -> MacAddr {
        self.current_address
    }

    pub fn packet_filter(&self) -> PacketFilter {
        self.rx.read().unwrap().filter
    }

    pub fn multicast_list(&self) -> Vec<MacAddr> {
        self.rx.read().unwrap().multicast.as_slice().to_vec()
    }

    pub fn link_speed(&self) -> u32 {
        self.link_speed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_link_speed(&self, speed: u32) {
        self.link_speed.store(speed, Ordering::Relaxed);
    }

    pub fn lookahead(&self) -> u32 {
        self.lookahead.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lookahead(&self, lookahead: u32) {
        self.lookahead.store(lookahead, Ordering::Relaxed);
    }

    /// 802.1Q VLAN id; 0 disables tagging.
    pub fn vlan_id(&self) -> u16 {
        self.vlan_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_vlan_id(&self, vlan_id: u16) {
        self.vlan_id.store(vlan_id, Ordering::Relaxed);
        debug!(vif = %self.id, vlan_id, "VLAN id set");
    }

    pub fn power_state(&self) -> DevicePowerState {
        self.power.lock().unwrap().state
    }

    pub fn stats(&self) -> &VifStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Read one counter.
    pub fn query_statistic(&self, stat: Statistic) -> u64 {
        self.stats.get(stat)
    }

    /// Frames indicated and not yet returned.
    pub fn receive_queue_len(&self) -> usize {
        self.receive_queue.used()
    }

    pub fn receive_queue_capacity(&self) -> usize {
        self.receive_queue.capacity()
    }

    pub fn set_receive_queue_capacity(&self, capacity: usize) {
        self.receive_queue.set_capacity(capacity);
    }

    pub fn max_busy_sends(&self) -> usize {
        self.sends.capacity()
    }

    pub fn sends_in_flight(&self) -> usize {
        self.sends.used()
    }

    /// Operations currently admitted on this VIF.
    pub fn in_flight(&self) -> usize {
        self.gate.active()
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn VifHandler>> {
        self.handler.read().unwrap().clone()
    }

    /// Admit one operation. Fails once the VIF has started halting.
    pub(crate) fn enter(self: &Arc<Self>) -> Result<VifRef> {
        if !self.gate.try_enter() {
            return Err(MuxError::Halting(self.id));
        }
        let guard = VifRef {
            vif: Arc::clone(self),
        };
        match self.state() {
            VifState::Active => Ok(guard),
            VifState::Created => Err(MuxError::NotInitialized(self.id)),
            VifState::Halting | VifState::Destroyed => Err(MuxError::Halting(self.id)),
        }
    }

    /// Whether a frame for `dst` passes this VIF's filter.
    pub(crate) fn accepts(&self, dst: MacAddr) -> bool {
        let rx = self.rx.read().unwrap();
        filter::frame_matches(rx.filter, self.current_address, &rx.multicast, dst)
    }

    pub(crate) fn store_packet_filter(&self, filter: PacketFilter) {
        self.rx.write().unwrap().filter = filter;
    }

    /// Bring the VIF up and attach the upper edge.
    pub fn initialize(&self, handler: Arc<dyn VifHandler>) -> Result<()> {
        let mut slot = self.handler.write().unwrap();
        match self.state.compare_exchange(
            VifState::Created as u8,
            VifState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                *slot = Some(handler);
                info!(
                    vif = %self.id,
                    key = %self.device_key,
                    mac = %self.current_address,
                    "VIF initialized"
                );
                Ok(())
            }
            Err(raw) => Err(MuxError::InvalidState(self.id, VifState::from_u8(raw))),
        }
    }

    /// Stop the VIF and wait for all of its in-flight work to drain.
    ///
    /// Must not be called from a callback of this same VIF, or while holding
    /// one of its [`ReceivedFrame`]s.
    pub fn halt(self: &Arc<Self>) {
        match self.binding() {
            Some(binding) => binding.stop_vif(self),
            None => self.wait_destroyed(),
        }
    }

    /// Hand frames to the lower binding. Per-frame results are reported
    /// through [`VifHandler::send_complete`].
    pub fn send_frames(self: &Arc<Self>, frames: Vec<OutboundFrame>) -> Result<()> {
        forward::send_frames(self, frames)
    }

    pub fn set_packet_filter(self: &Arc<Self>, filter: PacketFilter) -> Result<()> {
        let _guard = self.enter()?;
        let binding = self.binding().ok_or(MuxError::BindingClosing)?;
        binding.set_vif_filter(self, filter);
        debug!(vif = %self.id, filter = ?filter, "packet filter set");
        Ok(())
    }

    pub fn set_multicast_list(self: &Arc<Self>, addrs: &[MacAddr]) -> Result<()> {
        let _guard = self.enter()?;
        self.rx.write().unwrap().multicast.set(addrs)?;
        debug!(vif = %self.id, count = addrs.len(), "multicast list set");
        Ok(())
    }

    /// Forward a request unchanged to the lower binding.
    pub fn forward_request(
        self: &Arc<Self>,
        request: Request,
        completion: Completion,
    ) -> Result<RequestStatus> {
        request::forward_request(self, request, completion)
    }

    /// Query `oid`, answering locally where possible.
    pub fn query_information(
        self: &Arc<Self>,
        oid: Oid,
        len: usize,
        completion: Completion,
    ) -> Result<RequestStatus> {
        let _guard = self.enter()?;
        match oid::query_local(self, oid, len)? {
            QueryAction::Answer(data) => Ok(RequestStatus::Complete(RequestOutcome::answered(
                oid, data,
            ))),
            QueryAction::Forward => {
                request::forward_request(self, Request::query(oid, len), completion)
            }
        }
    }

    /// Set `oid`, applying it locally where possible.
    pub fn set_information(
        self: &Arc<Self>,
        oid: Oid,
        data: &[u8],
        completion: Completion,
    ) -> Result<RequestStatus> {
        let _guard = self.enter()?;
        match oid::set_local(self, oid, data)? {
            SetAction::Done { bytes_read } => Ok(RequestStatus::Complete(
                RequestOutcome::accepted(oid, bytes_read),
            )),
            SetAction::Forward(data) => {
                request::forward_request(self, Request::set(oid, data), completion)
            }
        }
    }

    /// Query or set and block until the answer is available.
    pub fn request_sync(self: &Arc<Self>, request: Request) -> Result<RequestOutcome> {
        let (completion, rx) = Completion::channel();
        let status = match request {
            Request::Query { oid, len } => self.query_information(oid, len, completion)?,
            Request::Set { oid, data } => self.set_information(oid, &data, completion)?,
        };
        request::wait(status, &rx)
    }

    /// Store a new device power state, replaying the latest media status
    /// if one arrived while the VIF was in low power.
    pub(crate) fn set_power_state(&self, new: DevicePowerState) {
        let replay = {
            let mut power = self.power.lock().unwrap();
            let old = power.state;
            let mut replay = None;
            if old.is_low_power()
                && !new.is_low_power()
                && power.latest_unindicated != power.last_indicated
            {
                replay = power.latest_unindicated;
                power.last_indicated = power.latest_unindicated;
            }
            if !old.is_low_power() && new.is_low_power() {
                power.latest_unindicated = power.last_indicated;
            }
            power.state = new;
            replay
        };

        info!(vif = %self.id, state = ?new, "VIF power state changed");
        if let Some(status) = replay
            && let Some(handler) = self.handler()
        {
            handler.status_indicated(self.id, status);
        }
    }

    /// Pass a media status up, or remember it while in low power.
    pub(crate) fn deliver_status(self: &Arc<Self>, status: MediaStatus) -> bool {
        {
            let mut power = self.power.lock().unwrap();
            if power.state.is_low_power() {
                power.latest_unindicated = Some(status);
                return false;
            }
        }
        let Ok(_guard) = self.enter() else {
            return false;
        };
        self.power.lock().unwrap().last_indicated = Some(status);
        match self.handler() {
            Some(handler) => {
                handler.status_indicated(self.id, status);
                true
            }
            None => false,
        }
    }

    /// Mark the VIF halting and close its gate. Returns false if another
    /// caller already did.
    pub(crate) fn begin_halt(&self) -> bool {
        let marked = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match VifState::from_u8(raw) {
                    VifState::Created | VifState::Active => Some(VifState::Halting as u8),
                    VifState::Halting | VifState::Destroyed => None,
                }
            })
            .is_ok();
        if marked {
            self.gate.close();
        }
        marked
    }

    /// Wait until every admitted operation has finished.
    pub(crate) fn drain(&self) {
        self.gate.wait_idle();
    }

    pub(crate) fn finish_halt(&self) {
        debug_assert_eq!(self.receive_queue.used(), 0);
        debug_assert_eq!(self.sends.used(), 0);
        self.state
            .store(VifState::Destroyed as u8, Ordering::Release);
        self.handler.write().unwrap().take();
        self.destroyed.set();
    }

    /// Block until the VIF reaches `Destroyed`.
    pub fn wait_destroyed(&self) {
        self.destroyed.wait();
    }
}

impl fmt::Debug for Vif {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vif")
            .field("id", &self.id)
            .field("device_key", &self.device_key)
            .field("state", &self.state())
            .field("current_address", &self.current_address)
            .field("vlan_id", &self.vlan_id())
            .finish_non_exhaustive()
    }
}

/// An admitted operation on a VIF. Leaves the VIF's gate on drop.
pub(crate) struct VifRef {
    vif: Arc<Vif>,
}

impl VifRef {
    pub(crate) fn arc(&self) -> &Arc<Vif> {
        &self.vif
    }
}

impl Deref for VifRef {
    type Target = Vif;

    fn deref(&self) -> &Vif {
        &self.vif
    }
}

impl Drop for VifRef {
    fn drop(&mut self) {
        self.vif.gate.exit();
    }
}

/// A frame indicated to the upper edge.
///
/// Occupies one slot of the VIF's receive queue until it is dropped or
/// returned with [`ReceivedFrame::into_data`].
pub struct ReceivedFrame {
    data: Vec<u8>,
    tag: Option<TagInfo>,
    vif: VifRef,
    _binding: BindingRef,
}

impl ReceivedFrame {
    pub(crate) fn new(
        data: Vec<u8>,
        tag: Option<TagInfo>,
        vif: VifRef,
        binding: BindingRef,
    ) -> Self {
        Self {
            data,
            tag,
            vif,
            _binding: binding,
        }
    }

    pub fn vif_id(&self) -> VifId {
        self.vif.id()
    }

    /// Frame bytes with any 802.1Q tag removed.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Tag the frame carried on the wire.
    pub fn tag(&self) -> Option<TagInfo> {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the frame and keep its bytes.
    pub fn into_data(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Drop for ReceivedFrame {
    fn drop(&mut self) {
        self.vif.receive_queue.put();
    }
}

impl fmt::Debug for ReceivedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFrame")
            .field("vif", &self.vif.id())
            .field("len", &self.data.len())
            .field("tag", &self.tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(id: u32) -> VifParams {
        let mac = MacAddr([0x02, 0, 0, 0, 0, id as u8]);
        VifParams {
            id: VifId(id),
            device_key: format!("vif{id}"),
            permanent_address: mac,
            current_address: mac,
            vlan_id: 0,
            receive_queue_capacity: 2,
            max_busy_sends: 4,
            link_speed: 100_000,
            lookahead: 256,
        }
    }

    struct NullHandler;

    impl VifHandler for NullHandler {
        fn frame_indicated(&self, _frame: ReceivedFrame) {}
        fn send_complete(&self, _vif: VifId, _cookie: FrameCookie, _result: Result<()>) {}
    }

    #[test]
    fn test_state_machine() {
        let vif = Vif::new(Weak::new(), params(1));
        assert_eq!(vif.state(), VifState::Created);
        assert_eq!(vif.enter().err(), Some(MuxError::NotInitialized(VifId(1))));

        vif.initialize(Arc::new(NullHandler)).unwrap();
        assert!(vif.is_active());
        assert_eq!(
            vif.initialize(Arc::new(NullHandler)),
            Err(MuxError::InvalidState(VifId(1), VifState::Active))
        );

        let guard = vif.enter().unwrap();
        assert_eq!(vif.in_flight(), 1);

        assert!(vif.begin_halt());
        assert!(!vif.begin_halt());
        assert_eq!(vif.state(), VifState::Halting);
        assert_eq!(vif.enter().err(), Some(MuxError::Halting(VifId(1))));

        drop(guard);
        vif.drain();
        vif.finish_halt();
        assert_eq!(vif.state(), VifState::Destroyed);
        vif.wait_destroyed();
    }

    #[test]
    fn test_filter_match_uses_current_address() {
        let vif = Vif::new(Weak::new(), params(3));
        let own = vif.current_address();
        assert!(!vif.accepts(own));
        vif.store_packet_filter(PacketFilter::DIRECTED);
        assert!(vif.accepts(own));
        assert!(!vif.accepts(MacAddr::BROADCAST));
    }

    #[test]
    fn test_power_replays_latest_status() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct StatusHandler(Mutex<Vec<MediaStatus>>);

        impl VifHandler for StatusHandler {
            fn frame_indicated(&self, _frame: ReceivedFrame) {}
            fn send_complete(&self, _vif: VifId, _cookie: FrameCookie, _result: Result<()>) {}
            fn status_indicated(&self, _vif: VifId, status: MediaStatus) {
                self.0.lock().unwrap().push(status);
            }
        }

        let handler = Arc::new(StatusHandler::default());
        let vif = Vif::new(Weak::new(), params(4));
        vif.initialize(handler.clone()).unwrap();

        assert!(vif.deliver_status(MediaStatus::Connected));
        vif.set_power_state(DevicePowerState::D3);
        assert!(!vif.deliver_status(MediaStatus::Disconnected));
        assert_eq!(*handler.0.lock().unwrap(), vec![MediaStatus::Connected]);

        vif.set_power_state(DevicePowerState::D0);
        assert_eq!(
            *handler.0.lock().unwrap(),
            vec![MediaStatus::Connected, MediaStatus::Disconnected]
        );
    }

    #[test]
    fn test_vif_id_display() {
        assert_eq!(VifId(7).to_string(), "Vif(7)");
        assert_eq!(VifState::Halting.to_string(), "halting");
    }
}
