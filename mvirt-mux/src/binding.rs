//! Bindings to lower adapters and the VIFs multiplexed over them.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::VifDefinition;
use crate::error::{MuxError, Result};
use crate::filter::PacketFilter;
use crate::lower::{DevicePowerState, LowerBinding, LowerError, LowerInfo, MediaStatus, Medium};
use crate::mac::{DEFAULT_VENDOR_PREFIX, MacAddr, generate_station_address};
use crate::oid::{Oid, Request, RequestOutcome};
use crate::registry::BindingRegistry;
use crate::request::{self, Completion, RequestStatus};
use crate::sync::{Event, Gate, RefCount};
use crate::vif::{Vif, VifId, VifParams};

/// How long a transition to low power waits for outstanding I/O.
pub const QUIESCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(Uuid);

impl BindingId {
    pub fn new() -> Self {
        BindingId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binding({})", self.0)
    }
}

/// Cached capabilities of the lower adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub medium: Medium,
    /// Link speed in units of 100 bit/s.
    pub link_speed: u32,
    pub max_lookahead: u32,
    pub current_address: MacAddr,
    pub power: DevicePowerState,
}

impl From<LowerInfo> for Capabilities {
    fn from(info: LowerInfo) -> Self {
        Capabilities {
            medium: info.medium,
            link_speed: info.link_speed,
            max_lookahead: info.max_lookahead,
            current_address: info.current_address,
            power: DevicePowerState::D0,
        }
    }
}

/// Lower filter to push when the union filter changes from `old` to `new`.
fn lower_transition(old: PacketFilter, new: PacketFilter) -> Option<PacketFilter> {
    match (old.is_empty(), new.is_empty()) {
        (true, false) => Some(PacketFilter::LOWER_ACTIVE),
        (false, true) => Some(PacketFilter::empty()),
        _ => None,
    }
}

#[derive(Default)]
struct VifListInner {
    vifs: Vec<Arc<Vif>>,
    packet_filter: PacketFilter,
    /// Set once the binding is unbinding; no VIF is linked after that.
    closed: bool,
}

impl VifListInner {
    fn recompute_filter(&mut self) -> Option<PacketFilter> {
        let old = self.packet_filter;
        self.packet_filter = self
            .vifs
            .iter()
            .fold(PacketFilter::empty(), |acc, vif| acc | vif.packet_filter());
        lower_transition(old, self.packet_filter)
    }
}

/// VIFs of one binding, in creation order, together with the union of
/// their packet filters.
///
/// Structural changes take the write lock; receive fan-out works on a
/// snapshot taken under the read lock.
#[derive(Default)]
pub struct VifList {
    inner: RwLock<VifListInner>,
}

impl VifList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Arc<Vif>> {
        self.inner.read().unwrap().vifs.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().vifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().vifs.is_empty()
    }

    /// Union of every listed VIF's packet filter.
    pub fn packet_filter(&self) -> PacketFilter {
        self.inner.read().unwrap().packet_filter
    }

    pub fn get(&self, id: VifId) -> Option<Arc<Vif>> {
        self.inner
            .read()
            .unwrap()
            .vifs
            .iter()
            .find(|v| v.id() == id)
            .cloned()
    }

    pub fn find(&self, device_key: &str) -> Option<Arc<Vif>> {
        self.inner
            .read()
            .unwrap()
            .vifs
            .iter()
            .find(|v| v.device_key() == device_key)
            .cloned()
    }

    fn insert(&self, vif: Arc<Vif>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(MuxError::BindingClosing);
        }
        if inner.vifs.iter().any(|v| v.device_key() == vif.device_key()) {
            return Err(MuxError::VifExists(vif.device_key().to_string()));
        }
        inner.vifs.push(vif);
        Ok(())
    }

    /// Refuse further inserts and return the VIFs linked at this point.
    fn close(&self) -> Vec<Arc<Vif>> {
        let mut inner = self.inner.write().unwrap();
        inner.closed = true;
        inner.vifs.clone()
    }

    /// Remove a VIF. Returns `None` if it was not listed, otherwise the
    /// lower filter to push if the union changed to or from empty.
    fn remove(&self, id: VifId) -> Option<Option<PacketFilter>> {
        let mut inner = self.inner.write().unwrap();
        let pos = inner.vifs.iter().position(|v| v.id() == id)?;
        inner.vifs.remove(pos);
        Some(inner.recompute_filter())
    }

    fn set_filter(&self, vif: &Vif, filter: PacketFilter) -> Option<PacketFilter> {
        let mut inner = self.inner.write().unwrap();
        vif.store_packet_filter(filter);
        inner.recompute_filter()
    }
}

/// Result of [`Binding::bootstrap_vifs`].
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub created: Vec<Arc<Vif>>,
    /// Device keys that already had a VIF.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, MuxError)>,
}

/// One bound lower adapter.
///
/// The binding starts with one base reference owned by whoever bound it.
/// Every VIF and every in-flight operation holds another; the binding is
/// torn down once the base reference is released by [`Binding::unbind`]
/// and the count drops to zero.
pub struct Binding {
    id: BindingId,
    adapter: String,
    lower: Arc<dyn LowerBinding>,
    registry: Arc<BindingRegistry>,
    caps: ArcSwap<Capabilities>,
    vifs: VifList,
    refs: RefCount,
    /// Operations currently touching the lower binding.
    io: Gate,
    closing: AtomicBool,
    destroyed: AtomicBool,
    released: Event,
    torn_down: Event,
}

impl Binding {
    /// Query the lower adapter and register a new binding for it.
    ///
    /// Nothing is registered if the query fails, the medium is not
    /// Ethernet or the adapter already has a binding.
    pub fn create(
        registry: &Arc<BindingRegistry>,
        adapter: &str,
        lower: Arc<dyn LowerBinding>,
    ) -> Result<Arc<Self>> {
        let info = lower.query_info()?;
        if info.medium != Medium::Ethernet {
            return Err(LowerError::UnsupportedMedium(info.medium).into());
        }

        let binding = Arc::new(Binding {
            id: BindingId::new(),
            adapter: adapter.to_string(),
            lower,
            registry: Arc::clone(registry),
            caps: ArcSwap::from_pointee(Capabilities::from(info)),
            vifs: VifList::new(),
            refs: RefCount::new(1),
            io: Gate::new(),
            closing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            released: Event::new(),
            torn_down: Event::new(),
        });
        registry.insert(Arc::clone(&binding))?;
        binding.lower.attach(Arc::downgrade(&binding));

        let caps = binding.capabilities();
        info!(
            binding = %binding.id,
            adapter,
            link_speed = caps.link_speed,
            mac = %caps.current_address,
            "binding created"
        );
        Ok(binding)
    }

    /// Remove the binding from the registry and close the lower binding.
    ///
    /// Only valid once no VIF is left and the reference count is zero.
    pub fn destroy(&self) {
        let vifs = self.vifs.len();
        let refs = self.refs.get();
        debug_assert_eq!(vifs, 0, "destroying binding with VIFs");
        debug_assert_eq!(refs, 0, "destroying referenced binding");
        if vifs != 0 || refs != 0 {
            error!(binding = %self.id, vifs, refs, "refusing to destroy binding in use");
            return;
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry.remove(self.id);
        if let Err(e) = self.lower.close() {
            warn!(binding = %self.id, error = %e, "failed to close lower binding");
        }
        info!(binding = %self.id, adapter = %self.adapter, "binding destroyed");
        self.torn_down.set();
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    /// Configuration key of the adapter.
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn lower(&self) -> &Arc<dyn LowerBinding> {
        &self.lower
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.caps.load_full()
    }

    pub fn power_state(&self) -> DevicePowerState {
        self.caps.load().power
    }

    pub fn packet_filter(&self) -> PacketFilter {
        self.vifs.packet_filter()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.get()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Take a reference. Fails once the count has dropped to zero.
    pub fn reference(&self) -> bool {
        self.refs.acquire()
    }

    /// Drop a reference and return how many remain.
    ///
    /// The drop to zero only signals [`Binding::unbind`]; teardown itself
    /// never runs on the releasing thread.
    pub fn dereference(&self) -> usize {
        match self.refs.release() {
            Some(0) => {
                debug!(binding = %self.id, "last reference released");
                self.released.set();
                0
            }
            Some(remaining) => remaining,
            None => 0,
        }
    }

    /// Pin the binding for the duration of one operation.
    pub fn pin(self: &Arc<Self>) -> Option<BindingRef> {
        if !self.io.try_enter() {
            return None;
        }
        if !self.reference() {
            self.io.exit();
            return None;
        }
        Some(BindingRef {
            binding: Arc::clone(self),
        })
    }

    pub(crate) fn cache_link_speed(&self, link_speed: u32) {
        self.caps.rcu(|caps| Capabilities {
            link_speed,
            ..(**caps).clone()
        });
    }

    /// Create one VIF per definition. Failures are logged and do not stop
    /// the remaining definitions; keys that already have a VIF are skipped.
    pub fn bootstrap_vifs(self: &Arc<Self>, definitions: &[VifDefinition]) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        for def in definitions {
            if self.vifs.find(&def.device_key).is_some() {
                debug!(binding = %self.id, key = %def.device_key, "VIF exists, skipping");
                report.skipped.push(def.device_key.clone());
                continue;
            }
            match self.create_vif(def) {
                Ok(vif) => report.created.push(vif),
                Err(e) => {
                    warn!(
                        binding = %self.id,
                        key = %def.device_key,
                        error = %e,
                        "failed to create VIF"
                    );
                    report.failed.push((def.device_key.clone(), e));
                }
            }
        }
        info!(
            binding = %self.id,
            created = report.created.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "VIF bootstrap complete"
        );
        report
    }

    /// Create a VIF and link it into the binding.
    ///
    /// Without a configured station address the VIF uses its generated
    /// permanent address.
    pub fn create_vif(self: &Arc<Self>, def: &VifDefinition) -> Result<Arc<Vif>> {
        if self.is_closing() {
            return Err(MuxError::BindingClosing);
        }
        if let Some(addr) = def.station_address
            && !addr.is_unicast()
        {
            return Err(MuxError::InvalidAddress(addr));
        }
        if self.vifs.find(&def.device_key).is_some() {
            return Err(MuxError::VifExists(def.device_key.clone()));
        }
        if !self.reference() {
            return Err(MuxError::BindingClosing);
        }

        let id = self.registry.next_vif_id();
        let permanent_address = generate_station_address(id.raw(), DEFAULT_VENDOR_PREFIX);
        let caps = self.capabilities();
        let vif = Vif::new(
            Arc::downgrade(self),
            VifParams {
                id,
                device_key: def.device_key.clone(),
                permanent_address,
                current_address: def.station_address.unwrap_or(permanent_address),
                vlan_id: def.vlan_id,
                receive_queue_capacity: def.receive_queue_capacity,
                max_busy_sends: def.max_busy_sends,
                link_speed: caps.link_speed,
                lookahead: caps.max_lookahead,
            },
        );

        if let Err(e) = self.vifs.insert(Arc::clone(&vif)) {
            self.dereference();
            return Err(e);
        }

        info!(
            binding = %self.id,
            vif = %id,
            key = %def.device_key,
            mac = %vif.current_address(),
            vlan_id = def.vlan_id,
            "VIF created"
        );
        Ok(vif)
    }

    pub fn vif(&self, id: VifId) -> Option<Arc<Vif>> {
        self.vifs.get(id)
    }

    pub fn find_vif(&self, device_key: &str) -> Option<Arc<Vif>> {
        self.vifs.find(device_key)
    }

    pub fn vifs(&self) -> Vec<Arc<Vif>> {
        self.vifs.snapshot()
    }

    pub fn vif_count(&self) -> usize {
        self.vifs.len()
    }

    /// Two-phase stop: mark the VIF halting, drain everything admitted
    /// before the mark, then unlink and release it.
    ///
    /// A concurrent second stop waits for the first one to finish.
    pub fn stop_vif(self: &Arc<Self>, vif: &Arc<Vif>) {
        if !vif.begin_halt() {
            vif.wait_destroyed();
            return;
        }
        info!(binding = %self.id, vif = %vif.id(), "stopping VIF");

        request::fail_queued(vif, MuxError::Halting(vif.id()));
        vif.drain();
        self.unlink_vif(vif);
        vif.finish_halt();
        self.dereference();

        info!(binding = %self.id, vif = %vif.id(), "VIF stopped");
    }

    /// Remove a VIF from the list without stopping it. Returns false if it
    /// was not linked.
    pub fn unlink_vif(self: &Arc<Self>, vif: &Vif) -> bool {
        let Some(transition) = self.vifs.remove(vif.id()) else {
            return false;
        };
        debug!(binding = %self.id, vif = %vif.id(), "VIF unlinked");
        if let Some(filter) = transition {
            self.push_lower_filter(filter);
        }
        true
    }

    pub(crate) fn set_vif_filter(self: &Arc<Self>, vif: &Vif, filter: PacketFilter) {
        if let Some(lower) = self.vifs.set_filter(vif, filter) {
            self.push_lower_filter(lower);
        }
    }

    fn push_lower_filter(self: &Arc<Self>, filter: PacketFilter) {
        debug!(binding = %self.id, filter = ?filter, "updating lower packet filter");
        let request = Request::set_u32(Oid::GEN_CURRENT_PACKET_FILTER, filter.bits());
        if let Err(e) = request::binding_request(self, request, Completion::Discard) {
            warn!(binding = %self.id, error = %e, "failed to update lower packet filter");
        }
    }

    /// Issue a request on the binding's own behalf.
    pub fn request_async(
        self: &Arc<Self>,
        request: Request,
        completion: Completion,
    ) -> Result<RequestStatus> {
        request::binding_request(self, request, completion)
    }

    /// Issue a request on the binding's own behalf and wait for the answer.
    pub fn request_sync(self: &Arc<Self>, request: Request) -> Result<RequestOutcome> {
        request::binding_request_sync(self, request)
    }

    /// Re-query link speed, lookahead and address from the lower binding.
    pub fn refresh_capabilities(self: &Arc<Self>) -> Result<Arc<Capabilities>> {
        let link_speed = self
            .request_sync(Request::query(Oid::GEN_LINK_SPEED, 4))?
            .as_u32();
        let max_lookahead = self
            .request_sync(Request::query(Oid::GEN_MAXIMUM_LOOKAHEAD, 4))?
            .as_u32();
        let address = self.request_sync(Request::query(Oid::ETH_CURRENT_ADDRESS, 6))?;
        let current_address = MacAddr::from_slice(&address.data);

        self.caps.rcu(|caps| {
            let mut caps = (**caps).clone();
            if let Some(speed) = link_speed {
                caps.link_speed = speed;
            }
            if let Some(lookahead) = max_lookahead {
                caps.max_lookahead = lookahead;
            }
            if let Some(addr) = current_address {
                caps.current_address = addr;
            }
            caps
        });
        let caps = self.capabilities();
        debug!(
            binding = %self.id,
            link_speed = caps.link_speed,
            max_lookahead = caps.max_lookahead,
            "capabilities refreshed"
        );
        Ok(caps)
    }

    /// Device power event from the lower binding.
    ///
    /// Going to low power waits up to [`QUIESCE_TIMEOUT`] for outstanding
    /// I/O. Returning to D0 replays requests parked while in low power,
    /// independently per VIF.
    pub fn set_power(self: &Arc<Self>, state: DevicePowerState) {
        let old = self.caps.rcu(|caps| Capabilities {
            power: state,
            ..(**caps).clone()
        });
        let old = old.power;
        info!(binding = %self.id, from = ?old, to = ?state, "binding power state changed");

        if state.is_low_power() && !old.is_low_power() {
            if !self.io.wait_idle_timeout(QUIESCE_TIMEOUT) {
                warn!(
                    binding = %self.id,
                    outstanding = self.io.active(),
                    "I/O did not quiesce before low power"
                );
            }
        } else if !state.is_low_power() && old.is_low_power() {
            let replayed = self
                .vifs()
                .iter()
                .filter(|vif| request::replay_queued(self, vif))
                .count();
            if replayed > 0 {
                debug!(binding = %self.id, replayed, "queued requests replayed");
            }
        }
    }

    /// Media connect status from the lower binding, fanned out to every
    /// VIF. VIFs in low power keep the latest status for later.
    pub fn indicate_status(self: &Arc<Self>, status: MediaStatus) {
        info!(binding = %self.id, status = ?status, "media status");
        for vif in self.vifs() {
            vif.deliver_status(status);
        }
    }

    /// Stop every VIF, release the base reference and destroy the binding
    /// once the last in-flight operation has finished.
    ///
    /// A concurrent second call returns once the binding is destroyed.
    pub fn unbind(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            self.torn_down.wait();
            return;
        }
        info!(binding = %self.id, adapter = %self.adapter, "unbinding");

        let vifs = self.vifs.close();
        for vif in &vifs {
            self.unlink_vif(vif);
        }
        for vif in &vifs {
            self.stop_vif(vif);
        }

        self.dereference();
        self.released.wait();
        self.destroy();
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .field("vifs", &self.vifs.len())
            .field("refs", &self.refs.get())
            .finish_non_exhaustive()
    }
}

/// A counted reference to a binding, held for the duration of one
/// operation and released on drop.
pub struct BindingRef {
    binding: Arc<Binding>,
}

impl BindingRef {
    pub fn arc(&self) -> &Arc<Binding> {
        &self.binding
    }
}

impl Deref for BindingRef {
    type Target = Binding;

    fn deref(&self) -> &Binding {
        &self.binding
    }
}

impl Drop for BindingRef {
    fn drop(&mut self) {
        self.binding.io.exit();
        self.binding.dereference();
    }
}

impl fmt::Debug for BindingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BindingRef").field(&self.binding.id).finish()
    }
}
