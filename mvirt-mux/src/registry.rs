//! Binding registry.
//!
//! Process-wide list of bound adapters plus the counter VIF numbers are
//! drawn from.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::binding::{Binding, BindingId};
use crate::error::{MuxError, Result};
use crate::vif::{Vif, VifId};

/// Central registry for all bindings.
pub struct BindingRegistry {
    /// Bindings in bind order.
    bindings: RwLock<Vec<Arc<Binding>>>,
    /// Next VIF number. Never reused.
    next_vif: AtomicU32,
}

impl BindingRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        BindingRegistry {
            bindings: RwLock::new(Vec::new()),
            next_vif: AtomicU32::new(1),
        }
    }

    /// Allocate the next VIF number.
    pub fn next_vif_id(&self) -> VifId {
        VifId(self.next_vif.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a binding. At most one binding per adapter.
    pub(crate) fn insert(&self, binding: Arc<Binding>) -> Result<()> {
        let mut bindings = self.bindings.write().unwrap();
        if bindings.iter().any(|b| b.adapter() == binding.adapter()) {
            return Err(MuxError::AdapterBound(binding.adapter().to_string()));
        }
        bindings.push(binding);
        Ok(())
    }

    /// Remove a binding by ID.
    ///
    /// Returns the removed binding if it was registered.
    pub(crate) fn remove(&self, id: BindingId) -> Option<Arc<Binding>> {
        let mut bindings = self.bindings.write().unwrap();
        let pos = bindings.iter().position(|b| b.id() == id)?;
        Some(bindings.remove(pos))
    }

    pub fn get(&self, id: BindingId) -> Option<Arc<Binding>> {
        self.bindings
            .read()
            .unwrap()
            .iter()
            .find(|b| b.id() == id)
            .cloned()
    }

    /// Look up a binding by adapter name.
    pub fn find_by_adapter(&self, adapter: &str) -> Option<Arc<Binding>> {
        self.bindings
            .read()
            .unwrap()
            .iter()
            .find(|b| b.adapter() == adapter)
            .cloned()
    }

    /// Find a VIF on any binding.
    pub fn find_vif(&self, id: VifId) -> Option<Arc<Vif>> {
        self.bindings.read().unwrap().iter().find_map(|b| b.vif(id))
    }

    /// Snapshot of all registered bindings.
    pub fn bindings(&self) -> Vec<Arc<Binding>> {
        self.bindings.read().unwrap().clone()
    }

    /// Get the number of registered bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().unwrap().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.bindings.read().unwrap().is_empty()
    }
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
