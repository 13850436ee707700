//! Multiplexer front end: binds adapters and tears them down again.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::binding::{Binding, BootstrapReport};
use crate::config::{BindingConfig, MuxConfig};
use crate::error::{MuxError, Result};
use crate::lower::LowerOpener;
use crate::registry::BindingRegistry;

/// Owns the binding registry and opens lower bindings on demand.
pub struct Multiplexer {
    registry: Arc<BindingRegistry>,
    opener: Arc<dyn LowerOpener>,
}

impl Multiplexer {
    pub fn new(opener: Arc<dyn LowerOpener>) -> Self {
        Self {
            registry: Arc::new(BindingRegistry::new()),
            opener,
        }
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    pub fn binding(&self, adapter: &str) -> Option<Arc<Binding>> {
        self.registry.find_by_adapter(adapter)
    }

    /// Open `config.adapter`, bind it and create its VIFs.
    ///
    /// Fails if the adapter cannot be opened or queried; individual VIF
    /// failures are only reported.
    pub fn bind(&self, config: &BindingConfig) -> Result<(Arc<Binding>, BootstrapReport)> {
        if self.registry.find_by_adapter(&config.adapter).is_some() {
            return Err(MuxError::AdapterBound(config.adapter.clone()));
        }

        let lower = self.opener.open_binding(&config.adapter)?;
        let binding = match Binding::create(&self.registry, &config.adapter, Arc::clone(&lower)) {
            Ok(binding) => binding,
            Err(e) => {
                if let Err(close_err) = lower.close() {
                    debug!(
                        adapter = %config.adapter,
                        error = %close_err,
                        "close after failed bind"
                    );
                }
                return Err(e);
            }
        };

        let report = binding.bootstrap_vifs(&config.vifs);
        Ok((binding, report))
    }

    /// Bind every adapter in `config`. Adapters that fail are logged and
    /// skipped.
    pub fn bind_all(&self, config: &MuxConfig) -> Vec<(Arc<Binding>, BootstrapReport)> {
        let mut bound = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            match self.bind(binding) {
                Ok(result) => bound.push(result),
                Err(e) => warn!(adapter = %binding.adapter, error = %e, "failed to bind adapter"),
            }
        }
        bound
    }

    /// Create the VIFs of `config` that do not exist yet on already bound
    /// adapters. Existing VIFs are left alone.
    pub fn reconfigure(&self, config: &MuxConfig) -> Vec<BootstrapReport> {
        let mut reports = Vec::new();
        for binding_config in &config.bindings {
            let Some(binding) = self.registry.find_by_adapter(&binding_config.adapter) else {
                debug!(adapter = %binding_config.adapter, "not bound, skipping reconfigure");
                continue;
            };
            reports.push(binding.bootstrap_vifs(&binding_config.vifs));
        }
        reports
    }

    /// Stop every VIF of `adapter` and destroy its binding.
    pub fn unbind(&self, adapter: &str) -> Result<()> {
        let binding = self
            .registry
            .find_by_adapter(adapter)
            .ok_or_else(|| MuxError::UnknownAdapter(adapter.to_string()))?;
        binding.unbind();
        Ok(())
    }

    /// Unbind every adapter.
    pub fn shutdown(&self) {
        let bindings = self.registry.bindings();
        info!(bindings = bindings.len(), "shutting down multiplexer");
        for binding in bindings {
            binding.unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use crate::config::VifDefinition;
    use crate::lower::LowerError;
    use crate::test_util::StubOpener;

    fn binding_config(adapter: &str, keys: &[&str]) -> BindingConfig {
        BindingConfig {
            adapter: adapter.into(),
            vifs: keys.iter().map(|k| VifDefinition::new(*k)).collect(),
        }
    }

    #[test]
    fn test_bind_and_unbind() {
        let opener = StubOpener::new();
        let mux = Multiplexer::new(opener.clone());

        let (binding, report) = mux.bind(&binding_config("eth0", &["a", "b"])).unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(binding.vif_count(), 2);
        assert!(mux.binding("eth0").is_some());

        assert_eq!(
            mux.bind(&binding_config("eth0", &[])).unwrap_err(),
            MuxError::AdapterBound("eth0".into())
        );

        mux.unbind("eth0").unwrap();
        assert!(mux.registry().is_empty());
        assert!(opener.stub("eth0").unwrap().is_closed());
        assert_eq!(
            mux.unbind("eth0").unwrap_err(),
            MuxError::UnknownAdapter("eth0".into())
        );
    }

    #[test]
    fn test_bind_open_failure() {
        let opener = StubOpener::new();
        opener.fail("eth9");
        let mux = Multiplexer::new(opener);
        assert!(matches!(
            mux.bind(&binding_config("eth9", &["a"])),
            Err(MuxError::Lower(LowerError::Open { .. }))
        ));
        assert!(mux.registry().is_empty());
    }

    #[test]
    fn test_bind_all_skips_failures() {
        let opener = StubOpener::new();
        opener.fail("bad");
        let mux = Multiplexer::new(opener);
        let config = MuxConfig {
            bindings: vec![binding_config("eth0", &["a"]), binding_config("bad", &["b"])],
        };
        let bound = mux.bind_all(&config);
        assert_eq!(bound.len(), 1);
        assert_eq!(mux.registry().len(), 1);
        mux.shutdown();
        assert!(mux.registry().is_empty());
    }

    #[test]
    fn test_reconfigure_adds_missing_vifs() {
        let mux = Multiplexer::new(StubOpener::new());
        let (binding, _) = mux.bind(&binding_config("eth0", &["a"])).unwrap();
        let first = binding.find_vif("a").unwrap();

        let config = MuxConfig {
            bindings: vec![
                binding_config("eth0", &["a", "b"]),
                binding_config("eth1", &["c"]),
            ],
        };
        let reports = mux.reconfigure(&config);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].created.len(), 1);
        assert_eq!(reports[0].skipped, vec!["a".to_string()]);
        assert_eq!(binding.vif_count(), 2);
        assert!(Arc::ptr_eq(&binding.find_vif("a").unwrap(), &first));
        assert!(mux.binding("eth1").is_none());
        mux.shutdown();
    }

    #[test]
    fn test_concurrent_binds_register_one() {
        let opener = StubOpener::new();
        let mux = Multiplexer::new(opener.clone());
        let config = binding_config("eth0", &["a"]);
        let barrier = Barrier::new(8);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        mux.bind(&config).map(|(binding, _)| binding)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let bound: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(bound.len(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(*err, MuxError::AdapterBound("eth0".into()));
        }
        assert_eq!(mux.registry().len(), 1);
        assert_eq!(bound[0].vif_count(), 1);

        mux.shutdown();
        assert!(mux.registry().is_empty());
    }
}
