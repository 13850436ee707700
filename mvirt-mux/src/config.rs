//! Adapter and VIF configuration.
//!
//! The core only consumes `&[VifDefinition]`; loading the JSON file is
//! left to the daemon.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mac::MacAddr;
use crate::vif::{DEFAULT_MAX_BUSY_SENDS, DEFAULT_RECEIVE_QUEUE_CAPACITY};

/// Largest usable 802.1Q VLAN id.
pub const MAX_VLAN_ID: u16 = 4094;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("adapter {0} configured twice")]
    DuplicateAdapter(String),

    #[error("adapter {adapter}: device key {key} configured twice")]
    DuplicateVif { adapter: String, key: String },

    #[error("adapter {adapter}: device key {key}: {reason}")]
    InvalidVif {
        adapter: String,
        key: String,
        reason: String,
    },
}

/// One virtual interface to create at bind time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VifDefinition {
    pub device_key: String,
    /// Overrides the generated current address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_address: Option<MacAddr>,
    /// 0 disables tagging.
    #[serde(default)]
    pub vlan_id: u16,
    #[serde(default = "default_receive_queue_capacity")]
    pub receive_queue_capacity: usize,
    #[serde(default = "default_max_busy_sends")]
    pub max_busy_sends: usize,
}

fn default_receive_queue_capacity() -> usize {
    DEFAULT_RECEIVE_QUEUE_CAPACITY
}

fn default_max_busy_sends() -> usize {
    DEFAULT_MAX_BUSY_SENDS
}

impl VifDefinition {
    pub fn new(device_key: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            station_address: None,
            vlan_id: 0,
            receive_queue_capacity: DEFAULT_RECEIVE_QUEUE_CAPACITY,
            max_busy_sends: DEFAULT_MAX_BUSY_SENDS,
        }
    }

    pub fn station_address(mut self, addr: MacAddr) -> Self {
        self.station_address = Some(addr);
        self
    }

    pub fn vlan_id(mut self, vlan_id: u16) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    pub fn receive_queue_capacity(mut self, capacity: usize) -> Self {
        self.receive_queue_capacity = capacity;
        self
    }

    pub fn max_busy_sends(mut self, max: usize) -> Self {
        self.max_busy_sends = max;
        self
    }

    fn check(&self) -> Result<(), String> {
        if self.device_key.is_empty() {
            return Err("empty device key".into());
        }
        if self.vlan_id > MAX_VLAN_ID {
            return Err(format!("vlan id {} out of range", self.vlan_id));
        }
        if self.receive_queue_capacity == 0 {
            return Err("receive queue capacity must be positive".into());
        }
        if self.max_busy_sends == 0 {
            return Err("max busy sends must be positive".into());
        }
        if let Some(addr) = self.station_address
            && !addr.is_unicast()
        {
            return Err(format!("station address {addr} is not unicast"));
        }
        Ok(())
    }
}

/// One adapter to bind and the VIFs to create on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingConfig {
    pub adapter: String,
    #[serde(default)]
    pub vifs: Vec<VifDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuxConfig {
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl MuxConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: MuxConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut adapters = HashSet::new();
        for binding in &self.bindings {
            if !adapters.insert(binding.adapter.as_str()) {
                return Err(ConfigError::DuplicateAdapter(binding.adapter.clone()));
            }
            let mut keys = HashSet::new();
            for vif in &binding.vifs {
                if !keys.insert(vif.device_key.as_str()) {
                    return Err(ConfigError::DuplicateVif {
                        adapter: binding.adapter.clone(),
                        key: vif.device_key.clone(),
                    });
                }
                vif.check().map_err(|reason| ConfigError::InvalidVif {
                    adapter: binding.adapter.clone(),
                    key: vif.device_key.clone(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    pub fn binding(&self, adapter: &str) -> Option<&BindingConfig> {
        self.bindings.iter().find(|b| b.adapter == adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "bindings": [
            {
                "adapter": "eth0",
                "vifs": [
                    { "device_key": "vif0" },
                    { "device_key": "vif1", "station_address": "02:00:00:aa:bb:cc", "vlan_id": 10 }
                ]
            },
            { "adapter": "eth1" }
        ]
    }"#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let config = MuxConfig::load(file.path()).unwrap();

        assert_eq!(config.bindings.len(), 2);
        let eth0 = config.binding("eth0").unwrap();
        assert_eq!(eth0.vifs[0], VifDefinition::new("vif0"));
        assert_eq!(
            eth0.vifs[1].station_address,
            Some("02:00:00:aa:bb:cc".parse().unwrap())
        );
        assert_eq!(eth0.vifs[1].vlan_id, 10);
        assert_eq!(
            eth0.vifs[1].receive_queue_capacity,
            DEFAULT_RECEIVE_QUEUE_CAPACITY
        );
        assert!(config.binding("eth1").unwrap().vifs.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MuxConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_parse_error() {
        let file = write_config(r#"{ "bindings": [ { "adapter": 3 } ] }"#);
        assert!(matches!(
            MuxConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let file = write_config(r#"{ "bindings": [], "extra": true }"#);
        assert!(matches!(
            MuxConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_duplicate_keys() {
        let config = MuxConfig {
            bindings: vec![BindingConfig {
                adapter: "eth0".into(),
                vifs: vec![VifDefinition::new("a"), VifDefinition::new("a")],
            }],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateVif { .. })
        ));

        let config = MuxConfig {
            bindings: vec![
                BindingConfig {
                    adapter: "eth0".into(),
                    vifs: vec![],
                },
                BindingConfig {
                    adapter: "eth0".into(),
                    vifs: vec![],
                },
            ],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateAdapter(_))
        ));
    }

    #[test]
    fn test_invalid_vif() {
        let bad = [
            VifDefinition::new("a").vlan_id(4095),
            VifDefinition::new("a").receive_queue_capacity(0),
            VifDefinition::new("a").max_busy_sends(0),
            VifDefinition::new("a").station_address(MacAddr::BROADCAST),
            VifDefinition::new(""),
        ];
        for vif in bad {
            let config = MuxConfig {
                bindings: vec![BindingConfig {
                    adapter: "eth0".into(),
                    vifs: vec![vif],
                }],
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidVif { .. })
            ));
        }
    }
}
