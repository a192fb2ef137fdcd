//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `POLLSRV_` environment variables (`__` separates nested keys, e.g.
//! `POLLSRV_POLL__CONCURRENCY=16`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use meter_protocols::register_map::MAX_BLOCK_SIZE;
use meter_protocols::{DeviceId, DeviceStatus, ProtocolKind, TransformTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PollSrvError, Result};
use crate::reconcile::{ReconcileSettings, StalePolicy};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "POLLSRV_";

/// Default Modbus TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSrvConfig {
    pub poll: PollConfig,
    pub reconcile: ReconcileConfig,
    pub storage: StorageConfig,
    pub models: Vec<ModelConfig>,
    pub devices: Vec<DeviceConfig>,
}

/// Polling cadence and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Devices polled in parallel; defaults to 4 x available cores
    pub concurrency: Option<usize>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Devices not done within this window fail the cycle's deadline
    pub cycle_deadline_secs: u64,
    pub instant_interval_secs: u64,
    pub cumulative_interval_secs: u64,
    /// Registers per read request
    pub max_block_size: u16,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 3_000,
            cycle_deadline_secs: 120,
            instant_interval_secs: 60,
            cumulative_interval_secs: 900,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}

impl PollConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            4 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn instant_interval(&self) -> Duration {
        Duration::from_secs(self.instant_interval_secs)
    }

    pub fn cumulative_interval(&self) -> Duration {
        Duration::from_secs(self.cumulative_interval_secs)
    }
}

/// Counter reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_minutes: u32,
    /// Gaps longer than this many intervals are not interpolated
    pub max_interpolated_intervals: i64,
    pub stale_policy: StalePolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            max_interpolated_intervals: 2_880,
            stale_policy: StalePolicy::Reject,
        }
    }
}

impl ReconcileConfig {
    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            interval: chrono::Duration::minutes(i64::from(self.interval_minutes)),
            max_interpolated_intervals: self.max_interpolated_intervals,
            stale_policy: self.stale_policy,
        }
    }
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_url: "sqlite://data/pollsrv.db".to_string(),
            max_connections: 4,
        }
    }
}

/// A device model: register schema plus value transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// CSV register schema; relative paths resolve against the config file
    pub schema_path: PathBuf,
    #[serde(default)]
    pub transforms: TransformTable,
}

/// A polled device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub model: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_protocol() -> ProtocolKind {
    ProtocolKind::Tcp
}

fn default_unit_id() -> u8 {
    1
}

impl PollSrvConfig {
    /// Load defaults, the YAML file and the environment, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PollSrvError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let figment = Self::defaults()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let mut config: Self = figment.extract()?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base_dir);
        config.validate()?;
        debug!(
            "Loaded {} models and {} devices from {}",
            config.models.len(),
            config.devices.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse and validate YAML text; relative schema paths resolve against
    /// `base_dir`.
    pub fn from_yaml_str(yaml: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Self = Self::defaults().merge(Yaml::string(yaml)).extract()?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        for model in &mut self.models {
            if model.schema_path.is_relative() {
                model.schema_path = base_dir.join(&model.schema_path);
            }
        }
    }

    /// Check ranges and cross-references
    pub fn validate(&self) -> Result<()> {
        let poll = &self.poll;
        if poll.max_block_size == 0 || poll.max_block_size > MAX_BLOCK_SIZE {
            return Err(PollSrvError::config(format!(
                "poll.max_block_size must be within 1..={MAX_BLOCK_SIZE}, got {}",
                poll.max_block_size
            )));
        }
        if poll.concurrency == Some(0) {
            return Err(PollSrvError::config("poll.concurrency must be at least 1"));
        }
        if poll.cycle_deadline_secs == 0 {
            return Err(PollSrvError::config("poll.cycle_deadline_secs must be positive"));
        }
        if poll.instant_interval_secs == 0 || poll.cumulative_interval_secs == 0 {
            return Err(PollSrvError::config("poll intervals must be positive"));
        }
        if self.reconcile.interval_minutes == 0 {
            return Err(PollSrvError::config("reconcile.interval_minutes must be positive"));
        }
        if self.reconcile.max_interpolated_intervals < 1 {
            return Err(PollSrvError::config(
                "reconcile.max_interpolated_intervals must be at least 1",
            ));
        }

        let mut model_names = HashSet::new();
        for model in &self.models {
            if !model_names.insert(model.name.as_str()) {
                return Err(PollSrvError::config(format!(
                    "duplicate model name: {}",
                    model.name
                )));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id) {
                return Err(PollSrvError::config(format!(
                    "duplicate device ID: {}",
                    device.id
                )));
            }
            if !model_names.contains(device.model.as_str()) {
                return Err(PollSrvError::config(format!(
                    "device {} references unknown model '{}'",
                    device.id, device.model
                )));
            }
            if !device.protocol.is_supported() {
                warn!(
                    "Device {} uses {} which cannot be polled; it will be marked broken",
                    device.id, device.protocol
                );
            }
        }

        Ok(())
    }
}
