//! Device registry
//!
//! Source of pollable endpoints and sink for status changes. Only the
//! scheduler writes statuses; an external health check is expected to put
//! broken devices back to `active`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use meter_protocols::{DataGroup, DeviceEndpoint, DeviceId, DeviceStatus};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::catalog::ModelCatalog;
use crate::config::PollSrvConfig;
use crate::error::{PollSrvError, Result};

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Active devices with at least one block in `group`, ordered by id
    async fn active_devices(&self, group: DataGroup) -> Result<Vec<DeviceEndpoint>>;

    async fn set_status(
        &self,
        device: DeviceId,
        status: DeviceStatus,
        notes: Option<String>,
    ) -> Result<()>;
}

/// Registry held in memory, seeded from configuration
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<BTreeMap<DeviceId, DeviceEndpoint>>,
}

impl MemoryRegistry {
    pub fn new(endpoints: impl IntoIterator<Item = DeviceEndpoint>) -> Self {
        Self {
            devices: RwLock::new(endpoints.into_iter().map(|e| (e.id, e)).collect()),
        }
    }

    pub fn from_config(config: &PollSrvConfig, catalog: &ModelCatalog) -> Result<Self> {
        let endpoints = config
            .devices
            .iter()
            .map(|device| catalog.endpoint(device))
            .collect::<Result<Vec<_>>>()?;
        info!("Registry loaded with {} devices", endpoints.len());
        Ok(Self::new(endpoints))
    }

    pub fn get(&self, device: DeviceId) -> Option<DeviceEndpoint> {
        self.devices.read().get(&device).cloned()
    }

    pub fn status(&self, device: DeviceId) -> Option<DeviceStatus> {
        self.devices.read().get(&device).map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn active_devices(&self, group: DataGroup) -> Result<Vec<DeviceEndpoint>> {
        Ok(self
            .devices
            .read()
            .values()
            .filter(|e| e.status == DeviceStatus::Active && !e.blocks(group).is_empty())
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        device: DeviceId,
        status: DeviceStatus,
        notes: Option<String>,
    ) -> Result<()> {
        let mut devices = self.devices.write();
        let endpoint = devices
            .get_mut(&device)
            .ok_or_else(|| PollSrvError::config(format!("unknown device {device}")))?;

        if endpoint.status != status {
            warn!(
                "Device {} ({}) status {} -> {}",
                device, endpoint.name, endpoint.status, status
            );
        }
        endpoint.status = status;
        endpoint.notes = notes;
        Ok(())
    }
}
