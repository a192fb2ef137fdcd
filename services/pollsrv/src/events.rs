//! Poll cycle events
//!
//! The scheduler reports progress through an [`EventSink`] instead of
//! logging directly, so callers can collect or forward events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use meter_protocols::{DataGroup, DeviceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    CycleStarted {
        group: DataGroup,
        devices: usize,
        at: DateTime<Utc>,
    },
    DevicePolled {
        group: DataGroup,
        device: DeviceId,
        elapsed_ms: u64,
        values: usize,
    },
    DeviceFailed {
        group: DataGroup,
        device: DeviceId,
        reason: String,
        elapsed_ms: u64,
    },
    ReconciliationRejected {
        device: DeviceId,
        reason: String,
    },
    CycleFinished {
        group: DataGroup,
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CycleEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CycleEvent) {
        match event {
            CycleEvent::CycleStarted { group, devices, .. } => {
                info!("{} cycle started: {} devices", group, devices);
            },
            CycleEvent::DevicePolled {
                group,
                device,
                elapsed_ms,
                values,
            } => {
                debug!(
                    "Device {} {} poll ok: {} values in {}ms",
                    device, group, values, elapsed_ms
                );
            },
            CycleEvent::DeviceFailed {
                group,
                device,
                reason,
                elapsed_ms,
            } => {
                warn!(
                    "Device {} {} poll failed after {}ms: {}",
                    device, group, elapsed_ms, reason
                );
            },
            CycleEvent::ReconciliationRejected { device, reason } => {
                warn!("Device {} reading rejected: {}", device, reason);
            },
            CycleEvent::CycleFinished {
                group,
                succeeded,
                failed,
                elapsed_ms,
            } => {
                info!(
                    "{} cycle finished in {}ms: {} ok, {} failed",
                    group, elapsed_ms, succeeded, failed
                );
            },
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<CycleEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CycleEvent> {
        self.events.lock().clone()
    }

    /// Failure reasons by device
    pub fn failures(&self) -> HashMap<DeviceId, String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CycleEvent::DeviceFailed { device, reason, .. } => Some((*device, reason.clone())),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: CycleEvent) {
        self.events.lock().push(event);
    }
}
