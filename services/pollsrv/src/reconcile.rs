//! Counter Reconciliation Engine
//!
//! Turns absolute energy counters into per-interval deltas. Each device keeps
//! one reference counter (the last absolute values seen and when); a new
//! reading is compared against it:
//!
//! - no reference yet: a zero-delta baseline record at the reading time
//! - at most one interval elapsed: one record with the full delta
//! - several intervals elapsed: the delta is spread evenly over the missed
//!   intervals, starting at the reference time, flagged as calculated
//!
//! Counters must be finite and must never decrease; a NaN, infinite or
//! negative delta rejects the reading and nothing is written. The reference update and the interval records of one
//! reading are committed together.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use meter_protocols::codec::round2;
use meter_protocols::{DecodedReading, DeviceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PollSrvError, Result};
use crate::storage::MeterStore;

/// Last absolute counter values of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCounter {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, f64>,
}

/// Per-field consumption attributed to one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, f64>,
    /// Interpolated across a gap rather than measured
    pub is_calculated: bool,
}

/// What to do when the reference is older than the interpolation limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Reject the reading; the reference stays where it was
    #[default]
    Reject,
    /// Book the whole delta as one measured record at the reading time
    Rebaseline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub max_interpolated_intervals: i64,
    pub stale_policy: StalePolicy,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::minutes(15),
            max_interpolated_intervals: 2_880,
            stale_policy: StalePolicy::Reject,
        }
    }
}

/// Writes produced by reconciling one reading
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub reference: ReferenceCounter,
    pub records: Vec<IntervalRecord>,
}

/// Compute the reconciliation of `reading` against `reference` without
/// touching storage.
pub fn plan(
    reading: &DecodedReading,
    reference: Option<&ReferenceCounter>,
    settings: &ReconcileSettings,
) -> Result<Reconciliation> {
    let device = reading.device_id;
    let now = reading.timestamp;

    if let Some((field, value)) = reading.values.iter().find(|(_, v)| !v.is_finite()) {
        return Err(PollSrvError::InvalidCounter {
            device,
            field: field.clone(),
            value: *value,
        });
    }

    let Some(reference) = reference else {
        debug!("Device {} has no reference counter, baselining at {}", device, now);
        let zeros = reading.values.keys().map(|f| (f.clone(), 0.0)).collect();
        return Ok(Reconciliation {
            reference: next_reference(None, reading),
            records: vec![IntervalRecord {
                device_id: device,
                timestamp: now,
                values: zeros,
                is_calculated: false,
            }],
        });
    };

    let mut deltas = HashMap::with_capacity(reading.values.len());
    for (field, current) in &reading.values {
        let previous = reference.values.get(field).copied().unwrap_or(0.0);
        let delta = current - previous;
        // A NaN reference value yields a NaN delta
        if delta.is_nan() || delta < 0.0 {
            return Err(PollSrvError::NonMonotonicCounter {
                device,
                field: field.clone(),
                previous,
                current: *current,
            });
        }
        deltas.insert(field.clone(), delta);
    }

    let elapsed = now - reference.timestamp;
    if elapsed < Duration::zero() {
        warn!(
            "Device {} reading at {} precedes its reference at {}, booking a single interval",
            device, now, reference.timestamp
        );
    }
    let missed = missed_intervals(elapsed, settings.interval);

    let single = |deltas| IntervalRecord {
        device_id: device,
        timestamp: now,
        values: deltas,
        is_calculated: false,
    };

    let records = if missed > settings.max_interpolated_intervals {
        match settings.stale_policy {
            StalePolicy::Reject => {
                return Err(PollSrvError::StaleReference {
                    device,
                    missed,
                    limit: settings.max_interpolated_intervals,
                })
            },
            StalePolicy::Rebaseline => {
                warn!(
                    "Device {} missed {} intervals, rebaselining without interpolation",
                    device, missed
                );
                vec![single(deltas)]
            },
        }
    } else if missed <= 1 {
        vec![single(deltas)]
    } else {
        let share: HashMap<String, f64> = deltas
            .into_iter()
            .map(|(field, delta)| (field, round2(delta / missed as f64)))
            .collect();
        (0..missed)
            .map(|k| IntervalRecord {
                device_id: device,
                timestamp: reference.timestamp + settings.interval * k as i32,
                values: share.clone(),
                is_calculated: true,
            })
            .collect()
    };

    Ok(Reconciliation {
        reference: next_reference(Some(reference), reading),
        records,
    })
}

/// Whole intervals between the reference and the reading, never negative
pub fn missed_intervals(elapsed: Duration, interval: Duration) -> i64 {
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return 0;
    }
    (elapsed.num_milliseconds() / interval_ms).max(0)
}

/// The reading's values over the previous reference, so a field missing from
/// one reading keeps its last absolute value.
fn next_reference(previous: Option<&ReferenceCounter>, reading: &DecodedReading) -> ReferenceCounter {
    let mut values = previous.map(|r| r.values.clone()).unwrap_or_default();
    values.extend(reading.values.iter().map(|(k, v)| (k.clone(), *v)));
    ReferenceCounter {
        device_id: reading.device_id,
        timestamp: reading.timestamp,
        values,
    }
}

/// Reconciles readings against stored references, one device at a time
pub struct CounterReconciler {
    store: Arc<dyn MeterStore>,
    settings: ReconcileSettings,
    locks: DashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>,
}

impl CounterReconciler {
    pub fn new(store: Arc<dyn MeterStore>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            settings,
            locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Reconcile one cumulative reading and commit the result.
    ///
    /// Readings of the same device are serialized; different devices proceed
    /// in parallel.
    pub async fn reconcile(&self, reading: &DecodedReading) -> Result<Vec<IntervalRecord>> {
        let lock = self
            .locks
            .entry(reading.device_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let reference = self.store.load_reference(reading.device_id).await?;
        let reconciliation = plan(reading, reference.as_ref(), &self.settings)?;
        self.store
            .commit_reconciliation(&reconciliation.reference, &reconciliation.records)
            .await?;

        debug!(
            "Device {} reconciled: {} interval records",
            reading.device_id,
            reconciliation.records.len()
        );
        Ok(reconciliation.records)
    }
}
