//! Fleet Poll Scheduler
//!
//! One cycle polls every active device of a data group with bounded
//! concurrency. A device failure marks that device broken and never touches
//! its siblings. Instant readings are persisted as one batch; cumulative
//! readings go through the reconciliation engine device by device.
//!
//! Devices still running when the cycle deadline passes fail with a deadline
//! cause. Dropping their in-flight poll closes the socket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use meter_protocols::{DataGroup, DecodedReading, DeviceClient, DeviceId, DeviceStatus};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::events::{CycleEvent, EventSink, TracingEventSink};
use crate::reconcile::CounterReconciler;
use crate::registry::DeviceRegistry;
use crate::storage::MeterStore;

/// Why a device produced no usable reading this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFailure {
    pub device_id: DeviceId,
    pub reason: String,
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub group: DataGroup,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Devices polled
    pub total: usize,
    /// Devices that returned a reading
    pub succeeded: usize,
    /// Devices that failed to poll, marked broken
    pub failed: Vec<DeviceFailure>,
    /// Cumulative readings polled but not reconciled
    pub reconcile_failures: Vec<DeviceFailure>,
    /// Readings written (instant batch) or reconciled (cumulative)
    pub readings_persisted: usize,
    pub interval_records_written: usize,
}

impl CycleSummary {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn failed_devices(&self) -> Vec<DeviceId> {
        self.failed.iter().map(|f| f.device_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Polls in flight at once
    pub concurrency: usize,
    pub cycle_deadline: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cycle_deadline: Duration::from_secs(120),
        }
    }
}

type PollOutcome = (DeviceId, Duration, std::result::Result<DecodedReading, String>);

pub struct FleetScheduler {
    registry: Arc<dyn DeviceRegistry>,
    client: DeviceClient,
    store: Arc<dyn MeterStore>,
    reconciler: Arc<CounterReconciler>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl FleetScheduler {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        client: DeviceClient,
        store: Arc<dyn MeterStore>,
        reconciler: Arc<CounterReconciler>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            reconciler,
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Poll every active device of `group` once.
    ///
    /// Device failures are reported in the summary. Only a registry or
    /// instant-batch storage failure fails the cycle itself.
    pub async fn run_cycle(&self, group: DataGroup) -> Result<CycleSummary> {
        let started_at = self.clock.now();
        let started = Instant::now();
        let endpoints = self.registry.active_devices(group).await?;
        let total = endpoints.len();

        self.events.emit(CycleEvent::CycleStarted {
            group,
            devices: total,
            at: started_at,
        });

        let deadline = started + self.settings.cycle_deadline;
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut pending: HashSet<DeviceId> = HashSet::with_capacity(total);
        let mut tasks: JoinSet<PollOutcome> = JoinSet::new();

        for endpoint in endpoints {
            pending.insert(endpoint.id);
            let client = self.client.clone();
            let clock = Arc::clone(&self.clock);
            let semaphore = Arc::clone(&semaphore);
            let budget = self.settings.cycle_deadline;

            tasks.spawn(async move {
                let polled_at = Instant::now();
                let poll = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| "poll permits closed".to_string())?;
                    client
                        .poll(&endpoint, group, clock.now())
                        .await
                        .map_err(|e| e.to_string())
                };
                let outcome = match timeout_at(deadline, poll).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(format!("cycle deadline of {budget:?} exceeded")),
                };
                (endpoint.id, polled_at.elapsed(), outcome)
            });
        }

        let mut readings = Vec::with_capacity(total);
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (device_id, elapsed, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Poll task failed: {}", e);
                    continue;
                },
            };
            pending.remove(&device_id);
            let elapsed_ms = elapsed.as_millis() as u64;

            match outcome {
                Ok(reading) => {
                    self.events.emit(CycleEvent::DevicePolled {
                        group,
                        device: device_id,
                        elapsed_ms,
                        values: reading.values.len(),
                    });
                    readings.push(reading);
                },
                Err(reason) => {
                    self.events.emit(CycleEvent::DeviceFailed {
                        group,
                        device: device_id,
                        reason: reason.clone(),
                        elapsed_ms,
                    });
                    failed.push(DeviceFailure { device_id, reason });
                },
            }
        }

        // Tasks that panicked never reported back
        for device_id in pending {
            let reason = "poll task panicked".to_string();
            self.events.emit(CycleEvent::DeviceFailed {
                group,
                device: device_id,
                reason: reason.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            failed.push(DeviceFailure { device_id, reason });
        }
        failed.sort_by_key(|f| f.device_id);
        readings.sort_by_key(|r| r.device_id);

        for failure in &failed {
            if let Err(e) = self
                .registry
                .set_status(
                    failure.device_id,
                    DeviceStatus::Broken,
                    Some(failure.reason.clone()),
                )
                .await
            {
                warn!("Cannot mark device {} broken: {}", failure.device_id, e);
            }
        }

        let succeeded = readings.len();
        let mut reconcile_failures = Vec::new();
        let mut interval_records_written = 0;
        let readings_persisted = match group {
            DataGroup::Instant => {
                if readings.is_empty() {
                    0
                } else {
                    self.store.persist_instant(&readings).await?
                }
            },
            DataGroup::Cumulative => {
                let results =
                    join_all(readings.iter().map(|r| self.reconciler.reconcile(r))).await;
                let mut reconciled = 0;
                for (reading, result) in readings.iter().zip(results) {
                    match result {
                        Ok(records) => {
                            reconciled += 1;
                            interval_records_written += records.len();
                        },
                        Err(e) => {
                            if !e.is_reconciliation_rejection() {
                                error!("Device {} reconciliation failed: {}", reading.device_id, e);
                            }
                            self.events.emit(CycleEvent::ReconciliationRejected {
                                device: reading.device_id,
                                reason: e.to_string(),
                            });
                            reconcile_failures.push(DeviceFailure {
                                device_id: reading.device_id,
                                reason: e.to_string(),
                            });
                        },
                    }
                }
                reconciled
            },
        };

        let summary = CycleSummary {
            group,
            started_at,
            finished_at: self.clock.now(),
            total,
            succeeded,
            failed,
            reconcile_failures,
            readings_persisted,
            interval_records_written,
        };
        self.events.emit(CycleEvent::CycleFinished {
            group,
            succeeded: summary.succeeded,
            failed: summary.failed_count(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(summary)
    }

    /// Run cycles of `group` every `interval` until `token` is cancelled.
    ///
    /// A cycle always completes before the next one is scheduled; ticks
    /// missed while a cycle overran are delayed, not bunched.
    pub async fn run_until_cancelled(
        &self,
        group: DataGroup,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("{} poll loop started, every {:?}", group, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle(group).await {
                        Ok(summary) => debug!(
                            "{} cycle: {}/{} devices ok",
                            group, summary.succeeded, summary.total
                        ),
                        Err(e) => error!("{} cycle failed: {}", group, e),
                    }
                }
                () = token.cancelled() => {
                    info!("{} poll loop received cancellation signal, shutting down", group);
                    break;
                }
            }
        }
    }
}
