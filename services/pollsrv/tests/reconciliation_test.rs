//! Cumulative cycles: polled counters through reconciliation into storage

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::{endpoint, harness, meter, set_counters, t0, HarnessOptions};
use futures::future::join_all;
use meter_protocols::{DataGroup, DecodedReading, DeviceId, DeviceStatus};
use pollsrv::{
    CounterReconciler, IntervalRecord, MemoryStore, MeterStore, ReconcileSettings,
    ReferenceCounter, SqliteStore, StalePolicy,
};

#[tokio::test]
async fn test_baseline_then_gap_fill_then_rejection() {
    let sim = meter(230.0, 1_000.0).await;
    let store = Arc::new(MemoryStore::new());
    let h = harness(
        vec![endpoint(1, sim.start_tcp().await.unwrap())],
        store.clone(),
        HarnessOptions::default(),
    );

    // First reading: zero-delta baseline
    let first = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    assert_eq!(first.interval_records_written, 1);
    let records = h.store.interval_records(1).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp, t0());
    assert!(!records[0].is_calculated);
    assert_eq!(records[0].values["active_energy_import"], 0.0);

    // One interval later: full delta, measured
    set_counters(&sim, 1_012.0, 3.0).await;
    h.clock.advance(ChronoDuration::minutes(15));
    let second = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    assert_eq!(second.interval_records_written, 1);
    let records = h.store.interval_records(1).await.unwrap();
    assert_eq!(records[1].timestamp, t0() + ChronoDuration::minutes(15));
    assert_eq!(records[1].values["active_energy_import"], 12.0);
    assert_eq!(records[1].values["active_energy_export"], 3.0);
    assert!(!records[1].is_calculated);

    // An hour of missed polls: spread over four calculated intervals
    set_counters(&sim, 1_112.0, 3.0).await;
    h.clock.advance(ChronoDuration::minutes(60));
    let third = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    assert_eq!(third.interval_records_written, 4);
    let records = h.store.interval_records(1).await.unwrap();
    assert_eq!(records.len(), 6);
    for (k, record) in records[2..].iter().enumerate() {
        assert_eq!(
            record.timestamp,
            t0() + ChronoDuration::minutes(15 + 15 * k as i64)
        );
        assert_eq!(record.values["active_energy_import"], 25.0);
        assert!(record.is_calculated);
    }

    let reference = h.store.load_reference(1).await.unwrap().unwrap();
    assert_eq!(reference.timestamp, t0() + ChronoDuration::minutes(75));
    assert_eq!(reference.values["active_energy_import"], 1_112.0);

    // Meter replaced or reset: counter went backwards
    set_counters(&sim, 5.0, 3.0).await;
    h.clock.advance(ChronoDuration::minutes(15));
    let fourth = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    assert_eq!(fourth.succeeded, 1);
    assert_eq!(fourth.readings_persisted, 0);
    assert_eq!(fourth.interval_records_written, 0);
    assert_eq!(fourth.reconcile_failures.len(), 1);
    assert!(fourth.reconcile_failures[0]
        .reason
        .contains("field 'active_energy_import' went from 1112 to 5"));

    assert_eq!(store.interval_count(), 6);
    assert_eq!(h.store.load_reference(1).await.unwrap().unwrap(), reference);
    assert_eq!(h.registry.status(1), Some(DeviceStatus::Active));
}

#[tokio::test]
async fn test_stale_reference_rebaseline_policy() {
    let sim = meter(230.0, 100.0).await;
    let options = HarnessOptions {
        reconcile: ReconcileSettings {
            max_interpolated_intervals: 8,
            stale_policy: StalePolicy::Rebaseline,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = harness(
        vec![endpoint(1, sim.start_tcp().await.unwrap())],
        Arc::new(MemoryStore::new()),
        options,
    );

    h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    set_counters(&sim, 400.0, 0.0).await;
    h.clock.advance(ChronoDuration::days(2));
    let summary = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();

    assert_eq!(summary.interval_records_written, 1);
    let records = h.store.interval_records(1).await.unwrap();
    assert_eq!(records[1].values["active_energy_import"], 300.0);
    assert!(!records[1].is_calculated);
    assert_eq!(records[1].timestamp, t0() + ChronoDuration::days(2));
}

#[tokio::test]
async fn test_sqlite_store_end_to_end() {
    let sim = meter(230.0, 2_000.0).await;
    let store = Arc::new(SqliteStore::connect("sqlite::memory:", 1).await.unwrap());
    let h = harness(
        vec![endpoint(7, sim.start_tcp().await.unwrap())],
        store,
        HarnessOptions::default(),
    );

    h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    set_counters(&sim, 2_030.0, 0.0).await;
    h.clock.advance(ChronoDuration::minutes(45));
    let summary = h.scheduler.run_cycle(DataGroup::Cumulative).await.unwrap();
    assert_eq!(summary.interval_records_written, 3);

    let records = h.store.interval_records(7).await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].timestamp, records[1].timestamp);
    assert!(records[1..].iter().all(|r| r.values["active_energy_import"] == 10.0));

    let instant = h.scheduler.run_cycle(DataGroup::Instant).await.unwrap();
    assert_eq!(instant.readings_persisted, 1);
    assert_eq!(h.store.instant_readings(7).await.unwrap().len(), 1);
}

/// Store wrapper that tracks how many reconciliations of a device overlap
struct OverlapStore {
    inner: MemoryStore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl OverlapStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MeterStore for OverlapStore {
    async fn persist_instant(&self, batch: &[DecodedReading]) -> pollsrv::Result<usize> {
        self.inner.persist_instant(batch).await
    }

    async fn load_reference(&self, device: DeviceId) -> pollsrv::Result<Option<ReferenceCounter>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.inner.load_reference(device).await
    }

    async fn commit_reconciliation(
        &self,
        reference: &ReferenceCounter,
        records: &[IntervalRecord],
    ) -> pollsrv::Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = self.inner.commit_reconciliation(reference, records).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn interval_records(&self, device: DeviceId) -> pollsrv::Result<Vec<IntervalRecord>> {
        self.inner.interval_records(device).await
    }

    async fn instant_readings(&self, device: DeviceId) -> pollsrv::Result<Vec<DecodedReading>> {
        self.inner.instant_readings(device).await
    }
}

fn cumulative(device: DeviceId, minutes: i64, kwh: f64) -> DecodedReading {
    DecodedReading {
        device_id: device,
        timestamp: t0() + ChronoDuration::minutes(minutes),
        group: DataGroup::Cumulative,
        values: HashMap::from([("kwh".to_string(), kwh)]),
    }
}

#[tokio::test]
async fn test_same_device_reconciliations_are_serialized() {
    let store = Arc::new(OverlapStore::new());
    let reconciler = CounterReconciler::new(store.clone(), ReconcileSettings::default());

    // Identical readings: whichever runs first baselines, the rest see its reference
    let readings: Vec<_> = (0..6).map(|_| cumulative(1, 0, 500.0)).collect();
    let results = join_all(readings.iter().map(|r| reconciler.reconcile(r))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    let records = store.interval_records(1).await.unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.values["kwh"] == 0.0));
    assert!(records.iter().all(|r| !r.is_calculated));
}

#[tokio::test]
async fn test_different_devices_reconcile_in_parallel() {
    let store = Arc::new(OverlapStore::new());
    let reconciler = CounterReconciler::new(store.clone(), ReconcileSettings::default());

    let readings = [cumulative(1, 0, 10.0), cumulative(2, 0, 20.0)];
    let results = join_all(readings.iter().map(|r| reconciler.reconcile(r))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(store.peak.load(Ordering::SeqCst), 2);
}
