//! In-memory store
//!
//! Used by tests and embedded deployments without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use meter_protocols::{DecodedReading, DeviceId};
use parking_lot::RwLock;

use super::MeterStore;
use crate::error::Result;
use crate::reconcile::{IntervalRecord, ReferenceCounter};

#[derive(Debug, Default)]
struct CounterState {
    references: HashMap<DeviceId, ReferenceCounter>,
    intervals: Vec<IntervalRecord>,
}

/// Concurrent in-memory [`MeterStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    instant: DashMap<DeviceId, Vec<DecodedReading>>,
    /// References and intervals share one lock so a commit is all-or-nothing
    counters: RwLock<CounterState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a reference counter directly
    pub fn insert_reference(&self, reference: ReferenceCounter) {
        self.counters
            .write()
            .references
            .insert(reference.device_id, reference);
    }

    /// Interval records across all devices
    pub fn interval_count(&self) -> usize {
        self.counters.read().intervals.len()
    }

    /// Instant readings across all devices
    pub fn instant_count(&self) -> usize {
        self.instant.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl MeterStore for MemoryStore {
    async fn persist_instant(&self, batch: &[DecodedReading]) -> Result<usize> {
        for reading in batch {
            self.instant
                .entry(reading.device_id)
                .or_default()
                .push(reading.clone());
        }
        Ok(batch.len())
    }

    async fn load_reference(&self, device: DeviceId) -> Result<Option<ReferenceCounter>> {
        Ok(self.counters.read().references.get(&device).cloned())
    }

    async fn commit_reconciliation(
        &self,
        reference: &ReferenceCounter,
        records: &[IntervalRecord],
    ) -> Result<()> {
        let mut state = self.counters.write();
        state.intervals.extend_from_slice(records);
        state
            .references
            .insert(reference.device_id, reference.clone());
        Ok(())
    }

    async fn interval_records(&self, device: DeviceId) -> Result<Vec<IntervalRecord>> {
        let mut records: Vec<IntervalRecord> = self
            .counters
            .read()
            .intervals
            .iter()
            .filter(|r| r.device_id == device)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn instant_readings(&self, device: DeviceId) -> Result<Vec<DecodedReading>> {
        Ok(self
            .instant
            .get(&device)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::Utc;
    use meter_protocols::DataGroup;

    #[tokio::test]
    async fn test_commit_and_load() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.load_reference(1).await.unwrap().is_none());

        let reference = ReferenceCounter {
            device_id: 1,
            timestamp: now,
            values: HashMap::from([("kwh".to_string(), 10.0)]),
        };
        let record = IntervalRecord {
            device_id: 1,
            timestamp: now,
            values: HashMap::from([("kwh".to_string(), 0.0)]),
            is_calculated: false,
        };
        store
            .commit_reconciliation(&reference, &[record.clone()])
            .await
            .unwrap();

        assert_eq!(store.load_reference(1).await.unwrap(), Some(reference));
        assert_eq!(store.interval_records(1).await.unwrap(), vec![record]);
        assert!(store.interval_records(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instant_batch() {
        let store = MemoryStore::new();
        let batch: Vec<DecodedReading> = (1..=3)
            .map(|id| DecodedReading::new(id, Utc::now(), DataGroup::Instant))
            .collect();
        assert_eq!(store.persist_instant(&batch).await.unwrap(), 3);
        assert_eq!(store.instant_count(), 3);
        assert_eq!(store.instant_readings(2).await.unwrap().len(), 1);
    }
}
