//! Persistence for readings, reference counters and interval records

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use meter_protocols::{DecodedReading, DeviceId};

use crate::error::Result;
use crate::reconcile::{IntervalRecord, ReferenceCounter};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage collaborator of the scheduler and the reconciliation engine
#[async_trait]
pub trait MeterStore: Send + Sync {
    /// Persist one cycle's instant readings as a single batch
    async fn persist_instant(&self, batch: &[DecodedReading]) -> Result<usize>;

    async fn load_reference(&self, device: DeviceId) -> Result<Option<ReferenceCounter>>;

    /// Store the new reference and its interval records atomically: either
    /// all of it becomes visible or none of it does.
    async fn commit_reconciliation(
        &self,
        reference: &ReferenceCounter,
        records: &[IntervalRecord],
    ) -> Result<()>;

    /// Interval records of a device, oldest first
    async fn interval_records(&self, device: DeviceId) -> Result<Vec<IntervalRecord>>;

    /// Instant readings of a device, oldest first
    async fn instant_readings(&self, device: DeviceId) -> Result<Vec<DecodedReading>>;
}
