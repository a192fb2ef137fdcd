//! SQLite store
//!
//! Field values are kept as JSON objects so device models with different
//! attribute sets share one schema. Timestamps are UTC epoch milliseconds.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meter_protocols::{DataGroup, DecodedReading, DeviceId};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

use super::MeterStore;
use crate::error::{PollSrvError, Result};
use crate::reconcile::{IntervalRecord, ReferenceCounter};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS instant_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        data_group TEXT NOT NULL,
        values_json TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_instant_device_time
        ON instant_readings(device_id, timestamp_ms)"#,
    r#"CREATE TABLE IF NOT EXISTS reference_counters (
        device_id INTEGER PRIMARY KEY,
        timestamp_ms INTEGER NOT NULL,
        values_json TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS interval_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        is_calculated INTEGER NOT NULL DEFAULT 0,
        values_json TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_interval_device_time
        ON interval_records(device_id, timestamp_ms)"#,
];

/// [`MeterStore`] backed by a SQLite connection pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let mut pool_options = SqlitePoolOptions::new();
        if in_memory {
            // Every connection to :memory: is its own database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            if let Some(path) = options.get_filename().parent() {
                if !path.as_os_str().is_empty() {
                    std::fs::create_dir_all(path)?;
                }
            }
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            pool_options = pool_options.max_connections(max_connections.max(1));
        }

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;

        info!("SQLite store ready: {}", url);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PollSrvError::storage(format!("timestamp out of range: {ms}")))
}

fn device_id(row: &SqliteRow) -> Result<DeviceId> {
    let raw: i64 = row.try_get("device_id")?;
    DeviceId::try_from(raw).map_err(|_| PollSrvError::storage(format!("invalid device id {raw}")))
}

/// JSON has no NaN or infinity; serde_json would write `null` and the row
/// could never be read back.
fn encode_values(values: &HashMap<String, f64>) -> Result<String> {
    if let Some((field, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
        return Err(PollSrvError::storage(format!(
            "field '{field}' is {value}, only finite values can be stored"
        )));
    }
    Ok(serde_json::to_string(values)?)
}

fn values(row: &SqliteRow) -> Result<HashMap<String, f64>> {
    let json: String = row.try_get("values_json")?;
    Ok(serde_json::from_str(&json)?)
}

#[async_trait]
impl MeterStore for SqliteStore {
    async fn persist_instant(&self, batch: &[DecodedReading]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let encoded = batch
            .iter()
            .map(|r| encode_values(&r.values))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        for (reading, values_json) in batch.iter().zip(encoded) {
            sqlx::query(
                r#"INSERT INTO instant_readings (device_id, timestamp_ms, data_group, values_json)
                   VALUES (?, ?, ?, ?)"#,
            )
            .bind(i64::from(reading.device_id))
            .bind(to_millis(&reading.timestamp))
            .bind(reading.group.as_str())
            .bind(values_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Persisted {} instant readings", batch.len());
        Ok(batch.len())
    }

    async fn load_reference(&self, device: DeviceId) -> Result<Option<ReferenceCounter>> {
        let row = sqlx::query(
            r#"SELECT device_id, timestamp_ms, values_json
               FROM reference_counters WHERE device_id = ?"#,
        )
        .bind(i64::from(device))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ReferenceCounter {
                device_id: device_id(&row)?,
                timestamp: from_millis(row.try_get("timestamp_ms")?)?,
                values: values(&row)?,
            })
        })
        .transpose()
    }

    async fn commit_reconciliation(
        &self,
        reference: &ReferenceCounter,
        records: &[IntervalRecord],
    ) -> Result<()> {
        let reference_json = encode_values(&reference.values)?;
        let encoded = records
            .iter()
            .map(|r| encode_values(&r.values))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;

        for (record, values_json) in records.iter().zip(encoded) {
            sqlx::query(
                r#"INSERT INTO interval_records (device_id, timestamp_ms, is_calculated, values_json)
                   VALUES (?, ?, ?, ?)"#,
            )
            .bind(i64::from(record.device_id))
            .bind(to_millis(&record.timestamp))
            .bind(record.is_calculated)
            .bind(values_json)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"INSERT INTO reference_counters (device_id, timestamp_ms, values_json)
               VALUES (?, ?, ?)
               ON CONFLICT(device_id) DO UPDATE SET
                   timestamp_ms = excluded.timestamp_ms,
                   values_json = excluded.values_json"#,
        )
        .bind(i64::from(reference.device_id))
        .bind(to_millis(&reference.timestamp))
        .bind(reference_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn interval_records(&self, device: DeviceId) -> Result<Vec<IntervalRecord>> {
        let rows = sqlx::query(
            r#"SELECT device_id, timestamp_ms, is_calculated, values_json
               FROM interval_records WHERE device_id = ?
               ORDER BY timestamp_ms, id"#,
        )
        .bind(i64::from(device))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(IntervalRecord {
                    device_id: device_id(row)?,
                    timestamp: from_millis(row.try_get("timestamp_ms")?)?,
                    values: values(row)?,
                    is_calculated: row.try_get("is_calculated")?,
                })
            })
            .collect()
    }

    async fn instant_readings(&self, device: DeviceId) -> Result<Vec<DecodedReading>> {
        let rows = sqlx::query(
            r#"SELECT device_id, timestamp_ms, data_group, values_json
               FROM instant_readings WHERE device_id = ?
               ORDER BY timestamp_ms, id"#,
        )
        .bind(i64::from(device))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let group: String = row.try_get("data_group")?;
                Ok(DecodedReading {
                    device_id: device_id(row)?,
                    timestamp: from_millis(row.try_get("timestamp_ms")?)?,
                    group: DataGroup::from_str(&group)?,
                    values: values(row)?,
                })
            })
            .collect()
    }
}
