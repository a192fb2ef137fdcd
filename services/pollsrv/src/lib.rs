//! Poll Service (`pollsrv`)
//!
//! Polls a fleet of Modbus energy meters on two cadences: instant values
//! (voltage, current, power) are stored as read, cumulative energy counters
//! are reconciled into 15-minute interval consumption records.
//!
//! # Modules
//!
//! - [`config`]: layered YAML/environment configuration
//! - [`catalog`]: compiled register maps per device model
//! - [`registry`]: pollable devices and their status
//! - [`scheduler`]: bounded concurrent poll cycles
//! - [`reconcile`]: counter-to-interval reconciliation
//! - [`storage`]: memory and SQLite persistence
//! - [`events`]: cycle progress events

pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use catalog::{CompiledModel, ModelCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PollSrvConfig;
pub use error::{PollSrvError, Result};
pub use events::{CollectingSink, CycleEvent, EventSink, TracingEventSink};
pub use reconcile::{
    CounterReconciler, IntervalRecord, ReconcileSettings, ReferenceCounter, StalePolicy,
};
pub use registry::{DeviceRegistry, MemoryRegistry};
pub use scheduler::{CycleSummary, DeviceFailure, FleetScheduler, SchedulerSettings};
pub use service::PollService;
pub use storage::{MemoryStore, MeterStore, SqliteStore};
