//! Service assembly
//!
//! Builds the catalog, registry, store, reconciler and scheduler from a
//! loaded configuration and runs the instant and cumulative poll loops.

use std::sync::Arc;

use meter_protocols::{DataGroup, DeviceClient, ModbusConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catalog::ModelCatalog;
use crate::config::{PollSrvConfig, StorageBackend};
use crate::error::{PollSrvError, Result};
use crate::reconcile::CounterReconciler;
use crate::registry::MemoryRegistry;
use crate::scheduler::{CycleSummary, FleetScheduler, SchedulerSettings};
use crate::storage::{MemoryStore, MeterStore, SqliteStore};

pub struct PollService {
    config: PollSrvConfig,
    registry: Arc<MemoryRegistry>,
    store: Arc<dyn MeterStore>,
    scheduler: Arc<FleetScheduler>,
}

impl PollService {
    pub async fn build(config: &PollSrvConfig) -> Result<Self> {
        let catalog = ModelCatalog::load(&config.models, config.poll.max_block_size)?;
        let registry = Arc::new(MemoryRegistry::from_config(config, &catalog)?);

        let store: Arc<dyn MeterStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => Arc::new(
                SqliteStore::connect(&config.storage.sqlite_url, config.storage.max_connections)
                    .await?,
            ),
        };

        let connector = ModbusConnector::new(
            config.poll.connect_timeout(),
            config.poll.read_timeout(),
        );
        let reconciler = Arc::new(CounterReconciler::new(
            Arc::clone(&store),
            config.reconcile.settings(),
        ));
        let settings = SchedulerSettings {
            concurrency: config.poll.effective_concurrency(),
            cycle_deadline: config.poll.cycle_deadline(),
        };
        let scheduler = FleetScheduler::new(
            registry.clone(),
            DeviceClient::new(Arc::new(connector)),
            Arc::clone(&store),
            reconciler,
            settings,
        );

        info!(
            "Poll service ready: {} models, {} devices, concurrency {}, {:?} storage",
            catalog.len(),
            registry.len(),
            scheduler.settings().concurrency,
            config.storage.backend
        );

        Ok(Self {
            config: config.clone(),
            registry,
            store,
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MeterStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<FleetScheduler> {
        &self.scheduler
    }

    pub async fn run_once(&self, group: DataGroup) -> Result<CycleSummary> {
        self.scheduler.run_cycle(group).await
    }

    /// Run both poll loops until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let loops = [
            (DataGroup::Instant, self.config.poll.instant_interval()),
            (DataGroup::Cumulative, self.config.poll.cumulative_interval()),
        ];

        let handles: Vec<_> = loops
            .into_iter()
            .map(|(group, interval)| {
                let scheduler = Arc::clone(&self.scheduler);
                let token = token.clone();
                tokio::spawn(async move {
                    scheduler.run_until_cancelled(group, interval, token).await;
                })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Poll loop terminated abnormally: {}", e);
                return Err(PollSrvError::io(format!("poll loop panicked: {e}")));
            }
        }

        info!("Poll loops stopped");
        Ok(())
    }
}
