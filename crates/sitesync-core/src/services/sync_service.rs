//! Node lifecycle: wiring, first-run bootstrap, connectivity reactions and
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityProber;
use crate::db::{Database, LibSqlSyncStateStore, SyncStateStore, TableRegistry};
use crate::error::Result;
use crate::models::SyncRunLog;
use crate::sync::{default_tables, RecordIngestor, SyncOrchestrator, TableSynchronizer};
use crate::transport::{HttpTransport, SyncTransport};

/// A running sync node and everything it owns
pub struct SyncService {
    database: Database,
    server_id: String,
    state: Arc<dyn SyncStateStore>,
    prober: Arc<ConnectivityProber>,
    synchronizer: Arc<TableSynchronizer>,
    orchestrator: Arc<SyncOrchestrator>,
    ingestor: RecordIngestor,
    auto_sync_enabled: bool,
    interval_minutes: u64,
    monitor_interval: Duration,
    shutdown: CancellationToken,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Open the database named in `config` and talk to the remote over HTTP
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        let database = Database::open(&config.database_path).await?;
        let transport: Arc<dyn SyncTransport> = Arc::new(HttpTransport::from_config(config)?);
        Self::with_transport(database, transport, config).await
    }

    /// Build a service over an already opened database and any transport
    pub async fn with_transport(
        database: Database,
        transport: Arc<dyn SyncTransport>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let registry = TableRegistry::discover(database.connection(), default_tables()).await?;
        let state: Arc<dyn SyncStateStore> =
            Arc::new(LibSqlSyncStateStore::new(database.connection()));
        let prober = Arc::new(ConnectivityProber::new(
            Arc::clone(&transport),
            config.connectivity_cache,
        ));
        let synchronizer = Arc::new(TableSynchronizer::new(
            registry.clone(),
            transport,
            config.policies.clone(),
            config.server_id.clone(),
        ));
        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                Arc::clone(&synchronizer),
                Arc::clone(&state),
                Arc::clone(&prober),
                shutdown.clone(),
            )
            .with_log_retention(config.log_retention),
        );

        Ok(Self {
            database,
            server_id: config.server_id.clone(),
            state,
            prober,
            synchronizer,
            orchestrator,
            ingestor: RecordIngestor::new(registry, config.server_id.clone()),
            auto_sync_enabled: config.auto_sync_enabled,
            interval_minutes: config.interval_minutes,
            monitor_interval: config.monitor_interval,
            shutdown,
            monitor: std::sync::Mutex::new(None),
        })
    }

    /// Run the first-run cycle, start the connectivity monitor and, if
    /// enabled, the auto-sync timer.
    ///
    /// Returns the bootstrap run log when one ran.
    pub async fn start(&self) -> Result<Option<SyncRunLog>> {
        let bootstrap = if self.state.last_watermark().await?.is_some() {
            None
        } else if self.prober.refresh().await {
            tracing::info!("No previous sync recorded, running initial cycle");
            Some(self.orchestrator.perform_sync().await)
        } else {
            tracing::info!("No previous sync recorded and remote offline, deferring initial cycle");
            None
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = self.prober.monitor(
            self.monitor_interval,
            self.shutdown.child_token(),
            move |online| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if online {
                        orchestrator.try_perform_sync().await;
                    }
                }
            },
        );
        if let Some(previous) = self.lock_monitor().replace(handle) {
            previous.abort();
        }

        if self.auto_sync_enabled {
            self.orchestrator.start_auto_sync(self.interval_minutes)?;
        }

        tracing::info!(server_id = %self.server_id, "Sync service started");
        Ok(bootstrap)
    }

    /// Stop timers, let the in-flight cycle stop at its next table and wait
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sync service");
        self.orchestrator.shutdown().await;
        let monitor = self.lock_monitor().take();
        if let Some(monitor) = monitor {
            monitor.await.ok();
        }
    }

    /// Use a different connectivity monitor period
    #[must_use]
    pub fn with_monitor_interval(mut self, period: Duration) -> Self {
        self.monitor_interval = period;
        self
    }

    pub const fn database(&self) -> &Database {
        &self.database
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub const fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub const fn synchronizer(&self) -> &Arc<TableSynchronizer> {
        &self.synchronizer
    }

    pub const fn ingestor(&self) -> &RecordIngestor {
        &self.ingestor
    }

    pub const fn prober(&self) -> &Arc<ConnectivityProber> {
        &self.prober
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
