//! Sync cycles: tiers, watermark, run logs and the auto-sync timer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TableSynchronizer;
use crate::connectivity::ConnectivityProber;
use crate::db::SyncStateStore;
use crate::error::{Error, Result};
use crate::models::{SyncDirection, SyncErrorEntry, SyncErrorKind, SyncRunLog, SyncStatus};

/// Table groups synchronized in order; later tiers reference earlier ones
pub const DEFAULT_TIERS: [&[&str]; 3] = [
    &["users", "academic_years", "classes", "sub_classes", "subjects"],
    &["enrollments", "marks", "student_absences"],
    &["payment_transactions", "generated_reports", "announcements"],
];

/// Accepted auto-sync intervals, in minutes
pub const AUTO_SYNC_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 1..=1_440;

/// Most run logs returned by [`SyncOrchestrator::recent_logs`]
pub const MAX_LOG_LIMIT: usize = 200;

/// A cycle lease not renewed for this long belongs to a dead process
const LEASE_STALE_MINUTES: i64 = 10;

/// Every table named in [`DEFAULT_TIERS`]
pub fn default_tables() -> impl Iterator<Item = &'static str> {
    DEFAULT_TIERS.iter().flat_map(|tier| tier.iter().copied())
}

/// Node state reported by `/sync/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNodeStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub is_online: bool,
    pub auto_sync_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_sync_interval_minutes: Option<u64>,
    pub sync_in_progress: bool,
    pub server_id: String,
}

/// Clears the in-progress flag however the cycle ends, including when the
/// caller drops the future
struct InProgressFlag<'a>(&'a AtomicBool);

impl<'a> InProgressFlag<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgressFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct AutoSync {
    interval_minutes: u64,
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Runs sync cycles, one at a time
pub struct SyncOrchestrator {
    synchronizer: Arc<TableSynchronizer>,
    state: Arc<dyn SyncStateStore>,
    prober: Arc<ConnectivityProber>,
    tiers: Vec<Vec<String>>,
    log_retention: usize,
    shutdown: CancellationToken,
    lease_holder: String,
    cycle: Mutex<()>,
    in_progress: AtomicBool,
    auto_sync: std::sync::Mutex<Option<AutoSync>>,
}

impl SyncOrchestrator {
    pub fn new(
        synchronizer: Arc<TableSynchronizer>,
        state: Arc<dyn SyncStateStore>,
        prober: Arc<ConnectivityProber>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            synchronizer,
            state,
            prober,
            tiers: DEFAULT_TIERS
                .iter()
                .map(|tier| tier.iter().map(ToString::to_string).collect())
                .collect(),
            log_retention: 500,
            shutdown,
            lease_holder: Uuid::now_v7().to_string(),
            cycle: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            auto_sync: std::sync::Mutex::new(None),
        }
    }

    /// Replace the tier layout
    #[must_use]
    pub fn with_tiers(mut self, tiers: Vec<Vec<String>>) -> Self {
        self.tiers = tiers;
        self
    }

    /// Run logs kept after each cycle
    #[must_use]
    pub fn with_log_retention(mut self, keep: usize) -> Self {
        self.log_retention = keep.max(1);
        self
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn server_id(&self) -> &str {
        self.synchronizer.server_id()
    }

    /// Run one cycle, waiting for an in-flight cycle to finish first
    pub async fn perform_sync(&self) -> SyncRunLog {
        let guard = self.cycle.lock().await;
        self.run_cycle(guard).await
    }

    /// Run one cycle unless another is in flight
    pub async fn try_perform_sync(&self) -> Option<SyncRunLog> {
        let Ok(guard) = self.cycle.try_lock() else {
            tracing::debug!("Sync cycle already running, skipping");
            return None;
        };
        Some(self.run_cycle(guard).await)
    }

    /// One auto-sync tick: skipped while offline or busy
    pub async fn auto_tick(&self) -> Option<SyncRunLog> {
        if !self.prober.is_online().await {
            tracing::debug!("Remote offline, skipping auto-sync tick");
            return None;
        }
        self.try_perform_sync().await
    }

    async fn run_cycle(&self, _guard: MutexGuard<'_, ()>) -> SyncRunLog {
        let _in_progress = InProgressFlag::set(&self.in_progress);
        let mut log = SyncRunLog::begin(SyncDirection::Bidirectional);
        log.mark_in_progress();
        tracing::info!(run = %log.id, "Starting sync cycle");

        match self.renew_lease().await {
            Ok(true) => {
                self.run_leased(&mut log).await;
                if let Err(error) = self.state.release_lease(&self.lease_holder).await {
                    tracing::warn!("Failed to release sync lease: {error}");
                }
            }
            Ok(false) => {
                tracing::warn!("Another process is syncing this database, skipping cycle");
                log.fail(SyncErrorEntry::cycle(
                    SyncErrorKind::Orchestration,
                    "another process holds the sync lease",
                ));
            }
            Err(error) => {
                tracing::error!("Failed to acquire sync lease: {error}");
                log.fail(SyncErrorEntry::cycle(
                    SyncErrorKind::Orchestration,
                    format!("acquiring sync lease failed: {error}"),
                ));
            }
        }

        self.persist_log(&log).await;
        tracing::info!(
            run = %log.id,
            status = %log.status,
            records = log.records_processed,
            conflicts = log.conflicts.len(),
            errors = log.errors.len(),
            "Sync cycle finished"
        );
        log
    }

    /// Watermark read, tiers and watermark write; runs under the lease
    async fn run_leased(&self, log: &mut SyncRunLog) {
        match self.state.last_watermark().await {
            Ok(watermark) => {
                let watermark = watermark.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                self.run_tiers(log, watermark).await;
            }
            Err(error) => {
                tracing::error!("Failed to read watermark: {error}");
                log.fail(SyncErrorEntry::cycle(
                    SyncErrorKind::Orchestration,
                    format!("reading watermark failed: {error}"),
                ));
            }
        }
        if log.status != SyncStatus::InProgress {
            return;
        }

        // Unsent changes stay above the old watermark and go out next cycle
        let unsent = log
            .errors
            .iter()
            .filter(|error| error.kind == SyncErrorKind::Unreachable)
            .count();
        if unsent > 0 {
            tracing::warn!(unsent, "Remote unreachable during push, keeping previous watermark");
            log.finish();
            return;
        }

        match self
            .state
            .record_watermark(log.start_time, self.server_id())
            .await
        {
            Ok(()) => log.finish(),
            Err(error) => {
                tracing::error!("Failed to persist watermark: {error}");
                log.fail(SyncErrorEntry::cycle(
                    SyncErrorKind::Orchestration,
                    format!("persisting watermark failed: {error}"),
                ));
            }
        }
    }

    async fn renew_lease(&self) -> Result<bool> {
        self.state
            .try_acquire_lease(
                &self.lease_holder,
                chrono::Duration::minutes(LEASE_STALE_MINUTES),
            )
            .await
    }

    async fn run_tiers(&self, log: &mut SyncRunLog, watermark: DateTime<Utc>) {
        for (index, tier) in self.tiers.iter().enumerate() {
            tracing::info!(tier = index + 1, tables = tier.len(), "Syncing tier");
            for table in tier {
                if self.shutdown.is_cancelled() {
                    tracing::warn!(table = %table, "Sync cycle cancelled");
                    log.fail(SyncErrorEntry::cycle(
                        SyncErrorKind::Cancelled,
                        format!("cancelled before table {table}"),
                    ));
                    return;
                }
                match self.renew_lease().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(table = %table, "Sync lease taken over by another process");
                        log.fail(SyncErrorEntry::cycle(
                            SyncErrorKind::Orchestration,
                            format!("sync lease lost before table {table}"),
                        ));
                        return;
                    }
                    Err(error) => {
                        log.fail(SyncErrorEntry::cycle(
                            SyncErrorKind::Orchestration,
                            format!("renewing sync lease failed: {error}"),
                        ));
                        return;
                    }
                }
                let result = self.synchronizer.sync_table(table, watermark).await;
                log.absorb(result);
            }
        }
    }

    async fn persist_log(&self, log: &SyncRunLog) {
        if let Err(error) = self.state.append_run_log(log).await {
            tracing::error!(run = %log.id, "Failed to store run log: {error}");
            return;
        }
        match self.state.prune_run_logs(self.log_retention).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "Pruned old run logs"),
            Err(error) => tracing::warn!("Failed to prune run logs: {error}"),
        }
    }

    /// Start (or restart) the auto-sync timer.
    ///
    /// The first tick fires one interval from now.
    pub fn start_auto_sync(self: &Arc<Self>, interval_minutes: u64) -> Result<()> {
        if !AUTO_SYNC_INTERVAL_RANGE.contains(&interval_minutes) {
            return Err(Error::InvalidInput(format!(
                "interval_minutes must be in [{}, {}]",
                AUTO_SYNC_INTERVAL_RANGE.start(),
                AUTO_SYNC_INTERVAL_RANGE.end()
            )));
        }

        let period = Duration::from_secs(interval_minutes * 60);
        let cancel = self.shutdown.child_token();
        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                orchestrator.auto_tick().await;
            }
            tracing::debug!("Auto-sync timer stopped");
        });

        let previous = self.lock_auto_sync().replace(AutoSync {
            interval_minutes,
            cancel,
            _handle: handle,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        tracing::info!(interval_minutes, "Auto-sync started");
        Ok(())
    }

    /// Stop the auto-sync timer; returns false if it was not running
    pub fn stop_auto_sync(&self) -> bool {
        let Some(auto_sync) = self.lock_auto_sync().take() else {
            return false;
        };
        auto_sync.cancel.cancel();
        tracing::info!("Auto-sync stopped");
        true
    }

    /// Interval of the running auto-sync timer
    pub fn auto_sync_interval(&self) -> Option<u64> {
        self.lock_auto_sync()
            .as_ref()
            .map(|auto_sync| auto_sync.interval_minutes)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Stop the timer, cancel the in-flight cycle at its next table and wait
    pub async fn shutdown(&self) {
        self.stop_auto_sync();
        self.shutdown.cancel();
        let _idle = self.cycle.lock().await;
        tracing::info!("Sync orchestrator stopped");
    }

    pub async fn status(&self) -> Result<SyncNodeStatus> {
        let last_sync = self.state.last_watermark().await?;
        let last_sync_status = self
            .state
            .recent_run_logs(1)
            .await?
            .first()
            .map(|log| log.status);
        let auto_sync_interval_minutes = self.auto_sync_interval();

        Ok(SyncNodeStatus {
            last_sync,
            last_sync_status,
            is_online: self.prober.is_online().await,
            auto_sync_enabled: auto_sync_interval_minutes.is_some(),
            auto_sync_interval_minutes,
            sync_in_progress: self.is_syncing(),
            server_id: self.server_id().to_string(),
        })
    }

    /// Newest run logs first, at most [`MAX_LOG_LIMIT`]
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>> {
        self.state
            .recent_run_logs(limit.clamp(1, MAX_LOG_LIMIT))
            .await
    }

    fn lock_auto_sync(&self) -> std::sync::MutexGuard<'_, Option<AutoSync>> {
        self.auto_sync
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
