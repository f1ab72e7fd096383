use std::env;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sitesync_core::config::SyncConfig;
use sitesync_core::db::{Database, LibSqlSyncStateStore, SyncStateStore};
use sitesync_core::sync::SyncNodeStatus;
use sitesync_core::{SyncRunLog, SyncService};

use crate::error::CliError;

const DEFAULT_DB_PATH: &str = "sitesync.db";

#[derive(Debug, Serialize)]
pub struct RunLogItem {
    pub id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub direction: String,
    pub records_processed: u64,
    pub conflicts: usize,
    pub errors: usize,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ReviewItem {
    pub run_id: String,
    pub detected_at: String,
    pub table: String,
    pub record_id: String,
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| {
            env::var_os("SYNC_DATABASE_PATH")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

/// Full node configuration from the environment, with the database path
/// taken from the command line
pub fn load_config(db_path: &Path) -> Result<SyncConfig, CliError> {
    let mut config = SyncConfig::from_env()?;
    config.database_path = db_path.to_path_buf();
    Ok(config)
}

pub async fn open_service(db_path: &Path) -> Result<SyncService, CliError> {
    let config = load_config(db_path)?;
    Ok(SyncService::open(&config).await?)
}

/// Run logs straight from the database; no remote settings needed
pub async fn load_recent_logs(limit: usize, db_path: &Path) -> Result<Vec<SyncRunLog>, CliError> {
    if limit == 0 {
        return Err(CliError::InvalidLimit);
    }
    let db = Database::open(db_path).await?;
    let store = LibSqlSyncStateStore::new(db.connection());
    Ok(store.recent_run_logs(limit).await?)
}

pub fn run_log_to_item(log: &SyncRunLog) -> RunLogItem {
    RunLogItem {
        id: log.id.to_string(),
        start_time: log.start_time.to_rfc3339(),
        end_time: log.end_time.map(|end| end.to_rfc3339()),
        status: log.status.as_str().to_string(),
        direction: log.direction.as_str().to_string(),
        records_processed: log.records_processed,
        conflicts: log.conflicts.len(),
        errors: log.errors.len(),
    }
}

pub fn format_run_summary(log: &SyncRunLog) -> String {
    format!(
        "{}  processed={} conflicts={} errors={}  run={}",
        log.status,
        log.records_processed,
        log.conflicts.len(),
        log.errors.len(),
        log.id
    )
}

pub fn format_log_lines(logs: &[SyncRunLog]) -> Vec<String> {
    logs.iter()
        .map(|log| {
            format!(
                "{}  {:<11}  processed={} conflicts={} errors={}",
                format_sync_timestamp(log.start_time),
                log.status.as_str(),
                log.records_processed,
                log.conflicts.len(),
                log.errors.len()
            )
        })
        .collect()
}

/// Conflicts flagged for review, newest run first
pub fn pending_review_items(logs: &[SyncRunLog]) -> Vec<ReviewItem> {
    logs.iter()
        .flat_map(|log| {
            log.pending_review().map(move |conflict| ReviewItem {
                run_id: log.id.to_string(),
                detected_at: log.start_time.to_rfc3339(),
                table: conflict.table.clone(),
                record_id: conflict.record_id.to_string(),
                field: conflict.field.clone(),
                local_value: conflict.local_value.clone(),
                remote_value: conflict.remote_value.clone(),
            })
        })
        .collect()
}

pub fn format_review_lines(items: &[ReviewItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            format!(
                "{}/{}  {}  local={} remote={}",
                item.table, item.record_id, item.field, item.local_value, item.remote_value
            )
        })
        .collect()
}

pub fn format_status_lines(status: &SyncNodeStatus) -> Vec<String> {
    let last_sync = status
        .last_sync
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    let last_status = status
        .last_sync_status
        .map_or("none", |last_status| last_status.as_str());

    vec![
        format!("server:      {}", status.server_id),
        format!("remote:      {}", if status.is_online { "online" } else { "offline" }),
        format!("last sync:   {last_sync} ({last_status})"),
        format!(
            "in progress: {}",
            if status.sync_in_progress { "yes" } else { "no" }
        ),
    ]
}

pub fn format_sync_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
