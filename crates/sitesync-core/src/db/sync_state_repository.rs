//! Watermark history and run log storage

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use libsql::{Connection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::SyncRunLog;
use crate::util::{format_timestamp, parse_timestamp};

/// Persistent state owned by the orchestrator
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Start time of the last finished cycle, if any
    async fn last_watermark(&self) -> Result<Option<DateTime<Utc>>>;

    /// Append a new watermark
    async fn record_watermark(&self, at: DateTime<Utc>, server_id: &str) -> Result<()>;

    /// Store a finished run log
    async fn append_run_log(&self, log: &SyncRunLog) -> Result<()>;

    /// Most recent run logs, newest first
    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>>;

    /// Delete all but the newest `keep` run logs, returning how many went
    async fn prune_run_logs(&self, keep: usize) -> Result<u64>;

    /// Claim or renew the cycle lease for `holder`.
    ///
    /// Returns false while another holder's lease is younger than
    /// `stale_after`.
    async fn try_acquire_lease(&self, holder: &str, stale_after: Duration) -> Result<bool>;

    /// Drop the lease if `holder` still owns it
    async fn release_lease(&self, holder: &str) -> Result<()>;
}

/// libSQL implementation of `SyncStateStore`
#[derive(Clone)]
pub struct LibSqlSyncStateStore {
    conn: Connection,
}

impl LibSqlSyncStateStore {
    /// Create a new store with the given connection
    pub fn new(conn: &Connection) -> Self {
        Self { conn: conn.clone() }
    }

    fn row_to_log(row: &Row) -> Result<SyncRunLog> {
        let id: String = row.get(0)?;
        let start_time: String = row.get(1)?;
        let end_time: Option<String> = row.get(2)?;
        let status: String = row.get(3)?;
        let direction: String = row.get(4)?;
        let records_processed: i64 = row.get(5)?;
        let conflicts: String = row.get(6)?;
        let errors: String = row.get(7)?;

        Ok(SyncRunLog {
            id: Uuid::parse_str(&id).map_err(|e| Error::Database(e.to_string()))?,
            start_time: parse_stored_timestamp(&start_time)?,
            end_time: end_time.as_deref().map(parse_stored_timestamp).transpose()?,
            status: status.parse().map_err(Error::Database)?,
            direction: direction.parse().map_err(Error::Database)?,
            records_processed: u64::try_from(records_processed).unwrap_or_default(),
            conflicts: serde_json::from_str(&conflicts)?,
            errors: serde_json::from_str(&errors)?,
        })
    }
}

fn parse_stored_timestamp(value: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value).ok_or_else(|| Error::Database(format!("invalid timestamp '{value}'")))
}

fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SyncStateStore for LibSqlSyncStateStore {
    async fn last_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_sync_time FROM sync_metadata ORDER BY id DESC LIMIT 1",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let value: String = row.get(0)?;
                parse_stored_timestamp(&value).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn record_watermark(&self, at: DateTime<Utc>, server_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_metadata (last_sync_time, server_id, created_at) VALUES (?, ?, ?)",
                libsql::params![format_timestamp(at), server_id, format_timestamp(Utc::now())],
            )
            .await?;
        Ok(())
    }

    async fn append_run_log(&self, log: &SyncRunLog) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_logs (id, start_time, end_time, status, direction,
                    records_processed, conflicts, errors)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    log.id.to_string(),
                    format_timestamp(log.start_time),
                    log.end_time.map(format_timestamp),
                    log.status.as_str(),
                    log.direction.as_str(),
                    i64::try_from(log.records_processed).unwrap_or(i64::MAX),
                    serde_json::to_string(&log.conflicts)?,
                    serde_json::to_string(&log.errors)?,
                ],
            )
            .await?;
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<SyncRunLog>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, start_time, end_time, status, direction, records_processed,
                        conflicts, errors
                 FROM sync_logs ORDER BY start_time DESC, id DESC LIMIT ?",
                [to_sql_count(limit)],
            )
            .await?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await? {
            logs.push(Self::row_to_log(&row)?);
        }
        Ok(logs)
    }

    async fn prune_run_logs(&self, keep: usize) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sync_logs WHERE id NOT IN (
                    SELECT id FROM sync_logs ORDER BY start_time DESC, id DESC LIMIT ?
                )",
                [to_sql_count(keep)],
            )
            .await?;
        Ok(deleted)
    }

    async fn try_acquire_lease(&self, holder: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        // One statement, so the check and the claim happen under one write lock
        let claimed = self
            .conn
            .execute(
                "INSERT INTO sync_lock (id, holder, acquired_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE
                    SET holder = excluded.holder, acquired_at = excluded.acquired_at
                    WHERE sync_lock.holder = excluded.holder OR sync_lock.acquired_at < ?3",
                libsql::params![
                    holder,
                    format_timestamp(now),
                    format_timestamp(now - stale_after)
                ],
            )
            .await?;
        Ok(claimed > 0)
    }

    async fn release_lease(&self, holder: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_lock WHERE holder = ?", [holder])
            .await?;
        Ok(())
    }
}
