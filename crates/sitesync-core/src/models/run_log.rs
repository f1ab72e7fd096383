//! Sync run log model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RecordId, SyncConflict};

/// Terminal classification of a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    InProgress,
    /// Every tier ran and nothing was recorded in `errors`
    Completed,
    /// Every tier ran but some tables or records failed
    Partial,
    /// The cycle itself failed (watermark storage, cancellation)
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "PARTIAL" => Ok(Self::Partial),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// Which way data moved during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bidirectional => "BIDIRECTIONAL",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BIDIRECTIONAL" => Ok(Self::Bidirectional),
            other => Err(format!("unknown sync direction '{other}'")),
        }
    }
}

/// Category of a recovered sync failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorKind {
    /// A local change could not be pushed
    Push,
    /// Remote went away mid-push; the change is retried next cycle
    Unreachable,
    /// A pulled row could not be inserted or updated locally
    RecordApply,
    /// Central rejected a push with 409
    RemoteConflict,
    /// Table has no registered repository
    UnknownTable,
    /// Pull or authentication failure for a whole table
    Transport,
    /// Cycle stopped on shutdown
    Cancelled,
    /// Watermark or run-log storage failure
    Orchestration,
}

/// One recovered failure inside a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncErrorEntry {
    /// Failure tied to one row
    pub fn record(
        table: &str,
        record_id: Option<RecordId>,
        kind: SyncErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            table: Some(table.to_string()),
            record_id,
            kind,
            message: message.into(),
        }
    }

    /// Failure tied to a table as a whole
    pub fn table(table: &str, kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self::record(table, None, kind, message)
    }

    /// Failure of the cycle itself
    pub fn cycle(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            table: None,
            record_id: None,
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of synchronizing one table (or one ingestion batch)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub records_processed: u64,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncResult {
    /// Fold another result into this one
    pub fn absorb(&mut self, other: Self) {
        self.records_processed += other.records_processed;
        self.conflicts.extend(other.conflicts);
        self.errors.extend(other.errors);
    }
}

/// Audit record of one orchestrator cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunLog {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub direction: SyncDirection,
    pub records_processed: u64,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    #[serde(default)]
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncRunLog {
    /// A new pending run starting now
    pub fn begin(direction: SyncDirection) -> Self {
        Self {
            id: Uuid::now_v7(),
            start_time: Utc::now(),
            end_time: None,
            status: SyncStatus::Pending,
            direction,
            records_processed: 0,
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// PENDING → IN_PROGRESS
    pub fn mark_in_progress(&mut self) {
        if self.status == SyncStatus::Pending {
            self.status = SyncStatus::InProgress;
        }
    }

    /// Add a table's outcome to the run totals
    pub fn absorb(&mut self, result: SyncResult) {
        self.records_processed += result.records_processed;
        self.conflicts.extend(result.conflicts);
        self.errors.extend(result.errors);
    }

    /// IN_PROGRESS → COMPLETED or PARTIAL
    pub fn finish(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if self.errors.is_empty() {
            SyncStatus::Completed
        } else {
            SyncStatus::Partial
        };
        self.end_time = Some(Utc::now());
    }

    /// IN_PROGRESS → FAILED
    pub fn fail(&mut self, error: SyncErrorEntry) {
        if self.status.is_terminal() {
            return;
        }
        self.errors.push(error);
        self.status = SyncStatus::Failed;
        self.end_time = Some(Utc::now());
    }

    /// Conflicts left for an operator
    pub fn pending_review(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|conflict| conflict.requires_review)
    }
}
