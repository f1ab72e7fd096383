//! JSON bodies exchanged between nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChangeRecord, RecordId};

/// Header carrying the shared secret
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header identifying the calling node
pub const SERVER_ID_HEADER: &str = "x-server-id";

/// `GET /sync/changes/:table` query string
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// `GET /sync/changes/:table` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub records: Vec<ChangeRecord>,
    pub timestamp: DateTime<Utc>,
}

/// `POST /sync/records/:table` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRecordRequest {
    pub record: ChangeRecord,
    pub timestamp: DateTime<Utc>,
}

/// Result of storing one incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Inserted,
    Updated,
    /// Stored copy already had the same business content
    Unchanged,
    /// Stored copy is newer and from another origin
    Conflict,
    Failed,
}

impl IngestStatus {
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Unchanged)
    }
}

/// `POST /sync/records/:table` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRecordResponse {
    pub status: IngestStatus,
}

/// `POST /sync/batch/:table` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBatchRequest {
    pub records: Vec<ChangeRecord>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome for one record of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecordResult {
    pub id: Option<RecordId>,
    pub status: IngestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /sync/batch/:table` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushBatchResponse {
    pub results: Vec<BatchRecordResult>,
    pub applied: u64,
    pub conflicts: u64,
    pub failed: u64,
}

impl PushBatchResponse {
    /// Tally per-record outcomes
    pub fn from_results(results: Vec<BatchRecordResult>) -> Self {
        let mut response = Self::default();
        for result in &results {
            match result.status {
                status if status.is_applied() => response.applied += 1,
                IngestStatus::Conflict => response.conflicts += 1,
                _ => response.failed += 1,
            }
        }
        response.results = results;
        response
    }
}

/// `POST /sync/receive/:table` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub records: Vec<ChangeRecord>,
}

/// `GET /sync/health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
}
