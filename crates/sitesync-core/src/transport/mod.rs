//! Transport to the remote node.
//!
//! [`SyncTransport`] is the seam between the synchronizer and the network.
//! [`HttpTransport`] talks to another sitesync node over HTTP; tests use an
//! in-memory double.

mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod wire;

pub use http::HttpTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{ChangeRecord, RecordId};
use wire::{BatchRecordResult, IngestStatus};

/// Records per batch request unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Errors returned by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Remote could not be reached
    #[error("remote unreachable: {0}")]
    Offline(String),

    /// Remote holds a newer, different copy of the record (HTTP 409)
    #[error("remote rejected a conflicting write: {0}")]
    RemoteConflict(String),

    /// Remote refused the shared secret
    #[error("remote refused credentials (HTTP {0})")]
    Unauthorized(u16),

    /// Remote answered with another non-success status
    #[error("remote returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Remote accepted the batch but failed this record
    #[error("remote failed to apply the record: {0}")]
    Rejected(String),

    /// Request could not be completed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response body did not match the wire format
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Connectivity failures are transient and never recorded against a run
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Offline(_))
    }
}

/// One record that did not make it to the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFailure {
    pub record_id: Option<RecordId>,
    pub error: TransportError,
}

/// Outcome of pushing a set of records in batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPushReport {
    /// Records the remote inserted, updated or already held
    pub applied: Vec<RecordId>,
    /// Records rejected individually or lost with a failed batch
    pub failed: Vec<PushFailure>,
    /// Batch requests attempted
    pub batches: usize,
}

impl BatchPushReport {
    /// Every record of `chunk` ends up applied or failed, including ones the
    /// remote left out of its answer
    fn absorb_results(&mut self, chunk: &[ChangeRecord], results: Vec<BatchRecordResult>) {
        let mut answered = Vec::with_capacity(results.len());
        for result in results {
            let Some(id) = result.id else {
                self.failed.push(PushFailure {
                    record_id: None,
                    error: TransportError::InvalidResponse(
                        "batch result without a record id".to_string(),
                    ),
                });
                continue;
            };
            answered.push(id.clone());
            match result.status {
                IngestStatus::Inserted | IngestStatus::Updated | IngestStatus::Unchanged => {
                    self.applied.push(id);
                }
                IngestStatus::Conflict => self.failed.push(PushFailure {
                    record_id: Some(id),
                    error: TransportError::RemoteConflict(
                        result
                            .error
                            .unwrap_or_else(|| "remote copy is newer".to_string()),
                    ),
                }),
                IngestStatus::Failed => self.failed.push(PushFailure {
                    record_id: Some(id),
                    error: TransportError::Rejected(result.error.unwrap_or_default()),
                }),
            }
        }

        for record in chunk {
            let id = record.id();
            if id.as_ref().is_some_and(|id| answered.contains(id)) {
                continue;
            }
            self.failed.push(PushFailure {
                record_id: id,
                error: TransportError::InvalidResponse(
                    "remote returned no result for the record".to_string(),
                ),
            });
        }
    }

    fn absorb_batch_failure(&mut self, records: &[ChangeRecord], error: &TransportError) {
        self.failed
            .extend(records.iter().map(|record| PushFailure {
                record_id: record.id(),
                error: error.clone(),
            }));
    }
}

/// Network capability the synchronizer and connectivity prober depend on
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Remote rows of `table` changed after `since`, excluding rows that
    /// originated on `server_id`
    async fn pull(
        &self,
        table: &str,
        since: DateTime<Utc>,
        server_id: &str,
    ) -> Result<Vec<ChangeRecord>, TransportError>;

    /// Push a single record
    async fn push_one(
        &self,
        table: &str,
        record: &ChangeRecord,
    ) -> Result<IngestStatus, TransportError>;

    /// Send one batch request and return the remote's per-record outcomes
    async fn push_chunk(
        &self,
        table: &str,
        records: &[ChangeRecord],
    ) -> Result<Vec<BatchRecordResult>, TransportError>;

    /// Whether the remote answers its health endpoint
    async fn probe(&self) -> bool;

    /// Records per batch request
    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    /// Push records in independent batches.
    ///
    /// A failed batch marks each of its records as failed; later batches
    /// still run. Nothing is rolled back.
    async fn push_batch(&self, table: &str, records: &[ChangeRecord]) -> BatchPushReport {
        let mut report = BatchPushReport::default();
        for (index, chunk) in records.chunks(self.batch_size().max(1)).enumerate() {
            report.batches += 1;
            match self.push_chunk(table, chunk).await {
                Ok(results) => report.absorb_results(chunk, results),
                Err(error) => {
                    tracing::warn!(
                        table,
                        batch = index + 1,
                        records = chunk.len(),
                        "Batch push failed: {error}"
                    );
                    report.absorb_batch_failure(chunk, &error);
                }
            }
        }
        report
    }
}
