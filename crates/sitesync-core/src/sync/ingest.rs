//! Serving side of the sync protocol: change feed and incoming writes

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::db::TableRegistry;
use crate::error::{Error, Result};
use crate::models::{is_bookkeeping_field, ChangeRecord};
use crate::transport::wire::{BatchRecordResult, IngestStatus};

/// Stores records pushed by other nodes and serves this node's changes
#[derive(Debug, Clone)]
pub struct RecordIngestor {
    registry: TableRegistry,
    server_id: String,
}

impl RecordIngestor {
    pub fn new(registry: TableRegistry, server_id: impl Into<String>) -> Self {
        Self {
            registry,
            server_id: server_id.into(),
        }
    }

    /// Rows changed after `since`, minus those that originated on `requester`.
    ///
    /// Rows without an origin were written here and carry this node's id.
    /// Every row gets a checksum.
    pub async fn changes_since(
        &self,
        table: &str,
        since: DateTime<Utc>,
        requester: Option<&str>,
    ) -> Result<Vec<ChangeRecord>> {
        let repository = self.registry.get(table)?;
        let records = repository.find_changed_since(since).await?;

        Ok(records
            .into_iter()
            .map(|mut record| {
                if record.server_id().is_none() {
                    record.set("server_id", Value::from(self.server_id.as_str()));
                }
                let checksum = record.compute_checksum();
                record.set("checksum", Value::from(checksum));
                record
            })
            .filter(|record| requester.is_none_or(|requester| record.server_id() != Some(requester)))
            .collect())
    }

    /// Store one incoming record.
    ///
    /// A stored row that is strictly newer, from another origin and with
    /// different content is kept and reported as [`IngestStatus::Conflict`].
    pub async fn ingest(&self, table: &str, record: ChangeRecord) -> Result<IngestStatus> {
        let repository = self.registry.get(table)?;
        let id = record
            .id()
            .ok_or_else(|| Error::InvalidInput("record has no id".to_string()))?;

        let Some(stored) = repository.find_by_id(&id).await? else {
            let mut row = record;
            row.remove("checksum");
            repository.insert(&row).await?;
            return Ok(IngestStatus::Inserted);
        };

        if stored.compute_checksum() == record.compute_checksum() {
            return Ok(IngestStatus::Unchanged);
        }

        let stored_origin = stored.server_id().unwrap_or(&self.server_id);
        let stored_is_newer = matches!(
            (stored.updated_at(), record.updated_at()),
            (Some(stored_at), Some(incoming_at)) if stored_at > incoming_at
        );
        if stored_is_newer && record.server_id() != Some(stored_origin) {
            tracing::debug!(table, record = %id, "Keeping newer stored copy");
            return Ok(IngestStatus::Conflict);
        }

        let changes: Map<String, Value> = record
            .into_fields()
            .into_iter()
            .filter(|(field, _)| {
                !is_bookkeeping_field(field) || field == "updated_at" || field == "server_id"
            })
            .collect();
        repository.update(&id, &changes).await?;
        Ok(IngestStatus::Updated)
    }

    /// Store a batch record by record; one failure does not affect the others
    pub async fn ingest_batch(
        &self,
        table: &str,
        records: Vec<ChangeRecord>,
    ) -> Result<Vec<BatchRecordResult>> {
        self.registry.get(table)?;

        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id();
            let result = match self.ingest(table, record).await {
                Ok(status) => BatchRecordResult {
                    id,
                    status,
                    error: (status == IngestStatus::Conflict)
                        .then(|| "stored copy is newer".to_string()),
                },
                Err(error) => {
                    tracing::warn!(table, record = ?id, "Failed to ingest record: {error}");
                    BatchRecordResult {
                        id,
                        status: IngestStatus::Failed,
                        error: Some(error.to_string()),
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}
