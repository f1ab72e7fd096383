//! Per-table push/pull reconciliation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::db::{TableRegistry, TableRepository};
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, SyncConflict, SyncErrorEntry, SyncErrorKind, SyncResult};
use crate::resolver::{resolve, PolicyBook};
use crate::transport::{SyncTransport, TransportError};

/// What applying one remote record did to the local table
#[derive(Debug, Default)]
struct Applied {
    processed: bool,
    conflicts: Vec<SyncConflict>,
}

/// Synchronizes one table at a time against the remote
pub struct TableSynchronizer {
    registry: TableRegistry,
    transport: Arc<dyn SyncTransport>,
    policies: PolicyBook,
    server_id: String,
}

impl TableSynchronizer {
    pub fn new(
        registry: TableRegistry,
        transport: Arc<dyn SyncTransport>,
        policies: PolicyBook,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            transport,
            policies,
            server_id: server_id.into(),
        }
    }

    /// This node's id
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub const fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Push local changes since `watermark`, then pull and apply remote ones.
    ///
    /// Never fails as a whole: every problem ends up in `errors`.
    pub async fn sync_table(&self, table: &str, watermark: DateTime<Utc>) -> SyncResult {
        let mut result = SyncResult::default();
        let repository = match self.registry.get(table) {
            Ok(repository) => repository,
            Err(error) => {
                tracing::warn!(table, "Skipping unregistered table");
                result.errors.push(SyncErrorEntry::table(
                    table,
                    SyncErrorKind::UnknownTable,
                    error.to_string(),
                ));
                return result;
            }
        };

        self.push_local_changes(repository.as_ref(), watermark, &mut result)
            .await;

        match self.transport.pull(table, watermark, &self.server_id).await {
            Ok(records) => {
                result.absorb(self.apply_records(repository.as_ref(), records).await);
            }
            Err(error) => {
                tracing::warn!(table, "Pull failed: {error}");
                result.errors.push(SyncErrorEntry::table(
                    table,
                    SyncErrorKind::Transport,
                    format!("pull failed: {error}"),
                ));
            }
        }

        tracing::debug!(
            table,
            records = result.records_processed,
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "Table synchronized"
        );
        result
    }

    /// Apply records received from another node, without pushing anything
    pub async fn apply_remote(&self, table: &str, records: Vec<ChangeRecord>) -> Result<SyncResult> {
        let repository = self.registry.get(table)?;
        Ok(self.apply_records(repository.as_ref(), records).await)
    }

    async fn push_local_changes(
        &self,
        repository: &dyn TableRepository,
        watermark: DateTime<Utc>,
        result: &mut SyncResult,
    ) {
        let table = repository.table();
        let local = match repository.find_changed_since(watermark).await {
            Ok(local) => local,
            Err(error) => {
                result.errors.push(SyncErrorEntry::table(
                    table,
                    SyncErrorKind::Push,
                    format!("reading local changes failed: {error}"),
                ));
                return;
            }
        };
        if local.is_empty() {
            return;
        }

        let outgoing: Vec<ChangeRecord> = local
            .into_iter()
            .map(|record| record.with_origin(&self.server_id))
            .collect();
        let report = self.transport.push_batch(table, &outgoing).await;

        result.records_processed += report.applied.len() as u64;
        for failure in report.failed {
            let kind = match failure.error {
                TransportError::RemoteConflict(_) => SyncErrorKind::RemoteConflict,
                TransportError::Offline(_) => SyncErrorKind::Unreachable,
                _ => SyncErrorKind::Push,
            };
            result.errors.push(SyncErrorEntry::record(
                table,
                failure.record_id,
                kind,
                failure.error.to_string(),
            ));
        }
    }

    async fn apply_records(
        &self,
        repository: &dyn TableRepository,
        records: Vec<ChangeRecord>,
    ) -> SyncResult {
        let mut result = SyncResult::default();
        for record in records {
            let record_id = record.id();
            match self.apply_record(repository, record).await {
                Ok(applied) => {
                    if applied.processed {
                        result.records_processed += 1;
                    }
                    result.conflicts.extend(applied.conflicts);
                }
                Err(error) => {
                    tracing::warn!(
                        table = repository.table(),
                        record = ?record_id,
                        "Failed to apply remote record: {error}"
                    );
                    result.errors.push(SyncErrorEntry::record(
                        repository.table(),
                        record_id,
                        SyncErrorKind::RecordApply,
                        error.to_string(),
                    ));
                }
            }
        }
        result
    }

    async fn apply_record(
        &self,
        repository: &dyn TableRepository,
        remote: ChangeRecord,
    ) -> Result<Applied> {
        let table = repository.table();
        let id = remote
            .id()
            .ok_or_else(|| Error::InvalidInput("remote record has no id".to_string()))?;

        let Some(local) = repository.find_by_id(&id).await? else {
            repository.insert(&remote.without_transport_fields()).await?;
            return Ok(Applied {
                processed: true,
                conflicts: Vec::new(),
            });
        };

        // Self-echo: this node wrote the version the remote is sending back
        if local.server_id().is_some() && local.server_id() == remote.server_id() {
            return Ok(Applied::default());
        }
        if local.compute_checksum() == remote.effective_checksum() {
            return Ok(Applied::default());
        }

        let mut applied = Applied::default();
        let mut changes = Map::new();
        for field in local.differing_fields(&remote) {
            let local_value = local.get(&field).cloned().unwrap_or(Value::Null);
            let remote_value = remote.get(&field).cloned().unwrap_or(Value::Null);
            let policy = self.policies.policy_for(table, &field);
            let conflict = resolve(
                SyncConflict::new(table, id.clone(), &field, local_value, remote_value, policy)
                    .with_timestamps(local.updated_at(), remote.updated_at()),
            );

            if conflict.is_resolved() {
                applied.processed = true;
                if let Some(value) = conflict.resolved_value.as_ref() {
                    if Some(value) != local.get(&field) {
                        changes.insert(field.clone(), value.clone());
                    }
                }
            }
            applied.conflicts.push(conflict);
        }

        if !changes.is_empty() {
            repository.update(&id, &changes).await?;
        }
        Ok(applied)
    }
}
