//! In-memory transport for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::wire::{BatchRecordResult, IngestStatus};
use super::{SyncTransport, TransportError, DEFAULT_BATCH_SIZE};
use crate::models::{ChangeRecord, RecordId};

/// Scripted remote: serves seeded rows and records every push
pub struct MockTransport {
    batch_size: usize,
    online: AtomicBool,
    probes: AtomicUsize,
    batch_calls: AtomicUsize,
    remote: Mutex<HashMap<String, Vec<ChangeRecord>>>,
    pushed: Mutex<HashMap<String, Vec<ChangeRecord>>>,
    pulls: Mutex<Vec<(String, DateTime<Utc>)>>,
    failing_batches: Mutex<HashMap<usize, TransportError>>,
    failing_pulls: Mutex<HashMap<String, TransportError>>,
    conflicting: Mutex<HashSet<(String, RecordId)>>,
    pull_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            online: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            remote: Mutex::default(),
            pushed: Mutex::default(),
            pulls: Mutex::default(),
            failing_batches: Mutex::default(),
            failing_pulls: Mutex::default(),
            conflicting: Mutex::default(),
            pull_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make every pull wait this long before answering
    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Rows the remote returns from `pull`
    pub fn seed_remote(&self, table: &str, records: Vec<ChangeRecord>) {
        self.remote
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(records);
    }

    /// Fail the `batch`-th batch request (1-based, counted across tables)
    pub fn fail_batch(&self, batch: usize, error: TransportError) {
        self.failing_batches.lock().unwrap().insert(batch, error);
    }

    pub fn fail_pull(&self, table: &str, error: TransportError) {
        self.failing_pulls
            .lock()
            .unwrap()
            .insert(table.to_string(), error);
    }

    /// Answer 409 for this record
    pub fn reject_with_conflict(&self, table: &str, id: RecordId) {
        self.conflicting
            .lock()
            .unwrap()
            .insert((table.to_string(), id));
    }

    /// Records accepted for `table`, in push order
    pub fn pushed(&self, table: &str) -> Vec<ChangeRecord> {
        self.pushed
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every `(table, since)` pulled, in call order
    pub fn pulls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.pulls.lock().unwrap().clone()
    }

    fn status_for(&self, table: &str, record: &ChangeRecord) -> IngestStatus {
        let conflicting = record.id().is_some_and(|id| {
            self.conflicting
                .lock()
                .unwrap()
                .contains(&(table.to_string(), id))
        });
        if conflicting {
            return IngestStatus::Conflict;
        }
        self.pushed
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        IngestStatus::Inserted
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn pull(
        &self,
        table: &str,
        since: DateTime<Utc>,
        server_id: &str,
    ) -> Result<Vec<ChangeRecord>, TransportError> {
        self.pulls.lock().unwrap().push((table.to_string(), since));
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failing_pulls.lock().unwrap().get(table) {
            return Err(error.clone());
        }
        if !self.online.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self
            .remote
            .lock()
            .unwrap()
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.updated_at().is_none_or(|at| at > since))
                    .filter(|record| record.server_id() != Some(server_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn push_one(
        &self,
        table: &str,
        record: &ChangeRecord,
    ) -> Result<IngestStatus, TransportError> {
        match self.status_for(table, record) {
            IngestStatus::Conflict => Err(TransportError::RemoteConflict(
                "stored copy is newer".to_string(),
            )),
            status => Ok(status),
        }
    }

    async fn push_chunk(
        &self,
        table: &str,
        records: &[ChangeRecord],
    ) -> Result<Vec<BatchRecordResult>, TransportError> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.failing_batches.lock().unwrap().get(&call) {
            return Err(error.clone());
        }
        Ok(records
            .iter()
            .map(|record| BatchRecordResult {
                id: record.id(),
                status: self.status_for(table, record),
                error: None,
            })
            .collect())
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
