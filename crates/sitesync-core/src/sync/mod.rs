//! The sync engine.
//!
//! [`TableSynchronizer`] reconciles one table, [`SyncOrchestrator`] runs
//! whole cycles over the tiers and [`RecordIngestor`] answers other nodes.

mod ingest;
mod orchestrator;
mod synchronizer;

pub use ingest::RecordIngestor;
pub use orchestrator::{
    default_tables, SyncNodeStatus, SyncOrchestrator, AUTO_SYNC_INTERVAL_RANGE, DEFAULT_TIERS,
    MAX_LOG_LIMIT,
};
pub use synchronizer::TableSynchronizer;
