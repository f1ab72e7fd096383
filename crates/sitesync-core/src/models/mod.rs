//! Data models for sitesync

mod conflict;
mod record;
mod run_log;

pub use conflict::{ResolutionPolicy, SyncConflict};
pub use record::{is_bookkeeping_field, ChangeRecord, RecordId, BOOKKEEPING_FIELDS};
pub use run_log::{
    SyncDirection, SyncErrorEntry, SyncErrorKind, SyncResult, SyncRunLog, SyncStatus,
};
