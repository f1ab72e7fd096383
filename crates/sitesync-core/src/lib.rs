//! sitesync-core - Core library for sitesync
//!
//! This crate contains the record model, conflict resolution, libSQL
//! storage, remote transport and the sync engine shared by the sitesync
//! API node and CLI.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod resolver;
pub mod services;
pub mod sync;
pub mod transport;
pub mod util;

pub use config::{ConfigError, SyncConfig};
pub use error::{Error, Result};
pub use models::{ChangeRecord, RecordId, SyncConflict, SyncRunLog, SyncStatus};
pub use services::SyncService;
