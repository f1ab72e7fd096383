//! Long-running services built on the sync engine

mod sync_service;

pub use sync_service::SyncService;
