//! Database layer for sitesync

mod connection;
mod migrations;
mod registry;
mod sync_state_repository;
mod table_repository;

pub use connection::Database;
pub use registry::TableRegistry;
pub use sync_state_repository::{LibSqlSyncStateStore, SyncStateStore};
pub use table_repository::{quote_ident, LibSqlTableRepository, TableRepository, REQUIRED_COLUMNS};

#[cfg(test)]
pub(crate) use table_repository::tests as fixtures;
