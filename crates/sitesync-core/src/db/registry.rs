//! Table name to repository mapping, built once at startup

use std::collections::BTreeMap;
use std::sync::Arc;

use libsql::Connection;

use super::table_repository::{LibSqlTableRepository, TableRepository};
use crate::error::{Error, Result};

/// Repositories for every table the node can synchronize
#[derive(Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, Arc<dyn TableRepository>>,
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every listed table that exists and carries the sync columns.
    ///
    /// Missing or unsyncable tables are skipped with a warning; syncing them
    /// later reports `UnknownTable`.
    pub async fn discover<'a>(
        conn: &Connection,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for table in tables {
            match LibSqlTableRepository::discover(conn, table).await {
                Ok(Some(repository)) => registry.register(Arc::new(repository)),
                Ok(None) => tracing::warn!(table, "Sync table does not exist, skipping"),
                Err(Error::InvalidInput(reason)) => {
                    tracing::warn!(table, "Sync table cannot be synchronized: {reason}");
                }
                Err(error) => return Err(error),
            }
        }
        tracing::info!(tables = registry.len(), "Registered sync tables");
        Ok(registry)
    }

    /// Add or replace a repository under its table name
    pub fn register(&mut self, repository: Arc<dyn TableRepository>) {
        self.tables
            .insert(repository.table().to_string(), repository);
    }

    /// Repository for `table`
    pub fn get(&self, table: &str) -> Result<Arc<dyn TableRepository>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Registered table names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
