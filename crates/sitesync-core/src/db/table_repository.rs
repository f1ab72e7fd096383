//! Generic access to one synchronized business table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Row, Value as SqlValue};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::models::{ChangeRecord, RecordId};
use crate::util::{format_timestamp, parse_timestamp};

/// Columns a table must have to take part in sync
pub const REQUIRED_COLUMNS: [&str; 3] = ["id", "updated_at", "server_id"];

/// Columns holding timestamps, stored in canonical form
const TIMESTAMP_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// Row access the synchronizer needs from a table
#[async_trait]
pub trait TableRepository: Send + Sync {
    /// Table name
    fn table(&self) -> &str;

    /// Rows with `updated_at` strictly after `since`, oldest first
    async fn find_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>>;

    /// Row by primary key
    async fn find_by_id(&self, id: &RecordId) -> Result<Option<ChangeRecord>>;

    /// Insert a new row; unknown columns are ignored
    async fn insert(&self, record: &ChangeRecord) -> Result<()>;

    /// Update the given columns of an existing row
    async fn update(&self, id: &RecordId, changes: &Map<String, Value>) -> Result<()>;
}

/// libSQL implementation of `TableRepository`.
///
/// The column list is read once from `PRAGMA table_info`; fields of a record
/// that are not columns of the table are dropped on write.
#[derive(Clone)]
pub struct LibSqlTableRepository {
    conn: Connection,
    table: String,
    columns: Vec<String>,
    select_list: String,
}

impl LibSqlTableRepository {
    /// Inspect `table` and build a repository for it.
    ///
    /// Returns `Ok(None)` if the table does not exist and an error if it
    /// lacks one of [`REQUIRED_COLUMNS`].
    pub async fn discover(conn: &Connection, table: &str) -> Result<Option<Self>> {
        let quoted = quote_ident(table)?;
        let mut rows = conn
            .query(&format!("PRAGMA table_info({quoted})"), ())
            .await?;

        let mut columns = Vec::new();
        while let Some(row) = rows.next().await? {
            columns.push(row.get::<String>(1)?);
        }
        if columns.is_empty() {
            return Ok(None);
        }

        if let Some(missing) = REQUIRED_COLUMNS
            .iter()
            .find(|required| !columns.iter().any(|column| column == *required))
        {
            return Err(Error::InvalidInput(format!(
                "table {table} has no {missing} column"
            )));
        }

        let select_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        Ok(Some(Self {
            conn: conn.clone(),
            table: table.to_string(),
            columns,
            select_list,
        }))
    }

    /// Column names in table order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    fn row_to_record(&self, row: &Row) -> Result<ChangeRecord> {
        let mut fields = Map::new();
        for (index, column) in self.columns.iter().enumerate() {
            let index = i32::try_from(index)
                .map_err(|_| Error::Database(format!("too many columns in {}", self.table)))?;
            fields.insert(column.clone(), sql_to_json(row.get_value(index)?));
        }
        Ok(ChangeRecord::new(fields))
    }
}

#[async_trait]
impl TableRepository for LibSqlTableRepository {
    fn table(&self) -> &str {
        &self.table
    }

    async fn find_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE updated_at > ? ORDER BY updated_at",
            self.select_list,
            quote_ident(&self.table)?
        );
        let mut rows = self.conn.query(&sql, [format_timestamp(since)]).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(self.row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            self.select_list,
            quote_ident(&self.table)?
        );
        let mut rows = self.conn.query(&sql, [id_to_sql(id)]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(self.row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, record: &ChangeRecord) -> Result<()> {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (field, value) in record.fields() {
            if self.has_column(field) {
                names.push(quote_ident(field)?);
                values.push(json_to_sql(field, value));
            }
        }
        if names.is_empty() {
            return Err(Error::InvalidInput(format!(
                "record has no columns of {}",
                self.table
            )));
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&self.table)?,
            names.join(", ")
        );
        self.conn.execute(&sql, values).await?;
        Ok(())
    }

    async fn update(&self, id: &RecordId, changes: &Map<String, Value>) -> Result<()> {
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for (field, value) in changes {
            if field != "id" && self.has_column(field) {
                assignments.push(format!("{} = ?", quote_ident(field)?));
                values.push(json_to_sql(field, value));
            }
        }
        if assignments.is_empty() {
            return Ok(());
        }
        values.push(id_to_sql(id));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            quote_ident(&self.table)?,
            assignments.join(", ")
        );
        let affected = self.conn.execute(&sql, values).await?;
        if affected == 0 {
            return Err(Error::NotFound(format!("{} {id}", self.table)));
        }
        Ok(())
    }
}

/// Double-quote an identifier, accepting only `[A-Za-z0-9_]` names
pub fn quote_ident(name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(Error::InvalidInput(format!("invalid identifier '{name}'")))
    }
}

fn id_to_sql(id: &RecordId) -> SqlValue {
    match id {
        RecordId::Int(value) => SqlValue::Integer(*value),
        RecordId::Text(value) => SqlValue::Text(value.clone()),
    }
}

fn json_to_sql(field: &str, value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) if TIMESTAMP_COLUMNS.contains(&field) => SqlValue::Text(
            parse_timestamp(text).map_or_else(|| text.clone(), format_timestamp),
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Blobs are exposed as hex text
fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(number) => Value::from(number),
        SqlValue::Real(number) => real_to_json(number),
        SqlValue::Text(text) => Value::String(text),
        SqlValue::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

/// Integral reals read back as integers, matching what the remote serializes
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn real_to_json(number: f64) -> Value {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e15 {
        Value::from(number as i64)
    } else {
        Number::from_f64(number).map_or(Value::Null, Value::Number)
    }
}
