//! Change record model

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::util::parse_timestamp;

/// Columns that carry sync bookkeeping rather than business data.
///
/// These never take part in checksums or conflict diffs.
pub const BOOKKEEPING_FIELDS: [&str; 5] = ["id", "created_at", "updated_at", "server_id", "checksum"];

/// Returns true if `field` is a bookkeeping column.
pub fn is_bookkeeping_field(field: &str) -> bool {
    BOOKKEEPING_FIELDS.contains(&field)
}

/// Primary key of a synchronized row (integer or text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer primary key
    Int(i64),
    /// Text primary key (UUIDs, codes)
    Text(String),
}

impl RecordId {
    /// Read an id from a JSON value, accepting integers and non-empty strings
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Int),
            Value::String(text) if !text.trim().is_empty() => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    /// JSON form of this id
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Text(value) => Value::from(value.as_str()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A row from any synchronized table.
///
/// Stored as a flat JSON object so the engine stays independent of the
/// business schema. `id` and `updated_at` are always expected; `server_id`
/// and `checksum` are attached for transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeRecord(Map<String, Value>);

impl ChangeRecord {
    /// Wrap a JSON object as a change record
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Build a record from a JSON value, rejecting non-objects
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Row identifier, if present and well formed
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id").and_then(RecordId::from_json)
    }

    /// Last modification time
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Origin node of the last write
    pub fn server_id(&self) -> Option<&str> {
        self.0
            .get("server_id")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Transported checksum, if attached
    pub fn checksum(&self) -> Option<&str> {
        self.0.get("checksum").and_then(Value::as_str)
    }

    /// Field value (missing fields read as `None`)
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field value
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Remove a field, returning its previous value
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// All fields including bookkeeping columns
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the record into its field map
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// Business fields in key order, with nulls dropped.
    ///
    /// A null column and an absent key are the same business state.
    pub fn business_fields(&self) -> BTreeMap<&str, &Value> {
        self.0
            .iter()
            .filter(|(key, value)| !is_bookkeeping_field(key) && !value.is_null())
            .map(|(key, value)| (key.as_str(), value))
            .collect()
    }

    /// SHA-256 digest (hex) over the canonical JSON of the business fields
    pub fn compute_checksum(&self) -> String {
        let canonical = serde_json::to_vec(&self.business_fields()).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// The transported checksum, or a freshly computed one
    pub fn effective_checksum(&self) -> String {
        self.checksum()
            .map_or_else(|| self.compute_checksum(), ToString::to_string)
    }

    /// Stamp the record with an origin node and a fresh checksum for pushing
    #[must_use]
    pub fn with_origin(mut self, server_id: &str) -> Self {
        let checksum = self.compute_checksum();
        self.0.insert("server_id".to_string(), Value::from(server_id));
        self.0.insert("checksum".to_string(), Value::from(checksum));
        self
    }

    /// Drop transport-only fields before storing a pulled record
    #[must_use]
    pub fn without_transport_fields(mut self) -> Self {
        self.0.remove("server_id");
        self.0.remove("checksum");
        self
    }

    /// Business fields whose values differ between `self` and `other`, sorted
    pub fn differing_fields(&self, other: &Self) -> Vec<String> {
        let ours = self.business_fields();
        let theirs = other.business_fields();
        ours.keys()
            .chain(theirs.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|field| ours.get(field) != theirs.get(field))
            .map(ToString::to_string)
            .collect()
    }
}

impl From<Map<String, Value>> for ChangeRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> ChangeRecord {
        ChangeRecord::from_value(value).unwrap()
    }

    #[test]
    fn checksum_ignores_bookkeeping_fields() {
        let site = record(json!({
            "id": 7,
            "score": 14,
            "subject_id": 3,
            "updated_at": "2024-02-01T08:00:00.000Z",
            "created_at": "2024-01-01T08:00:00.000Z",
            "server_id": "site-a",
        }));
        let central = record(json!({
            "id": 7,
            "subject_id": 3,
            "score": 14,
            "updated_at": "2024-05-01T08:00:00.000Z",
            "server_id": "central",
            "checksum": "stale",
        }));

        assert_eq!(site.compute_checksum(), central.compute_checksum());
    }

    #[test]
    fn checksum_changes_with_business_values() {
        let before = record(json!({"id": 7, "score": 14}));
        let after = record(json!({"id": 7, "score": 16}));
        assert_ne!(before.compute_checksum(), after.compute_checksum());
    }

    #[test]
    fn checksum_treats_null_as_absent() {
        let with_null = record(json!({"id": 1, "name": "Ada", "nickname": null}));
        let without = record(json!({"id": 1, "name": "Ada"}));
        assert_eq!(with_null.compute_checksum(), without.compute_checksum());
    }

    #[test]
    fn with_origin_attaches_server_id_and_checksum() {
        let pushed = record(json!({"id": 42, "reason": "sick"})).with_origin("site-a");
        assert_eq!(pushed.server_id(), Some("site-a"));
        assert_eq!(
            pushed.checksum().map(str::len),
            Some(64),
            "hex encoded sha-256"
        );

        let stored = pushed.without_transport_fields();
        assert!(stored.server_id().is_none());
        assert!(stored.checksum().is_none());
    }

    #[test]
    fn differing_fields_lists_business_fields_only() {
        let local = record(json!({"id": 7, "score": 14, "comment": "ok", "updated_at": "a"}));
        let remote = record(json!({"id": 7, "score": 16, "comment": "ok", "updated_at": "b", "rank": 2}));
        assert_eq!(local.differing_fields(&remote), vec!["rank", "score"]);
    }

    #[test]
    fn record_id_accepts_integers_and_text() {
        assert_eq!(RecordId::from_json(&json!(42)), Some(RecordId::Int(42)));
        assert_eq!(
            RecordId::from_json(&json!("STU-001")),
            Some(RecordId::from("STU-001"))
        );
        assert_eq!(RecordId::from_json(&json!("  ")), None);
        assert_eq!(RecordId::from_json(&json!(1.5)), None);
    }

    #[test]
    fn updated_at_parses_rfc3339() {
        let row = record(json!({"id": 1, "updated_at": "2024-03-01T10:00:00Z"}));
        assert!(row.updated_at().is_some());

        let broken = record(json!({"id": 1, "updated_at": "yesterday"}));
        assert!(broken.updated_at().is_none());
    }
}
