//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::RecordId;

/// How a conflicting field is reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionPolicy {
    /// Keep the site value
    LocalWins,
    /// Take the central value
    RemoteWins,
    /// Dispatch to the per-table business rules
    #[default]
    TimestampWins,
    /// Shallow-merge structured values, remote keys win
    Merge,
    /// Defer to an operator; never applied automatically
    Manual,
}

impl ResolutionPolicy {
    /// Wire name of the policy
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "LOCAL_WINS",
            Self::RemoteWins => "REMOTE_WINS",
            Self::TimestampWins => "TIMESTAMP_WINS",
            Self::Merge => "MERGE",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LOCAL_WINS" => Ok(Self::LocalWins),
            "REMOTE_WINS" => Ok(Self::RemoteWins),
            "TIMESTAMP_WINS" => Ok(Self::TimestampWins),
            "MERGE" => Ok(Self::Merge),
            "MANUAL" => Ok(Self::Manual),
            other => Err(format!("unknown resolution policy '{other}'")),
        }
    }
}

/// A field-level divergence between the site and central copies of a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Table the row lives in
    pub table: String,
    /// Row identifier
    pub record_id: RecordId,
    /// Diverging business field
    pub field: String,
    /// Site value
    pub local_value: Value,
    /// Central value
    pub remote_value: Value,
    /// Site row's `updated_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_updated_at: Option<DateTime<Utc>>,
    /// Central row's `updated_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<DateTime<Utc>>,
    /// Policy selected for this field
    pub resolution_policy: ResolutionPolicy,
    /// Value to apply; `None` until resolved and for manual review.
    ///
    /// A present JSON `null` is a real resolution (clear the field).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub resolved_value: Option<Value>,
    /// Flagged for an operator instead of being applied
    #[serde(default)]
    pub requires_review: bool,
}

impl SyncConflict {
    /// Create an unresolved conflict
    pub fn new(
        table: impl Into<String>,
        record_id: RecordId,
        field: impl Into<String>,
        local_value: Value,
        remote_value: Value,
        resolution_policy: ResolutionPolicy,
    ) -> Self {
        Self {
            table: table.into(),
            record_id,
            field: field.into(),
            local_value,
            remote_value,
            local_updated_at: None,
            remote_updated_at: None,
            resolution_policy,
            resolved_value: None,
            requires_review: false,
        }
    }

    /// Attach the edit times of both copies
    #[must_use]
    pub const fn with_timestamps(
        mut self,
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.local_updated_at = local_updated_at;
        self.remote_updated_at = remote_updated_at;
        self
    }

    /// True once a value has been chosen for automatic application
    pub const fn is_resolved(&self) -> bool {
        self.resolved_value.is_some() && !self.requires_review
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
