//! Conflict resolution.
//!
//! [`resolve`] is a pure function of the conflict it is given: the same
//! table, field, values, timestamps and policy always produce the same
//! resolved value. [`PolicyBook`] decides which policy a field gets.

mod policy_book;

pub use policy_book::PolicyBook;

use serde_json::{Map, Value};

use crate::models::{ResolutionPolicy, SyncConflict};

/// Business outcome used by `TIMESTAMP_WINS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusinessRule {
    /// Newer edit wins; ties and unknown times go to remote
    LatestEdit,
    /// Site copy wins (data captured live at the site)
    Local,
    /// Central copy wins (central is the authority)
    Remote,
    /// Most restrictive account status wins
    MostRestrictive,
}

/// Fields of `users` edited by their owner from either side
const USER_CONTACT_FIELDS: [&str; 5] = ["password", "email", "phone", "address", "whatsapp"];

/// Look up the business rule for a field
pub fn business_rule(table: &str, field: &str) -> BusinessRule {
    match (table, field) {
        ("marks", _) => BusinessRule::LatestEdit,
        ("student_absences" | "attendance", _) => BusinessRule::Local,
        ("payment_transactions" | "payments", _) => BusinessRule::Remote,
        ("users", "status") => BusinessRule::MostRestrictive,
        ("users", field) if USER_CONTACT_FIELDS.contains(&field) => BusinessRule::LatestEdit,
        _ => BusinessRule::Remote,
    }
}

/// Fill in `resolved_value` according to the conflict's policy
pub fn resolve(mut conflict: SyncConflict) -> SyncConflict {
    let resolved = match conflict.resolution_policy {
        ResolutionPolicy::LocalWins => Some(conflict.local_value.clone()),
        ResolutionPolicy::RemoteWins => Some(conflict.remote_value.clone()),
        ResolutionPolicy::TimestampWins => Some(resolve_by_business_rule(&conflict)),
        ResolutionPolicy::Merge => Some(merge_values(
            &conflict.local_value,
            &conflict.remote_value,
        )),
        ResolutionPolicy::Manual => None,
    };

    conflict.requires_review = resolved.is_none();
    conflict.resolved_value = resolved;
    conflict
}

fn resolve_by_business_rule(conflict: &SyncConflict) -> Value {
    match business_rule(&conflict.table, &conflict.field) {
        BusinessRule::Local => conflict.local_value.clone(),
        BusinessRule::Remote => conflict.remote_value.clone(),
        BusinessRule::LatestEdit => {
            let local_is_newer = matches!(
                (conflict.local_updated_at, conflict.remote_updated_at),
                (Some(local), Some(remote)) if local > remote
            );
            if local_is_newer {
                conflict.local_value.clone()
            } else {
                conflict.remote_value.clone()
            }
        }
        BusinessRule::MostRestrictive => {
            if status_rank(&conflict.local_value) > status_rank(&conflict.remote_value) {
                conflict.local_value.clone()
            } else {
                conflict.remote_value.clone()
            }
        }
    }
}

/// SUSPENDED > INACTIVE > ACTIVE; anything else ranks lowest
fn status_rank(value: &Value) -> u8 {
    match value.as_str().map(str::to_ascii_uppercase).as_deref() {
        Some("SUSPENDED") => 3,
        Some("INACTIVE") => 2,
        Some("ACTIVE") => 1,
        _ => 0,
    }
}

/// Shallow union of two objects; remote keys overwrite local ones.
///
/// Objects stored as JSON text merge too, and the result keeps the local
/// value's shape.
fn merge_values(local: &Value, remote: &Value) -> Value {
    let (Some(mut merged), Some(remote_fields)) = (as_object(local), as_object(remote)) else {
        return remote.clone();
    };
    merged.extend(remote_fields);

    let merged = Value::Object(merged);
    if local.is_string() {
        Value::String(merged.to_string())
    } else {
        merged
    }
}

fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(fields) => Some(fields.clone()),
        Value::String(text) => match serde_json::from_str(text) {
            Ok(Value::Object(fields)) => Some(fields),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordId;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn conflict(
        table: &str,
        field: &str,
        local: Value,
        remote: Value,
        policy: ResolutionPolicy,
    ) -> SyncConflict {
        SyncConflict::new(table, RecordId::Int(1), field, local, remote, policy)
    }

    #[test]
    fn trivial_policies_select_a_side() {
        let local = resolve(conflict(
            "subjects",
            "name",
            json!("Maths"),
            json!("Math"),
            ResolutionPolicy::LocalWins,
        ));
        assert_eq!(local.resolved_value, Some(json!("Maths")));

        let remote = resolve(conflict(
            "subjects",
            "name",
            json!("Maths"),
            json!("Math"),
            ResolutionPolicy::RemoteWins,
        ));
        assert_eq!(remote.resolved_value, Some(json!("Math")));
        assert!(!remote.requires_review);
    }

    #[test]
    fn marks_take_latest_edit() {
        let older = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();

        let local_newer = resolve(
            conflict(
                "marks",
                "score",
                json!(14),
                json!(16),
                ResolutionPolicy::TimestampWins,
            )
            .with_timestamps(Some(newer), Some(older)),
        );
        assert_eq!(local_newer.resolved_value, Some(json!(14)));

        let remote_newer = resolve(
            conflict(
                "marks",
                "score",
                json!(14),
                json!(16),
                ResolutionPolicy::TimestampWins,
            )
            .with_timestamps(Some(older), Some(newer)),
        );
        assert_eq!(remote_newer.resolved_value, Some(json!(16)));
    }

    #[test]
    fn latest_edit_without_timestamps_goes_remote() {
        let resolved = resolve(conflict(
            "marks",
            "score",
            json!(14),
            json!(16),
            ResolutionPolicy::TimestampWins,
        ));
        assert_eq!(resolved.resolved_value, Some(json!(16)));
    }

    #[test]
    fn attendance_keeps_site_value() {
        let resolved = resolve(conflict(
            "student_absences",
            "reason",
            json!("sick"),
            json!("unjustified"),
            ResolutionPolicy::TimestampWins,
        ));
        assert_eq!(resolved.resolved_value, Some(json!("sick")));
    }

    #[test]
    fn payments_follow_central() {
        let resolved = resolve(conflict(
            "payment_transactions",
            "amount",
            json!(50_000),
            json!(45_000),
            ResolutionPolicy::TimestampWins,
        ));
        assert_eq!(resolved.resolved_value, Some(json!(45_000)));
    }

    #[test]
    fn user_status_prefers_most_restrictive() {
        let cases = [
            ("ACTIVE", "SUSPENDED", "SUSPENDED"),
            ("SUSPENDED", "ACTIVE", "SUSPENDED"),
            ("INACTIVE", "ACTIVE", "INACTIVE"),
            ("ACTIVE", "INACTIVE", "INACTIVE"),
            ("active", "ACTIVE", "ACTIVE"),
        ];
        for (local, remote, expected) in cases {
            let resolved = resolve(conflict(
                "users",
                "status",
                json!(local),
                json!(remote),
                ResolutionPolicy::TimestampWins,
            ));
            assert_eq!(
                resolved.resolved_value,
                Some(json!(expected)),
                "{local} vs {remote}"
            );
        }
    }

    #[test]
    fn user_contact_fields_take_latest_edit() {
        let older = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
        let resolved = resolve(
            conflict(
                "users",
                "email",
                json!("new@school.cm"),
                json!("old@school.cm"),
                ResolutionPolicy::TimestampWins,
            )
            .with_timestamps(Some(newer), Some(older)),
        );
        assert_eq!(resolved.resolved_value, Some(json!("new@school.cm")));
        assert_eq!(business_rule("users", "name"), BusinessRule::Remote);
    }

    #[test]
    fn merge_unions_objects_with_remote_priority() {
        let resolved = resolve(conflict(
            "announcements",
            "metadata",
            json!({"audience": "parents", "pinned": true}),
            json!({"audience": "all", "lang": "fr"}),
            ResolutionPolicy::Merge,
        ));
        assert_eq!(
            resolved.resolved_value,
            Some(json!({"audience": "all", "pinned": true, "lang": "fr"}))
        );
    }

    #[test]
    fn merge_reads_objects_stored_as_text() {
        let resolved = resolve(conflict(
            "announcements",
            "metadata",
            json!(r#"{"audience":"parents","pinned":true}"#),
            json!({"audience": "all", "lang": "fr"}),
            ResolutionPolicy::Merge,
        ));
        let text = resolved.resolved_value.as_ref().and_then(Value::as_str).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!({"audience": "all", "pinned": true, "lang": "fr"})
        );
    }

    #[test]
    fn merge_of_scalars_falls_back_to_remote() {
        let resolved = resolve(conflict(
            "announcements",
            "title",
            json!("A"),
            json!("B"),
            ResolutionPolicy::Merge,
        ));
        assert_eq!(resolved.resolved_value, Some(json!("B")));
    }

    #[test]
    fn manual_is_flagged_without_value() {
        let resolved = resolve(conflict(
            "marks",
            "score",
            json!(14),
            json!(16),
            ResolutionPolicy::Manual,
        ));
        assert_eq!(resolved.resolved_value, None);
        assert!(resolved.requires_review);
        assert!(!resolved.is_resolved());
    }

    #[test]
    fn resolution_is_deterministic() {
        let input = conflict(
            "users",
            "status",
            json!("INACTIVE"),
            json!("ACTIVE"),
            ResolutionPolicy::TimestampWins,
        );
        let first = resolve(input.clone());
        let second = resolve(input);
        assert_eq!(first, second);
    }
}
