//! Per-table and per-field resolution policy selection

use std::collections::HashMap;

use crate::models::ResolutionPolicy;

/// Maps `table.field`, then `table`, to a policy, else the default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyBook {
    default: ResolutionPolicy,
    tables: HashMap<String, ResolutionPolicy>,
    fields: HashMap<(String, String), ResolutionPolicy>,
}

impl PolicyBook {
    /// Empty book with the given fallback policy
    pub fn new(default: ResolutionPolicy) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    /// Override the policy for every field of a table
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>, policy: ResolutionPolicy) -> Self {
        self.tables.insert(table.into(), policy);
        self
    }

    /// Override the policy for a single field
    #[must_use]
    pub fn with_field(
        mut self,
        table: impl Into<String>,
        field: impl Into<String>,
        policy: ResolutionPolicy,
    ) -> Self {
        self.fields.insert((table.into(), field.into()), policy);
        self
    }

    /// Policy for a field, most specific override first
    pub fn policy_for(&self, table: &str, field: &str) -> ResolutionPolicy {
        self.fields
            .get(&(table.to_string(), field.to_string()))
            .or_else(|| self.tables.get(table))
            .copied()
            .unwrap_or(self.default)
    }

    /// Apply overrides written as `table=POLICY,table.field=POLICY`
    pub fn with_overrides(mut self, overrides: &str) -> Result<Self, String> {
        for entry in overrides.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (target, policy) = entry
                .split_once('=')
                .ok_or_else(|| format!("policy override '{entry}' must look like table=POLICY"))?;
            let policy: ResolutionPolicy = policy.parse()?;
            match target.trim().split_once('.') {
                Some((table, field)) if !table.is_empty() && !field.is_empty() => {
                    self = self.with_field(table, field, policy);
                }
                None if !target.trim().is_empty() => {
                    self = self.with_table(target.trim(), policy);
                }
                _ => return Err(format!("policy override '{entry}' has an empty target")),
            }
        }
        Ok(self)
    }
}
