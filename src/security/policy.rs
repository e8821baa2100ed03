//! Access Policy Definitions
//!
//! Per-database policy configuration: which schemas, tables and columns a
//! generated statement may read, and how expensive reading them may be.
//! Configuration is validated once at construction and immutable afterwards.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What to do when a statement references an explicitly denied column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedColumnAction {
    Reject,
    /// Would require rewriting the statement to drop the column. Rewriting of
    /// explicit projections is not implemented, so this downgrades to
    /// `Reject` with a construction-time warning.
    Filter,
}

/// How to treat `SELECT *` when the expansion would expose a denied column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardPolicy {
    Reject,
    ExpandSafe,
}

/// Table allow/deny lists. A non-empty allow list is a whitelist and fully
/// overrides the deny list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRules {
    #[serde(default)]
    pub allowed: HashSet<String>,
    #[serde(default)]
    pub denied: HashSet<String>,
}

/// Column deny rules. Entries are `table.column`; patterns are globs matched
/// against the same form, case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRules {
    #[serde(default)]
    pub denied: HashSet<String>,
    #[serde(default)]
    pub denied_patterns: Vec<String>,
    #[serde(default = "default_denied_action")]
    pub on_denied: DeniedColumnAction,
    #[serde(default = "default_wildcard_policy")]
    pub wildcard_policy: WildcardPolicy,
}

fn default_denied_action() -> DeniedColumnAction {
    DeniedColumnAction::Reject
}

fn default_wildcard_policy() -> WildcardPolicy {
    WildcardPolicy::Reject
}

impl Default for ColumnRules {
    fn default() -> Self {
        Self {
            denied: HashSet::new(),
            denied_patterns: Vec::new(),
            on_denied: DeniedColumnAction::Reject,
            wildcard_policy: WildcardPolicy::Reject,
        }
    }
}

/// Cost-estimation guard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainPolicy {
    pub enabled: bool,
    pub max_estimated_rows: i64,
    pub max_estimated_cost: f64,
    pub deny_seq_scan_on_large_tables: bool,
    pub large_table_row_threshold: i64,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for ExplainPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_estimated_rows: 1_000_000,
            max_estimated_cost: 1_000_000.0,
            deny_seq_scan_on_large_tables: true,
            large_table_row_threshold: 10_000_000, // 10M rows
            timeout_ms: 2_000,
            cache_ttl_secs: 300,
            cache_capacity: 1_024,
        }
    }
}

/// Per-database access policy, immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicyConfig {
    /// Schema attributed to tables that are not explicitly qualified.
    #[serde(default = "default_schema")]
    pub default_schema: String,
    #[serde(default = "default_allowed_schemas")]
    pub allowed_schemas: HashSet<String>,
    #[serde(default)]
    pub tables: TableRules,
    #[serde(default)]
    pub columns: ColumnRules,
    #[serde(default)]
    pub explain: ExplainPolicy,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_allowed_schemas() -> HashSet<String> {
    let mut schemas = HashSet::new();
    schemas.insert("public".to_string());
    schemas
}

impl Default for AccessPolicyConfig {
    fn default() -> Self {
        Self {
            default_schema: default_schema(),
            allowed_schemas: default_allowed_schemas(),
            tables: TableRules::default(),
            columns: ColumnRules::default(),
            explain: ExplainPolicy::default(),
        }
    }
}

impl AccessPolicyConfig {
    /// Validate construction invariants. Conflicting configuration is fatal
    /// here, never at request time. Returns non-fatal warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let overlap: Vec<&String> = self
            .tables
            .allowed
            .iter()
            .filter(|table| self.tables.denied.contains(*table))
            .collect();
        if !overlap.is_empty() {
            return Err(QueryError::Config(format!(
                "tables appear in both allowed and denied lists: {:?}",
                overlap
            )));
        }

        for entry in &self.columns.denied {
            if entry.matches('.').count() != 1 {
                return Err(QueryError::Config(format!(
                    "denied column '{}' must be of the form table.column",
                    entry
                )));
            }
        }

        for pattern in &self.columns.denied_patterns {
            if glob::Pattern::new(pattern).is_err() {
                return Err(QueryError::Config(format!(
                    "invalid denied-column pattern '{}'",
                    pattern
                )));
            }
        }

        if self.allowed_schemas.is_empty() {
            return Err(QueryError::Config(
                "allowed_schemas must not be empty".to_string(),
            ));
        }

        if self.columns.on_denied == DeniedColumnAction::Filter {
            warnings.push(
                "on_denied=filter requires statement rewriting which is not implemented; \
                 denied columns will be rejected instead"
                    .to_string(),
            );
        }

        if self.explain.enabled && self.explain.max_estimated_rows <= 0 {
            return Err(QueryError::Config(
                "max_estimated_rows must be positive when the explain guard is enabled"
                    .to_string(),
            ));
        }

        Ok(warnings)
    }
}
