//! Access Control
//!
//! Evaluates a statement's structural summary against the per-database access
//! policy. Evaluation is a pure function of the summary and the immutable
//! policy - no I/O, no suspension - and accumulates every violation instead of
//! stopping at the first one, so a single pass reports everything that is
//! wrong with a statement.

use crate::error::Result;
use crate::security::policy::{AccessPolicyConfig, WildcardPolicy};
use crate::sql_structure::SqlStructure;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Which check produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Schema,
    Table,
    Column,
}

/// A single policy violation. Violations are accumulated, never
/// short-circuited, so diagnostics can name every offending resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub check_type: CheckType,
    pub resource: String,
    pub reason: String,
}

/// Outcome of a full policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyValidationResult {
    pub passed: bool,
    pub violations: Vec<PolicyViolation>,
    pub warnings: Vec<String>,
}

impl PolicyValidationResult {
    fn passing() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Offending resources for a given check, in reporting order.
    pub fn resources(&self, check: CheckType) -> Vec<String> {
        let mut resources: Vec<String> = self
            .violations
            .iter()
            .filter(|violation| violation.check_type == check)
            .map(|violation| violation.resource.clone())
            .collect();
        resources.sort();
        resources.dedup();
        resources
    }
}

/// Access controller for one database.
///
/// Holds the immutable policy plus the denied-column globs compiled once at
/// construction. Safe for concurrent use: evaluation borrows immutably.
pub struct AccessController {
    allowed_schemas: HashSet<String>,
    allowed_tables: HashSet<String>,
    denied_tables: HashSet<String>,
    denied_columns: HashSet<String>,
    denied_patterns: Vec<glob::Pattern>,
    wildcard_policy: WildcardPolicy,
}

impl AccessController {
    /// Build a controller from a validated policy. Fails on configuration the
    /// policy-level `validate` would also reject.
    pub fn new(config: &AccessPolicyConfig) -> Result<Self> {
        config.validate()?;

        let denied_patterns = config
            .columns
            .denied_patterns
            .iter()
            .map(|pattern| glob::Pattern::new(&pattern.to_lowercase()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| crate::error::QueryError::Config(format!("bad pattern: {}", e)))?;

        Ok(Self {
            allowed_schemas: lowered(&config.allowed_schemas),
            allowed_tables: lowered(&config.tables.allowed),
            denied_tables: lowered(&config.tables.denied),
            denied_columns: lowered(&config.columns.denied),
            denied_patterns,
            wildcard_policy: config.columns.wildcard_policy,
        })
    }

    pub fn wildcard_policy(&self) -> WildcardPolicy {
        self.wildcard_policy
    }

    /// Evaluate a statement summary against the policy.
    ///
    /// `wildcard_columns` supplies the full column list of every wildcard
    /// table, looked up from the schema catalog by the caller - evaluation
    /// itself never touches the database.
    pub fn validate(
        &self,
        structure: &SqlStructure,
        wildcard_columns: &HashMap<String, Vec<String>>,
    ) -> PolicyValidationResult {
        let mut result = PolicyValidationResult::passing();

        // A statement whose structure could not be determined is denied by
        // default rather than waved through unchecked.
        if !structure.diagnostics.is_empty() && structure.tables.is_empty() {
            result.violations.push(PolicyViolation {
                check_type: CheckType::Table,
                resource: "<statement>".to_string(),
                reason: format!(
                    "statement structure could not be determined: {}",
                    structure.diagnostics.join("; ")
                ),
            });
            result.passed = false;
            return result;
        }

        for schema in &structure.schemas {
            if !self.allowed_schemas.contains(&schema.to_lowercase()) {
                result.violations.push(PolicyViolation {
                    check_type: CheckType::Schema,
                    resource: schema.clone(),
                    reason: "Schema not in allowed list".to_string(),
                });
            }
        }

        for table in &structure.tables {
            let table = table.to_lowercase();
            if !self.allowed_tables.is_empty() {
                // Whitelist mode: anything not listed is denied, regardless
                // of the deny list.
                if !self.allowed_tables.contains(&table) {
                    result.violations.push(PolicyViolation {
                        check_type: CheckType::Table,
                        resource: table,
                        reason: "Table not in allowed list".to_string(),
                    });
                }
            } else if self.denied_tables.contains(&table) {
                result.violations.push(PolicyViolation {
                    check_type: CheckType::Table,
                    resource: table,
                    reason: "Table in denied list".to_string(),
                });
            }
        }

        for (table, column) in &structure.columns {
            let qualified = format!("{}.{}", table.to_lowercase(), column.to_lowercase());
            if self.column_denied(&qualified) {
                result.violations.push(PolicyViolation {
                    check_type: CheckType::Column,
                    resource: qualified,
                    reason: "Column is denied by policy".to_string(),
                });
            }
        }

        if structure.has_wildcard_selection {
            for table in &structure.wildcard_tables {
                let table = table.to_lowercase();
                let Some(all_columns) = wildcard_columns.get(&table) else {
                    result.warnings.push(format!(
                        "no catalog column list for wildcard table '{}'",
                        table
                    ));
                    continue;
                };
                let sensitive: Vec<String> = all_columns
                    .iter()
                    .filter(|column| {
                        self.column_denied(&format!("{}.{}", table, column.to_lowercase()))
                    })
                    .cloned()
                    .collect();
                if sensitive.is_empty() {
                    continue;
                }
                match self.wildcard_policy {
                    WildcardPolicy::Reject => {
                        for column in sensitive {
                            result.violations.push(PolicyViolation {
                                check_type: CheckType::Column,
                                resource: format!("{}.{}", table, column.to_lowercase()),
                                reason: "Wildcard selection would expose denied column"
                                    .to_string(),
                            });
                        }
                    }
                    WildcardPolicy::ExpandSafe => {
                        // The executor substitutes safe_columns() into the
                        // statement; nothing to deny here.
                        result.warnings.push(format!(
                            "wildcard on '{}' narrowed to safe columns",
                            table
                        ));
                    }
                }
            }
        }

        result.passed = result.violations.is_empty();
        result
    }

    /// Columns of `table` that survive the column deny rules. Deterministic
    /// and order-preserving with respect to `all_columns`.
    pub fn safe_columns(&self, table: &str, all_columns: &[String]) -> Vec<String> {
        let table = table.to_lowercase();
        all_columns
            .iter()
            .filter(|column| !self.column_denied(&format!("{}.{}", table, column.to_lowercase())))
            .cloned()
            .collect()
    }

    fn column_denied(&self, qualified: &str) -> bool {
        if self.denied_columns.contains(qualified) {
            return true;
        }
        self.denied_patterns
            .iter()
            .any(|pattern| pattern.matches(qualified))
    }
}

fn lowered(set: &HashSet<String>) -> HashSet<String> {
    set.iter().map(|entry| entry.to_lowercase()).collect()
}
