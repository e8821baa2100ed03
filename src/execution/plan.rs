//! EXPLAIN Plan Model
//!
//! Closed representation of a cost-estimation plan tree as produced by
//! `EXPLAIN (FORMAT JSON)`. The guard walks this tree; it is never mutated
//! after parsing.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of the estimated plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub node_type: String,
    pub relation: Option<String>,
    pub plan_rows: i64,
    pub total_cost: f64,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    /// Parse the root plan node out of `EXPLAIN (FORMAT JSON)` output, which
    /// is a one-element array wrapping a `Plan` object.
    pub fn from_postgres_json(value: &Value) -> Result<Self> {
        let plan = value
            .as_array()
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("Plan"))
            .ok_or_else(|| {
                QueryError::Execution("EXPLAIN output missing root Plan object".to_string())
            })?;
        Ok(Self::from_node(plan))
    }

    fn from_node(node: &Value) -> Self {
        let children = node
            .get("Plans")
            .and_then(Value::as_array)
            .map(|nodes| nodes.iter().map(Self::from_node).collect())
            .unwrap_or_default();

        Self {
            node_type: node
                .get("Node Type")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            relation: node
                .get("Relation Name")
                .and_then(Value::as_str)
                .map(str::to_string),
            plan_rows: node.get("Plan Rows").and_then(Value::as_i64).unwrap_or(0),
            total_cost: node
                .get("Total Cost")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            children,
        }
    }

    /// Every full-scan node in the tree with its estimated row count.
    pub fn seq_scans(&self) -> Vec<(String, i64)> {
        let mut scans = Vec::new();
        self.collect_seq_scans(&mut scans);
        scans
    }

    fn collect_seq_scans(&self, scans: &mut Vec<(String, i64)>) {
        if self.node_type == "Seq Scan" {
            if let Some(relation) = &self.relation {
                scans.push((relation.clone(), self.plan_rows));
            }
        }
        for child in &self.children {
            child.collect_seq_scans(scans);
        }
    }
}

/// Summary of one estimated plan, computed once per distinct statement text
/// and cached by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainResult {
    pub total_cost: f64,
    pub estimated_rows: i64,
    pub has_seq_scan: bool,
    pub seq_scan_tables: Vec<(String, i64)>,
}

impl ExplainResult {
    pub fn from_plan(root: &PlanNode) -> Self {
        let seq_scan_tables = root.seq_scans();
        Self {
            total_cost: root.total_cost,
            estimated_rows: root.plan_rows,
            has_seq_scan: !seq_scan_tables.is_empty(),
            seq_scan_tables,
        }
    }
}
