//! Query Result - Bounded result returned to the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a guarded execution, capped at the caller's row limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in projection order.
    pub columns: Vec<String>,

    /// Rows as JSON objects keyed by column name.
    pub rows: Vec<HashMap<String, serde_json::Value>>,

    /// Number of rows returned (after capping).
    pub row_count: usize,

    /// True when the underlying result exceeded the row limit.
    pub truncated: bool,

    /// Execution time in milliseconds, pipeline included.
    pub execution_time_ms: u64,

    /// Database that served the request.
    pub database: String,

    /// Non-fatal issues: cost warnings, wildcard narrowing, decode fallbacks.
    pub warnings: Vec<String>,
}
