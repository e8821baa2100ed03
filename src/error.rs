use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Access to schema denied: {schemas}")]
    SchemaAccessDenied { schemas: String },

    #[error("Access to table denied: {tables}")]
    TableAccessDenied { tables: String },

    #[error("Access to column denied: {columns}")]
    ColumnAccessDenied { columns: String },

    #[error("Query too expensive: estimated {estimated_rows} rows exceeds limit of {limit}")]
    QueryTooExpensive { estimated_rows: i64, limit: i64 },

    #[error("Sequential scan denied on large table '{table}' (~{rows} rows, threshold {threshold})")]
    SeqScanDenied {
        table: String,
        rows: i64,
        threshold: i64,
    },

    #[error("Unknown database '{name}'. Available databases: {available}")]
    UnknownDatabase { name: String, available: String },

    #[error("No database specified and multiple are registered - specify one of: {available}")]
    AmbiguousDatabase { available: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    /// Stable machine-readable code, recorded in the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Config(_) => "configuration_error",
            QueryError::SchemaAccessDenied { .. } => "schema_access_denied",
            QueryError::TableAccessDenied { .. } => "table_access_denied",
            QueryError::ColumnAccessDenied { .. } => "column_access_denied",
            QueryError::QueryTooExpensive { .. } => "query_too_expensive",
            QueryError::SeqScanDenied { .. } => "seq_scan_denied",
            QueryError::UnknownDatabase { .. } => "unknown_database",
            QueryError::AmbiguousDatabase { .. } => "ambiguous_database",
            QueryError::Execution(_) => "execution_error",
            QueryError::Cancelled(_) => "cancelled",
            QueryError::Catalog(_) => "catalog_error",
            QueryError::Io(_) => "io_error",
            QueryError::Json(_) => "json_error",
        }
    }

    /// Whether this error is a policy or resource-guard denial rather than a
    /// failure of the execution machinery itself.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            QueryError::SchemaAccessDenied { .. }
                | QueryError::TableAccessDenied { .. }
                | QueryError::ColumnAccessDenied { .. }
                | QueryError::QueryTooExpensive { .. }
                | QueryError::SeqScanDenied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
