//! Schema Catalog
//!
//! Supplies the full column list of a table (for wildcard expansion) and a
//! periodically refreshed row-count estimate per table (for the cost guard's
//! large-table threshold). Row estimates are served from an in-memory
//! snapshot so the hot path never waits on the database for them.

use crate::error::{QueryError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Full column list of `table`, in catalog order.
    async fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Estimated row count from the most recent refresh, if known.
    /// Synchronous on purpose: the cost guard must not issue an extra query
    /// per check.
    fn row_estimate(&self, table: &str) -> Option<i64>;
}

/// Fixed in-memory catalog for tests and embedders with static schemas.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    columns: HashMap<String, Vec<String>>,
    row_estimates: HashMap<String, i64>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        table: impl Into<String>,
        columns: Vec<String>,
        row_estimate: i64,
    ) -> Self {
        let table = table.into().to_lowercase();
        self.columns.insert(table.clone(), columns);
        self.row_estimates.insert(table, row_estimate);
        self
    }
}

#[async_trait]
impl SchemaCatalog for StaticCatalog {
    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        self.columns
            .get(&table.to_lowercase())
            .cloned()
            .ok_or_else(|| QueryError::Catalog(format!("unknown table '{}'", table)))
    }

    fn row_estimate(&self, table: &str) -> Option<i64> {
        self.row_estimates.get(&table.to_lowercase()).copied()
    }
}

/// PostgreSQL-backed catalog. `refresh()` is expected to run out of band
/// (startup plus a periodic task owned by the embedding service); lookups in
/// between are served from the snapshot maps.
pub struct PgCatalog {
    pool: PgPool,
    schemas: Vec<String>,
    columns: DashMap<String, Vec<String>>,
    row_estimates: DashMap<String, i64>,
}

impl PgCatalog {
    pub fn new(pool: PgPool, schemas: Vec<String>) -> Self {
        Self {
            pool,
            schemas,
            columns: DashMap::new(),
            row_estimates: DashMap::new(),
        }
    }

    /// Reload column lists and row estimates for the configured schemas.
    pub async fn refresh(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT table_name, column_name \
             FROM information_schema.columns \
             WHERE table_schema = ANY($1) \
             ORDER BY table_name, ordinal_position",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueryError::Catalog(format!("column refresh failed: {}", e)))?;

        let mut columns: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| QueryError::Catalog(e.to_string()))?;
            let column: String = row
                .try_get("column_name")
                .map_err(|e| QueryError::Catalog(e.to_string()))?;
            columns.entry(table.to_lowercase()).or_default().push(column);
        }
        for (table, cols) in columns {
            self.columns.insert(table, cols);
        }

        let rows = sqlx::query(
            "SELECT c.relname, c.reltuples::bigint AS reltuples \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.relkind = 'r' AND n.nspname = ANY($1)",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueryError::Catalog(format!("row-estimate refresh failed: {}", e)))?;

        for row in &rows {
            let table: String = row
                .try_get("relname")
                .map_err(|e| QueryError::Catalog(e.to_string()))?;
            let estimate: i64 = row
                .try_get("reltuples")
                .map_err(|e| QueryError::Catalog(e.to_string()))?;
            self.row_estimates.insert(table.to_lowercase(), estimate);
        }

        info!(
            "catalog refreshed: {} tables, {} row estimates",
            self.columns.len(),
            self.row_estimates.len()
        );
        Ok(())
    }
}

#[async_trait]
impl SchemaCatalog for PgCatalog {
    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let key = table.to_lowercase();
        if let Some(columns) = self.columns.get(&key) {
            return Ok(columns.clone());
        }

        // Miss: the table appeared after the last refresh. Fetch it directly
        // and remember the answer.
        debug!("catalog miss for '{}', querying information_schema", key);
        let rows = sqlx::query(
            "SELECT column_name \
             FROM information_schema.columns \
             WHERE table_schema = ANY($1) AND lower(table_name) = $2 \
             ORDER BY ordinal_position",
        )
        .bind(&self.schemas)
        .bind(&key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueryError::Catalog(format!("column lookup failed: {}", e)))?;

        if rows.is_empty() {
            return Err(QueryError::Catalog(format!("unknown table '{}'", table)));
        }
        let columns: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("column_name"))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| QueryError::Catalog(e.to_string()))?;
        self.columns.insert(key, columns.clone());
        Ok(columns)
    }

    fn row_estimate(&self, table: &str) -> Option<i64> {
        self.row_estimates
            .get(&table.to_lowercase())
            .map(|estimate| *estimate)
    }
}
