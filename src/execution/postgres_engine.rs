//! PostgreSQL Engine - Connection source backed by a sqlx pool.
//!
//! Connections are acquired per pipeline stage and returned to the pool on
//! drop, which also makes both round trips cancellable by dropping the
//! future.

use crate::error::{QueryError, Result};
use crate::execution::engine::{ConnectionSource, DbConnection, RowSet};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row, TypeInfo};
use std::collections::HashMap;
use std::time::Duration;

/// Connection source over a shared PostgreSQL pool.
pub struct PostgresSource {
    pool: PgPool,
}

impl PostgresSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool and verify it with a probe query.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| QueryError::Execution(format!("failed to connect: {}", e)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| QueryError::Execution(format!("connection probe failed: {}", e)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionSource for PostgresSource {
    async fn acquire(&self) -> Result<Box<dyn DbConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| QueryError::Execution(format!("failed to acquire connection: {}", e)))?;
        Ok(Box::new(PostgresConnection { conn }))
    }
}

struct PostgresConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl DbConnection for PostgresConnection {
    async fn explain_json(&mut self, sql: &str) -> Result<Value> {
        let explain_sql = format!("EXPLAIN (FORMAT JSON) {}", sql.trim_end_matches(';'));
        let row = sqlx::query(&explain_sql)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| QueryError::Execution(format!("EXPLAIN failed: {}", e)))?;
        row.try_get::<Value, _>(0)
            .map_err(|e| QueryError::Execution(format!("EXPLAIN output unreadable: {}", e)))
    }

    async fn fetch_rows(&mut self, sql: &str, max_rows: usize) -> Result<RowSet> {
        // Bound the result on the server side rather than streaming and
        // cutting off client-side.
        let bounded_sql = format!(
            "SELECT * FROM ({}) AS bounded_result LIMIT {}",
            sql.trim_end_matches(';'),
            max_rows
        );
        let rows = sqlx::query(&bounded_sql)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| QueryError::Execution(e.to_string()))?;

        let mut result = RowSet::default();
        if let Some(first) = rows.first() {
            result.columns = first
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect();
        }
        for row in &rows {
            let mut object = HashMap::new();
            for (index, column) in row.columns().iter().enumerate() {
                let value = pg_value_to_json(row, index, &mut result.warnings);
                object.insert(column.name().to_string(), value);
            }
            result.rows.push(object);
        }
        Ok(result)
    }
}

/// Convert a single column value to JSON based on its declared type, with a
/// best-effort fallback for types outside the supported set.
fn pg_value_to_json(row: &PgRow, index: usize, warnings: &mut Vec<String>) -> Value {
    let column = &row.columns()[index];
    let type_name = column.type_info().name();

    match type_name {
        "INT2" => opt_json(row.try_get::<Option<i16>, _>(index).ok().flatten()),
        "INT4" => opt_json(row.try_get::<Option<i32>, _>(index).ok().flatten()),
        "INT8" => opt_json(row.try_get::<Option<i64>, _>(index).ok().flatten()),
        "FLOAT4" => opt_json(row.try_get::<Option<f32>, _>(index).ok().flatten()),
        "FLOAT8" => opt_json(row.try_get::<Option<f64>, _>(index).ok().flatten()),
        "BOOL" => opt_json(row.try_get::<Option<bool>, _>(index).ok().flatten()),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            opt_json(row.try_get::<Option<String>, _>(index).ok().flatten())
        }
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "UUID" => opt_json(
            row.try_get::<Option<uuid::Uuid>, _>(index)
                .ok()
                .flatten()
                .map(|value| value.to_string()),
        ),
        "TIMESTAMPTZ" => opt_json(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|value| value.to_rfc3339()),
        ),
        "TIMESTAMP" => opt_json(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten()
                .map(|value| value.to_string()),
        ),
        "DATE" => opt_json(
            row.try_get::<Option<chrono::NaiveDate>, _>(index)
                .ok()
                .flatten()
                .map(|value| value.to_string()),
        ),
        "TIME" => opt_json(
            row.try_get::<Option<chrono::NaiveTime>, _>(index)
                .ok()
                .flatten()
                .map(|value| value.to_string()),
        ),
        other => {
            // Unknown type: try the common decodings before giving up.
            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(index) {
                return Value::String(value);
            }
            if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(index) {
                return serde_json::json!(value);
            }
            if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(index) {
                return serde_json::json!(value);
            }
            let warning = format!(
                "column '{}' of type {} not representable, returned null",
                column.name(),
                other
            );
            if !warnings.contains(&warning) {
                warnings.push(warning);
            }
            Value::Null
        }
    }
}

fn opt_json<T: serde::Serialize>(value: Option<T>) -> Value {
    value
        .map(|value| serde_json::json!(value))
        .unwrap_or(Value::Null)
}
