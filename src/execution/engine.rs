//! Connection Boundary - Traits the executor uses to talk to a database.
//!
//! The connection pool itself is owned by the embedding service; this crate
//! only sees a source it can acquire request-scoped connections from. A
//! connection is held for exactly one pipeline stage (EXPLAIN or execution)
//! and released on every exit path by dropping it.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Caller-supplied context for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    /// The original natural-language question, when the caller has one.
    pub question: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: None,
            client_ip: None,
            question: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Rows fetched from a connection, already converted to JSON values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub warnings: Vec<String>,
}

/// One live database connection, scoped to a single pipeline stage.
///
/// Dropping the connection returns it to the owning pool; both calls are
/// cancellable by dropping the future.
#[async_trait]
pub trait DbConnection: Send {
    /// Run a cost-estimation pass for the statement and return the raw
    /// `EXPLAIN (FORMAT JSON)` document. The statement itself is not executed.
    async fn explain_json(&mut self, sql: &str) -> Result<serde_json::Value>;

    /// Execute the statement, returning at most `max_rows` rows.
    async fn fetch_rows(&mut self, sql: &str, max_rows: usize) -> Result<RowSet>;
}

/// Source of request-scoped connections (the embedding service's pool).
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn DbConnection>>;

    /// Check that the backing database is reachable.
    async fn health_check(&self) -> Result<bool> {
        Ok(self.acquire().await.is_ok())
    }
}
