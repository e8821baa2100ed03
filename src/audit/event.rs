//! Audit Event Model
//!
//! One immutable record per executed request, success or failure. Events are
//! created exactly once, handed to the logger, and never updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Denied,
    Error,
    Cancelled,
}

/// Outcome of one policy or guard check, recorded for offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCheckOutcome {
    pub check: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Immutable audit record for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub sql: String,
    pub sql_hash: String,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<u64>,
    pub duration_ms: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub policy_check_outcomes: Vec<PolicyCheckOutcome>,
}

impl AuditEvent {
    pub fn new(database: impl Into<String>, request_id: impl Into<String>, sql: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: "query_execution".to_string(),
            request_id: request_id.into(),
            session_id: None,
            database: database.into(),
            client_ip: None,
            question: None,
            sql: sql.to_string(),
            sql_hash: format!("{:016x}", crate::sql_structure::fingerprint(sql)),
            status: AuditStatus::Error,
            rows_returned: None,
            duration_ms: 0,
            truncated: false,
            error_code: None,
            error_message: None,
            policy_check_outcomes: Vec::new(),
        }
    }

    pub fn with_success(mut self, rows_returned: u64, truncated: bool) -> Self {
        self.status = AuditStatus::Success;
        self.rows_returned = Some(rows_returned);
        self.truncated = truncated;
        self
    }

    pub fn with_failure(mut self, status: AuditStatus, code: &str, message: String) -> Self {
        self.status = status;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
