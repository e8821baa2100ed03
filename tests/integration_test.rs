//! End-to-end pipeline tests against a mock connection source.

use anyhow::Result;
use async_trait::async_trait;
use queryguard::audit::{AuditLogger, MemorySink};
use queryguard::catalog::StaticCatalog;
use queryguard::execution::engine::{DbConnection, RowSet};
use queryguard::{
    AccessPolicyConfig, ConnectionSource, QueryError, QueryExecutorManager, RequestContext,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Connection source serving canned plans and rows; statements referencing
/// the `broken` table fail at execution time.
struct FixtureSource;

#[async_trait]
impl ConnectionSource for FixtureSource {
    async fn acquire(&self) -> queryguard::Result<Box<dyn DbConnection>> {
        Ok(Box::new(FixtureConnection))
    }
}

struct FixtureConnection;

#[async_trait]
impl DbConnection for FixtureConnection {
    async fn explain_json(&mut self, _sql: &str) -> queryguard::Result<Value> {
        Ok(json!([{
            "Plan": {
                "Node Type": "Index Scan",
                "Relation Name": "users",
                "Plan Rows": 3,
                "Total Cost": 4.2
            }
        }]))
    }

    async fn fetch_rows(&mut self, sql: &str, max_rows: usize) -> queryguard::Result<RowSet> {
        if sql.contains("broken") {
            return Err(QueryError::Execution(
                "relation \"broken\" does not exist".to_string(),
            ));
        }
        let mut rows = Vec::new();
        for id in 0..3i64.min(max_rows as i64) {
            let mut row = HashMap::new();
            row.insert("id".to_string(), json!(id));
            row.insert("name".to_string(), json!(format!("user-{}", id)));
            rows.push(row);
        }
        Ok(RowSet {
            columns: vec!["id".to_string(), "name".to_string()],
            rows,
            warnings: Vec::new(),
        })
    }
}

fn fixture_catalog() -> Arc<StaticCatalog> {
    Arc::new(
        StaticCatalog::new()
            .with_table(
                "users",
                vec!["id".to_string(), "name".to_string(), "password".to_string()],
                1_000,
            )
            .with_table("broken", vec!["id".to_string()], 10)
            .with_table("secrets", vec!["id".to_string(), "data".to_string()], 10),
    )
}

fn build_manager() -> Result<(
    QueryExecutorManager,
    Arc<AuditLogger>,
    Arc<Mutex<Vec<String>>>,
)> {
    let sink = MemorySink::new();
    let lines = sink.lines();
    let audit = Arc::new(AuditLogger::new(vec![Box::new(sink)]));

    let mut config = AccessPolicyConfig::default();
    config.tables.denied.insert("secrets".to_string());

    let mut manager = QueryExecutorManager::new(audit.clone());
    manager.register(
        "maindb",
        config,
        Arc::new(FixtureSource),
        fixture_catalog(),
    )?;
    Ok((manager, audit, lines))
}

#[tokio::test]
async fn full_pipeline_returns_bounded_result() -> Result<()> {
    init_tracing();
    let (manager, audit, lines) = build_manager()?;
    let executor = manager.resolve(None)?;

    let ctx = RequestContext::new()
        .with_session("session-1")
        .with_question("how many users are there?");
    let result = executor.execute("SELECT id, name FROM users", 2, &ctx).await?;

    assert_eq!(result.columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(result.row_count, 2);
    assert!(result.truncated);

    audit.flush();
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"question\":\"how many users are there?\""));
    Ok(())
}

#[tokio::test]
async fn hundred_concurrent_requests_emit_exactly_one_event_each() -> Result<()> {
    init_tracing();
    let (manager, audit, lines) = build_manager()?;
    let executor = manager.resolve(Some("maindb"))?;

    let mut handles = Vec::new();
    for i in 0..100usize {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let sql = match i % 3 {
                0 => "SELECT id FROM users",
                1 => "SELECT id FROM secrets",
                _ => "SELECT id FROM broken",
            };
            let outcome = executor
                .execute(sql, 10, &RequestContext::new())
                .await;
            (i % 3, outcome.is_ok())
        }));
    }

    let mut ok = 0usize;
    let mut denied = 0usize;
    let mut errored = 0usize;
    for handle in handles {
        let (kind, succeeded) = handle.await?;
        match (kind, succeeded) {
            (0, true) => ok += 1,
            (1, false) => denied += 1,
            (2, false) => errored += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(ok, 34);
    assert_eq!(denied, 33);
    assert_eq!(errored, 33);

    audit.flush();
    drop(manager);
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 100, "exactly one audit event per request");
    let successes = lines
        .iter()
        .filter(|line| line.contains("\"status\":\"success\""))
        .count();
    let denials = lines
        .iter()
        .filter(|line| line.contains("\"status\":\"denied\""))
        .count();
    let errors = lines
        .iter()
        .filter(|line| line.contains("\"status\":\"error\""))
        .count();
    assert_eq!(successes, 34);
    assert_eq!(denials, 33);
    assert_eq!(errors, 33);
    Ok(())
}

#[tokio::test]
async fn resolve_rejects_unknown_and_ambiguous() -> Result<()> {
    let (mut manager, _audit, _lines) = build_manager()?;

    let err = manager.resolve(Some("nope")).unwrap_err();
    assert!(matches!(err, QueryError::UnknownDatabase { .. }));

    manager.register(
        "reporting",
        AccessPolicyConfig::default(),
        Arc::new(FixtureSource),
        fixture_catalog(),
    )?;
    let err = manager.resolve(None).unwrap_err();
    match err {
        QueryError::AmbiguousDatabase { available } => {
            assert!(available.contains("maindb"));
            assert!(available.contains("reporting"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}
