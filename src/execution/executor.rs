//! Query Executor - Per-database pipeline orchestrator.
//!
//! Runs structural parse -> access policy -> cost guard -> execution for one
//! request and emits exactly one audit event whatever the outcome. The
//! executor is safe for concurrent use: policy evaluation is pure, the
//! EXPLAIN cache is a concurrent map, and connections are acquired per stage
//! and released on every exit path.

use crate::audit::{AuditEvent, AuditLogger, AuditStatus, PolicyCheckOutcome};
use crate::catalog::SchemaCatalog;
use crate::error::{QueryError, Result};
use crate::execution::engine::{ConnectionSource, RequestContext, RowSet};
use crate::execution::result::QueryResult;
use crate::security::access_control::{AccessController, CheckType};
use crate::security::policy::{AccessPolicyConfig, WildcardPolicy};
use crate::security::query_guards::CostGuard;
use crate::sql_structure::{self, SqlStructure};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct PipelineOutput {
    rowset: RowSet,
    truncated: bool,
}

/// Guarded executor for one configured database.
pub struct QueryExecutor {
    database: String,
    default_schema: String,
    wildcard_policy: WildcardPolicy,
    explain_enabled: bool,
    controller: AccessController,
    guard: CostGuard,
    source: Arc<dyn ConnectionSource>,
    catalog: Arc<dyn SchemaCatalog>,
    audit: Arc<AuditLogger>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("database", &self.database)
            .field("default_schema", &self.default_schema)
            .field("wildcard_policy", &self.wildcard_policy)
            .field("explain_enabled", &self.explain_enabled)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    /// Build an executor. Conflicting policy configuration fails here, at
    /// startup, never at request time.
    pub fn new(
        database: impl Into<String>,
        config: AccessPolicyConfig,
        source: Arc<dyn ConnectionSource>,
        catalog: Arc<dyn SchemaCatalog>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self> {
        let database = database.into();
        for warning in config.validate()? {
            warn!("policy for '{}': {}", database, warning);
        }
        let controller = AccessController::new(&config)?;
        let guard = CostGuard::new(config.explain.clone(), catalog.clone());

        Ok(Self {
            database,
            default_schema: config.default_schema.clone(),
            wildcard_policy: config.columns.wildcard_policy,
            explain_enabled: config.explain.enabled,
            controller,
            guard,
            source,
            catalog,
            audit,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Check that the backing database is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        self.source.health_check().await
    }

    /// Run the full guarded pipeline for one statement.
    pub async fn execute(
        &self,
        sql: &str,
        row_limit: usize,
        ctx: &RequestContext,
    ) -> Result<QueryResult> {
        self.execute_inner(sql, row_limit, ctx, None).await
    }

    /// Like `execute`, but the whole pipeline is bounded by `deadline`. A
    /// request that runs out of time is cancelled, audited as such, and the
    /// in-flight round trip is dropped (which releases its connection).
    pub async fn execute_with_deadline(
        &self,
        sql: &str,
        row_limit: usize,
        ctx: &RequestContext,
        deadline: Duration,
    ) -> Result<QueryResult> {
        self.execute_inner(sql, row_limit, ctx, Some(deadline)).await
    }

    async fn execute_inner(
        &self,
        sql: &str,
        row_limit: usize,
        ctx: &RequestContext,
        deadline: Option<Duration>,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let mut outcomes: Vec<PolicyCheckOutcome> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        let outcome = match deadline {
            None => {
                self.run_pipeline(sql, row_limit, &mut outcomes, &mut warnings)
                    .await
            }
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    self.run_pipeline(sql, row_limit, &mut outcomes, &mut warnings),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(QueryError::Cancelled(format!(
                        "deadline of {}ms exceeded",
                        deadline.as_millis()
                    ))),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut event = AuditEvent::new(&self.database, &ctx.request_id, sql);
        event.session_id = ctx.session_id.clone();
        event.client_ip = ctx.client_ip.clone();
        event.question = ctx.question.clone();
        event.policy_check_outcomes = std::mem::take(&mut outcomes);

        match outcome {
            Ok(output) => {
                let row_count = output.rowset.rows.len();
                event = event
                    .with_success(row_count as u64, output.truncated)
                    .with_duration(duration_ms);
                self.audit.log(event);
                info!(
                    "query on '{}' returned {} rows in {}ms (truncated: {})",
                    self.database, row_count, duration_ms, output.truncated
                );
                warnings.extend(output.rowset.warnings);
                Ok(QueryResult {
                    columns: output.rowset.columns,
                    rows: output.rowset.rows,
                    row_count,
                    truncated: output.truncated,
                    execution_time_ms: duration_ms,
                    database: self.database.clone(),
                    warnings,
                })
            }
            Err(e) => {
                let status = if e.is_denial() {
                    AuditStatus::Denied
                } else if matches!(e, QueryError::Cancelled(_)) {
                    AuditStatus::Cancelled
                } else {
                    AuditStatus::Error
                };
                event = event
                    .with_failure(status, e.code(), e.to_string())
                    .with_duration(duration_ms);
                self.audit.log(event);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        sql: &str,
        row_limit: usize,
        outcomes: &mut Vec<PolicyCheckOutcome>,
        warnings: &mut Vec<String>,
    ) -> Result<PipelineOutput> {
        // Stage 1: structural parse. Never fails; an unparseable statement is
        // denied by the policy stage.
        let structure = SqlStructure::from_sql(sql, &self.default_schema);
        outcomes.push(PolicyCheckOutcome {
            check: "structural_parse".to_string(),
            passed: structure.diagnostics.is_empty(),
            detail: (!structure.diagnostics.is_empty())
                .then(|| structure.diagnostics.join("; ")),
        });

        // Wildcard expansion needs the catalog's column lists before the pure
        // policy evaluation can see them.
        let (wildcard_columns, catalog_misses) =
            self.wildcard_columns(&structure).await;

        // Stage 2: access policy.
        let validation = self.controller.validate(&structure, &wildcard_columns);
        outcomes.push(PolicyCheckOutcome {
            check: "access_policy".to_string(),
            passed: validation.passed,
            detail: (!validation.violations.is_empty()).then(|| {
                validation
                    .violations
                    .iter()
                    .map(|violation| format!("{}: {}", violation.resource, violation.reason))
                    .join("; ")
            }),
        });
        warnings.extend(validation.warnings.clone());

        if !validation.passed {
            return Err(self.denial_error(&validation));
        }

        // The statement passed policy, but a wildcard table whose column list
        // the catalog could not supply cannot be proven safe.
        if !catalog_misses.is_empty() {
            return Err(QueryError::Catalog(format!(
                "no column list for wildcard table(s): {}",
                catalog_misses.iter().join(", ")
            )));
        }

        // Substitute safe column lists for wildcards where the policy asks
        // for narrowing instead of rejection.
        let executed_sql =
            self.narrow_wildcards(sql, &structure, &wildcard_columns, warnings)?;

        // Stage 3: cost guard. One connection, scoped to the EXPLAIN round
        // trip only.
        if self.explain_enabled {
            let mut conn = self.source.acquire().await?;
            let guard_validation = self.guard.validate(conn.as_mut(), &executed_sql).await;
            drop(conn);

            outcomes.push(PolicyCheckOutcome {
                check: "cost_guard".to_string(),
                passed: guard_validation.passed,
                detail: guard_validation
                    .explain
                    .as_ref()
                    .map(|explain| {
                        format!(
                            "estimated_rows={} total_cost={:.1} seq_scans={}",
                            explain.estimated_rows,
                            explain.total_cost,
                            explain.seq_scan_tables.len()
                        )
                    }),
            });
            warnings.extend(guard_validation.warnings.clone());

            if !guard_validation.passed {
                return Err(match guard_validation.denial {
                    Some(denial) => denial.into_error(),
                    None => QueryError::Execution(
                        "cost guard rejected the statement".to_string(),
                    ),
                });
            }
        }

        // Stage 4: execution. A fresh connection, scoped to the statement
        // round trip; one extra row detects truncation.
        let mut conn = self.source.acquire().await?;
        let mut rowset = conn.fetch_rows(&executed_sql, row_limit + 1).await?;
        drop(conn);

        let truncated = rowset.rows.len() > row_limit;
        if truncated {
            rowset.rows.truncate(row_limit);
        }
        debug!(
            "executed on '{}': {} rows, truncated={}",
            self.database,
            rowset.rows.len(),
            truncated
        );

        Ok(PipelineOutput { rowset, truncated })
    }

    /// Fetch catalog column lists for every wildcard table. Lookup failures
    /// are returned separately so policy violations still take precedence.
    async fn wildcard_columns(
        &self,
        structure: &SqlStructure,
    ) -> (HashMap<String, Vec<String>>, Vec<String>) {
        let mut columns = HashMap::new();
        let mut misses = Vec::new();
        if !structure.has_wildcard_selection {
            return (columns, misses);
        }
        for table in &structure.wildcard_tables {
            match self.catalog.table_columns(table).await {
                Ok(list) => {
                    columns.insert(table.to_lowercase(), list);
                }
                Err(e) => {
                    debug!("catalog lookup for '{}' failed: {}", table, e);
                    misses.push(table.clone());
                }
            }
        }
        (columns, misses)
    }

    fn narrow_wildcards(
        &self,
        sql: &str,
        structure: &SqlStructure,
        wildcard_columns: &HashMap<String, Vec<String>>,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        if !structure.has_wildcard_selection
            || self.wildcard_policy != WildcardPolicy::ExpandSafe
        {
            return Ok(sql.to_string());
        }

        let mut replacements = HashMap::new();
        let mut narrowed_any = false;
        let mut fully_denied = Vec::new();
        for (table, all_columns) in wildcard_columns {
            let safe = self.controller.safe_columns(table, all_columns);
            if safe.is_empty() {
                fully_denied.push(table.clone());
            }
            if safe.len() != all_columns.len() {
                narrowed_any = true;
            }
            replacements.insert(table.clone(), safe);
        }

        if !fully_denied.is_empty() {
            return Err(QueryError::ColumnAccessDenied {
                columns: format!(
                    "every column of {} is denied",
                    fully_denied.iter().join(", ")
                ),
            });
        }
        if !narrowed_any {
            return Ok(sql.to_string());
        }

        match sql_structure::rewrite_wildcard_projection(sql, &replacements) {
            Ok(rewritten) => {
                debug!("wildcard narrowed: {}", rewritten);
                warnings.push("wildcard selection narrowed to safe columns".to_string());
                Ok(rewritten)
            }
            Err(e) => {
                // Statement shape we cannot rewrite safely: reject instead of
                // running the wildcard as-is.
                warn!("wildcard narrowing failed, rejecting: {}", e);
                let sensitive: Vec<String> = wildcard_columns
                    .iter()
                    .flat_map(|(table, all_columns)| {
                        let safe = self.controller.safe_columns(table, all_columns);
                        all_columns
                            .iter()
                            .filter(|column| !safe.contains(column))
                            .map(|column| format!("{}.{}", table, column))
                            .collect::<Vec<_>>()
                    })
                    .sorted()
                    .collect();
                Err(QueryError::ColumnAccessDenied {
                    columns: sensitive.join(", "),
                })
            }
        }
    }

    fn denial_error(&self, validation: &crate::security::PolicyValidationResult) -> QueryError {
        let schemas = validation.resources(CheckType::Schema);
        if !schemas.is_empty() {
            return QueryError::SchemaAccessDenied {
                schemas: schemas.iter().join(", "),
            };
        }
        let tables = validation.resources(CheckType::Table);
        if !tables.is_empty() {
            return QueryError::TableAccessDenied {
                tables: tables.iter().join(", "),
            };
        }
        let columns = validation.resources(CheckType::Column);
        QueryError::ColumnAccessDenied {
            columns: columns.iter().join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::catalog::StaticCatalog;
    use crate::execution::engine::DbConnection;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockSource {
        plan: Value,
        rows: Vec<HashMap<String, Value>>,
        columns: Vec<String>,
        fail_execution: bool,
        explain_calls: Arc<AtomicUsize>,
        fetch_calls: Arc<AtomicUsize>,
        last_sql: Arc<Mutex<Option<String>>>,
    }

    impl MockSource {
        fn with_rows(columns: Vec<&str>, rows: Vec<HashMap<String, Value>>) -> Self {
            Self {
                plan: json!([{
                    "Plan": {
                        "Node Type": "Index Scan",
                        "Relation Name": "users",
                        "Plan Rows": 10,
                        "Total Cost": 8.5
                    }
                }]),
                rows,
                columns: columns.into_iter().map(String::from).collect(),
                fail_execution: false,
                explain_calls: Arc::new(AtomicUsize::new(0)),
                fetch_calls: Arc::new(AtomicUsize::new(0)),
                last_sql: Arc::new(Mutex::new(None)),
            }
        }
    }

    struct MockConnection {
        plan: Value,
        rows: Vec<HashMap<String, Value>>,
        columns: Vec<String>,
        fail_execution: bool,
        explain_calls: Arc<AtomicUsize>,
        fetch_calls: Arc<AtomicUsize>,
        last_sql: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl ConnectionSource for MockSource {
        async fn acquire(&self) -> crate::error::Result<Box<dyn DbConnection>> {
            Ok(Box::new(MockConnection {
                plan: self.plan.clone(),
                rows: self.rows.clone(),
                columns: self.columns.clone(),
                fail_execution: self.fail_execution,
                explain_calls: self.explain_calls.clone(),
                fetch_calls: self.fetch_calls.clone(),
                last_sql: self.last_sql.clone(),
            }))
        }
    }

    #[async_trait]
    impl DbConnection for MockConnection {
        async fn explain_json(&mut self, _sql: &str) -> crate::error::Result<Value> {
            self.explain_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plan.clone())
        }

        async fn fetch_rows(
            &mut self,
            sql: &str,
            max_rows: usize,
        ) -> crate::error::Result<RowSet> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_sql.lock().unwrap() = Some(sql.to_string());
            if self.fail_execution {
                return Err(QueryError::Execution("relation does not exist".to_string()));
            }
            Ok(RowSet {
                columns: self.columns.clone(),
                rows: self.rows.iter().take(max_rows).cloned().collect(),
                warnings: Vec::new(),
            })
        }
    }

    fn row(id: i64) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), json!(id));
        map
    }

    fn audit_pair() -> (Arc<AuditLogger>, Arc<Mutex<Vec<String>>>) {
        let sink = MemorySink::new();
        let lines = sink.lines();
        (Arc::new(AuditLogger::new(vec![Box::new(sink)])), lines)
    }

    fn catalog() -> Arc<StaticCatalog> {
        Arc::new(StaticCatalog::new().with_table(
            "users",
            vec!["id".to_string(), "name".to_string(), "password".to_string()],
            1_000,
        ))
    }

    fn executor(
        config: AccessPolicyConfig,
        source: MockSource,
        audit: Arc<AuditLogger>,
    ) -> QueryExecutor {
        QueryExecutor::new("maindb", config, Arc::new(source), catalog(), audit).unwrap()
    }

    #[tokio::test]
    async fn success_path_truncates_and_audits() {
        let (audit, lines) = audit_pair();
        let source = MockSource::with_rows(vec!["id"], vec![row(1), row(2), row(3)]);
        let executor = executor(AccessPolicyConfig::default(), source, audit.clone());

        let result = executor
            .execute("SELECT id FROM users", 2, &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
        assert_eq!(result.database, "maindb");

        audit.flush();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"status\":\"success\""));
        assert!(lines[0].contains("\"truncated\":true"));
    }

    #[tokio::test]
    async fn denied_table_never_reaches_the_database() {
        let (audit, lines) = audit_pair();
        let mut config = AccessPolicyConfig::default();
        config.tables.denied.insert("users".to_string());
        let source = MockSource::with_rows(vec!["id"], vec![row(1)]);
        let fetch_calls = source.fetch_calls.clone();
        let explain_calls = source.explain_calls.clone();
        let executor = executor(config, source, audit.clone());

        let err = executor
            .execute("SELECT id FROM users", 10, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::TableAccessDenied { .. }));
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(explain_calls.load(Ordering::SeqCst), 0);

        audit.flush();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"status\":\"denied\""));
        assert!(lines[0].contains("table_access_denied"));
    }

    #[tokio::test]
    async fn execution_error_is_audited_as_error() {
        let (audit, lines) = audit_pair();
        let mut source = MockSource::with_rows(vec!["id"], vec![row(1)]);
        source.fail_execution = true;
        let executor = executor(AccessPolicyConfig::default(), source, audit.clone());

        let err = executor
            .execute("SELECT id FROM users", 10, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));

        audit.flush();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"status\":\"error\""));
    }

    #[tokio::test]
    async fn expand_safe_rewrites_the_statement() {
        let (audit, _lines) = audit_pair();
        let mut config = AccessPolicyConfig::default();
        config.columns.denied.insert("users.password".to_string());
        config.columns.wildcard_policy = WildcardPolicy::ExpandSafe;
        let source = MockSource::with_rows(vec!["id", "name"], vec![row(1)]);
        let last_sql = source.last_sql.clone();
        let executor = executor(config, source, audit);

        let result = executor
            .execute("SELECT * FROM users", 10, &RequestContext::new())
            .await
            .unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|warning| warning.contains("narrowed")));

        let executed = last_sql.lock().unwrap().clone().unwrap();
        assert!(executed.contains("id"));
        assert!(executed.contains("name"));
        assert!(!executed.contains('*'));
        assert!(!executed.contains("password"));
    }

    #[tokio::test]
    async fn wildcard_reject_names_the_sensitive_column() {
        let (audit, _lines) = audit_pair();
        let mut config = AccessPolicyConfig::default();
        config.columns.denied.insert("users.password".to_string());
        let source = MockSource::with_rows(vec!["id"], vec![row(1)]);
        let executor = executor(config, source, audit);

        let err = executor
            .execute("SELECT * FROM users", 10, &RequestContext::new())
            .await
            .unwrap_err();
        match err {
            QueryError::ColumnAccessDenied { columns } => {
                assert!(columns.contains("users.password"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn deadline_cancellation_is_audited() {
        let (audit, lines) = audit_pair();

        struct StallSource;
        #[async_trait]
        impl ConnectionSource for StallSource {
            async fn acquire(&self) -> crate::error::Result<Box<dyn DbConnection>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(QueryError::Execution("unreachable".to_string()))
            }
        }

        let executor = QueryExecutor::new(
            "maindb",
            AccessPolicyConfig::default(),
            Arc::new(StallSource),
            catalog(),
            audit.clone(),
        )
        .unwrap();

        let err = executor
            .execute_with_deadline(
                "SELECT id FROM users",
                10,
                &RequestContext::new(),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled(_)));

        audit.flush();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"status\":\"cancelled\""));
    }

    #[tokio::test]
    async fn conflicting_config_fails_at_construction() {
        let (audit, _lines) = audit_pair();
        let mut config = AccessPolicyConfig::default();
        config.tables.allowed.insert("users".to_string());
        config.tables.denied.insert("users".to_string());
        let source = MockSource::with_rows(vec!["id"], vec![]);

        let result = QueryExecutor::new("maindb", config, Arc::new(source), catalog(), audit);
        assert!(matches!(result, Err(QueryError::Config(_))));
    }
}
