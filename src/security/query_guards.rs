//! Query Guards
//!
//! Cost-estimation guard for statements that already passed the access
//! policy. One EXPLAIN round trip per distinct statement text, cached by
//! content hash; the round trip is bounded by the configured timeout and
//! fails open - cost estimation is a resource guard, not a correctness
//! guard, and must never take the service down with it.

use crate::catalog::SchemaCatalog;
use crate::error::QueryError;
use crate::execution::engine::DbConnection;
use crate::execution::plan::{ExplainResult, PlanNode};
use crate::security::policy::ExplainPolicy;
use crate::sql_structure::fingerprint;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why the guard rejected a statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CostDenial {
    TooManyRows { estimated_rows: i64, limit: i64 },
    LargeSeqScan { table: String, rows: i64, threshold: i64 },
}

impl CostDenial {
    pub fn into_error(self) -> QueryError {
        match self {
            CostDenial::TooManyRows {
                estimated_rows,
                limit,
            } => QueryError::QueryTooExpensive {
                estimated_rows,
                limit,
            },
            CostDenial::LargeSeqScan {
                table,
                rows,
                threshold,
            } => QueryError::SeqScanDenied {
                table,
                rows,
                threshold,
            },
        }
    }
}

/// Outcome of one guard evaluation.
#[derive(Debug, Clone)]
pub struct ExplainValidation {
    pub passed: bool,
    pub denial: Option<CostDenial>,
    pub warnings: Vec<String>,
    pub explain: Option<ExplainResult>,
    /// True when the result came from the cache without a round trip.
    pub cache_hit: bool,
}

impl ExplainValidation {
    fn passing() -> Self {
        Self {
            passed: true,
            denial: None,
            warnings: Vec::new(),
            explain: None,
            cache_hit: false,
        }
    }
}

struct CachedPlan {
    explain: ExplainResult,
    cached_at: Instant,
}

/// Cost guard for one database.
///
/// The cache is shared between concurrent requests; racing inserts are
/// last-writer-wins, which is safe because the value for a given key is
/// idempotent.
pub struct CostGuard {
    policy: ExplainPolicy,
    catalog: Arc<dyn SchemaCatalog>,
    cache: DashMap<u64, CachedPlan>,
}

impl CostGuard {
    pub fn new(policy: ExplainPolicy, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self {
            policy,
            catalog,
            cache: DashMap::new(),
        }
    }

    /// Validate the estimated cost of `sql` using `conn` for at most one
    /// round trip. Never returns an error: estimation failures fail open.
    pub async fn validate(&self, conn: &mut dyn DbConnection, sql: &str) -> ExplainValidation {
        if !self.policy.enabled {
            return ExplainValidation::passing();
        }

        let key = fingerprint(sql);
        let ttl = Duration::from_secs(self.policy.cache_ttl_secs);
        if let Some(entry) = self.cache.get(&key) {
            if entry.cached_at.elapsed() < ttl {
                debug!("explain cache hit for statement {:016x}", key);
                let explain = entry.explain.clone();
                drop(entry);
                let mut validation = self.evaluate(explain);
                validation.cache_hit = true;
                return validation;
            }
        }

        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let raw = match tokio::time::timeout(timeout, conn.explain_json(sql)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("EXPLAIN round trip failed, passing statement through: {}", e);
                let mut validation = ExplainValidation::passing();
                validation
                    .warnings
                    .push(format!("cost estimation unavailable: {}", e));
                return validation;
            }
            Err(_) => {
                warn!(
                    "EXPLAIN round trip timed out after {}ms, passing statement through",
                    self.policy.timeout_ms
                );
                let mut validation = ExplainValidation::passing();
                validation
                    .warnings
                    .push("cost estimation timed out".to_string());
                return validation;
            }
        };

        let explain = match PlanNode::from_postgres_json(&raw) {
            Ok(root) => ExplainResult::from_plan(&root),
            Err(e) => {
                warn!("could not parse EXPLAIN output, passing statement through: {}", e);
                let mut validation = ExplainValidation::passing();
                validation
                    .warnings
                    .push(format!("cost estimation unparseable: {}", e));
                return validation;
            }
        };

        // Cached whether the verdict is pass or fail, so repeated identical
        // statements are not re-estimated.
        self.insert(key, explain.clone());
        self.evaluate(explain)
    }

    fn evaluate(&self, explain: ExplainResult) -> ExplainValidation {
        let mut validation = ExplainValidation::passing();

        if explain.estimated_rows > self.policy.max_estimated_rows {
            validation.passed = false;
            validation.denial = Some(CostDenial::TooManyRows {
                estimated_rows: explain.estimated_rows,
                limit: self.policy.max_estimated_rows,
            });
        }

        if validation.passed && self.policy.deny_seq_scan_on_large_tables {
            // Catalog estimates are refreshed out of band and beat the plan's
            // own guess when available.
            let mut worst: Option<(String, i64)> = None;
            for (table, plan_rows) in &explain.seq_scan_tables {
                let rows = self.catalog.row_estimate(table).unwrap_or(*plan_rows);
                if rows > self.policy.large_table_row_threshold
                    && worst.as_ref().map(|(_, r)| rows > *r).unwrap_or(true)
                {
                    worst = Some((table.clone(), rows));
                }
            }
            if let Some((table, rows)) = worst {
                validation.passed = false;
                validation.denial = Some(CostDenial::LargeSeqScan {
                    table,
                    rows,
                    threshold: self.policy.large_table_row_threshold,
                });
            }
        }

        // Cost alone never blocks, it only warns.
        if explain.total_cost > self.policy.max_estimated_cost {
            validation.warnings.push(format!(
                "estimated cost {:.1} exceeds configured limit {:.1}",
                explain.total_cost, self.policy.max_estimated_cost
            ));
        }

        validation.explain = Some(explain);
        validation
    }

    fn insert(&self, key: u64, explain: ExplainResult) {
        let ttl = Duration::from_secs(self.policy.cache_ttl_secs);
        if self.cache.len() >= self.policy.cache_capacity {
            self.cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        }
        while self.cache.len() >= self.policy.cache_capacity {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.cached_at)
                .map(|entry| *entry.key());
            match oldest {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
        self.cache.insert(
            key,
            CachedPlan {
                explain,
                cached_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::error::Result;
    use crate::execution::engine::RowSet;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConnection {
        plan: serde_json::Value,
        fail: bool,
        explain_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DbConnection for FakeConnection {
        async fn explain_json(&mut self, _sql: &str) -> Result<serde_json::Value> {
            self.explain_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(QueryError::Execution("connection reset".to_string()));
            }
            Ok(self.plan.clone())
        }

        async fn fetch_rows(&mut self, _sql: &str, _max_rows: usize) -> Result<RowSet> {
            Ok(RowSet::default())
        }
    }

    fn seq_scan_plan(rows: i64, cost: f64) -> serde_json::Value {
        json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Relation Name": "events",
                "Plan Rows": rows,
                "Total Cost": cost
            }
        }])
    }

    fn guard(policy: ExplainPolicy) -> CostGuard {
        CostGuard::new(policy, Arc::new(StaticCatalog::new()))
    }

    #[tokio::test]
    async fn rejects_row_estimate_over_limit() {
        let policy = ExplainPolicy {
            max_estimated_rows: 1_000,
            deny_seq_scan_on_large_tables: false,
            ..Default::default()
        };
        let guard = guard(policy);
        let mut conn = FakeConnection {
            plan: seq_scan_plan(50_000, 10.0),
            fail: false,
            explain_calls: Arc::new(AtomicUsize::new(0)),
        };

        let validation = guard.validate(&mut conn, "SELECT * FROM events").await;
        assert!(!validation.passed);
        match validation.denial.unwrap() {
            CostDenial::TooManyRows {
                estimated_rows,
                limit,
            } => {
                assert_eq!(estimated_rows, 50_000);
                assert_eq!(limit, 1_000);
            }
            other => panic!("unexpected denial: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cost_over_limit_warns_but_passes() {
        let policy = ExplainPolicy {
            max_estimated_cost: 100.0,
            deny_seq_scan_on_large_tables: false,
            ..Default::default()
        };
        let guard = guard(policy);
        let mut conn = FakeConnection {
            plan: seq_scan_plan(10, 5_000.0),
            fail: false,
            explain_calls: Arc::new(AtomicUsize::new(0)),
        };

        let validation = guard.validate(&mut conn, "SELECT * FROM events").await;
        assert!(validation.passed);
        assert_eq!(validation.warnings.len(), 1);
    }

    #[tokio::test]
    async fn denies_seq_scan_on_large_table_preferring_catalog_estimate() {
        let policy = ExplainPolicy {
            large_table_row_threshold: 100_000,
            ..Default::default()
        };
        // The plan claims a tiny scan, the catalog knows better.
        let catalog = StaticCatalog::new().with_table("events", vec!["id".to_string()], 5_000_000);
        let guard = CostGuard::new(policy, Arc::new(catalog));
        let mut conn = FakeConnection {
            plan: seq_scan_plan(10, 10.0),
            fail: false,
            explain_calls: Arc::new(AtomicUsize::new(0)),
        };

        let validation = guard.validate(&mut conn, "SELECT * FROM events").await;
        assert!(!validation.passed);
        match validation.denial.unwrap() {
            CostDenial::LargeSeqScan { table, rows, .. } => {
                assert_eq!(table, "events");
                assert_eq!(rows, 5_000_000);
            }
            other => panic!("unexpected denial: {:?}", other),
        }
    }

    #[tokio::test]
    async fn identical_statements_issue_one_round_trip() {
        let guard = guard(ExplainPolicy {
            deny_seq_scan_on_large_tables: false,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let mut conn = FakeConnection {
            plan: seq_scan_plan(10, 10.0),
            fail: false,
            explain_calls: calls.clone(),
        };

        let first = guard.validate(&mut conn, "SELECT id FROM events").await;
        let second = guard.validate(&mut conn, "SELECT id FROM events").await;
        assert!(first.passed && second.passed);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn estimation_failure_fails_open() {
        let guard = guard(ExplainPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut conn = FakeConnection {
            plan: serde_json::Value::Null,
            fail: true,
            explain_calls: calls.clone(),
        };

        let validation = guard.validate(&mut conn, "SELECT id FROM events").await;
        assert!(validation.passed);
        assert!(!validation.warnings.is_empty());
        assert!(validation.explain.is_none());

        // Failures are not cached; the next call tries again.
        let validation = guard.validate(&mut conn, "SELECT id FROM events").await;
        assert!(validation.passed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_guard_is_a_no_op() {
        let guard = guard(ExplainPolicy {
            enabled: false,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let mut conn = FakeConnection {
            plan: seq_scan_plan(10, 10.0),
            fail: false,
            explain_calls: calls.clone(),
        };

        let validation = guard.validate(&mut conn, "SELECT id FROM events").await;
        assert!(validation.passed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capacity_eviction_keeps_cache_bounded() {
        let guard = guard(ExplainPolicy {
            cache_capacity: 2,
            deny_seq_scan_on_large_tables: false,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let mut conn = FakeConnection {
            plan: seq_scan_plan(10, 10.0),
            fail: false,
            explain_calls: calls.clone(),
        };

        for sql in ["SELECT 1", "SELECT 2", "SELECT 3", "SELECT 4"] {
            guard.validate(&mut conn, sql).await;
        }
        assert!(guard.cached_len() <= 2);
    }
}
