//! Executor Manager - Owns one guarded executor per configured database and
//! resolves which one serves an inbound request.
//!
//! Registration happens once at startup; after that the set of executors is
//! never mutated, so resolution is a plain map lookup with no locking.

use crate::audit::AuditLogger;
use crate::catalog::SchemaCatalog;
use crate::error::{QueryError, Result};
use crate::execution::engine::ConnectionSource;
use crate::execution::executor::QueryExecutor;
use crate::security::policy::AccessPolicyConfig;
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct QueryExecutorManager {
    audit: Arc<AuditLogger>,
    executors: HashMap<String, Arc<QueryExecutor>>,
}

impl QueryExecutorManager {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            audit,
            executors: HashMap::new(),
        }
    }

    /// Register a database at startup. Policy validation errors are fatal
    /// here; nothing is registered on the request path.
    pub fn register(
        &mut self,
        database: impl Into<String>,
        config: AccessPolicyConfig,
        source: Arc<dyn ConnectionSource>,
        catalog: Arc<dyn SchemaCatalog>,
    ) -> Result<()> {
        let database = database.into();
        if self.executors.contains_key(&database) {
            return Err(QueryError::Config(format!(
                "database '{}' is already registered",
                database
            )));
        }
        let executor = QueryExecutor::new(
            database.clone(),
            config,
            source,
            catalog,
            self.audit.clone(),
        )?;
        info!("registered database '{}'", database);
        self.executors.insert(database, Arc::new(executor));
        Ok(())
    }

    /// Registered database names, sorted for stable error messages.
    pub fn databases(&self) -> Vec<String> {
        self.executors.keys().cloned().sorted().collect()
    }

    /// Resolve the executor for a request.
    ///
    /// With a name: that database or an unknown-database error. Without one:
    /// the single registered database, or an ambiguity error rather than a
    /// guess when several are registered.
    pub fn resolve(&self, database: Option<&str>) -> Result<Arc<QueryExecutor>> {
        match database {
            Some(name) => self.executors.get(name).cloned().ok_or_else(|| {
                QueryError::UnknownDatabase {
                    name: name.to_string(),
                    available: self.databases().iter().join(", "),
                }
            }),
            None => match self.executors.values().collect::<Vec<_>>().as_slice() {
                [] => Err(QueryError::Execution(
                    "no databases are registered".to_string(),
                )),
                [only] => Ok(Arc::clone(only)),
                _ => Err(QueryError::AmbiguousDatabase {
                    available: self.databases().iter().join(", "),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogger, MemorySink};
    use crate::catalog::StaticCatalog;
    use crate::execution::engine::{DbConnection, RowSet};
    use async_trait::async_trait;

    struct NullSource;

    #[async_trait]
    impl ConnectionSource for NullSource {
        async fn acquire(&self) -> Result<Box<dyn DbConnection>> {
            Ok(Box::new(NullConnection))
        }
    }

    struct NullConnection;

    #[async_trait]
    impl DbConnection for NullConnection {
        async fn explain_json(&mut self, _sql: &str) -> Result<serde_json::Value> {
            Ok(serde_json::json!([]))
        }

        async fn fetch_rows(&mut self, _sql: &str, _max_rows: usize) -> Result<RowSet> {
            Ok(RowSet::default())
        }
    }

    fn manager() -> QueryExecutorManager {
        QueryExecutorManager::new(Arc::new(AuditLogger::new(vec![Box::new(
            MemorySink::new(),
        )])))
    }

    fn register(manager: &mut QueryExecutorManager, name: &str) {
        manager
            .register(
                name,
                AccessPolicyConfig::default(),
                Arc::new(NullSource),
                Arc::new(StaticCatalog::new()),
            )
            .unwrap();
    }

    #[test]
    fn single_database_auto_selects() {
        let mut manager = manager();
        register(&mut manager, "analytics");
        let executor = manager.resolve(None).unwrap();
        assert_eq!(executor.database(), "analytics");
    }

    #[test]
    fn ambiguous_resolution_lists_both_names() {
        let mut manager = manager();
        register(&mut manager, "analytics");
        register(&mut manager, "billing");

        let err = manager.resolve(None).unwrap_err();
        match err {
            QueryError::AmbiguousDatabase { available } => {
                assert_eq!(available, "analytics, billing");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unknown_database_lists_available() {
        let mut manager = manager();
        register(&mut manager, "analytics");

        let err = manager.resolve(Some("warehouse")).unwrap_err();
        match err {
            QueryError::UnknownDatabase { name, available } => {
                assert_eq!(name, "warehouse");
                assert_eq!(available, "analytics");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut manager = manager();
        register(&mut manager, "analytics");
        let result = manager.register(
            "analytics",
            AccessPolicyConfig::default(),
            Arc::new(NullSource),
            Arc::new(StaticCatalog::new()),
        );
        assert!(matches!(result, Err(QueryError::Config(_))));
    }
}
