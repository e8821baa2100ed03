//! Execution
//!
//! The guarded execution pipeline: connection boundary, plan model, the
//! per-database executor and the manager that routes requests to it.

pub mod engine;
pub mod executor;
pub mod manager;
pub mod plan;
pub mod postgres_engine;
pub mod result;

pub use engine::{ConnectionSource, DbConnection, RequestContext, RowSet};
pub use executor::QueryExecutor;
pub use manager::QueryExecutorManager;
pub use plan::{ExplainResult, PlanNode};
pub use postgres_engine::PostgresSource;
pub use result::QueryResult;
