//! Security
//!
//! Access policy configuration, policy evaluation and cost guards.

pub mod access_control;
pub mod policy;
pub mod query_guards;

pub use access_control::{AccessController, CheckType, PolicyValidationResult, PolicyViolation};
pub use policy::{
    AccessPolicyConfig, ColumnRules, DeniedColumnAction, ExplainPolicy, TableRules, WildcardPolicy,
};
pub use query_guards::{CostDenial, CostGuard, ExplainValidation};
