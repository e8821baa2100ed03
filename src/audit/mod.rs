//! Audit Trail
//!
//! Tamper-evident record of every decision this engine makes: one event per
//! request, emitted on every path, written off the hot path.

pub mod event;
pub mod logger;
pub mod sinks;

pub use event::{AuditEvent, AuditStatus, PolicyCheckOutcome};
pub use logger::AuditLogger;
pub use sinks::{AuditSink, ConsoleSink, FileSink, MemorySink};
