//! Trubble Core - Foundation types shared by the audit engine, scheduler and returners
//!
//! This crate provides the core abstractions used throughout the agent:
//! - `AttributeSnapshot`: Host attributes (grains and pillar) used for targeting
//! - `SnapshotSource`: Captures a fresh snapshot per audit run
//! - `Check`: A single auditable assertion loaded from a profile
//! - `CheckResult` / `AuditReport`: Classified outcomes of an audit run
//! - `Error`: The error taxonomy shared by every crate

pub mod attributes;
pub mod check;
pub mod error;
pub mod result;

// Re-export commonly used types at crate root
pub use attributes::{AttributeSnapshot, SnapshotSource};
pub use check::{Check, ControlReason, Trigger};
pub use error::{Error, Result};
pub use result::{AuditReport, CheckResult, Outcome, ReportError, RunState};
