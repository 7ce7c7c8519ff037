//! Trubble Nova - Audit selection, execution and control reconciliation
//!
//! This crate provides:
//! - `MatchExpression`: Compound targeting expressions over host attributes
//! - `Topfile`: Resolution of which profiles apply to this host
//! - `Profile`: YAML profile parsing into checks
//! - `CheckExecutor`: Runs checks through pluggable probes
//! - `ControlReconciler`: Downgrades failures covered by compensating controls
//! - `AuditEngine`: Orchestrates one audit run into an `AuditReport`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trubble_core::AttributeSnapshot;
//! use trubble_nova::{AuditEngine, AuditRequest, EngineSettings, FsProfileSource, ProbeRegistry};
//!
//! let source = FsProfileSource::new("/var/cache/trubble/files", "trubblestack_nova_profiles");
//! let engine = AuditEngine::new(
//!     Arc::new(source),
//!     Arc::new(ProbeRegistry::with_builtins()),
//!     EngineSettings::default(),
//! );
//!
//! let snapshot = AttributeSnapshot::new().with_grain("id", "web1");
//! let report = engine.run(&AuditRequest::top(), &snapshot);
//! println!("Compliance: {:?}", report.compliance_percent());
//! ```

pub mod control;
pub mod engine;
pub mod executor;
pub mod glob;
pub mod matcher;
pub mod probes;
pub mod profile;
pub mod source;
pub mod topfile;

pub use control::{ControlEntry, ControlProfile, ControlReconciler, ControlSet};
pub use engine::{AuditEngine, AuditRequest, EngineSettings, EngineState};
pub use executor::{CheckExecutor, Probe, ProbeRegistry, Verdict};
pub use glob::{GlobPattern, TagFilter};
pub use matcher::{Atom, MatchExpression};
pub use profile::Profile;
pub use source::{FsProfileSource, ProfileSource};
pub use topfile::{Namespace, ProfileRef, Topfile};
