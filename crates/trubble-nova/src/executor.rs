//! Check execution through pluggable probes
//!
//! Each trigger kind is served by a `Probe`. The executor never lets a probe
//! failure escape: errors and panics become `Outcome::Error` results.

use serde_yaml::Mapping;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};
use trubble_core::{AttributeSnapshot, Check, CheckResult, Error, Outcome, Result};

/// What a probe observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    /// Observed value
    pub actual: String,
    /// Expected value, when the probe compares against one
    pub expected: Option<String>,
    pub details: Option<String>,
}

impl Verdict {
    pub fn pass(actual: impl Into<String>) -> Self {
        Self {
            passed: true,
            actual: actual.into(),
            expected: None,
            details: None,
        }
    }

    pub fn fail(actual: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            passed: false,
            actual: actual.into(),
            expected: Some(expected.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Human-readable summary used as the result detail
    pub fn describe(&self) -> String {
        let mut text = match &self.expected {
            Some(expected) => format!("expected {}, found {}", expected, self.actual),
            None => format!("found {}", self.actual),
        };
        if let Some(details) = &self.details {
            text.push_str(": ");
            text.push_str(details);
        }
        text
    }
}

/// Capability provider that evaluates one trigger kind
pub trait Probe: Send + Sync {
    /// Trigger `type` served by this probe
    fn kind(&self) -> &str;

    /// Evaluate trigger parameters against the host
    fn evaluate(&self, params: &Mapping, snapshot: &AttributeSnapshot) -> Result<Verdict>;
}

/// Registry of probes by trigger kind
#[derive(Default)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in probe
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for probe in crate::probes::builtins() {
            registry.register(probe);
        }
        registry
    }

    /// Register a probe, replacing any previous probe of the same kind
    pub fn register(&mut self, probe: Arc<dyn Probe>) {
        let kind = probe.kind().to_string();
        if self.probes.insert(kind.clone(), probe).is_some() {
            debug!("Replaced probe for trigger kind: {}", kind);
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.probes.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Runs single checks
#[derive(Debug, Clone)]
pub struct CheckExecutor {
    registry: Arc<ProbeRegistry>,
}

impl CheckExecutor {
    pub fn new(registry: Arc<ProbeRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one check from `profile`
    pub fn execute(&self, check: &Check, profile: &str, snapshot: &AttributeSnapshot) -> CheckResult {
        let base = CheckResult::new(&check.name, profile, Outcome::Success)
            .with_description(&check.description)
            .with_tags(check.tags.clone());

        if let Some(control) = &check.control {
            debug!(check = %check.name, "Check controlled inline, trigger skipped");
            let mut result = base.with_reason(control.reason.clone());
            result.outcome = Outcome::Controlled;
            return result;
        }

        match self.evaluate(check, snapshot) {
            Ok(verdict) if verdict.passed => base,
            Ok(verdict) => {
                let mut result = base.with_detail(verdict.describe());
                result.outcome = Outcome::Failure;
                result
            }
            Err(e) => {
                warn!(check = %check.name, profile, error = %e, "Check execution failed");
                let mut result = base.with_detail(e.to_string());
                result.outcome = Outcome::Error;
                result
            }
        }
    }

    fn evaluate(&self, check: &Check, snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let kind = &check.trigger.kind;
        let probe = self
            .registry
            .get(kind)
            .ok_or_else(|| Error::UnknownProbe { kind: kind.clone() })?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            probe.evaluate(&check.trigger.params, snapshot)
        }));

        match outcome {
            Ok(verdict) => verdict.map_err(|e| match e {
                e @ (Error::Probe { .. } | Error::Execution { .. }) => e,
                other => Error::Execution {
                    check: check.name.clone(),
                    message: other.to_string(),
                },
            }),
            Err(payload) => Err(Error::Execution {
                check: check.name.clone(),
                message: format!("probe '{}' panicked: {}", kind, panic_message(&payload)),
            }),
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
