//! Check results and the audit report

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Classified outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Error,
    /// Accepted risk: either controlled inline or downgraded from Failure
    Controlled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "Success",
            Outcome::Failure => "Failure",
            Outcome::Error => "Error",
            Outcome::Controlled => "Controlled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name
    pub check_name: String,
    /// Profile the check came from
    pub profile: String,
    /// Check description
    pub description: String,
    /// Check tags
    pub tags: BTreeSet<String>,
    /// Classified outcome
    pub outcome: Outcome,
    /// Control reason (Controlled only)
    pub reason: Option<String>,
    /// Failure or error details
    pub detail: Option<String>,
}

impl CheckResult {
    /// Create a result with no reason or detail
    pub fn new(
        check_name: impl Into<String>,
        profile: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            profile: profile.into(),
            description: String::new(),
            tags: BTreeSet::new(),
            outcome,
            reason: None,
            detail: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn to_value(&self, verbose: bool) -> Value {
        let mut entry = Map::new();
        if !verbose {
            entry.insert(self.check_name.clone(), json!(self.description));
            return Value::Object(entry);
        }

        let mut body = Map::new();
        body.insert("description".into(), json!(self.description));
        body.insert("profile".into(), json!(self.profile));
        body.insert("tags".into(), json!(self.tags));
        if let Some(reason) = &self.reason {
            body.insert("reason".into(), json!(reason));
        }
        if let Some(detail) = &self.detail {
            body.insert("detail".into(), json!(detail));
        }
        entry.insert(self.check_name.clone(), Value::Object(body));
        Value::Object(entry)
    }
}

/// A non-check error recorded in the report (missing profile, bad document, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportError {
    pub profile: Option<String>,
    pub check: Option<String>,
    pub code: String,
    pub message: String,
}

impl ReportError {
    /// Error attributed to a whole profile
    pub fn for_profile(profile: impl Into<String>, error: &Error) -> Self {
        Self {
            profile: Some(profile.into()),
            check: None,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Top-level error not attributed to a profile
    pub fn top_level(error: &Error) -> Self {
        Self {
            profile: None,
            check: None,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Error produced while executing a check
    pub fn from_check(result: &CheckResult) -> Self {
        Self {
            profile: Some(result.profile.clone()),
            check: Some(result.check_name.clone()),
            code: String::from("EXECUTION_ERROR"),
            message: result.detail.clone().unwrap_or_default(),
        }
    }
}

/// Terminal state of an audit run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Done,
    Failed,
}

/// Structured report of one audit run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub state: RunState,
    pub successes: Vec<CheckResult>,
    pub failures: Vec<CheckResult>,
    pub controlled: Vec<CheckResult>,
    pub errors: Vec<ReportError>,
    /// (Success + Controlled) / (Success + Controlled + Failure); `None` when nothing was scored
    pub compliance: Option<f64>,
    /// Whether `render` includes result details
    #[serde(default)]
    pub verbose: bool,
}

impl AuditReport {
    /// Build a completed report from final (reconciled) results
    ///
    /// Results with outcome Error are recorded in `errors`.
    pub fn from_results(results: Vec<CheckResult>, mut errors: Vec<ReportError>) -> Self {
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut controlled = Vec::new();

        for result in results {
            match result.outcome {
                Outcome::Success => successes.push(result),
                Outcome::Failure => failures.push(result),
                Outcome::Controlled => controlled.push(result),
                Outcome::Error => errors.push(ReportError::from_check(&result)),
            }
        }

        let compliance = compliance_ratio(successes.len(), controlled.len(), failures.len());

        Self {
            state: RunState::Done,
            successes,
            failures,
            controlled,
            errors,
            compliance,
            verbose: false,
        }
    }

    /// Report for a run that hit an unrecoverable input error
    pub fn failed(error: &Error) -> Self {
        Self {
            state: RunState::Failed,
            successes: Vec::new(),
            failures: Vec::new(),
            controlled: Vec::new(),
            errors: vec![ReportError::top_level(error)],
            compliance: None,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.state == RunState::Failed
    }

    /// Total number of classified checks
    pub fn total_checks(&self) -> usize {
        self.successes.len() + self.failures.len() + self.controlled.len()
    }

    /// Compliance as a whole percentage
    pub fn compliance_percent(&self) -> Option<u32> {
        self.compliance.map(|c| (c * 100.0).round() as u32)
    }

    /// Render with the verbosity the run was requested with
    pub fn render(&self) -> Value {
        self.to_return(self.verbose)
    }

    /// Render the return value handed to returners
    pub fn to_return(&self, verbose: bool) -> Value {
        let render = |items: &[CheckResult]| -> Vec<Value> {
            items.iter().map(|r| r.to_value(verbose)).collect()
        };

        let mut ret = Map::new();
        ret.insert("Success".into(), Value::Array(render(&self.successes)));
        ret.insert("Failure".into(), Value::Array(render(&self.failures)));
        ret.insert("Controlled".into(), Value::Array(render(&self.controlled)));
        ret.insert(
            "Errors".into(),
            serde_json::to_value(&self.errors).unwrap_or(Value::Null),
        );
        if let Some(percent) = self.compliance_percent() {
            ret.insert("Compliance".into(), json!(percent));
        }
        Value::Object(ret)
    }
}

/// Compliance ratio; controlled checks count as passing, errors are excluded
pub fn compliance_ratio(successes: usize, controlled: usize, failures: usize) -> Option<f64> {
    let passing = successes + controlled;
    let total = passing + failures;
    if total == 0 {
        None
    } else {
        Some(passing as f64 / total as f64)
    }
}
