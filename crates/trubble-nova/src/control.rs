//! Compensating controls
//!
//! Control profiles name tags whose failures are accepted risk:
//!
//! ```yaml
//! control:
//!   - CIS-2.1.4: Telnet is blocked at the perimeter
//!   - CIS-5.2.10:
//!       reason: Break-glass access
//!   - STIG-V-1234
//! ```
//!
//! After execution, the reconciler rewrites Failure results carrying a
//! controlled tag to Controlled. No other outcome is ever changed.

use serde_yaml::Value;
use std::collections::HashMap;
use tracing::debug;
use trubble_core::{CheckResult, Error, Outcome, Result};

/// One controlled tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEntry {
    pub tag: String,
    pub reason: Option<String>,
}

/// A parsed control profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlProfile {
    pub path: String,
    pub entries: Vec<ControlEntry>,
}

impl ControlProfile {
    /// Parse a control profile document
    pub fn parse(path: &str, content: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(content).map_err(|e| {
            Error::Config(format!("Control profile {} is not valid YAML: {}", path, e))
        })?;

        let control = doc.get("control").ok_or_else(|| {
            Error::Config(format!("Control profile {} has no 'control' key", path))
        })?;

        let items = match control {
            Value::Null => return Ok(Self::empty(path)),
            Value::Sequence(items) => items,
            _ => {
                return Err(Error::Config(format!(
                    "Control profile {}: 'control' must be a list",
                    path
                )))
            }
        };

        let entries = items
            .iter()
            .map(|item| parse_entry(path, item))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path: path.to_string(),
            entries,
        })
    }

    fn empty(path: &str) -> Self {
        Self {
            path: path.to_string(),
            entries: Vec::new(),
        }
    }
}

fn parse_entry(path: &str, item: &Value) -> Result<ControlEntry> {
    let malformed = || Error::Config(format!("Control profile {} has a malformed entry", path));

    match item {
        Value::String(tag) => Ok(ControlEntry {
            tag: tag.clone(),
            reason: None,
        }),
        Value::Mapping(map) if map.len() == 1 => {
            let (tag, reason) = map.iter().next().ok_or_else(malformed)?;
            let tag = tag.as_str().ok_or_else(malformed)?.to_string();
            let reason = match reason {
                Value::Null => None,
                Value::String(reason) => Some(reason.clone()),
                Value::Mapping(inner) => match inner.get("reason") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(reason)) => Some(reason.clone()),
                    Some(_) => return Err(malformed()),
                },
                _ => return Err(malformed()),
            };
            Ok(ControlEntry { tag, reason })
        }
        _ => Err(malformed()),
    }
}

/// Lookup from controlled tag to its reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlSet {
    controls: HashMap<String, Option<String>>,
}

impl ControlSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from resolved profiles; the first definition of a tag wins
    pub fn from_profiles(profiles: &[ControlProfile]) -> Self {
        let mut set = Self::new();
        for entry in profiles.iter().flat_map(|p| p.entries.iter()) {
            set.insert(entry.tag.clone(), entry.reason.clone());
        }
        set
    }

    /// Add a tag unless it is already controlled
    pub fn insert(&mut self, tag: String, reason: Option<String>) {
        self.controls.entry(tag).or_insert(reason);
    }

    /// `Some(reason)` when the tag is controlled
    pub fn get(&self, tag: &str) -> Option<&Option<String>> {
        self.controls.get(tag)
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

/// Applies a control set to executed results
#[derive(Debug, Clone, Default)]
pub struct ControlReconciler {
    controls: ControlSet,
}

impl ControlReconciler {
    pub fn new(controls: ControlSet) -> Self {
        Self { controls }
    }

    pub fn reconcile(&self, results: Vec<CheckResult>) -> Vec<CheckResult> {
        reconcile(results, &self.controls)
    }
}

/// Downgrade controlled failures, preserving order
pub fn reconcile(results: Vec<CheckResult>, controls: &ControlSet) -> Vec<CheckResult> {
    if controls.is_empty() {
        return results;
    }

    results
        .into_iter()
        .map(|mut result| {
            if result.outcome != Outcome::Failure {
                return result;
            }

            // tags is a BTreeSet, so the first controlled tag is stable
            let matched = result
                .tags
                .iter()
                .find_map(|tag| controls.get(tag).map(|reason| (tag.clone(), reason.clone())));

            if let Some((tag, reason)) = matched {
                debug!(
                    check = %result.check_name,
                    tag = %tag,
                    "Failure covered by compensating control"
                );
                result.outcome = Outcome::Controlled;
                result.reason = reason;
            }
            result
        })
        .collect()
}
