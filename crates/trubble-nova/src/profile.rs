//! Profile loading - YAML documents of named checks
//!
//! ```yaml
//! sshd_root_login:
//!   description: Ensure SSH root login is disabled
//!   tags: [CIS-5.2.10]
//!   trigger:
//!     type: config_value
//!     file: /etc/ssh/sshd_config
//!     key: PermitRootLogin
//!     expected: "no"
//! ```

use crate::glob::TagFilter;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use trubble_core::{Check, ControlReason, Error, Result, Trigger};

/// A loaded profile
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Dotted profile path
    pub path: String,
    /// Checks in document order
    pub checks: Vec<Check>,
}

impl Profile {
    /// Parse a profile document
    ///
    /// An empty document yields a profile with no checks.
    pub fn load(path: &str, content: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| Error::profile_format(path, format!("invalid YAML: {}", e)))?;

        let root = match doc {
            Value::Mapping(map) => map,
            Value::Null => {
                return Ok(Self {
                    path: path.to_string(),
                    checks: Vec::new(),
                })
            }
            _ => return Err(Error::profile_format(path, "document must be a mapping of checks")),
        };

        let mut checks = Vec::with_capacity(root.len());
        for (name, body) in &root {
            let name = name
                .as_str()
                .ok_or_else(|| Error::profile_format(path, "check names must be strings"))?;
            checks.push(parse_check(path, name, body)?);
        }

        Ok(Self {
            path: path.to_string(),
            checks,
        })
    }

    /// Checks that pass an optional tag filter
    pub fn selected<'a>(&'a self, filter: Option<&'a TagFilter>) -> impl Iterator<Item = &'a Check> {
        self.checks
            .iter()
            .filter(move |check| filter.map_or(true, |f| f.matches_any(&check.tags)))
    }
}

fn parse_check(profile: &str, name: &str, body: &Value) -> Result<Check> {
    let body = body.as_mapping().ok_or_else(|| {
        Error::profile_format(profile, format!("check '{}' must be a mapping", name))
    })?;

    let trigger = match body.get("trigger") {
        Some(Value::Mapping(trigger)) => parse_trigger(profile, name, trigger)?,
        Some(_) => {
            return Err(Error::profile_format(
                profile,
                format!("check '{}' trigger must be a mapping", name),
            ))
        }
        None => {
            return Err(Error::profile_format(
                profile,
                format!("check '{}' has no trigger", name),
            ))
        }
    };

    let mut check = Check::new(name, trigger);

    match body.get("description") {
        None | Some(Value::Null) => {}
        Some(Value::String(desc)) => check.description = desc.clone(),
        Some(_) => {
            return Err(Error::profile_format(
                profile,
                format!("check '{}' description must be a string", name),
            ))
        }
    }

    check.tags = parse_tags(profile, name, body.get("tags"))?;

    if let Some(control) = body.get("control") {
        check.control = Some(parse_control(profile, name, control)?);
    }

    Ok(check)
}

fn parse_trigger(profile: &str, name: &str, trigger: &Mapping) -> Result<Trigger> {
    let kind = trigger.get("type").and_then(Value::as_str).ok_or_else(|| {
        Error::profile_format(
            profile,
            format!("check '{}' trigger needs a string 'type'", name),
        )
    })?;

    let mut params = trigger.clone();
    params.remove("type");

    Ok(Trigger {
        kind: kind.to_string(),
        params,
    })
}

fn parse_tags(profile: &str, name: &str, tags: Option<&Value>) -> Result<BTreeSet<String>> {
    let invalid = || {
        Error::profile_format(
            profile,
            format!("check '{}' tags must be a string or list of strings", name),
        )
    };

    match tags {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::String(tag)) => Ok(BTreeSet::from([tag.clone()])),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|t| t.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Some(_) => Err(invalid()),
    }
}

fn parse_control(profile: &str, name: &str, control: &Value) -> Result<ControlReason> {
    match control {
        Value::Null => Ok(ControlReason::unexplained()),
        Value::String(reason) => Ok(ControlReason::new(reason.clone())),
        Value::Mapping(map) => match map.get("reason") {
            None | Some(Value::Null) => Ok(ControlReason::unexplained()),
            Some(Value::String(reason)) => Ok(ControlReason::new(reason.clone())),
            Some(_) => Err(Error::profile_format(
                profile,
                format!("check '{}' control reason must be a string", name),
            )),
        },
        _ => Err(Error::profile_format(
            profile,
            format!("check '{}' control must be a string or {{reason: ...}}", name),
        )),
    }
}
