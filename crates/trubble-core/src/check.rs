//! Check definitions - a single auditable assertion loaded from a profile

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Trigger predicate of a check, evaluated by the probe registered for `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Probe kind (the `type` key of the trigger mapping)
    pub kind: String,
    /// Probe-specific parameters (every key except `type`)
    #[serde(default)]
    pub params: serde_yaml::Mapping,
}

impl Trigger {
    /// Create a trigger with no parameters
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_yaml::Mapping::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.params
            .insert(serde_yaml::Value::String(key.to_string()), value.into());
        self
    }
}

/// Inline control marker; a check carrying one is never executed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReason {
    pub reason: Option<String>,
}

impl ControlReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    /// Control with no stated reason
    pub fn unexplained() -> Self {
        Self { reason: None }
    }
}

/// A named check from a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Check name (key in the profile document)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Trigger predicate
    pub trigger: Trigger,

    /// Tags used for topfile filtering and control matching
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Inline control override
    #[serde(default)]
    pub control: Option<ControlReason>,
}

impl Check {
    /// Create a check with no description, tags or control
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            trigger,
            tags: BTreeSet::new(),
            control: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_control(mut self, control: ControlReason) -> Self {
        self.control = Some(control);
        self
    }

    /// Whether the check is controlled inline
    pub fn is_controlled(&self) -> bool {
        self.control.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_builder() {
        let check = Check::new(
            "sshd_root_login",
            Trigger::new("config_value")
                .with_param("file", "/etc/ssh/sshd_config")
                .with_param("key", "PermitRootLogin"),
        )
        .with_description("Ensure SSH root login is disabled")
        .with_tag("CIS-5.2.10")
        .with_tag("CIS-5.2.10");

        assert_eq!(check.tags.len(), 1);
        assert_eq!(check.trigger.params.len(), 2);
        assert!(!check.is_controlled());

        let check = check.with_control(ControlReason::new("bastion host"));
        assert!(check.is_controlled());
    }
}
