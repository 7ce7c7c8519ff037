//! Built-in probes
//!
//! | kind | parameters |
//! |------|------------|
//! | `grain` | `grain`, `pattern`, `source` (`grains`/`pillar`) |
//! | `file_content` | `path`, `pattern`, `expected`, `should_exist` |
//! | `config_value` | `file`, `key`, `expected`, `delimiter` |
//! | `file_permission` | `path`, `mode`, `max_mode`, `owner`, `group` |
//! | `command` | `command`, `args`, `expected_output`, `expected_exit_code` |
//! | `sysctl` | `key`, `expected` |

mod attribute;
mod command;
mod file;

pub use attribute::GrainProbe;
pub use command::{CommandProbe, SysctlProbe};
pub use file::{ConfigValueProbe, FileContentProbe, FilePermissionProbe};

use crate::executor::Probe;
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use trubble_core::{Error, Result};

/// Every built-in probe
pub fn builtins() -> Vec<Arc<dyn Probe>> {
    vec![
        Arc::new(GrainProbe),
        Arc::new(FileContentProbe),
        Arc::new(ConfigValueProbe),
        Arc::new(FilePermissionProbe),
        Arc::new(CommandProbe),
        Arc::new(SysctlProbe),
    ]
}

/// Typed access to trigger parameters
pub(crate) struct Params<'a> {
    kind: &'a str,
    map: &'a Mapping,
}

impl<'a> Params<'a> {
    pub(crate) fn new(kind: &'a str, map: &'a Mapping) -> Self {
        Self { kind, map }
    }

    fn invalid(&self, key: &str, wanted: &str) -> Error {
        Error::probe(self.kind, format!("parameter '{}' must be {}", key, wanted))
    }

    pub(crate) fn str(&self, key: &str) -> Result<&'a str> {
        self.opt_str(key)?
            .ok_or_else(|| Error::probe(self.kind, format!("missing parameter '{}'", key)))
    }

    /// Optional scalar rendered as a string; numbers and booleans as written
    pub(crate) fn opt_string(&self, key: &str) -> Result<Option<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(key, "a scalar")),
        }
    }

    pub(crate) fn string(&self, key: &str) -> Result<String> {
        self.opt_string(key)?
            .ok_or_else(|| Error::probe(self.kind, format!("missing parameter '{}'", key)))
    }

    pub(crate) fn opt_str(&self, key: &str) -> Result<Option<&'a str>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub(crate) fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.invalid(key, "a boolean")),
        }
    }

    pub(crate) fn opt_i32(&self, key: &str) -> Result<Option<i32>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| self.invalid(key, "an integer")),
            Some(_) => Err(self.invalid(key, "an integer")),
        }
    }

    /// Optional file mode written with octal digits (`0644`, `"0o600"`, `644`)
    pub(crate) fn opt_mode(&self, key: &str) -> Result<Option<u32>> {
        let digits = match self.opt_string(key)? {
            Some(digits) => digits,
            None => return Ok(None),
        };
        let trimmed = digits.trim_start_matches("0o");
        u32::from_str_radix(trimmed, 8)
            .map(Some)
            .map_err(|_| self.invalid(key, "an octal file mode"))
    }

    pub(crate) fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(self.invalid(key, "a list of strings")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(self.invalid(key, "a list of strings")),
        }
    }
}
