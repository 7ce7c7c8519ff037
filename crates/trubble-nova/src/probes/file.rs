//! File probes - content, key/value settings and permissions

use super::Params;
use crate::executor::{Probe, Verdict};
use regex::Regex;
use serde_yaml::Mapping;
use std::fs;
use trubble_core::{AttributeSnapshot, Error, Result};

/// Regex over a file's content
pub struct FileContentProbe;

impl Probe for FileContentProbe {
    fn kind(&self) -> &str {
        "file_content"
    }

    fn evaluate(&self, params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let params = Params::new(self.kind(), params);
        let path = params.str("path")?;
        let pattern = params.str("pattern")?;
        let expected = params.opt_string("expected")?;
        let should_exist = params.bool_or("should_exist", true)?;

        let re = Regex::new(pattern)
            .map_err(|e| Error::probe(self.kind(), format!("invalid regex: {}", e)))?;
        let content = fs::read_to_string(path)
            .map_err(|e| Error::probe(self.kind(), format!("cannot read file {}: {}", path, e)))?;

        let found = re.captures(&content).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        });

        Ok(match (found, expected, should_exist) {
            (Some(found), Some(expected), _) => {
                if found == expected {
                    Verdict::pass(found)
                } else {
                    Verdict::fail(found, expected)
                }
            }
            (Some(found), None, true) => Verdict::pass(found),
            (Some(found), None, false) => Verdict::fail(found, "pattern should not exist"),
            (None, _, true) => Verdict::fail("not found", "pattern should exist"),
            (None, _, false) => Verdict::pass("pattern not found (expected)"),
        })
    }
}

/// `key<delimiter>value` lookup in a configuration file
pub struct ConfigValueProbe;

impl Probe for ConfigValueProbe {
    fn kind(&self) -> &str {
        "config_value"
    }

    fn evaluate(&self, params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let params = Params::new(self.kind(), params);
        let file = params.str("file")?;
        let key = params.str("key")?;
        let expected = params.string("expected")?;
        let delimiter = params.opt_str("delimiter")?;

        let content = fs::read_to_string(file)
            .map_err(|e| Error::probe(self.kind(), format!("cannot read file {}: {}", file, e)))?;

        match find_setting(&content, key, delimiter) {
            Some(value) if value == expected => Ok(Verdict::pass(value)),
            Some(value) => Ok(Verdict::fail(value, expected)),
            None => Ok(Verdict::fail("key not found", expected)
                .with_details(format!("key '{}' not found in {}", key, file))),
        }
    }
}

/// First uncommented value for `key`; whitespace delimits when no delimiter is given
fn find_setting(content: &str, key: &str, delimiter: Option<&str>) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let pair = match delimiter {
            Some(delim) => line.split_once(delim),
            None => line.split_once(char::is_whitespace),
        };

        if let Some((k, v)) = pair {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Mode, owner and group of a path
pub struct FilePermissionProbe;

impl Probe for FilePermissionProbe {
    fn kind(&self) -> &str {
        "file_permission"
    }

    #[cfg(unix)]
    fn evaluate(&self, params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let params = Params::new(self.kind(), params);
        let path = params.str("path")?;
        let expected_mode = params.opt_mode("mode")?;
        let max_mode = params.opt_mode("max_mode")?;
        let owner = params.opt_str("owner")?;
        let group = params.opt_str("group")?;

        let metadata = fs::metadata(path)
            .map_err(|e| Error::probe(self.kind(), format!("cannot access {}: {}", path, e)))?;
        let mode = metadata.permissions().mode() & 0o7777;

        if let Some(expected) = expected_mode {
            if mode != expected {
                return Ok(Verdict::fail(
                    format!("{:04o}", mode),
                    format!("{:04o}", expected),
                ));
            }
        }

        if let Some(max) = max_mode {
            // every bit set must also be allowed by max_mode
            if mode & !max != 0 {
                return Ok(
                    Verdict::fail(format!("{:04o}", mode), format!("<= {:04o}", max))
                        .with_details(format!("{} is more permissive than {:04o}", path, max)),
                );
            }
        }

        let actual_owner = lookup_name("/etc/passwd", metadata.uid());
        if let Some(expected) = owner {
            if actual_owner != expected {
                return Ok(Verdict::fail(actual_owner, expected)
                    .with_details(format!("owner of {}", path)));
            }
        }

        let actual_group = lookup_name("/etc/group", metadata.gid());
        if let Some(expected) = group {
            if actual_group != expected {
                return Ok(Verdict::fail(actual_group, expected)
                    .with_details(format!("group of {}", path)));
            }
        }

        Ok(Verdict::pass(format!(
            "mode={:04o} owner={} group={}",
            mode, actual_owner, actual_group
        )))
    }

    #[cfg(not(unix))]
    fn evaluate(&self, _params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        Err(Error::probe(
            self.kind(),
            "file permission checks are only supported on unix",
        ))
    }
}

/// Name for a numeric id from a passwd-style database, falling back to the id
#[cfg(unix)]
fn lookup_name(database: &str, id: u32) -> String {
    fs::read_to_string(database)
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                let mut parts = line.split(':');
                let name = parts.next()?;
                let parsed = parts.nth(1)?.parse::<u32>().ok()?;
                (parsed == id).then(|| name.to_string())
            })
        })
        .unwrap_or_else(|| id.to_string())
}
