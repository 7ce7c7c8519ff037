//! Topfile resolution - which profiles apply to this host
//!
//! A topfile maps a namespace (`nova` or `control`) to match expressions, each
//! naming the profiles that apply when the expression matches:
//!
//! ```yaml
//! nova:
//!   '*':
//!     - cis.linux
//!   'G@os:Ubuntu and web*':
//!     - stig.nginx: 'V-*'
//! ```

use crate::glob::TagFilter;
use crate::matcher::MatchExpression;
use serde::Serialize;
use serde_yaml::Value;
use std::collections::HashMap;
use tracing::{debug, trace};
use trubble_core::{AttributeSnapshot, Error, Result};

/// Top-level section of a topfile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Audit profiles
    Nova,
    /// Compensating-control profiles
    Control,
}

impl Namespace {
    pub fn key(&self) -> &'static str {
        match self {
            Namespace::Nova => "nova",
            Namespace::Control => "control",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A profile selected by a topfile, with an optional tag restriction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileRef {
    /// Dotted profile path
    pub path: String,
    /// `None` runs every check in the profile
    pub tag_filter: Option<TagFilter>,
}

impl ProfileRef {
    pub fn new(path: impl Into<String>, tag_filter: Option<TagFilter>) -> Self {
        Self {
            path: path.into(),
            tag_filter,
        }
    }

    /// Merge another reference to the same profile: no filter wins, filters union
    pub(crate) fn merge(&mut self, other: &ProfileRef) {
        let Some(incoming) = &other.tag_filter else {
            self.tag_filter = None;
            return;
        };
        if let Some(existing) = &mut self.tag_filter {
            existing.union(incoming);
        }
    }
}

#[derive(Debug, Clone)]
struct TopfileEntry {
    expression: MatchExpression,
    profiles: Vec<ProfileRef>,
}

/// A parsed topfile
#[derive(Debug, Clone, Default)]
pub struct Topfile {
    sections: HashMap<Namespace, Vec<TopfileEntry>>,
}

impl Topfile {
    /// Parse a topfile document
    pub fn parse(content: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Topfile is not valid YAML: {}", e)))?;

        let root = match doc {
            Value::Mapping(map) => map,
            Value::Null => return Ok(Self::default()),
            _ => return Err(Error::config("Topfile must be a mapping")),
        };

        let mut sections = HashMap::new();
        for namespace in [Namespace::Nova, Namespace::Control] {
            if let Some(section) = root.get(namespace.key()) {
                sections.insert(namespace, parse_section(namespace, section)?);
            }
        }

        Ok(Self { sections })
    }

    /// Whether the document has the namespace
    pub fn has(&self, namespace: Namespace) -> bool {
        self.sections.contains_key(&namespace)
    }

    /// Number of entries under a namespace
    pub fn entry_count(&self, namespace: Namespace) -> usize {
        self.sections.get(&namespace).map_or(0, Vec::len)
    }

    /// Profiles that apply to this host
    pub fn resolve(
        &self,
        namespace: Namespace,
        snapshot: &AttributeSnapshot,
    ) -> Result<Vec<ProfileRef>> {
        resolve(self, namespace, snapshot)
    }
}

fn parse_section(namespace: Namespace, section: &Value) -> Result<Vec<TopfileEntry>> {
    let mapping = match section {
        Value::Mapping(m) => m,
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(Error::Config(format!(
                "Topfile section '{}' must be a mapping",
                namespace
            )))
        }
    };

    let mut entries = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let expr = key.as_str().ok_or_else(|| {
            Error::Config(format!(
                "Topfile section '{}' has a non-string match expression",
                namespace
            ))
        })?;
        let expression = MatchExpression::parse(expr)?;

        let items = value.as_sequence().ok_or_else(|| {
            Error::Config(format!(
                "Topfile entry {:?} must map to a list of profiles",
                expr
            ))
        })?;

        let profiles = items
            .iter()
            .map(|item| parse_profile_item(expr, item))
            .collect::<Result<Vec<_>>>()?;

        entries.push(TopfileEntry {
            expression,
            profiles,
        });
    }

    Ok(entries)
}

fn parse_profile_item(expr: &str, item: &Value) -> Result<ProfileRef> {
    match item {
        Value::String(path) => Ok(ProfileRef::new(path.clone(), None)),
        Value::Mapping(map) if map.len() == 1 => {
            let (path, filter) = map
                .iter()
                .next()
                .ok_or_else(|| Error::Internal("empty single-key mapping".into()))?;
            let path = path.as_str().ok_or_else(|| {
                Error::Config(format!("Topfile entry {:?} has a non-string profile", expr))
            })?;

            let tag_filter = match filter {
                Value::Null => None,
                Value::String(glob) => Some(TagFilter::parse(glob)?),
                Value::Sequence(globs) => {
                    let globs = globs
                        .iter()
                        .map(|g| {
                            g.as_str().map(str::to_string).ok_or_else(|| {
                                Error::Config(format!(
                                    "Tag filter for profile {:?} must be strings",
                                    path
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Some(TagFilter::parse_all(&globs)?)
                }
                _ => {
                    return Err(Error::Config(format!(
                        "Tag filter for profile {:?} must be a glob or list of globs",
                        path
                    )))
                }
            };

            Ok(ProfileRef::new(path, tag_filter))
        }
        _ => Err(Error::Config(format!(
            "Topfile entry {:?} contains an item that is neither a profile path nor a single-key mapping",
            expr
        ))),
    }
}

/// Profiles under `namespace` whose expressions match the snapshot
///
/// Output keeps first-seen order and holds each path once.
pub fn resolve(
    topfile: &Topfile,
    namespace: Namespace,
    snapshot: &AttributeSnapshot,
) -> Result<Vec<ProfileRef>> {
    let entries = topfile.sections.get(&namespace).ok_or_else(|| {
        Error::Config(format!("Topfile has no '{}' section", namespace))
    })?;

    let mut resolved: Vec<ProfileRef> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        if !entry.expression.matches(snapshot) {
            trace!(expression = entry.expression.as_str(), "Topfile entry does not match");
            continue;
        }
        debug!(
            expression = entry.expression.as_str(),
            profiles = entry.profiles.len(),
            "Topfile entry matched"
        );

        for profile in &entry.profiles {
            match positions.get(&profile.path) {
                Some(&idx) => resolved[idx].merge(profile),
                None => {
                    positions.insert(profile.path.clone(), resolved.len());
                    resolved.push(profile.clone());
                }
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web1() -> AttributeSnapshot {
        AttributeSnapshot::new()
            .with_grain("id", "web1")
            .with_grain("os", "Ubuntu")
    }

    fn filter_of(r: &ProfileRef) -> Option<Vec<&str>> {
        r.tag_filter.as_ref().map(|f| f.patterns())
    }

    #[test]
    fn test_resolve_in_document_order() {
        let top = Topfile::parse(
            r#"
nova:
  '*':
    - a
    - b
  'web*':
    - c: 'CIS*'
"#,
        )
        .unwrap();

        let refs = top.resolve(Namespace::Nova, &web1()).unwrap();
        let paths: Vec<_> = refs.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
        assert_eq!(filter_of(&refs[0]), None);
        assert_eq!(filter_of(&refs[1]), None);
        assert_eq!(filter_of(&refs[2]), Some(vec!["CIS*"]));
    }

    #[test]
    fn test_non_matching_entries_skipped() {
        let top = Topfile::parse("nova:\n  'db*':\n    - a\n  'G@os:Ubuntu':\n    - b\n").unwrap();
        let refs = top.resolve(Namespace::Nova, &web1()).unwrap();
        assert_eq!(refs, vec![ProfileRef::new("b", None)]);
    }

    #[test]
    fn test_dedup_unfiltered_wins() {
        let top = Topfile::parse(
            "nova:\n  '*':\n    - a: 'CIS*'\n    - b\n  'web*':\n    - a\n",
        )
        .unwrap();
        let refs = top.resolve(Namespace::Nova, &web1()).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].path, "a");
        assert_eq!(refs[0].tag_filter, None);
    }

    #[test]
    fn test_dedup_unions_filters() {
        let top = Topfile::parse(
            "nova:\n  '*':\n    - a: 'CIS*'\n  'web*':\n    - a: ['STIG*', 'CIS*']\n",
        )
        .unwrap();
        let refs = top.resolve(Namespace::Nova, &web1()).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(filter_of(&refs[0]), Some(vec!["CIS*", "STIG*"]));
    }

    #[test]
    fn test_missing_namespace_is_config_error() {
        let top = Topfile::parse("nova:\n  '*':\n    - a\n").unwrap();
        assert!(top.has(Namespace::Nova));
        let err = top.resolve(Namespace::Control, &web1()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_malformed_documents() {
        for bad in [
            "- a\n- b\n",
            "nova: [a, b]\n",
            "nova:\n  '*': a\n",
            "nova:\n  '*':\n    - {a: x, b: y}\n",
            "nova:\n  '*':\n    - a: 42\n",
            "nova:\n  'G@os':\n    - a\n",
            "nova: [unclosed\n",
        ] {
            let err = Topfile::parse(bad).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR", "document {:?}", bad);
        }
    }
}
