//! Compound targeting expressions
//!
//! An expression is a whitespace-separated list of atoms that must all hold:
//!
//! - `G@key:glob` matches a grain
//! - `I@key:glob` matches a pillar value
//! - a bare glob matches the `id` grain
//!
//! The word `and` may appear between atoms and is ignored. There is no `or`,
//! `not` or grouping.

use crate::glob::GlobPattern;
use trubble_core::attributes::{scalar_strings, AttributeSource};
use trubble_core::{AttributeSnapshot, Error, Result};

/// One predicate of a match expression
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    /// Glob over a grain or pillar value reached by a dotted key
    Namespaced {
        source: AttributeSource,
        key: String,
        pattern: GlobPattern,
    },
    /// Glob over the host identifier
    Bare(GlobPattern),
}

impl Atom {
    fn parse(token: &str) -> Result<Self> {
        if let Some((prefix, rest)) = token.split_once('@') {
            let source = match prefix {
                "G" => AttributeSource::Grains,
                "I" => AttributeSource::Pillar,
                other => {
                    return Err(Error::Config(format!(
                        "Unsupported match namespace '{}@' in {:?}",
                        other, token
                    )))
                }
            };

            let (key, pattern) = rest.split_once(':').ok_or_else(|| {
                Error::Config(format!("Match atom {:?} is missing ':<pattern>'", token))
            })?;
            if key.is_empty() {
                return Err(Error::Config(format!("Match atom {:?} has an empty key", token)));
            }

            return Ok(Atom::Namespaced {
                source,
                key: key.to_string(),
                pattern: GlobPattern::new(pattern)?,
            });
        }

        Ok(Atom::Bare(GlobPattern::new(token)?))
    }

    /// Evaluate the atom against a snapshot
    pub fn matches(&self, snapshot: &AttributeSnapshot) -> bool {
        match self {
            Atom::Namespaced {
                source,
                key,
                pattern,
            } => match snapshot.get(*source, key) {
                Some(value) => scalar_strings(value)
                    .iter()
                    .any(|candidate| pattern.is_match(candidate)),
                None => false,
            },
            Atom::Bare(pattern) => snapshot.id().map_or(false, |id| pattern.is_match(id)),
        }
    }
}

/// A parsed compound expression; all atoms must match
#[derive(Debug, Clone, PartialEq)]
pub struct MatchExpression {
    source: String,
    atoms: Vec<Atom>,
}

impl MatchExpression {
    /// Parse an expression
    pub fn parse(expression: &str) -> Result<Self> {
        let mut atoms = Vec::new();

        for token in expression.split_whitespace() {
            match token {
                "and" => continue,
                "or" | "not" => {
                    return Err(Error::Config(format!(
                        "Operator '{}' is not supported in match expression {:?}",
                        token, expression
                    )))
                }
                t if t.starts_with('(') || t.ends_with(')') => {
                    return Err(Error::Config(format!(
                        "Grouping is not supported in match expression {:?}",
                        expression
                    )))
                }
                t => atoms.push(Atom::parse(t)?),
            }
        }

        if atoms.is_empty() {
            return Err(Error::Config(format!(
                "Match expression {:?} has no atoms",
                expression
            )));
        }

        Ok(Self {
            source: expression.to_string(),
            atoms,
        })
    }

    /// Whether every atom holds for the snapshot
    pub fn matches(&self, snapshot: &AttributeSnapshot) -> bool {
        self.atoms.iter().all(|atom| atom.matches(snapshot))
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Evaluate a parsed expression against a snapshot
pub fn matches(expression: &MatchExpression, snapshot: &AttributeSnapshot) -> bool {
    expression.matches(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> AttributeSnapshot {
        AttributeSnapshot::new()
            .with_grain("id", "web1")
            .with_grain("os", "Ubuntu")
            .with_grain("osrelease", "22.04")
            .with_grain("roles", json!(["nginx", "app"]))
            .with_grain("ip_gw", json!(true))
            .with_grain("cpu", json!({"arch": "x86_64"}))
            .with_pillar("env", "prod")
    }

    fn eval(expr: &str) -> bool {
        MatchExpression::parse(expr).unwrap().matches(&snapshot())
    }

    #[test]
    fn test_bare_glob_matches_id() {
        assert!(eval("web*"));
        assert!(eval("*"));
        assert!(!eval("db*"));
        assert!(!MatchExpression::parse("*")
            .unwrap()
            .matches(&AttributeSnapshot::new()));
    }

    #[test]
    fn test_grain_atoms() {
        assert!(eval("G@os:Ubuntu"));
        assert!(!eval("G@os:ubuntu"));
        assert!(eval("G@osrelease:22.*"));
        assert!(eval("G@roles:app"));
        assert!(eval("G@ip_gw:true"));
        assert!(eval("G@cpu.arch:x86_*"));
        assert!(!eval("G@cpu:*"));
        assert!(!eval("G@missing:*"));
    }

    #[test]
    fn test_pillar_atom_and_conjunction() {
        assert!(eval("I@env:prod"));
        assert!(eval("G@os:Ubuntu and web*"));
        assert!(eval("G@os:Ubuntu I@env:prod"));
        assert!(!eval("G@os:Ubuntu and I@env:dev"));
    }

    #[test]
    fn test_pattern_may_contain_colons() {
        let snap = AttributeSnapshot::new().with_grain("mac", "aa:bb:cc");
        let expr = MatchExpression::parse("G@mac:aa:*").unwrap();
        assert!(expr.matches(&snap));
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        for bad in ["web* or db*", "not web*", "( web* )", "P@os:Ubuntu", "G@os", "", "  "] {
            let err = MatchExpression::parse(bad).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR", "expression {:?}", bad);
        }
    }
}
