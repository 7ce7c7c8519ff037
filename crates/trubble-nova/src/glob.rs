//! Shell-style glob patterns used by match expressions and tag filters
//!
//! Supports `*`, `?`, bracket classes (`[abc]`, `[a-z]`, `[!abc]`) and
//! alternation (`{a,b}`). Matching is anchored and case-sensitive; an
//! unterminated `[` is a configuration error.

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use serde::{Serialize, Serializer};
use trubble_core::{Error, Result};

fn compile(pattern: &str) -> Result<Glob> {
    Glob::new(pattern).map_err(|e| Error::Config(format!("Invalid glob {:?}: {}", pattern, e)))
}

fn compile_globset(globs: &[Glob]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(glob.clone());
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("Invalid tag filter: {}", e)))
}

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    glob: Glob,
    matcher: GlobMatcher,
}

impl GlobPattern {
    /// Compile a glob
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = compile(pattern)?;
        let matcher = glob.compile_matcher();
        Ok(Self { glob, matcher })
    }

    /// Whether `candidate` matches the whole pattern
    pub fn is_match(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        self.glob.glob()
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.glob == other.glob
    }
}

impl Eq for GlobPattern {}

impl std::fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for GlobPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One or more tag globs; a check passes when any of its tags matches any glob
#[derive(Debug, Clone)]
pub struct TagFilter {
    globs: Vec<Glob>,
    set: GlobSet,
}

impl TagFilter {
    fn from_globs(globs: Vec<Glob>) -> Result<Self> {
        let set = compile_globset(&globs)?;
        Ok(Self { globs, set })
    }

    /// Filter from a single glob
    pub fn parse(pattern: &str) -> Result<Self> {
        Self::from_globs(vec![compile(pattern)?])
    }

    /// Filter from several globs
    pub fn parse_all<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::Config("Tag filter must name at least one glob".into()));
        }
        let globs = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_globs(globs)
    }

    /// Whether any tag matches any glob
    pub fn matches_any<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        tags.into_iter().any(|tag| self.set.is_match(tag))
    }

    /// Add the other filter's globs that are not already present
    pub fn union(&mut self, other: &TagFilter) {
        let before = self.globs.len();
        for glob in &other.globs {
            if !self.globs.contains(glob) {
                self.globs.push(glob.clone());
            }
        }
        if self.globs.len() == before {
            return;
        }
        // Globs already compiled once, so rebuilding the set cannot fail
        if let Ok(set) = compile_globset(&self.globs) {
            self.set = set;
        }
    }

    /// Globs as written
    pub fn patterns(&self) -> Vec<&str> {
        self.globs.iter().map(Glob::glob).collect()
    }
}

impl PartialEq for TagFilter {
    fn eq(&self, other: &Self) -> bool {
        self.globs == other.globs
    }
}

impl Eq for TagFilter {}

impl Serialize for TagFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("TagFilter", 1)?;
        state.serialize_field("patterns", &self.patterns())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::new(p).unwrap()
    }

    #[test]
    fn test_wildcards() {
        assert!(glob("web*").is_match("web1"));
        assert!(glob("web*").is_match("web"));
        assert!(!glob("web*").is_match("db-web1"));
        assert!(glob("db?").is_match("db1"));
        assert!(!glob("db?").is_match("db12"));
        assert!(glob("*").is_match(""));
    }

    #[test]
    fn test_character_classes() {
        assert!(glob("web[0-3]").is_match("web2"));
        assert!(!glob("web[0-3]").is_match("web7"));
        assert!(glob("web[!0-3]").is_match("web7"));
        assert!(glob("[]x]").is_match("]"));
        assert!(glob("[^a]").is_match("^"));
        assert!(GlobPattern::new("web[").is_err());
    }

    #[test]
    fn test_alternation() {
        assert!(glob("CIS-{1,2}*").is_match("CIS-2.1"));
        assert!(!glob("CIS-{1,2}*").is_match("CIS-3.1"));
    }

    #[test]
    fn test_case_sensitive_and_literal() {
        assert!(!glob("Debian").is_match("debian"));
        assert!(glob("CIS-2.1.4").is_match("CIS-2.1.4"));
        assert!(!glob("CIS-2.1.4").is_match("CIS-2x1x4"));
        assert!(!glob("deb").is_match("debian"));
    }

    #[test]
    fn test_tag_filter_union() {
        let mut filter = TagFilter::parse("CIS*").unwrap();
        filter.union(&TagFilter::parse_all(&["STIG*", "CIS*"]).unwrap());
        assert_eq!(filter.patterns(), vec!["CIS*", "STIG*"]);

        let tags = vec![String::from("STIG-V-1234")];
        assert!(filter.matches_any(&tags));
        assert!(!filter.matches_any(&Vec::<String>::new()));
        assert!(TagFilter::parse_all(&["CIS*", "bad["]).is_err());
    }
}
