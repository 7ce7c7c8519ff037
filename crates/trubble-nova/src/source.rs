//! Where topfiles and profile documents come from
//!
//! Profiles are addressed by dotted paths relative to the profile directory:
//! `cis.linux` is `<root>/<profile_dir>/cis/linux.yaml`. A dotted path that
//! names a directory stands for every profile beneath it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use trubble_core::{Error, Result};

const PROFILE_EXTENSION: &str = "yaml";

/// Read access to topfiles and profiles
pub trait ProfileSource: Send + Sync {
    /// Read a topfile; `Ok(None)` when it does not exist
    fn read_topfile(&self, path: &str) -> Result<Option<String>>;

    /// Read a profile document by dotted path
    fn read_profile(&self, profile: &str) -> Result<String>;

    /// Expand a dotted path naming a directory into the profiles beneath it
    ///
    /// A path that is not a directory is returned unchanged.
    fn expand(&self, profile: &str) -> Result<Vec<String>>;
}

/// Profile source over a local file root
#[derive(Debug, Clone)]
pub struct FsProfileSource {
    root: PathBuf,
    profile_dir: String,
}

impl FsProfileSource {
    pub fn new(root: impl Into<PathBuf>, profile_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            profile_dir: profile_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profile_base(&self) -> PathBuf {
        self.root.join(&self.profile_dir)
    }

    fn relative(profile: &str) -> PathBuf {
        let trimmed = profile
            .trim_end_matches(".yaml")
            .trim_matches(|c| c == '.' || c == '/');
        trimmed.split(['.', '/']).collect()
    }

    fn profile_file(&self, profile: &str) -> PathBuf {
        self.profile_base()
            .join(Self::relative(profile))
            .with_extension(PROFILE_EXTENSION)
    }
}

impl ProfileSource for FsProfileSource {
    fn read_topfile(&self, path: &str) -> Result<Option<String>> {
        let full = self.root.join(path);
        match fs::read_to_string(&full) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Topfile not found: {}", full.display());
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_profile(&self, profile: &str) -> Result<String> {
        let path = self.profile_file(profile);
        trace!("Reading profile {} from {}", profile, path.display());
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ProfileNotFound {
                path: profile.to_string(),
            },
            _ => Error::Io(e),
        })
    }

    fn expand(&self, profile: &str) -> Result<Vec<String>> {
        let dir = self.profile_base().join(Self::relative(profile));
        if !dir.is_dir() {
            return Ok(vec![profile.to_string()]);
        }

        let prefix = Self::relative(profile)
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        let mut found = Vec::new();
        collect_profiles(&dir, &prefix, &mut found)?;
        found.sort();
        debug!("Expanded {} into {} profiles", profile, found.len());
        Ok(found)
    }
}

fn collect_profiles(dir: &Path, prefix: &[String], found: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };

        if path.is_dir() {
            let mut nested = prefix.to_vec();
            nested.push(stem);
            collect_profiles(&path, &nested, found)?;
        } else if path.extension().map_or(false, |ext| ext == PROFILE_EXTENSION) {
            let mut parts = prefix.to_vec();
            parts.push(stem);
            found.push(parts.join("."));
        }
    }
    Ok(())
}
