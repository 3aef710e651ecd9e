//! Mapping symbolic bucket paths to filesystem locations

use std::path::{Path, PathBuf};
use strata_common::{BucketPath, Error, Result};

/// Resolves `bucket:relative` paths to real locations
pub trait PathResolver: Send + Sync {
    /// Real location of `path`; fails rather than point outside the bucket
    fn resolve(&self, path: &BucketPath) -> Result<PathBuf>;
}

/// Resolver rooted at a directory holding one subdirectory per bucket
///
/// Components that could climb out of the bucket (`..`, `.`, anything with a
/// backslash) are rejected instead of normalised away.
#[derive(Clone, Debug)]
pub struct SandboxResolver {
    root: PathBuf,
}

impl SandboxResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathResolver for SandboxResolver {
    fn resolve(&self, path: &BucketPath) -> Result<PathBuf> {
        let mut resolved = self.root.join(path.bucket());

        for component in path.components() {
            if component == ".." || component == "." || component.contains('\\') {
                return Err(Error::invalid_path(format!("{path} escapes its bucket")));
            }
            resolved.push(component);
        }

        Ok(resolved)
    }
}
