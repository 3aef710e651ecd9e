//! Core type definitions for Strata
//!
//! Objects are addressed by symbolic bucket paths of the form
//! `bucket:relative/path`. Mapping them to real filesystem locations is the
//! job of a path resolver; this module only deals with the symbolic form.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the bucket name and the relative path
pub const BUCKET_SEPARATOR: char = ':';

/// Kind of object held in a bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[display("file")]
    File,
    #[display("folder")]
    Folder,
}

impl FileType {
    /// Whether this object is a folder
    #[must_use]
    pub const fn is_folder(self) -> bool {
        matches!(self, Self::Folder)
    }
}

/// One child of a folder listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub name: String,
    pub file_type: FileType,
}

impl ListingEntry {
    pub fn new(name: impl Into<String>, file_type: FileType) -> Self {
        Self {
            name: name.into(),
            file_type,
        }
    }
}

/// Symbolic object path (`bucket:relative/path`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketPath {
    bucket: String,
    relative: String,
}

impl BucketPath {
    /// Parse a symbolic path, normalising redundant slashes in the relative part
    pub fn parse(path: &str) -> Result<Self, BucketPathError> {
        let (bucket, relative) = path
            .split_once(BUCKET_SEPARATOR)
            .ok_or(BucketPathError::MissingSeparator)?;

        Self::validate_bucket(bucket)?;

        if relative.contains('\0') {
            return Err(BucketPathError::NulByte);
        }

        let relative = relative
            .split('/')
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            bucket: bucket.to_string(),
            relative,
        })
    }

    /// Bucket root (`bucket:`)
    pub fn root(bucket: &str) -> Result<Self, BucketPathError> {
        Self::validate_bucket(bucket)?;
        Ok(Self {
            bucket: bucket.to_string(),
            relative: String::new(),
        })
    }

    fn validate_bucket(bucket: &str) -> Result<(), BucketPathError> {
        if bucket.is_empty() {
            return Err(BucketPathError::EmptyBucket);
        }

        for c in bucket.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
                return Err(BucketPathError::InvalidBucketChar(c));
            }
        }

        Ok(())
    }

    /// Bucket name
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Path relative to the bucket root, without leading slash
    #[must_use]
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Whether this path names the bucket root itself
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// Relative path components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.relative.split('/').filter(|c| !c.is_empty())
    }

    /// Last component, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.components().last()
    }

    /// Parent path; `None` for the bucket root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        let relative = match self.relative.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };

        Some(Self {
            bucket: self.bucket.clone(),
            relative,
        })
    }

    /// Append a child component
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        let name = name.trim_matches('/');
        let relative = if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative, name)
        };

        Self {
            bucket: self.bucket.clone(),
            relative,
        }
    }

    /// Whether this path is `prefix` itself or lies below it
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        if self.bucket != prefix.bucket {
            return false;
        }
        if prefix.is_root() {
            return true;
        }

        match self.relative.strip_prefix(prefix.relative.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// This path with the leading `from` replaced by `to`; `None` if it is not under `from`
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }

        let rest = self.relative[from.relative.len()..].trim_start_matches('/');
        Some(if rest.is_empty() {
            to.clone()
        } else {
            to.join(rest)
        })
    }

    /// Every non-root prefix of this path, shortest first
    #[must_use]
    pub fn ancestors_inclusive(&self) -> Vec<Self> {
        let mut levels = Vec::new();
        let mut current = Self {
            bucket: self.bucket.clone(),
            relative: String::new(),
        };

        for component in self.components() {
            current = current.join(component);
            levels.push(current.clone());
        }

        levels
    }
}

impl fmt::Display for BucketPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.bucket, BUCKET_SEPARATOR, self.relative)
    }
}

impl fmt::Debug for BucketPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketPath({self})")
    }
}

impl std::str::FromStr for BucketPath {
    type Err = BucketPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BucketPath {
    type Error = BucketPathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BucketPath> for String {
    fn from(path: BucketPath) -> Self {
        path.to_string()
    }
}

/// Errors that can occur when parsing a bucket path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketPathError {
    #[error("path must have the form bucket:relative/path")]
    MissingSeparator,
    #[error("bucket name must not be empty")]
    EmptyBucket,
    #[error("invalid character in bucket name: {0:?}")]
    InvalidBucketChar(char),
    #[error("path must not contain NUL bytes")]
    NulByte,
}
