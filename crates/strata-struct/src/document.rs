//! Self-describing document values
//!
//! `Document` is the payload type for structs and journal revisions. Maps are
//! ordered so that two equal documents always encode, and therefore hash, to
//! the same bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use strata_common::{Error, Result};

/// A dynamically shaped value
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Document {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Document>),
    Map(BTreeMap<String, Document>),
}

impl Document {
    /// Empty map
    #[must_use]
    pub fn map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Build a map from key/value pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Document>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Document>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Child of a map by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Value at a key path; the empty path is the document itself
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Document> {
        let mut current = self;
        for key in path {
            current = current.get(key.as_ref())?;
        }
        Some(current)
    }

    /// Replace the value at a key path
    ///
    /// Missing or non-map intermediate values become empty maps. An empty
    /// path replaces the whole document.
    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: Document) {
        let Some((last, parents)) = path.split_last() else {
            *self = value;
            return;
        };

        let mut current = self;
        for key in parents {
            current = current
                .ensure_map()
                .entry(key.as_ref().to_string())
                .or_insert_with(Document::map);
        }

        current.ensure_map().insert(last.as_ref().to_string(), value);
    }

    fn ensure_map(&mut self) -> &mut BTreeMap<String, Document> {
        if !matches!(self, Self::Map(_)) {
            *self = Self::map();
        }

        match self {
            Self::Map(map) => map,
            _ => unreachable!("document was just replaced by a map"),
        }
    }

    /// Lowercase hex SHA-256 of the canonical encoding
    pub fn content_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        bincode::serialize_into(&mut hasher, self)
            .map_err(|e| Error::Serialization(format!("failed to hash document: {e}")))?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Values that can absorb a partial update
pub trait MergeValue {
    /// Shallow-merge `update` into `self`
    fn merge_from(&mut self, update: Self);
}

impl MergeValue for Document {
    fn merge_from(&mut self, update: Self) {
        match (self, update) {
            (Self::Map(existing), Self::Map(fields)) => existing.extend(fields),
            (this, other) => *this = other,
        }
    }
}

impl From<bool> for Document {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Document {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Document {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Document {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Document {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Document {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Document>> for Document {
    fn from(v: Vec<Document>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Document>> for Document {
    fn from(v: BTreeMap<String, Document>) -> Self {
        Self::Map(v)
    }
}
