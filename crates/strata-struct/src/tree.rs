//! Array-backed binary search tree
//!
//! Nodes live in an append-only vector and link to their children by index.
//! The tree never rebalances and never reclaims slots, so lookups are
//! O(log n) only for keys inserted in a reasonably random order.

use crate::document::MergeValue;
use crate::store::{Struct, StructFile};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::path::PathBuf;
use strata_common::{Error, Result};

/// Three-way key ordering
pub trait KeyComparator<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

impl<K, F> KeyComparator<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}

/// Which child link of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Less,
    Greater,
}

/// Result of walking the tree for a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Key is stored at `index`
    Found { index: usize },
    /// Key is absent; a new node would hang off `parent` (`None` for an empty tree)
    Vacant { parent: Option<(usize, Side)> },
}

impl Lookup {
    #[must_use]
    pub const fn exists(&self) -> bool {
        matches!(self, Self::Found { .. })
    }
}

/// One node of the tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode<K, V> {
    pub key: K,
    pub value: V,
    pub less: Option<usize>,
    pub greater: Option<usize>,
}

/// Persisted tree layout
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeData<K, V> {
    pub nodes: Vec<TreeNode<K, V>>,
    pub root_node_index: Option<usize>,
}

impl<K, V> Default for TreeData<K, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root_node_index: None,
        }
    }
}

/// Key/value store backed by an index-linked BST
pub struct IndexedTree<K, V, C = NaturalOrder> {
    file: StructFile<TreeData<K, V>>,
    comparator: C,
}

impl<K, V> IndexedTree<K, V, NaturalOrder> {
    /// Empty tree ordered by `K: Ord`
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_comparator(path, NaturalOrder)
    }
}

impl<K, V, C> IndexedTree<K, V, C> {
    /// Empty tree with a custom key ordering
    pub fn with_comparator(path: Option<PathBuf>, comparator: C) -> Self {
        Self {
            file: StructFile::new(path),
            comparator,
        }
    }

    /// Number of stored nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.file.data.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file.data.nodes.is_empty()
    }

    /// Node at an arena index
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&TreeNode<K, V>> {
        self.file.data.nodes.get(index)
    }

    /// In-order traversal
    pub fn iter(&self) -> InOrder<'_, K, V> {
        InOrder {
            nodes: &self.file.data.nodes,
            stack: Vec::new(),
            next: self.file.data.root_node_index,
        }
    }
}

impl<K, V, C: KeyComparator<K>> IndexedTree<K, V, C> {
    /// Walk from the root towards `key`; counts as an access
    pub fn find(&self, key: &K) -> Lookup {
        self.file.touch();
        let nodes = &self.file.data.nodes;
        let mut parent = None;
        let mut current = self.file.data.root_node_index;

        while let Some(index) = current {
            let Some(node) = nodes.get(index) else {
                break;
            };

            match self.comparator.compare(key, &node.key) {
                Ordering::Less => {
                    parent = Some((index, Side::Less));
                    current = node.less;
                }
                Ordering::Greater => {
                    parent = Some((index, Side::Greater));
                    current = node.greater;
                }
                Ordering::Equal => return Lookup::Found { index },
            }
        }

        Lookup::Vacant { parent }
    }

    /// Value stored under `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        match self.find(key) {
            Lookup::Found { index } => Some(&self.file.data.nodes[index].value),
            Lookup::Vacant { .. } => None,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).exists()
    }

    /// Insert a new key, failing if it is already present
    pub fn insert(&mut self, key: K, value: V) -> Result<usize>
    where
        K: Debug,
    {
        match self.find(&key) {
            Lookup::Found { .. } => Err(Error::AlreadyExists(format!("tree key {key:?}"))),
            Lookup::Vacant { parent } => Ok(self.link(parent, key, value)),
        }
    }

    /// Change the value under an existing key
    ///
    /// With `merge` the update is merged into the stored value, otherwise it
    /// replaces it.
    pub fn update(&mut self, key: &K, value: V, merge: bool) -> Result<usize>
    where
        K: Debug,
        V: MergeValue,
    {
        match self.find(key) {
            Lookup::Found { index } => {
                self.set_value(index, value, merge);
                Ok(index)
            }
            Lookup::Vacant { .. } => Err(Error::NotExists(format!("tree key {key:?}"))),
        }
    }

    /// Update the key if present, insert it otherwise
    pub fn upsert(&mut self, key: K, value: V, merge: bool) -> usize
    where
        V: MergeValue,
    {
        match self.find(&key) {
            Lookup::Found { index } => {
                self.set_value(index, value, merge);
                index
            }
            Lookup::Vacant { parent } => self.link(parent, key, value),
        }
    }

    fn set_value(&mut self, index: usize, value: V, merge: bool)
    where
        V: MergeValue,
    {
        let slot = &mut self.file.data.nodes[index].value;
        if merge {
            slot.merge_from(value);
        } else {
            *slot = value;
        }
        self.file.mark_dirty();
    }

    fn link(&mut self, parent: Option<(usize, Side)>, key: K, value: V) -> usize {
        let data = &mut self.file.data;
        let index = data.nodes.len();

        data.nodes.push(TreeNode {
            key,
            value,
            less: None,
            greater: None,
        });

        match parent {
            None => data.root_node_index = Some(index),
            Some((p, Side::Less)) => data.nodes[p].less = Some(index),
            Some((p, Side::Greater)) => data.nodes[p].greater = Some(index),
        }

        self.file.mark_dirty();
        index
    }
}

impl<K, V, C> Struct for IndexedTree<K, V, C>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    type Data = TreeData<K, V>;

    fn file(&self) -> &StructFile<Self::Data> {
        &self.file
    }

    fn file_mut(&mut self) -> &mut StructFile<Self::Data> {
        &mut self.file
    }
}

/// In-order iterator over `(key, value)` pairs
pub struct InOrder<'a, K, V> {
    nodes: &'a [TreeNode<K, V>],
    stack: Vec<usize>,
    next: Option<usize>,
}

impl<'a, K, V> Iterator for InOrder<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(index) = self.next {
            self.stack.push(index);
            self.next = self.nodes.get(index).and_then(|n| n.less);
        }

        let index = self.stack.pop()?;
        let node = self.nodes.get(index)?;
        self.next = node.greater;
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn test_insert_and_find() {
        let mut tree = IndexedTree::<u32, Document>::new(None);
        assert_eq!(tree.find(&5), Lookup::Vacant { parent: None });

        tree.insert(5, "five".into()).unwrap();
        tree.insert(3, "three".into()).unwrap();
        tree.insert(8, "eight".into()).unwrap();

        assert_eq!(tree.find(&5), Lookup::Found { index: 0 });
        assert_eq!(tree.get(&3), Some(&Document::from("three")));
        assert_eq!(tree.node(0).unwrap().less, Some(1));
        assert_eq!(tree.node(0).unwrap().greater, Some(2));
        assert_eq!(
            tree.find(&4),
            Lookup::Vacant {
                parent: Some((1, Side::Greater))
            }
        );
        assert!(tree.has_unsaved_changes());
    }

    #[test]
    fn test_lookup_records_access() {
        let mut tree = IndexedTree::<u32, Document>::new(None);
        tree.insert(1, Document::Null).unwrap();
        let written = tree.last_access();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(tree.get(&1).is_some());
        assert!(tree.last_access() > written);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut tree = IndexedTree::<u32, Document>::new(None);
        tree.insert(1, Document::Null).unwrap();
        let err = tree.insert(1, Document::Null).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_update_merges_node_value() {
        let mut tree = IndexedTree::<String, Document>::new(None);
        tree.insert("user".into(), Document::from_pairs([("name", "alice"), ("role", "admin")]))
            .unwrap();

        tree.update(&"user".into(), Document::from_pairs([("role", "owner")]), true)
            .unwrap();
        assert_eq!(
            tree.get(&"user".into()),
            Some(&Document::from_pairs([("name", "alice"), ("role", "owner")]))
        );

        tree.update(&"user".into(), Document::from_pairs([("role", "guest")]), false)
            .unwrap();
        assert_eq!(
            tree.get(&"user".into()),
            Some(&Document::from_pairs([("role", "guest")]))
        );
        // Links survive value updates
        assert_eq!(tree.find(&"user".into()), Lookup::Found { index: 0 });
    }

    #[test]
    fn test_update_missing_fails() {
        let mut tree = IndexedTree::<u32, Document>::new(None);
        let err = tree.update(&7, Document::Null, true).unwrap_err();
        assert!(matches!(err, Error::NotExists(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_upsert() {
        let mut tree = IndexedTree::<u32, Document>::new(None);
        let first = tree.upsert(2, Document::from_pairs([("a", 1i64)]), true);
        let again = tree.upsert(2, Document::from_pairs([("b", 2i64)]), true);
        tree.upsert(1, Document::Null, true);

        assert_eq!(first, again);
        assert_eq!(tree.len(), 2);
        assert_eq!(
            tree.get(&2),
            Some(&Document::from_pairs([("a", 1i64), ("b", 2i64)]))
        );
    }

    #[test]
    fn test_float_keys_with_comparator() {
        let mut tree = IndexedTree::with_comparator(None, |a: &f64, b: &f64| a.total_cmp(b));
        for k in [0.5, 0.25, 0.75, 0.1] {
            tree.insert(k, Document::from(k)).unwrap();
        }

        assert_eq!(tree.get(&0.75), Some(&Document::Float(0.75)));
        assert!(!tree.contains(&0.3));
        let keys: Vec<f64> = tree.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![0.1, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.tree");

        let mut tree = IndexedTree::<String, Document>::new(Some(path.clone()));
        tree.insert("b".into(), 2i64.into()).unwrap();
        tree.insert("a".into(), 1i64.into()).unwrap();
        tree.save_to_file().unwrap();

        let mut loaded = IndexedTree::<String, Document>::new(Some(path));
        loaded.load_from_file().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&"a".into()), Some(&Document::Int(1)));
        assert!(!loaded.has_unsaved_changes());
    }

    proptest! {
        #[test]
        fn prop_inserted_keys_are_found(keys in prop::collection::hash_set(any::<i32>(), 0..200), needle in any::<i32>()) {
            let keys: Vec<i32> = keys.into_iter().collect();
            let mut tree = IndexedTree::<i32, Document>::new(None);
            for k in &keys {
                tree.insert(*k, Document::Int(i64::from(*k) * 2)).unwrap();
            }

            for k in &keys {
                prop_assert_eq!(tree.get(k), Some(&Document::Int(i64::from(*k) * 2)));
            }

            let present: HashSet<i32> = keys.iter().copied().collect();
            if !present.contains(&needle) {
                prop_assert!(!tree.find(&needle).exists());
            }

            let ordered: Vec<i32> = tree.iter().map(|(k, _)| *k).collect();
            let mut expected = keys.clone();
            expected.sort_unstable();
            prop_assert_eq!(ordered, expected);
        }
    }
}
