//! Strata Struct - persisted document structures
//!
//! Building blocks for objects stored in buckets:
//! - [`Document`]: ordered, hashable dynamic value
//! - [`Struct`]: load/save/size on top of checksummed struct files
//! - [`IndexedTree`]: append-only arena binary search tree
//! - [`RevisionJournal`]: document with a replayable, hash-verified history

pub mod document;
pub mod journal;
pub mod store;
pub mod tree;

pub use document::{Document, MergeValue};
pub use journal::{Revision, RevisionJournal};
pub use store::{DocumentStruct, Struct, StructFile};
pub use tree::{IndexedTree, KeyComparator, Lookup, NaturalOrder};
