//! Persisted structs
//!
//! A struct is a document with an optional backing file, a dirty flag and a
//! last-access time. Concrete structs (plain documents, indexed trees,
//! revision journals) wrap a [`StructFile`] and implement [`Struct`], which
//! provides loading, saving and sizing on top of it.

use crate::document::Document;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::persist;
use strata_common::{Result, Timestamp};
use tracing::debug;

/// Magic number for struct files
pub const STRUCT_MAGIC: u32 = 0x5354_5243; // "STRC"

/// Millisecond resolution is enough for access bookkeeping
const ACCESS_SUBDIVISIONS: u64 = 1;

/// Backing state shared by every struct
///
/// The access time is atomic so lookups through `&self` can record it.
#[derive(Debug)]
pub struct StructFile<D> {
    path: Option<PathBuf>,
    pub data: D,
    unsaved_changes: bool,
    last_access: AtomicU64,
}

impl<D: Clone> Clone for StructFile<D> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            data: self.data.clone(),
            unsaved_changes: self.unsaved_changes,
            last_access: AtomicU64::new(self.last_access.load(Ordering::Relaxed)),
        }
    }
}

impl<D: Default> StructFile<D> {
    /// New struct with default data, optionally bound to a file
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_data(path, D::default())
    }
}

impl<D> StructFile<D> {
    /// New struct with explicit initial data
    pub fn with_data(path: Option<PathBuf>, data: D) -> Self {
        Self {
            path,
            data,
            unsaved_changes: false,
            last_access: AtomicU64::new(Timestamp::now(ACCESS_SUBDIVISIONS).ticks()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn has_unsaved_changes(&self) -> bool {
        self.unsaved_changes
    }

    /// Last read or write, in wall-clock milliseconds
    #[must_use]
    pub fn last_access(&self) -> Timestamp {
        Timestamp(self.last_access.load(Ordering::Relaxed))
    }

    /// Record a read
    pub fn touch(&self) {
        self.last_access
            .store(Timestamp::now(ACCESS_SUBDIVISIONS).ticks(), Ordering::Relaxed);
    }

    /// Record a write
    pub fn mark_dirty(&mut self) {
        self.touch();
        self.unsaved_changes = true;
    }
}

/// Operations common to every persisted struct
pub trait Struct {
    /// Serialized payload
    type Data: Serialize + DeserializeOwned;

    fn file(&self) -> &StructFile<Self::Data>;

    fn file_mut(&mut self) -> &mut StructFile<Self::Data>;

    /// Called after data has been replaced from disk
    fn after_load(&mut self) {}

    /// Backing file, if any
    fn path(&self) -> Option<&Path> {
        self.file().path()
    }

    fn has_unsaved_changes(&self) -> bool {
        self.file().has_unsaved_changes()
    }

    fn last_access(&self) -> Timestamp {
        self.file().last_access()
    }

    /// Replace the in-memory data with the file contents
    ///
    /// A struct without a path, or whose file does not exist yet, keeps its
    /// current data.
    fn load_from_file(&mut self) -> Result<()> {
        let Some(path) = self.path().map(Path::to_path_buf) else {
            return Ok(());
        };

        if let Some(data) = persist::read_file(&path, STRUCT_MAGIC)? {
            let file = self.file_mut();
            file.data = data;
            file.unsaved_changes = false;
            file.touch();
            debug!("Loaded struct from {}", path.display());
            self.after_load();
        }

        Ok(())
    }

    /// Write the data to the backing file and clear the dirty flag
    fn save_to_file(&mut self) -> Result<()> {
        let Some(path) = self.path().map(Path::to_path_buf) else {
            return Ok(());
        };

        let written = persist::write_file(&path, STRUCT_MAGIC, &self.file().data)?;
        self.file_mut().unsaved_changes = false;
        debug!("Saved struct to {} ({} bytes)", path.display(), written);
        Ok(())
    }

    /// Size of the on-disk encoding in bytes
    fn size(&self) -> Result<u64> {
        persist::encoded_size(&self.file().data)
    }
}

/// A plain document struct
#[derive(Clone, Debug)]
pub struct DocumentStruct {
    file: StructFile<Document>,
}

impl DocumentStruct {
    /// Empty map document, optionally bound to a file
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            file: StructFile::with_data(path, Document::map()),
        }
    }

    /// Open a struct file, loading it if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut this = Self::new(Some(path.into()));
        this.load_from_file()?;
        Ok(this)
    }

    #[must_use]
    pub fn data(&self) -> &Document {
        &self.file.data
    }

    /// Mutable access; marks the struct dirty
    pub fn data_mut(&mut self) -> &mut Document {
        self.file.mark_dirty();
        &mut self.file.data
    }
}

impl Struct for DocumentStruct {
    type Data = Document;

    fn file(&self) -> &StructFile<Document> {
        &self.file
    }

    fn file_mut(&mut self) -> &mut StructFile<Document> {
        &mut self.file
    }
}
