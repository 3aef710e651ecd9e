//! File management
//!
//! Entry point for everything that stores objects in buckets. Writes land on
//! the local disk and are admitted to the cache, which queues them for the
//! storage nodes; reads go through `request_file` so a miss is pulled back.
//! Buckets configured as no-cache are plain local directories and never
//! reach the queues.

use crate::coordinator::BucketCoordinator;
use crate::request::{ProgressCallback, RequestProgress, RequestState};
use std::collections::HashSet;
use std::path::PathBuf;
use strata_common::{BucketPath, Config, Error, FileType, ListingEntry, Result, persist};
use strata_struct::Struct;
use strata_struct::store::STRUCT_MAGIC;
use tracing::debug;

/// Bucket file operations on top of a [`BucketCoordinator`]
#[derive(Clone)]
pub struct FileManager {
    coordinator: BucketCoordinator,
    no_cache: HashSet<String>,
}

impl FileManager {
    pub fn new<I, S>(coordinator: BucketCoordinator, no_cache: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            coordinator,
            no_cache: no_cache.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(coordinator: BucketCoordinator, config: &Config) -> Self {
        Self::new(coordinator, config.buckets.no_cache.iter().cloned())
    }

    #[must_use]
    pub const fn coordinator(&self) -> &BucketCoordinator {
        &self.coordinator
    }

    /// Whether objects of this bucket go through the cache
    #[must_use]
    pub fn should_cache(&self, path: &BucketPath) -> bool {
        !self.no_cache.contains(path.bucket())
    }

    fn local(&self, path: &BucketPath) -> Result<PathBuf> {
        self.coordinator.resolve_path(path)
    }

    pub async fn save_file(&self, path: &BucketPath, data: &[u8]) -> Result<()> {
        let local = self.local(path)?;
        self.coordinator
            .file_system()
            .write(&local, data)
            .await
            .map_err(|e| e.for_object(path))?;
        debug!("Saved {} ({} bytes)", path, data.len());

        if self.should_cache(path) {
            self.coordinator
                .admit(path.clone(), FileType::File, data.len() as u64)
                .await;
        }
        Ok(())
    }

    /// Store a struct's data as a struct file; returns the encoded size
    pub async fn save_struct<S: Struct>(&self, path: &BucketPath, value: &S) -> Result<u64> {
        let bytes = persist::encode(STRUCT_MAGIC, &value.file().data)?;
        self.save_file(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    pub async fn load_file(&self, path: &BucketPath) -> Result<Vec<u8>> {
        if !self.should_cache(path) {
            let local = self.local(path)?;
            return self
                .coordinator
                .file_system()
                .read(&local)
                .await
                .map_err(|e| e.for_object(path));
        }

        let object = self.coordinator.request_file(path, None).await?;
        if object.file_type.is_folder() {
            return Err(Error::invalid_path(format!("{path} is a folder")));
        }
        Ok(object.data)
    }

    /// Load the data of a struct file written by [`Self::save_struct`]
    pub async fn load_struct<S: Struct>(&self, path: &BucketPath) -> Result<S::Data> {
        let bytes = self.load_file(path).await?;
        persist::decode(STRUCT_MAGIC, &bytes)
    }

    /// Type of the object at `path`
    ///
    /// A miss asks the storage nodes but stops the transfer as soon as they
    /// report what the object is.
    pub async fn check_exists(&self, path: &BucketPath) -> Result<FileType> {
        if !self.should_cache(path) {
            let local = self.local(path)?;
            let stat = self
                .coordinator
                .file_system()
                .stat(&local)
                .await
                .map_err(|e| e.for_object(path))?;
            return Ok(stat.file_type);
        }

        let stop_early: ProgressCallback =
            Box::new(|progress: &RequestProgress| progress.state != RequestState::Unfulfilled);
        let object = self.coordinator.request_file(path, Some(stop_early)).await?;
        Ok(object.file_type)
    }

    /// Create a folder and every missing parent
    pub async fn create_folder(&self, path: &BucketPath) -> Result<()> {
        let local = self.local(path)?;
        self.coordinator.file_system().create_dir_all(&local).await?;

        if self.should_cache(path) {
            for level in path.ancestors_inclusive() {
                self.coordinator.admit(level, FileType::Folder, 0).await;
            }
        }
        Ok(())
    }

    pub async fn list_folder(&self, path: &BucketPath) -> Result<Vec<ListingEntry>> {
        if !self.should_cache(path) {
            let local = self.local(path)?;
            return self
                .coordinator
                .file_system()
                .list_dir(&local)
                .await
                .map_err(|e| e.for_object(path));
        }

        let object = self.coordinator.request_file(path, None).await?;
        object
            .listing
            .ok_or_else(|| Error::invalid_path(format!("{path} is not a folder")))
    }

    /// Delete an object locally and on the storage nodes
    ///
    /// A cached bucket queues the delete even when there is no local copy,
    /// since the storage nodes may still hold one. Deleting a folder takes
    /// everything below it out of the cache and the commit queue.
    pub async fn delete_file(&self, path: &BucketPath) -> Result<()> {
        let fs = self.coordinator.file_system();
        let local = self.local(path)?;
        let caching = self.should_cache(path);

        let size = match fs.stat(&local).await {
            Ok(stat) => {
                fs.remove_all(&local).await?;
                stat.size
            }
            Err(e) if caching && e.is_not_found() => 0,
            Err(e) => return Err(e.for_object(path)),
        };

        if caching {
            self.coordinator.remove(path, size);
        }
        debug!("Deleted {}", path);
        Ok(())
    }

    /// Rename an object locally and on the storage nodes
    ///
    /// Cache entries and pending commits below a moved folder follow it.
    pub async fn move_file(&self, path: &BucketPath, new_path: &BucketPath) -> Result<()> {
        let caching = self.should_cache(path);
        if caching != self.should_cache(new_path) {
            return Err(Error::invalid_path(format!(
                "cannot move {path} to {new_path} across cached and uncached buckets"
            )));
        }

        let from = self.local(path)?;
        let to = self.local(new_path)?;
        match self.coordinator.file_system().rename(&from, &to).await {
            Ok(()) => {}
            Err(e) if caching && e.is_not_found() => {}
            Err(e) => return Err(e.for_object(path)),
        }

        if caching {
            self.coordinator.move_object(path, new_path);
        }
        debug!("Moved {} to {}", path, new_path);
        Ok(())
    }
}
