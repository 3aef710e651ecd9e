//! Filesystem collaborator
//!
//! The coordinator never touches the disk directly; it goes through a
//! [`FileSystem`] so tests and alternative backends can swap it out.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use strata_common::{Error, FileType, ListingEntry, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Type and size of an object on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
}

/// Async filesystem operations used by the bucket layer
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Whether anything exists at `path`
    async fn exists(&self, path: &Path) -> bool;

    async fn stat(&self, path: &Path) -> Result<FileStat>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Bytes `[start, end)` of a file; `end` is clamped to the file size
    async fn read_range(&self, path: &Path, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Write a whole file, creating parent directories
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Remove a file or an empty directory
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Remove a file or a directory with everything below it
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Rename, creating the destination's parent directories
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Children of a directory, sorted by name
    async fn list_dir(&self, path: &Path) -> Result<Vec<ListingEntry>>;
}

/// [`FileSystem`] backed by `tokio::fs`
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

fn io_error(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(path.display().to_string())
    } else {
        Error::Io(e)
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;

        Ok(if meta.is_dir() {
            FileStat {
                file_type: FileType::Folder,
                size: 0,
            }
        } else {
            FileStat {
                file_type: FileType::File,
                size: meta.len(),
            }
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| io_error(path, e))
    }

    async fn read_range(&self, path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let size = file.metadata().await.map_err(|e| io_error(path, e))?.len();

        let end = end.min(size);
        if start >= end {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity(usize::try_from(end - start).unwrap_or(0));
        file.take(end - start).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;

        let result = if meta.is_dir() {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(|e| io_error(path, e))
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;

        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(|e| io_error(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        ensure_parent(to).await?;
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| io_error(from, e))
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<ListingEntry>> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| io_error(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let file_type = if entry.file_type().await?.is_dir() {
                FileType::Folder
            } else {
                FileType::File
            };
            entries.push(ListingEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                file_type,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
