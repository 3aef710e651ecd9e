//! Queue snapshot
//!
//! Cache entries, the three queues and the watermark are written as one
//! checksummed file so a restarted coordinator picks up where it stopped.
//! Pending pull requests are not persisted; their callers are gone after a
//! restart anyway.

use crate::cache::CacheEntry;
use crate::queue::{CommitItem, DeleteItem, MoveItem};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_common::{Result, Timestamp, persist};
use tracing::info;

/// Magic number for queue snapshots
pub const SNAPSHOT_MAGIC: u32 = 0x5354_5251; // "STRQ"

/// Persisted coordinator state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub cached_files: Vec<CacheEntry>,
    pub cached_size: u64,
    pub file_commit_queue: Vec<CommitItem>,
    pub file_delete_queue: Vec<DeleteItem>,
    pub file_move_queue: Vec<MoveItem>,
    pub file_commit_queue_minimum_time: Timestamp,
}

impl QueueSnapshot {
    /// Load a snapshot; `Ok(None)` when none has been written yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let snapshot: Option<Self> = persist::read_file(path, SNAPSHOT_MAGIC)?;
        if let Some(s) = &snapshot {
            info!(
                "Loaded queue snapshot from {}: {} cached, {} commits, {} deletes, {} moves",
                path.display(),
                s.cached_files.len(),
                s.file_commit_queue.len(),
                s.file_delete_queue.len(),
                s.file_move_queue.len()
            );
        }
        Ok(snapshot)
    }

    /// Atomically replace the snapshot at `path`
    pub fn save(&self, path: &Path) -> Result<u64> {
        persist::write_file(path, SNAPSHOT_MAGIC, self)
    }

    /// Largest timestamp recorded anywhere in the snapshot
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        let cached = self.cached_files.iter().map(|e| e.timestamp);
        let commits = self.file_commit_queue.iter().map(|c| c.timestamp);
        let deletes = self.file_delete_queue.iter().map(|d| d.timestamp);
        let moves = self.file_move_queue.iter().map(|m| m.timestamp);

        cached
            .chain(commits)
            .chain(deletes)
            .chain(moves)
            .fold(self.file_commit_queue_minimum_time, Timestamp::max)
    }
}
