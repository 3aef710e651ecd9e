//! Synchronization queues
//!
//! Storage nodes learn what to do from three queues (commit, delete, move)
//! plus the pending pull requests, merged into one feed ordered by
//! timestamp. Queue items are addressed by their exact timestamp; a lookup
//! that misses means another storage node already finished the work, so it
//! yields [`Resolution::Stale`] instead of an error.

use serde::{Deserialize, Serialize};
use strata_common::{BucketPath, FileType, Timestamp};
use tracing::debug;

/// Durable copy requested for a cached object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitItem {
    pub path: BucketPath,
    pub file_type: FileType,
    pub size: u64,
    pub timestamp: Timestamp,
    pub already_committed_once: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteItem {
    pub path: BucketPath,
    pub size: u64,
    pub timestamp: Timestamp,
    pub already_committed_once: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveItem {
    pub path: BucketPath,
    pub new_path: BucketPath,
    pub timestamp: Timestamp,
    pub already_committed_once: bool,
}

/// Outcome of a timestamp-keyed operation
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Resolution<T> {
    Applied(T),
    /// The target was already retired, resolved or advanced elsewhere
    Stale,
}

impl<T> Resolution<T> {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Stale => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Applied(value) => Resolution::Applied(f(value)),
            Self::Stale => Resolution::Stale,
        }
    }
}

/// One entry of the merged feed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum QueueItem {
    Commit {
        path: BucketPath,
        file_type: FileType,
        size: u64,
        timestamp: Timestamp,
    },
    Delete {
        path: BucketPath,
        size: u64,
        timestamp: Timestamp,
    },
    Move {
        path: BucketPath,
        new_path: BucketPath,
        timestamp: Timestamp,
    },
    Request {
        path: BucketPath,
        timestamp: Timestamp,
        initialised: bool,
        bytes_transferred: u64,
    },
}

impl QueueItem {
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        match self {
            Self::Commit { timestamp, .. }
            | Self::Delete { timestamp, .. }
            | Self::Move { timestamp, .. }
            | Self::Request { timestamp, .. } => *timestamp,
        }
    }

    #[must_use]
    pub const fn path(&self) -> &BucketPath {
        match self {
            Self::Commit { path, .. }
            | Self::Delete { path, .. }
            | Self::Move { path, .. }
            | Self::Request { path, .. } => path,
        }
    }
}

/// Feed served to storage nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedQueue {
    /// Newest retired timestamp
    pub min_timestamp: Timestamp,
    pub items: Vec<QueueItem>,
}

/// Commit, delete and move queues plus the retirement watermark
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncQueues {
    commits: Vec<CommitItem>,
    deletes: Vec<DeleteItem>,
    moves: Vec<MoveItem>,
    min_timestamp: Timestamp,
}

impl SyncQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild queues from persisted parts
    #[must_use]
    pub const fn restore(
        commits: Vec<CommitItem>,
        deletes: Vec<DeleteItem>,
        moves: Vec<MoveItem>,
        min_timestamp: Timestamp,
    ) -> Self {
        Self {
            commits,
            deletes,
            moves,
            min_timestamp,
        }
    }

    #[must_use]
    pub fn commits(&self) -> &[CommitItem] {
        &self.commits
    }

    #[must_use]
    pub fn deletes(&self) -> &[DeleteItem] {
        &self.deletes
    }

    #[must_use]
    pub fn moves(&self) -> &[MoveItem] {
        &self.moves
    }

    /// Watermark: newest timestamp retired from any queue
    #[must_use]
    pub const fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    /// Largest timestamp held by any queue
    #[must_use]
    pub fn max_timestamp(&self) -> Timestamp {
        let commits = self.commits.iter().map(|c| c.timestamp);
        let deletes = self.deletes.iter().map(|d| d.timestamp);
        let moves = self.moves.iter().map(|m| m.timestamp);

        commits
            .chain(deletes)
            .chain(moves)
            .fold(self.min_timestamp, Timestamp::max)
    }

    /// Queue a commit, superseding any earlier commit of the same path
    pub fn enqueue_commit(
        &mut self,
        path: BucketPath,
        file_type: FileType,
        size: u64,
        timestamp: Timestamp,
    ) {
        self.commits.retain(|c| c.path != path);
        debug!("Queued commit of {} at {}", path, timestamp);
        self.commits.push(CommitItem {
            path,
            file_type,
            size,
            timestamp,
            already_committed_once: false,
        });
    }

    /// Queue a delete; pending commits of the path and anything below it are dropped
    pub fn enqueue_delete(&mut self, path: BucketPath, size: u64, timestamp: Timestamp) {
        self.commits.retain(|c| !c.path.starts_with(&path));
        debug!("Queued delete of {} at {}", path, timestamp);
        self.deletes.push(DeleteItem {
            path,
            size,
            timestamp,
            already_committed_once: false,
        });
    }

    /// Queue a move; uncommitted commits follow the object to `new_path`
    ///
    /// Moving a folder carries the commits of everything below it along.
    pub fn enqueue_move(&mut self, path: BucketPath, new_path: BucketPath, timestamp: Timestamp) {
        let pending = |c: &CommitItem| c.path.starts_with(&path) && !c.already_committed_once;
        if self.commits.iter().any(pending) {
            self.commits
                .retain(|c| pending(c) || !c.path.starts_with(&new_path));
            for commit in self.commits.iter_mut().filter(|c| pending(c)) {
                if let Some(rebased) = commit.path.rebase(&path, &new_path) {
                    commit.path = rebased;
                }
            }
        }

        debug!("Queued move of {} to {} at {}", path, new_path, timestamp);
        self.moves.push(MoveItem {
            path,
            new_path,
            timestamp,
            already_committed_once: false,
        });
    }

    /// Commit item with exactly this timestamp
    #[must_use]
    pub fn commit_at(&self, timestamp: Timestamp) -> Option<&CommitItem> {
        self.commits.iter().find(|c| c.timestamp == timestamp)
    }

    /// Record that a storage node holds the committed object
    pub fn mark_commit(&mut self, timestamp: Timestamp) -> Resolution<()> {
        match self.commits.iter_mut().find(|c| c.timestamp == timestamp) {
            Some(item) => {
                item.already_committed_once = true;
                Resolution::Applied(())
            }
            None => Resolution::Stale,
        }
    }

    pub fn mark_delete(&mut self, timestamp: Timestamp) -> Resolution<()> {
        match self.deletes.iter_mut().find(|d| d.timestamp == timestamp) {
            Some(item) => {
                item.already_committed_once = true;
                Resolution::Applied(())
            }
            None => Resolution::Stale,
        }
    }

    pub fn mark_move(&mut self, timestamp: Timestamp) -> Resolution<()> {
        match self.moves.iter_mut().find(|m| m.timestamp == timestamp) {
            Some(item) => {
                item.already_committed_once = true;
                Resolution::Applied(())
            }
            None => Resolution::Stale,
        }
    }

    /// Retire confirmed items older than `now - grace`
    ///
    /// Returns the retired commit items; their local copies may now go.
    pub fn sweep(&mut self, now: Timestamp, grace: u64) -> Vec<CommitItem> {
        let cutoff = Timestamp(now.ticks().saturating_sub(grace));
        let expired = |done: bool, ts: Timestamp| done && ts < cutoff;
        let mut newest = self.min_timestamp;

        let mut retired = Vec::new();
        self.commits.retain(|c| {
            if expired(c.already_committed_once, c.timestamp) {
                newest = newest.max(c.timestamp);
                retired.push(c.clone());
                false
            } else {
                true
            }
        });

        self.deletes.retain(|d| {
            let keep = !expired(d.already_committed_once, d.timestamp);
            if !keep {
                newest = newest.max(d.timestamp);
            }
            keep
        });

        self.moves.retain(|m| {
            let keep = !expired(m.already_committed_once, m.timestamp);
            if !keep {
                newest = newest.max(m.timestamp);
            }
            keep
        });

        if newest > self.min_timestamp {
            debug!("Queue watermark advanced to {}", newest);
            self.min_timestamp = newest;
        }

        retired
    }

    /// Merge the queues and `requests` into a feed sorted by timestamp
    ///
    /// Commits for which `exists_locally` is false are left out: there is
    /// nothing to copy until the object is written again.
    pub fn merge(
        &self,
        exists_locally: impl Fn(&CommitItem) -> bool,
        requests: impl IntoIterator<Item = QueueItem>,
    ) -> MergedQueue {
        let commits = self
            .commits
            .iter()
            .filter(|c| exists_locally(c))
            .map(|c| QueueItem::Commit {
                path: c.path.clone(),
                file_type: c.file_type,
                size: c.size,
                timestamp: c.timestamp,
            });

        let deletes = self.deletes.iter().map(|d| QueueItem::Delete {
            path: d.path.clone(),
            size: d.size,
            timestamp: d.timestamp,
        });

        let moves = self.moves.iter().map(|m| QueueItem::Move {
            path: m.path.clone(),
            new_path: m.new_path.clone(),
            timestamp: m.timestamp,
        });

        let mut items: Vec<QueueItem> = commits.chain(deletes).chain(moves).chain(requests).collect();
        items.sort_by_key(QueueItem::timestamp);

        MergedQueue {
            min_timestamp: self.min_timestamp,
            items,
        }
    }
}
