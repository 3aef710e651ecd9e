//! Strata Bucket - local working set and storage node synchronization
//!
//! This crate provides:
//! - [`BucketCache`]: size-bounded FIFO of recently written objects
//! - [`SyncQueues`]: commit, delete and move queues with a retirement watermark
//! - [`FileRequest`]: chunked pull of objects that are not held locally
//! - [`BucketCoordinator`]: the shared state and the I/O it drives
//! - [`FileManager`]: bucket file operations for the rest of the system

pub mod cache;
pub mod coordinator;
pub mod filemgmt;
pub mod fs;
pub mod queue;
pub mod request;
pub mod resolver;
pub mod snapshot;

pub use cache::{BucketCache, CacheEntry, CacheStats};
pub use coordinator::{BucketCoordinator, CoordinatorSettings};
pub use filemgmt::FileManager;
pub use fs::{FileStat, FileSystem, LocalFs};
pub use queue::{
    CommitItem, DeleteItem, MergedQueue, MoveItem, QueueItem, Resolution, SyncQueues,
};
pub use request::{
    FetchedObject, FileRequest, ProgressCallback, RequestInfo, RequestProgress, RequestState,
    RequestTable,
};
pub use resolver::{PathResolver, SandboxResolver};
pub use snapshot::QueueSnapshot;
