//! Bucket coordinator
//!
//! Owns the cache, the synchronization queues and the pending requests, and
//! performs the file I/O their state changes call for. All state sits behind
//! one mutex that is never held across an `.await`: each operation takes the
//! lock, updates the state machines, releases it, and only then touches the
//! disk.

use crate::cache::{BucketCache, CacheEntry, CacheStats};
use crate::fs::{FileSystem, LocalFs};
use crate::queue::{CommitItem, MergedQueue, Resolution, SyncQueues};
use crate::request::{
    FetchedObject, FileRequest, ProgressCallback, RequestInfo, RequestOutcome, RequestProgress,
    RequestState, RequestStatus, RequestTable,
};
use crate::resolver::{PathResolver, SandboxResolver};
use crate::snapshot::QueueSnapshot;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{BucketPath, Config, Error, FileType, Result, Timestamp, TimestampGenerator};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Tunables of a coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Upper bound on bytes of cached files
    pub capacity: u64,
    /// How long a confirmed queue item lingers before retirement
    pub commit_grace: Duration,
    /// A request without byte progress for this long ends not found
    pub request_timeout: Duration,
    /// State check interval of request tasks
    pub poll_interval: Duration,
    /// Ticks per millisecond of the logical clock
    pub subdivisions: u64,
    /// Where the queue snapshot lives; `None` keeps state in memory only
    pub snapshot_path: Option<PathBuf>,
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.cache.max_bucket_cache_size,
            commit_grace: Duration::from_millis(config.cache.max_commit_queue_time_ms),
            request_timeout: config.request.timeout(),
            poll_interval: config.request.poll_interval(),
            subdivisions: config.timestamp.subdivisions,
            snapshot_path: Some(config.snapshot_path()),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            ..Self::from_config(&Config::default())
        }
    }
}

struct BucketState {
    cache: BucketCache,
    queues: SyncQueues,
    requests: RequestTable,
}

struct Inner {
    state: Mutex<BucketState>,
    clock: TimestampGenerator,
    settings: CoordinatorSettings,
    resolver: Arc<dyn PathResolver>,
    fs: Arc<dyn FileSystem>,
}

/// Shared handle to the bucket cache and its queues
#[derive(Clone)]
pub struct BucketCoordinator {
    inner: Arc<Inner>,
}

impl BucketCoordinator {
    /// Create a coordinator with empty state
    pub fn new(
        settings: CoordinatorSettings,
        resolver: Arc<dyn PathResolver>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let state = BucketState {
            cache: BucketCache::new(settings.capacity),
            queues: SyncQueues::new(),
            requests: RequestTable::new(),
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                clock: TimestampGenerator::new(settings.subdivisions),
                settings,
                resolver,
                fs,
            }),
        }
    }

    /// Coordinator over the local bucket directory, restored from its snapshot
    pub fn open(config: &Config) -> Result<Self> {
        let coordinator = Self::new(
            CoordinatorSettings::from_config(config),
            Arc::new(SandboxResolver::new(&config.buckets.root)),
            Arc::new(LocalFs),
        );

        if !coordinator.load()? {
            info!("No queue snapshot found, starting with an empty cache");
        }

        Ok(coordinator)
    }

    #[must_use]
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn clock(&self) -> &TimestampGenerator {
        &self.inner.clock
    }

    #[must_use]
    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.inner.fs
    }

    /// Real location of a bucket path
    pub fn resolve_path(&self, path: &BucketPath) -> Result<PathBuf> {
        self.inner.resolver.resolve(path)
    }

    // Persistence

    /// Copy of the persistable state
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            cached_files: state.cache.entries().cloned().collect(),
            cached_size: state.cache.cached_size(),
            file_commit_queue: state.queues.commits().to_vec(),
            file_delete_queue: state.queues.deletes().to_vec(),
            file_move_queue: state.queues.moves().to_vec(),
            file_commit_queue_minimum_time: state.queues.min_timestamp(),
        }
    }

    /// Replace cache and queues with a snapshot; pending requests are kept
    pub fn restore(&self, snapshot: QueueSnapshot) {
        self.inner.clock.observe(snapshot.max_timestamp());

        let cache = BucketCache::restore(self.inner.settings.capacity, snapshot.cached_files);
        if cache.cached_size() != snapshot.cached_size {
            warn!(
                "Snapshot cached size {} disagrees with its entries ({}), using the latter",
                snapshot.cached_size,
                cache.cached_size()
            );
        }

        let queues = SyncQueues::restore(
            snapshot.file_commit_queue,
            snapshot.file_delete_queue,
            snapshot.file_move_queue,
            snapshot.file_commit_queue_minimum_time,
        );

        let mut state = self.inner.state.lock();
        state.cache = cache;
        state.queues = queues;
    }

    /// Restore from the configured snapshot file; `Ok(false)` if there is none
    pub fn load(&self) -> Result<bool> {
        let Some(path) = &self.inner.settings.snapshot_path else {
            return Ok(false);
        };

        match QueueSnapshot::load(path)? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the configured snapshot file
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.inner.settings.snapshot_path.clone() else {
            return Ok(());
        };

        let snapshot = self.snapshot();
        let written = tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .map_err(|e| Error::internal(format!("snapshot task failed: {e}")))??;

        debug!("Wrote queue snapshot ({} bytes)", written);
        Ok(())
    }

    // Cache

    /// Register a locally written object and queue it for commit
    pub async fn admit(&self, path: BucketPath, file_type: FileType, size: u64) {
        let retired = {
            let mut state = self.inner.state.lock();
            let timestamp = self.inner.clock.next();
            let evicted = state
                .cache
                .admit(path.clone(), file_type, size, timestamp);

            let size = if file_type.is_folder() { 0 } else { size };
            state.queues.enqueue_commit(path, file_type, size, timestamp);
            self.requeue_evicted(&mut state, evicted);
            self.retire_locked(&mut state)
        };

        self.remove_retired(retired).await;
    }

    /// Forget a deleted object, and everything below it, and queue the delete
    pub fn remove(&self, path: &BucketPath, size: u64) {
        let mut state = self.inner.state.lock();
        let dropped = state.cache.remove_subtree(path);
        if dropped.len() > 1 {
            debug!("Dropped {} cached entries under {}", dropped.len(), path);
        }
        let timestamp = self.inner.clock.next();
        state.queues.enqueue_delete(path.clone(), size, timestamp);
    }

    /// Follow a renamed object, and everything below it, and queue the move
    pub fn move_object(&self, path: &BucketPath, new_path: &BucketPath) {
        let mut state = self.inner.state.lock();
        state.cache.rebase_subtree(path, new_path);
        let timestamp = self.inner.clock.next();
        state
            .queues
            .enqueue_move(path.clone(), new_path.clone(), timestamp);
    }

    #[must_use]
    pub fn is_cached(&self, path: &BucketPath) -> bool {
        self.inner.state.lock().cache.contains(path)
    }

    #[must_use]
    pub fn cached_size(&self) -> u64 {
        self.inner.state.lock().cache.cached_size()
    }

    #[must_use]
    pub fn cached_entries(&self) -> Vec<CacheEntry> {
        self.inner.state.lock().cache.entries().cloned().collect()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        *self.inner.state.lock().cache.stats()
    }

    /// Copy of the synchronization queues
    #[must_use]
    pub fn queues(&self) -> SyncQueues {
        self.inner.state.lock().queues.clone()
    }

    // Storage node feed

    /// Merged feed of queued work and pending requests
    pub async fn merge(&self) -> MergedQueue {
        let candidates: Vec<BucketPath> = {
            let state = self.inner.state.lock();
            state.queues.commits().iter().map(|c| c.path.clone()).collect()
        };

        let mut present = HashSet::new();
        for path in candidates {
            if let Ok(local) = self.resolve_path(&path) {
                if self.inner.fs.exists(&local).await {
                    present.insert(path);
                }
            }
        }

        let state = self.inner.state.lock();
        state
            .queues
            .merge(|c| present.contains(&c.path), state.requests.queue_items())
    }

    /// Serve bytes `[start, end)` of a queued commit
    ///
    /// The commit counts as done once a range reaching the end of the file
    /// has been served.
    pub async fn resolve_commit(
        &self,
        timestamp: Timestamp,
        start: u64,
        end: u64,
    ) -> Result<Resolution<Vec<u8>>> {
        let item = self.inner.state.lock().queues.commit_at(timestamp).cloned();
        let Some(item) = item else {
            return Ok(Resolution::Stale);
        };

        let (data, complete) = if item.file_type.is_folder() {
            (Vec::new(), true)
        } else {
            let local = self.resolve_path(&item.path)?;
            let stat = match self.inner.fs.stat(&local).await {
                Ok(stat) => stat,
                Err(e) if e.is_not_found() => return Ok(Resolution::Stale),
                Err(e) => return Err(e),
            };
            let data = match self.inner.fs.read_range(&local, start, end).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => return Ok(Resolution::Stale),
                Err(e) => return Err(e),
            };
            (data, end >= stat.size)
        };

        if complete {
            let retired = {
                let mut state = self.inner.state.lock();
                if state.queues.mark_commit(timestamp).is_applied() {
                    debug!("Commit of {} confirmed", item.path);
                }
                self.sweep_locked(&mut state)
            };
            self.remove_retired(retired).await;
        }

        Ok(Resolution::Applied(data))
    }

    /// Confirm a folder commit; file commits only complete through [`Self::resolve_commit`]
    pub fn resolve_folder_commit(&self, timestamp: Timestamp) -> Resolution<()> {
        let mut state = self.inner.state.lock();
        match state.queues.commit_at(timestamp) {
            Some(item) if item.file_type.is_folder() => state.queues.mark_commit(timestamp),
            Some(item) => {
                warn!("Refused folder confirmation of file commit {}", item.path);
                Resolution::Stale
            }
            None => Resolution::Stale,
        }
    }

    pub fn resolve_delete(&self, timestamp: Timestamp) -> Resolution<()> {
        self.inner.state.lock().queues.mark_delete(timestamp)
    }

    pub fn resolve_move(&self, timestamp: Timestamp) -> Resolution<()> {
        self.inner.state.lock().queues.mark_move(timestamp)
    }

    // Pull requests

    pub fn init_request(&self, timestamp: Timestamp, info: RequestInfo) -> Resolution<()> {
        self.inner.state.lock().requests.init(timestamp, info)
    }

    pub fn tx_request_data(
        &self,
        timestamp: Timestamp,
        chunk: &[u8],
        previous_bytes_transferred: u64,
    ) -> Resolution<u64> {
        self.inner
            .state
            .lock()
            .requests
            .write_chunk(timestamp, chunk, previous_bytes_transferred)
    }

    pub fn mark_not_found(&self, timestamp: Timestamp) -> Resolution<()> {
        self.inner.state.lock().requests.mark_not_found(timestamp)
    }

    /// Number of requests in flight
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().requests.len()
    }

    /// Fetch an object, pulling it from a storage node if it is not local
    ///
    /// Concurrent calls for the same path share one request. `on_progress`
    /// is called on the first state check and on every change of state or
    /// transferred bytes; returning `true` stops waiting, and the caller gets
    /// whatever arrived so far marked as cancelled. The transfer itself is
    /// only cancelled, and nothing stored, when no other caller still waits.
    pub async fn request_file(
        &self,
        path: &BucketPath,
        on_progress: Option<ProgressCallback>,
    ) -> Result<FetchedObject> {
        let cached = self
            .inner
            .state
            .lock()
            .cache
            .lookup(path)
            .map(|e| e.file_type);

        if let Some(file_type) = cached {
            return self.fetch_local(path, file_type, on_progress).await;
        }

        // Not cached but still on disk, e.g. evicted and awaiting retirement
        let local = self.resolve_path(path)?;
        if let Ok(stat) = self.inner.fs.stat(&local).await {
            return self.fetch_local(path, stat.file_type, on_progress).await;
        }

        let (timestamp, rx) = {
            let mut state = self.inner.state.lock();
            // A cancelled request is on its way out; start over
            match state.requests.pending_mut(path).filter(|r| !r.is_cancelled()) {
                Some(request) => (request.timestamp(), request.join()),
                None => {
                    let timestamp = self.inner.clock.next();
                    let (request, rx) = FileRequest::new(path.clone(), timestamp);
                    let wake = request.wake_handle();
                    state.requests.insert(request);
                    debug!("Requesting {} from storage nodes at {}", path, timestamp);
                    tokio::spawn(self.clone().drive_request(timestamp, wake));
                    (timestamp, rx)
                }
            }
        };

        self.await_request(path, timestamp, rx, on_progress).await
    }

    async fn fetch_local(
        &self,
        path: &BucketPath,
        file_type: FileType,
        mut on_progress: Option<ProgressCallback>,
    ) -> Result<FetchedObject> {
        let local = self.resolve_path(path)?;
        let size = match file_type {
            FileType::File => {
                self.inner
                    .fs
                    .stat(&local)
                    .await
                    .map_err(|e| e.for_object(path))?
                    .size
            }
            FileType::Folder => 0,
        };

        if let Some(callback) = on_progress.as_mut() {
            let progress = RequestProgress {
                path: path.clone(),
                state: RequestState::Fulfilled,
                file_type: Some(file_type),
                size: Some(size),
                bytes_transferred: size,
            };

            if callback(&progress) {
                return Ok(FetchedObject {
                    path: path.clone(),
                    file_type,
                    data: Vec::new(),
                    listing: None,
                    cancelled: true,
                });
            }
        }

        let (data, listing) = match file_type {
            FileType::File => (self.inner.fs.read(&local).await, None),
            FileType::Folder => (Ok(Vec::new()), Some(self.inner.fs.list_dir(&local).await)),
        };
        let data = data.map_err(|e| e.for_object(path))?;
        let listing = listing
            .transpose()
            .map_err(|e| e.for_object(path))?;

        Ok(FetchedObject {
            path: path.clone(),
            file_type,
            data,
            listing,
            cancelled: false,
        })
    }

    async fn await_request(
        &self,
        path: &BucketPath,
        timestamp: Timestamp,
        mut rx: watch::Receiver<RequestStatus>,
        mut on_progress: Option<ProgressCallback>,
    ) -> Result<FetchedObject> {
        let mut reported: Option<(RequestState, u64)> = None;

        loop {
            let status = rx.borrow_and_update().clone();
            if let Some(outcome) = status.outcome {
                return outcome_result(path, outcome);
            }

            if let Some(callback) = on_progress.as_mut() {
                let seen = (status.progress.state, status.progress.bytes_transferred);
                if reported != Some(seen) {
                    reported = Some(seen);
                    if callback(&status.progress) {
                        if let Some(partial) = self.withdraw_waiter(timestamp) {
                            return Ok(partial);
                        }
                    }
                }
            }

            if rx.changed().await.is_err() {
                let outcome = rx.borrow().outcome.clone();
                return match outcome {
                    Some(outcome) => outcome_result(path, outcome),
                    None => Err(Error::internal(format!("request for {path} was dropped"))),
                };
            }
        }
    }

    fn withdraw_waiter(&self, timestamp: Timestamp) -> Option<FetchedObject> {
        self.inner
            .state
            .lock()
            .requests
            .get_mut(timestamp)
            .and_then(FileRequest::withdraw)
    }

    /// Per-request task: wakes on every change and on each poll tick
    async fn drive_request(self, timestamp: Timestamp, wake: Arc<Notify>) {
        let settings = &self.inner.settings;
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wake.notified() => {}
                _ = ticker.tick() => {}
            }

            let settled = self.inner.state.lock().requests.take_settled(
                timestamp,
                settings.request_timeout,
                Instant::now(),
            );

            if let Some(mut request) = settled {
                self.finish_request(&mut request).await;
                break;
            }
        }
    }

    async fn finish_request(&self, request: &mut FileRequest) {
        let Some(object) = request.take_object() else {
            debug!("Request for {} ended not found", request.path());
            request.resolve(RequestOutcome::NotFound);
            return;
        };

        if !object.cancelled {
            if let Err(e) = self.persist_fetched(&object).await {
                error!("Failed to store fetched {}: {}", object.path, e);
            }
        }

        request.resolve(RequestOutcome::Fulfilled(Arc::new(object)));
    }

    async fn persist_fetched(&self, object: &FetchedObject) -> Result<()> {
        let local = self.resolve_path(&object.path)?;
        match object.file_type {
            FileType::File => self.inner.fs.write(&local, &object.data).await?,
            FileType::Folder => self.inner.fs.create_dir_all(&local).await?,
        }

        self.admit(object.path.clone(), object.file_type, object.data.len() as u64)
            .await;
        Ok(())
    }

    // Maintenance

    /// Evict down to capacity and retire confirmed queue items
    pub async fn sweep(&self) {
        let retired = {
            let mut state = self.inner.state.lock();
            self.sweep_locked(&mut state)
        };
        self.remove_retired(retired).await;
    }

    /// Run [`Self::sweep`] every `interval`
    pub async fn sweep_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Write the snapshot every `interval`
    pub async fn snapshot_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.save().await {
                error!("Failed to write queue snapshot: {}", e);
            }
        }
    }

    fn grace_ticks(&self) -> u64 {
        let millis = u64::try_from(self.inner.settings.commit_grace.as_millis()).unwrap_or(u64::MAX);
        millis.saturating_mul(self.inner.clock.subdivisions())
    }

    fn requeue_evicted(&self, state: &mut BucketState, evicted: Vec<CacheEntry>) {
        for entry in evicted {
            let timestamp = self.inner.clock.next();
            state
                .queues
                .enqueue_commit(entry.path, entry.file_type, entry.size, timestamp);
        }
    }

    fn sweep_locked(&self, state: &mut BucketState) -> Vec<CommitItem> {
        let evicted = state.cache.evict(0);
        self.requeue_evicted(state, evicted);
        self.retire_locked(state)
    }

    /// Retire queue items; returns commits whose local copy can go
    fn retire_locked(&self, state: &mut BucketState) -> Vec<CommitItem> {
        let retired = state
            .queues
            .sweep(self.inner.clock.now(), self.grace_ticks());

        retired
            .into_iter()
            .filter(|c| !state.cache.contains(&c.path))
            .collect()
    }

    async fn remove_retired(&self, retired: Vec<CommitItem>) {
        for item in retired {
            let local = match self.resolve_path(&item.path) {
                Ok(local) => local,
                Err(e) => {
                    warn!("Cannot resolve retired {}: {}", item.path, e);
                    continue;
                }
            };

            match self.inner.fs.remove(&local).await {
                Ok(()) => debug!("Removed local copy of committed {}", item.path),
                Err(e) if e.is_not_found() => {}
                // Folders that still hold files stay until their contents retire
                Err(e) if item.file_type.is_folder() => {
                    debug!("Kept folder {}: {}", item.path, e);
                }
                Err(e) => warn!("Failed to remove committed {}: {}", item.path, e),
            }
        }
    }
}

fn outcome_result(path: &BucketPath, outcome: RequestOutcome) -> Result<FetchedObject> {
    match outcome {
        RequestOutcome::Fulfilled(object) => Ok((*object).clone()),
        RequestOutcome::NotFound => Err(Error::not_found(path.to_string())),
    }
}
