//! Pull requests for objects that are not held locally
//!
//! A request is published in the merged feed; a storage node answers with
//! the object's type and size, then streams the bytes in chunks. Each chunk
//! names the offset it expects to continue from, so when two storage nodes
//! race on the same request only the first writer at each offset wins.
//!
//! ```text
//! Unfulfilled --init(size 0 or folder)--> Fulfilled
//! Unfulfilled --init(size > 0)--> InitialInfoReceived
//! InitialInfoReceived | TxInProgress --chunk--> TxInProgress | Fulfilled
//! any non-terminal --not found / timeout--> NotFound
//! ```

use crate::queue::{QueueItem, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use strata_common::{BucketPath, FileType, ListingEntry, Timestamp};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transfer state of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Unfulfilled,
    InitialInfoReceived,
    TxInProgress,
    Fulfilled,
    NotFound,
}

impl RequestState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::NotFound)
    }

    /// Whether data chunks are accepted in this state
    #[must_use]
    pub const fn accepts_data(self) -> bool {
        matches!(self, Self::InitialInfoReceived | Self::TxInProgress)
    }
}

/// Initial information a storage node reports for a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub file_type: FileType,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub listing: Option<Vec<ListingEntry>>,
}

/// Progress snapshot handed to progress callbacks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestProgress {
    pub path: BucketPath,
    pub state: RequestState,
    pub file_type: Option<FileType>,
    pub size: Option<u64>,
    pub bytes_transferred: u64,
}

/// Called with every progress change; returning `true` cancels the transfer
pub type ProgressCallback = Box<dyn FnMut(&RequestProgress) -> bool + Send>;

/// Object returned to a caller of `request_file`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedObject {
    pub path: BucketPath,
    /// `File` when the transfer was cancelled before the type was known
    pub file_type: FileType,
    pub data: Vec<u8>,
    pub listing: Option<Vec<ListingEntry>>,
    /// Transfer stopped early on request; `data` may be partial
    pub cancelled: bool,
}

/// Final result shared by every waiter of a request
#[derive(Clone, Debug)]
pub enum RequestOutcome {
    Fulfilled(Arc<FetchedObject>),
    NotFound,
}

/// What waiters observe through the status channel
#[derive(Clone, Debug)]
pub struct RequestStatus {
    pub progress: RequestProgress,
    pub outcome: Option<RequestOutcome>,
}

/// One in-flight request
#[derive(Debug)]
pub struct FileRequest {
    path: BucketPath,
    timestamp: Timestamp,
    state: RequestState,
    file_type: Option<FileType>,
    size: Option<u64>,
    bytes_transferred: u64,
    data: Vec<u8>,
    listing: Option<Vec<ListingEntry>>,
    cancelled: bool,
    waiters: usize,
    last_progress: Instant,
    wake: Arc<Notify>,
    status: watch::Sender<RequestStatus>,
}

impl FileRequest {
    /// New unfulfilled request and a receiver for its status
    pub fn new(path: BucketPath, timestamp: Timestamp) -> (Self, watch::Receiver<RequestStatus>) {
        let progress = RequestProgress {
            path: path.clone(),
            state: RequestState::Unfulfilled,
            file_type: None,
            size: None,
            bytes_transferred: 0,
        };
        let (status, rx) = watch::channel(RequestStatus {
            progress,
            outcome: None,
        });

        let request = Self {
            path,
            timestamp,
            state: RequestState::Unfulfilled,
            file_type: None,
            size: None,
            bytes_transferred: 0,
            data: Vec::new(),
            listing: None,
            cancelled: false,
            waiters: 1,
            last_progress: Instant::now(),
            wake: Arc::new(Notify::new()),
            status,
        };

        (request, rx)
    }

    #[must_use]
    pub const fn path(&self) -> &BucketPath {
        &self.path
    }

    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    #[must_use]
    pub const fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Handle the driving task waits on
    #[must_use]
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Callers currently waiting on this request
    #[must_use]
    pub const fn waiters(&self) -> usize {
        self.waiters
    }

    /// Register another waiter for the same outcome
    pub fn join(&mut self) -> watch::Receiver<RequestStatus> {
        self.waiters += 1;
        self.status.subscribe()
    }

    #[must_use]
    pub fn progress(&self) -> RequestProgress {
        RequestProgress {
            path: self.path.clone(),
            state: self.state,
            file_type: self.file_type,
            size: self.size,
            bytes_transferred: self.bytes_transferred,
        }
    }

    /// Feed entry for this request
    #[must_use]
    pub fn queue_item(&self) -> QueueItem {
        QueueItem::Request {
            path: self.path.clone(),
            timestamp: self.timestamp,
            initialised: self.state != RequestState::Unfulfilled,
            bytes_transferred: self.bytes_transferred,
        }
    }

    /// Apply initial info; only the first storage node to answer wins
    pub fn init(&mut self, info: RequestInfo) -> Resolution<()> {
        if self.state != RequestState::Unfulfilled {
            return Resolution::Stale;
        }

        let size = if info.file_type.is_folder() { 0 } else { info.size };
        let Ok(len) = usize::try_from(size) else {
            warn!("Rejected initial info for {}: size {} too large", self.path, size);
            return Resolution::Stale;
        };

        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            warn!("Rejected initial info for {}: cannot buffer {} bytes", self.path, size);
            return Resolution::Stale;
        }
        data.resize(len, 0);

        self.file_type = Some(info.file_type);
        self.size = Some(size);
        self.listing = info.listing;
        self.data = data;
        self.state = if size == 0 {
            RequestState::Fulfilled
        } else {
            RequestState::InitialInfoReceived
        };
        self.last_progress = Instant::now();

        debug!("Request {} initialised: {} of {} bytes", self.path, info.file_type, size);
        self.changed();
        Resolution::Applied(())
    }

    /// Write a chunk continuing from `previous_bytes_transferred`
    ///
    /// Returns the new transferred byte count.
    pub fn write_chunk(&mut self, chunk: &[u8], previous_bytes_transferred: u64) -> Resolution<u64> {
        if !self.state.accepts_data() || self.bytes_transferred != previous_bytes_transferred {
            return Resolution::Stale;
        }

        // No bytes, no progress: the timeout keeps running
        if chunk.is_empty() {
            return Resolution::Applied(self.bytes_transferred);
        }

        let start = self.bytes_transferred as usize;
        let end = start + chunk.len();
        if end > self.data.len() {
            warn!(
                "Rejected chunk for {}: {} bytes at offset {} overflow declared size {}",
                self.path,
                chunk.len(),
                start,
                self.data.len()
            );
            return Resolution::Stale;
        }

        self.data[start..end].copy_from_slice(chunk);
        self.bytes_transferred = end as u64;
        self.last_progress = Instant::now();
        self.state = if end == self.data.len() {
            RequestState::Fulfilled
        } else {
            RequestState::TxInProgress
        };

        self.changed();
        Resolution::Applied(self.bytes_transferred)
    }

    /// Storage node reports the object does not exist
    pub fn mark_not_found(&mut self) -> Resolution<()> {
        if self.state.is_terminal() {
            return Resolution::Stale;
        }

        self.state = RequestState::NotFound;
        self.changed();
        Resolution::Applied(())
    }

    /// Stop the transfer and hand out whatever has arrived
    pub fn cancel(&mut self) {
        if !self.cancelled && !self.state.is_terminal() {
            debug!("Request {} cancelled at {} bytes", self.path, self.bytes_transferred);
            self.cancelled = true;
            self.wake.notify_one();
        }
    }

    /// A waiter stops waiting
    ///
    /// While others still wait, the transfer goes on and the leaving waiter
    /// gets a cancelled copy of what has arrived so far. The last waiter to
    /// leave cancels the transfer and gets the shared outcome instead.
    pub fn withdraw(&mut self) -> Option<FetchedObject> {
        if self.waiters > 1 {
            self.waiters -= 1;
            return Some(self.partial_object());
        }

        self.cancel();
        None
    }

    fn partial_object(&self) -> FetchedObject {
        let received = self.data.len().min(self.bytes_transferred as usize);
        FetchedObject {
            path: self.path.clone(),
            file_type: self.file_type.unwrap_or(FileType::File),
            data: self.data[..received].to_vec(),
            listing: self.listing.clone(),
            cancelled: true,
        }
    }

    /// Whether the request has seen no progress for `timeout`
    #[must_use]
    pub fn timed_out(&self, timeout: Duration, now: Instant) -> bool {
        !self.state.is_terminal() && now.duration_since(self.last_progress) >= timeout
    }

    /// Whether the driving task should finish the request now
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() || self.cancelled
    }

    /// Final object, or `None` when the request ended not found
    #[must_use]
    pub fn take_object(&mut self) -> Option<FetchedObject> {
        if self.state == RequestState::NotFound {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        data.truncate(self.bytes_transferred as usize);

        Some(FetchedObject {
            path: self.path.clone(),
            file_type: self.file_type.unwrap_or(FileType::File),
            data,
            listing: self.listing.take(),
            cancelled: self.cancelled,
        })
    }

    /// Publish the final outcome to every waiter
    pub fn resolve(&self, outcome: RequestOutcome) {
        let progress = self.progress();
        self.status.send_replace(RequestStatus {
            progress,
            outcome: Some(outcome),
        });
    }

    fn changed(&mut self) {
        let progress = self.progress();
        self.status.send_modify(|status| status.progress = progress);
        self.wake.notify_one();
    }
}

/// Pending requests keyed by timestamp, at most one per path
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: BTreeMap<Timestamp, FileRequest>,
    by_path: HashMap<BucketPath, Timestamp>,
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Pending request for `path`, if any
    #[must_use]
    pub fn pending(&self, path: &BucketPath) -> Option<&FileRequest> {
        self.by_path.get(path).and_then(|ts| self.requests.get(ts))
    }

    pub fn pending_mut(&mut self, path: &BucketPath) -> Option<&mut FileRequest> {
        let timestamp = self.by_path.get(path)?;
        self.requests.get_mut(timestamp)
    }

    #[must_use]
    pub fn get(&self, timestamp: Timestamp) -> Option<&FileRequest> {
        self.requests.get(&timestamp)
    }

    pub fn get_mut(&mut self, timestamp: Timestamp) -> Option<&mut FileRequest> {
        self.requests.get_mut(&timestamp)
    }

    pub fn insert(&mut self, request: FileRequest) {
        self.by_path.insert(request.path.clone(), request.timestamp);
        self.requests.insert(request.timestamp, request);
    }

    pub fn remove(&mut self, timestamp: Timestamp) -> Option<FileRequest> {
        let request = self.requests.remove(&timestamp)?;
        if self.by_path.get(&request.path) == Some(&timestamp) {
            self.by_path.remove(&request.path);
        }
        Some(request)
    }

    /// Feed entries for requests still awaiting a storage node
    pub fn queue_items(&self) -> impl Iterator<Item = QueueItem> + '_ {
        self.requests
            .values()
            .filter(|r| !r.is_settled())
            .map(FileRequest::queue_item)
    }

    pub fn init(&mut self, timestamp: Timestamp, info: RequestInfo) -> Resolution<()> {
        match self.requests.get_mut(&timestamp) {
            Some(request) => request.init(info),
            None => Resolution::Stale,
        }
    }

    pub fn write_chunk(
        &mut self,
        timestamp: Timestamp,
        chunk: &[u8],
        previous_bytes_transferred: u64,
    ) -> Resolution<u64> {
        match self.requests.get_mut(&timestamp) {
            Some(request) => request.write_chunk(chunk, previous_bytes_transferred),
            None => Resolution::Stale,
        }
    }

    pub fn mark_not_found(&mut self, timestamp: Timestamp) -> Resolution<()> {
        match self.requests.get_mut(&timestamp) {
            Some(request) => request.mark_not_found(),
            None => Resolution::Stale,
        }
    }

    /// Remove and return the request if it is ready to be finished
    ///
    /// A request without progress for `timeout` is marked not found first.
    pub fn take_settled(
        &mut self,
        timestamp: Timestamp,
        timeout: Duration,
        now: Instant,
    ) -> Option<FileRequest> {
        let request = self.requests.get_mut(&timestamp)?;

        if !request.cancelled && request.timed_out(timeout, now) {
            debug!("Request {} timed out", request.path);
            request.state = RequestState::NotFound;
        }

        if request.is_settled() {
            self.remove(timestamp)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> (FileRequest, watch::Receiver<RequestStatus>) {
        FileRequest::new(BucketPath::parse("shared:x").unwrap(), Timestamp(10))
    }

    fn file_info(size: u64) -> RequestInfo {
        RequestInfo {
            file_type: FileType::File,
            size,
            listing: None,
        }
    }

    #[test]
    fn test_full_transfer() {
        let (mut req, rx) = request();
        assert!(req.write_chunk(b"early", 0).is_stale());

        assert!(req.init(file_info(6)).is_applied());
        assert_eq!(req.state(), RequestState::InitialInfoReceived);
        assert!(req.init(file_info(6)).is_stale());

        assert_eq!(req.write_chunk(b"abc", 0), Resolution::Applied(3));
        assert_eq!(req.state(), RequestState::TxInProgress);
        assert_eq!(req.write_chunk(b"def", 3), Resolution::Applied(6));
        assert_eq!(req.state(), RequestState::Fulfilled);
        assert_eq!(rx.borrow().progress.bytes_transferred, 6);

        let object = req.take_object().unwrap();
        assert_eq!(object.data, b"abcdef");
        assert!(!object.cancelled);
    }

    #[test]
    fn test_duplicate_chunk_applied_once() {
        let (mut req, _rx) = request();
        let _ = req.init(file_info(8));

        assert!(req.write_chunk(b"1234", 0).is_applied());
        let before = req.progress();
        assert!(req.write_chunk(b"9999", 0).is_stale());

        assert_eq!(req.progress(), before);
        assert_eq!(req.bytes_transferred(), 4);
    }

    #[test]
    fn test_zero_size_fulfils_immediately() {
        let (mut req, _rx) = request();
        assert!(req.init(file_info(0)).is_applied());
        assert_eq!(req.state(), RequestState::Fulfilled);
        assert!(req.take_object().unwrap().data.is_empty());
    }

    #[test]
    fn test_folder_carries_listing() {
        let (mut req, _rx) = request();
        let listing = vec![ListingEntry::new("a.txt", FileType::File)];
        let _ = req.init(RequestInfo {
            file_type: FileType::Folder,
            size: 4096,
            listing: Some(listing.clone()),
        });

        assert_eq!(req.state(), RequestState::Fulfilled);
        let object = req.take_object().unwrap();
        assert_eq!(object.file_type, FileType::Folder);
        assert_eq!(object.listing, Some(listing));
    }

    #[test]
    fn test_overflowing_chunk_rejected() {
        let (mut req, _rx) = request();
        let _ = req.init(file_info(4));
        assert!(req.write_chunk(b"12345", 0).is_stale());
        assert_eq!(req.state(), RequestState::InitialInfoReceived);
    }

    #[test]
    fn test_unbufferable_size_rejected() {
        let (mut req, _rx) = request();
        assert!(req.init(file_info(u64::MAX)).is_stale());
        assert_eq!(req.state(), RequestState::Unfulfilled);
        assert!(req.init(file_info(3)).is_applied());
    }

    #[test]
    fn test_empty_chunk_is_not_progress() {
        let (mut req, _rx) = request();
        let _ = req.init(file_info(4));
        let _ = req.write_chunk(b"12", 0);
        let before = req.last_progress;

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(req.write_chunk(b"", 2), Resolution::Applied(2));
        assert_eq!(req.last_progress, before);
        assert_eq!(req.state(), RequestState::TxInProgress);
        assert!(req.timed_out(Duration::from_secs(60), before + Duration::from_secs(61)));
    }

    #[test]
    fn test_withdraw_leaves_transfer_to_remaining_waiters() {
        let (mut req, _rx) = request();
        let _second = req.join();
        assert_eq!(req.waiters(), 2);

        let _ = req.init(file_info(4));
        let _ = req.write_chunk(b"ab", 0);

        let partial = req.withdraw().unwrap();
        assert!(partial.cancelled);
        assert_eq!(partial.data, b"ab");
        assert!(!req.is_cancelled());
        assert_eq!(req.write_chunk(b"cd", 2), Resolution::Applied(4));

        // The last waiter out stops the transfer
        assert!(req.withdraw().is_none());
        assert_eq!(req.waiters(), 1);
        let object = req.take_object().unwrap();
        assert_eq!(object.data, b"abcd");
    }

    #[test]
    fn test_not_found_is_terminal() {
        let (mut req, _rx) = request();
        assert!(req.mark_not_found().is_applied());
        assert!(req.mark_not_found().is_stale());
        assert!(req.init(file_info(1)).is_stale());
        assert!(req.take_object().is_none());
    }

    #[test]
    fn test_queue_item_reports_initialised() {
        let (mut req, _rx) = request();
        let _ = req.init(file_info(4));
        let _ = req.write_chunk(b"12", 0);

        assert_eq!(
            req.queue_item(),
            QueueItem::Request {
                path: BucketPath::parse("shared:x").unwrap(),
                timestamp: Timestamp(10),
                initialised: true,
                bytes_transferred: 2,
            }
        );
    }

    #[test]
    fn test_table_timeout_and_cancel() {
        let mut table = RequestTable::new();
        let (req, _rx) = request();
        table.insert(req);
        assert!(table.pending(&BucketPath::parse("shared:x").unwrap()).is_some());

        let now = Instant::now();
        assert!(table.take_settled(Timestamp(10), Duration::from_secs(60), now).is_none());
        assert_eq!(table.queue_items().count(), 1);

        let later = now + Duration::from_secs(61);
        let mut timed_out = table
            .take_settled(Timestamp(10), Duration::from_secs(60), later)
            .unwrap();
        assert_eq!(timed_out.state(), RequestState::NotFound);
        assert!(timed_out.take_object().is_none());
        assert!(table.is_empty());
        assert!(table.init(Timestamp(10), file_info(1)).is_stale());

        let (mut req, _rx) = request();
        let _ = req.init(file_info(10));
        let _ = req.write_chunk(b"abc", 0);
        req.cancel();
        table.insert(req);
        assert_eq!(table.queue_items().count(), 0);

        let mut cancelled = table
            .take_settled(Timestamp(10), Duration::from_secs(60), Instant::now())
            .unwrap();
        let object = cancelled.take_object().unwrap();
        assert!(object.cancelled);
        assert_eq!(object.data, b"abc");
    }
}
