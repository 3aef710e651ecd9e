//! Bucket cache
//!
//! Bounded working set of recently written objects. Entries are kept in
//! insertion order and evicted oldest first; reads do not refresh an
//! entry's position. The cache only tracks descriptors: the coordinator owns
//! the files themselves and turns every admission and eviction into a commit.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strata_common::{BucketPath, FileType, Timestamp};
use tracing::debug;

/// A cached object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: BucketPath,
    pub file_type: FileType,
    pub size: u64,
    pub timestamp: Timestamp,
    pub already_committed_once: bool,
}

/// Cache statistics for monitoring
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a cached entry
    pub hits: u64,
    /// Lookups that did not
    pub misses: u64,
    /// Objects admitted
    pub admissions: u64,
    /// Objects evicted to make room
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// FIFO cache of object descriptors bounded by total file size
#[derive(Debug)]
pub struct BucketCache {
    entries: VecDeque<CacheEntry>,
    cached_size: u64,
    capacity: u64,
    stats: CacheStats,
}

impl BucketCache {
    /// Create an empty cache holding at most `capacity` bytes of files
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            cached_size: 0,
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Rebuild a cache from persisted entries
    ///
    /// The size is recomputed from the entries rather than trusted.
    #[must_use]
    pub fn restore(capacity: u64, entries: Vec<CacheEntry>) -> Self {
        let cached_size = entries.iter().map(|e| e.size).sum();
        Self {
            entries: entries.into(),
            cached_size,
            capacity,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes of cached files
    #[must_use]
    pub const fn cached_size(&self) -> u64 {
        self.cached_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Entries in eviction order
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn contains(&self, path: &BucketPath) -> bool {
        self.entries.iter().any(|e| &e.path == path)
    }

    /// Look up an entry, counting a hit or a miss
    pub fn lookup(&mut self, path: &BucketPath) -> Option<&CacheEntry> {
        match self.entries.iter().position(|e| &e.path == path) {
            Some(index) => {
                self.stats.hits += 1;
                self.entries.get(index)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Register an object, returning the entries evicted to make room
    pub fn admit(
        &mut self,
        path: BucketPath,
        file_type: FileType,
        size: u64,
        timestamp: Timestamp,
    ) -> Vec<CacheEntry> {
        let size = if file_type.is_folder() { 0 } else { size };
        let mut evicted = self.evict(size);

        self.remove(&path);
        debug!("Caching {} ({} bytes)", path, size);
        self.entries.push_back(CacheEntry {
            path,
            file_type,
            size,
            timestamp,
            already_committed_once: false,
        });
        self.cached_size += size;
        self.stats.admissions += 1;

        // An object larger than the whole cache goes straight back out
        while self.cached_size > self.capacity {
            let Some(entry) = self.pop_oldest() else {
                break;
            };
            evicted.push(entry);
        }

        evicted
    }

    /// Evict oldest entries until `space_to_reserve` more bytes would fit
    pub fn evict(&mut self, space_to_reserve: u64) -> Vec<CacheEntry> {
        let limit = self.capacity.saturating_sub(space_to_reserve);
        let mut evicted = Vec::new();

        while !self.entries.is_empty() && self.cached_size >= limit {
            let Some(entry) = self.pop_oldest() else {
                break;
            };
            evicted.push(entry);
        }

        evicted
    }

    /// Drop the entry for `path`, if cached
    pub fn remove(&mut self, path: &BucketPath) -> Option<CacheEntry> {
        let index = self.entries.iter().position(|e| &e.path == path)?;
        let entry = self.entries.remove(index)?;
        self.cached_size = self.cached_size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Drop `path` and every entry below it
    pub fn remove_subtree(&mut self, path: &BucketPath) -> Vec<CacheEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.path.starts_with(path));

        self.entries = kept.into();
        let freed: u64 = removed.iter().map(|e| e.size).sum();
        self.cached_size = self.cached_size.saturating_sub(freed);
        removed
    }

    /// Retarget `from` and every entry below it to live under `to`
    ///
    /// Entries already under `to` are replaced. Eviction order is kept.
    pub fn rebase_subtree(&mut self, from: &BucketPath, to: &BucketPath) {
        if !self.entries.iter().any(|e| e.path.starts_with(from)) {
            return;
        }

        self.remove_subtree(to);
        for entry in &mut self.entries {
            if let Some(path) = entry.path.rebase(from, to) {
                entry.path = path;
            }
        }
    }

    fn pop_oldest(&mut self) -> Option<CacheEntry> {
        let entry = self.entries.pop_front()?;
        self.cached_size = self.cached_size.saturating_sub(entry.size);
        self.stats.evictions += 1;
        debug!("Evicted {} ({} bytes)", entry.path, entry.size);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> BucketPath {
        BucketPath::parse(&format!("shared:{p}")).unwrap()
    }

    #[test]
    fn test_admit_evicts_oldest() {
        let mut cache = BucketCache::new(150);
        assert!(cache.admit(path("a"), FileType::File, 100, Timestamp(1)).is_empty());

        let evicted = cache.admit(path("b"), FileType::File, 100, Timestamp(2));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].path, path("a"));
        assert_eq!(cache.cached_size(), 100);
        assert!(cache.contains(&path("b")));
        assert!(!cache.contains(&path("a")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_readmit_replaces_entry() {
        let mut cache = BucketCache::new(1000);
        cache.admit(path("a"), FileType::File, 100, Timestamp(1));
        cache.admit(path("b"), FileType::File, 10, Timestamp(2));
        cache.admit(path("a"), FileType::File, 40, Timestamp(3));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cached_size(), 50);
        // Re-admission moves the path to the back of the eviction order
        let order: Vec<_> = cache.entries().map(|e| e.path.to_string()).collect();
        assert_eq!(order, vec!["shared:b", "shared:a"]);
    }

    #[test]
    fn test_folders_take_no_space() {
        let mut cache = BucketCache::new(100);
        cache.admit(path("docs"), FileType::Folder, 4096, Timestamp(1));
        assert_eq!(cache.cached_size(), 0);
        assert_eq!(cache.entries().next().unwrap().size, 0);
    }

    #[test]
    fn test_oversized_object_does_not_stay() {
        let mut cache = BucketCache::new(100);
        cache.admit(path("small"), FileType::File, 10, Timestamp(1));
        let evicted = cache.admit(path("huge"), FileType::File, 500, Timestamp(2));

        let names: Vec<_> = evicted.iter().map(|e| e.path.to_string()).collect();
        assert_eq!(names, vec!["shared:small", "shared:huge"]);
        assert_eq!(cache.cached_size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut cache = BucketCache::new(1000);
        cache.admit(path("a"), FileType::File, 10, Timestamp(1));

        assert!(cache.lookup(&path("a")).is_some());
        assert!(cache.lookup(&path("b")).is_none());
        assert_eq!(cache.stats().hit_ratio(), 0.5);

        assert_eq!(cache.remove(&path("a")).unwrap().size, 10);
        assert!(cache.remove(&path("a")).is_none());
        assert_eq!(cache.cached_size(), 0);
    }

    #[test]
    fn test_subtree_remove_and_rebase() {
        let mut cache = BucketCache::new(1000);
        cache.admit(path("dir"), FileType::Folder, 0, Timestamp(1));
        cache.admit(path("dir/a.txt"), FileType::File, 5, Timestamp(2));
        cache.admit(path("dir2x"), FileType::File, 7, Timestamp(3));

        cache.rebase_subtree(&path("dir"), &path("moved"));
        let order: Vec<_> = cache.entries().map(|e| e.path.to_string()).collect();
        assert_eq!(order, vec!["shared:moved", "shared:moved/a.txt", "shared:dir2x"]);
        assert_eq!(cache.cached_size(), 12);

        let removed = cache.remove_subtree(&path("moved"));
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.cached_size(), 7);
        assert!(cache.contains(&path("dir2x")));
    }

    #[test]
    fn test_size_bound_holds_for_any_sequence() {
        let mut cache = BucketCache::new(256);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for i in 0..500u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let size = seed % 400;
            let name = format!("f{}", seed % 40);
            cache.admit(path(&name), FileType::File, size, Timestamp(i));
            assert!(cache.cached_size() <= cache.capacity());
            assert_eq!(
                cache.cached_size(),
                cache.entries().map(|e| e.size).sum::<u64>()
            );
        }
    }

    #[test]
    fn test_restore_recomputes_size() {
        let entries = vec![CacheEntry {
            path: path("a"),
            file_type: FileType::File,
            size: 42,
            timestamp: Timestamp(1),
            already_committed_once: false,
        }];
        let cache = BucketCache::restore(100, entries);
        assert_eq!(cache.cached_size(), 42);
    }
}
