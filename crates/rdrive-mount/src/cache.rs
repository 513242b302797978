//! Metadata and directory-listing cache backed by Moka.
//!
//! Two independent TTL caches keyed by [`RemotePath`]:
//!
//! - listings: the children of a directory
//! - metadata: a single [`RemoteEntry`]
//!
//! The cache is best-effort. Nothing is persisted, and the remote side is
//! always the source of truth. Every entry carries its own expiry and is
//! never returned once that instant has passed, even if Moka has not yet
//! reaped it.
//!
//! [`MetadataCache::invalidate`] drops the path's own entries *and* its
//! parent's listing, so a stale child never lingers inside a cached parent.
//!
//! # Racing a mutation
//!
//! A lookup that misses reads the backend without holding any path lock, so a
//! mutation can complete and invalidate while that read is in flight. Callers
//! take a [`CacheEpoch`] before going to the backend and insert through
//! [`MetadataCache::put_listing_since`] / [`MetadataCache::put_entry_since`],
//! which drop the result if an invalidation touched the path in between.
//! Epochs live in a fixed set of striped counters; two paths sharing a stripe
//! only cost a skipped insert.

use crate::config::CacheConfig;
use crate::stats::CacheStats;
use moka::Expiry;
use moka::notification::RemovalCause;
use rdrive_core::{RemoteEntry, RemotePath};
use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// A cached value with its own TTL and absolute expiry.
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    pub value: V,
    ttl: Duration,
    expires: Instant,
}

impl<V> CachedEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            ttl,
            expires: Instant::now() + ttl,
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    pub fn time_remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Expiry that honours the TTL stored in each [`CachedEntry`].
struct PerEntryExpiry;

impl<K, V> Expiry<K, CachedEntry<V>> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &K, value: &CachedEntry<V>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &CachedEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type Listing = Arc<Vec<RemoteEntry>>;

fn build_cache<V>(max_entries: u64, stats: &Arc<CacheStats>) -> moka::sync::Cache<RemotePath, CachedEntry<V>>
where
    V: Clone + Send + Sync + 'static,
{
    let stats = Arc::clone(stats);
    moka::sync::Cache::builder()
        .max_capacity(max_entries)
        .expire_after(PerEntryExpiry)
        .support_invalidation_closures()
        .eviction_listener(move |_key, _value, cause| {
            if cause != RemovalCause::Replaced {
                stats.record_eviction();
            }
        })
        .build()
}

const EPOCH_STRIPES: usize = 256;

/// Invalidation counters, striped by path hash.
///
/// `local` moves when a path or one of its children is invalidated,
/// `subtree` when the path is dropped together with everything below it.
struct Epochs {
    local: [AtomicU64; EPOCH_STRIPES],
    subtree: [AtomicU64; EPOCH_STRIPES],
}

impl Epochs {
    fn new() -> Self {
        Self {
            local: std::array::from_fn(|_| AtomicU64::new(0)),
            subtree: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn stripe(path: &RemotePath) -> usize {
        let hash = BuildHasherDefault::<DefaultHasher>::default().hash_one(path);
        (hash % EPOCH_STRIPES as u64) as usize
    }

    fn bump_local(&self, path: &RemotePath) {
        self.local[Self::stripe(path)].fetch_add(1, Ordering::SeqCst);
    }

    fn bump_subtree(&self, path: &RemotePath) {
        self.subtree[Self::stripe(path)].fetch_add(1, Ordering::SeqCst);
    }

    /// Counters that can change the cached view of `path`: its own local
    /// counter plus the subtree counter of it and every ancestor.
    fn read(&self, path: &RemotePath) -> Vec<(bool, usize, u64)> {
        let stripe = Self::stripe(path);
        let mut stamps = vec![(false, stripe, self.local[stripe].load(Ordering::SeqCst))];
        let mut next = Some(path.clone());
        while let Some(current) = next {
            let stripe = Self::stripe(&current);
            stamps.push((true, stripe, self.subtree[stripe].load(Ordering::SeqCst)));
            next = current.parent();
        }
        stamps
    }

    fn unchanged(&self, epoch: &CacheEpoch) -> bool {
        epoch.stamps.iter().all(|&(subtree, stripe, seen)| {
            let counters = if subtree { &self.subtree } else { &self.local };
            counters[stripe].load(Ordering::SeqCst) == seen
        })
    }
}

/// Snapshot of the invalidation counters covering one path.
#[derive(Debug, Clone)]
pub struct CacheEpoch {
    stamps: Vec<(bool, usize, u64)>,
}

/// Thread-safe listing + metadata cache for one mount.
pub struct MetadataCache {
    listings: moka::sync::Cache<RemotePath, CachedEntry<Listing>>,
    entries: moka::sync::Cache<RemotePath, CachedEntry<RemoteEntry>>,
    listing_stats: Arc<CacheStats>,
    entry_stats: Arc<CacheStats>,
    epochs: Epochs,
    config: CacheConfig,
}

impl MetadataCache {
    pub fn new(config: CacheConfig) -> Self {
        let listing_stats = Arc::new(CacheStats::new());
        let entry_stats = Arc::new(CacheStats::new());
        Self {
            listings: build_cache(config.max_entries, &listing_stats),
            entries: build_cache(config.max_entries, &entry_stats),
            listing_stats,
            entry_stats,
            epochs: Epochs::new(),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cached children of `dir`, if present and unexpired.
    pub fn get_listing(&self, dir: &RemotePath) -> Option<Listing> {
        lookup(&self.listings, &self.listing_stats, self.config.enabled, dir)
    }

    /// Stores a listing and seeds the metadata cache with each child.
    pub fn put_listing(&self, dir: &RemotePath, children: Vec<RemoteEntry>) -> Listing {
        let listing = Arc::new(children);
        if !self.config.enabled {
            return listing;
        }
        for child in listing.iter() {
            self.put_entry(&dir.join(&child.name), child.clone());
        }
        self.listings
            .insert(dir.clone(), CachedEntry::new(Arc::clone(&listing), self.config.dir_ttl));
        self.listing_stats.record_insert();
        listing
    }

    /// Takes an epoch for `path`. Take it before reading the backend.
    pub fn epoch(&self, path: &RemotePath) -> CacheEpoch {
        CacheEpoch {
            stamps: self.epochs.read(path),
        }
    }

    /// Like [`put_listing`](Self::put_listing), but skips the insert if
    /// `dir` or one of its children was invalidated after `epoch` was taken.
    pub fn put_listing_since(&self, dir: &RemotePath, children: Vec<RemoteEntry>, epoch: &CacheEpoch) -> Listing {
        if !self.epochs.unchanged(epoch) {
            trace!(path = %dir, "Listing changed while fetching, not caching");
            return Arc::new(children);
        }
        let listing = self.put_listing(dir, children);
        self.recheck(dir, epoch, true);
        listing
    }

    /// Like [`put_entry`](Self::put_entry), but skips the insert if `path`
    /// was invalidated after `epoch` was taken.
    pub fn put_entry_since(&self, path: &RemotePath, entry: RemoteEntry, epoch: &CacheEpoch) {
        if !self.epochs.unchanged(epoch) {
            trace!(path = %path, "Entry changed while fetching, not caching");
            return;
        }
        self.put_entry(path, entry);
        self.recheck(path, epoch, false);
    }

    /// An invalidation that bumped its counter between our check and our
    /// insert may have run its removal before the insert landed.
    fn recheck(&self, path: &RemotePath, epoch: &CacheEpoch, listing: bool) {
        if self.epochs.unchanged(epoch) {
            return;
        }
        if listing {
            self.listings.invalidate(path);
            let prefix = path.clone();
            if self
                .entries
                .invalidate_entries_if(move |key, _| key.parent().as_ref() == Some(&prefix))
                .is_err()
            {
                self.entries.invalidate_all();
            }
        } else {
            self.entries.invalidate(path);
        }
    }

    pub fn get_entry(&self, path: &RemotePath) -> Option<RemoteEntry> {
        lookup(&self.entries, &self.entry_stats, self.config.enabled, path)
    }

    pub fn put_entry(&self, path: &RemotePath, entry: RemoteEntry) {
        if !self.config.enabled {
            return;
        }
        self.entries
            .insert(path.clone(), CachedEntry::new(entry, self.config.meta_ttl));
        self.entry_stats.record_insert();
    }

    /// Drops `path`'s metadata and listing, plus its parent's listing.
    pub fn invalidate(&self, path: &RemotePath) {
        trace!(path = %path, "Invalidating cache entries");
        self.epochs.bump_local(path);
        if let Some(parent) = path.parent() {
            self.epochs.bump_local(&parent);
        }
        self.entries.invalidate(path);
        self.listings.invalidate(path);
        if let Some(parent) = path.parent() {
            self.listings.invalidate(&parent);
        }
    }

    /// Like [`invalidate`](Self::invalidate), and also drops every cached
    /// descendant of `path`. Used when a directory is renamed or removed.
    pub fn invalidate_subtree(&self, path: &RemotePath) {
        self.epochs.bump_subtree(path);
        self.invalidate(path);
        let prefix = path.clone();
        let listed = self
            .listings
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix));
        let prefix = path.clone();
        let entries = self
            .entries
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix));
        if listed.is_err() || entries.is_err() {
            warn!(path = %path, "Predicate invalidation unavailable, clearing cache");
            self.clear();
        }
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.listings.invalidate_all();
        self.entries.invalidate_all();
    }

    pub fn listing_stats(&self) -> &CacheStats {
        &self.listing_stats
    }

    pub fn entry_stats(&self) -> &CacheStats {
        &self.entry_stats
    }

    /// Approximate number of live entries across both caches.
    pub fn entry_count(&self) -> u64 {
        self.listings.run_pending_tasks();
        self.entries.run_pending_tasks();
        self.listings.entry_count() + self.entries.entry_count()
    }
}

fn lookup<V: Clone + Send + Sync + 'static>(
    cache: &moka::sync::Cache<RemotePath, CachedEntry<V>>,
    stats: &CacheStats,
    enabled: bool,
    key: &RemotePath,
) -> Option<V> {
    if !enabled {
        stats.record_miss();
        return None;
    }
    match cache.get(key) {
        Some(entry) if !entry.is_expired() => {
            stats.record_hit();
            Some(entry.value)
        }
        Some(_) => {
            cache.invalidate(key);
            stats.record_miss();
            None
        }
        None => {
            stats.record_miss();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::SystemTime;

    fn file(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry::file(name, size, SystemTime::now())
    }

    fn cache() -> MetadataCache {
        MetadataCache::new(CacheConfig::default())
    }

    #[test]
    fn test_listing_round_trip_seeds_entries() {
        let cache = cache();
        let dir = RemotePath::new("/a");
        cache.put_listing(&dir, vec![file("b.txt", 5), file("c.txt", 7)]);

        let listing = cache.get_listing(&dir).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(cache.get_entry(&RemotePath::new("/a/c.txt")).unwrap().size, 7);
    }

    #[test]
    fn test_expired_entries_are_never_returned() {
        let config = CacheConfig::default()
            .dir_ttl(Duration::from_millis(20))
            .meta_ttl(Duration::from_millis(20));
        let cache = MetadataCache::new(config);
        let path = RemotePath::new("/x");
        cache.put_entry(&path, file("x", 1));
        assert!(cache.get_entry(&path).is_some());

        thread::sleep(Duration::from_millis(40));
        assert!(cache.get_entry(&path).is_none());
    }

    #[test]
    fn test_invalidate_drops_parent_listing() {
        let cache = cache();
        let dir = RemotePath::new("/a");
        let child = RemotePath::new("/a/b.txt");
        cache.put_listing(&dir, vec![file("b.txt", 5)]);

        cache.invalidate(&child);

        assert!(cache.get_entry(&child).is_none());
        assert!(cache.get_listing(&dir).is_none(), "parent listing must not keep a stale child");
    }

    #[test]
    fn test_invalidate_subtree() {
        let cache = cache();
        cache.put_listing(&RemotePath::new("/a"), vec![RemoteEntry::directory("d", SystemTime::now())]);
        cache.put_listing(&RemotePath::new("/a/d"), vec![file("f", 1)]);
        cache.put_entry(&RemotePath::new("/ab"), file("ab", 1));

        cache.invalidate_subtree(&RemotePath::new("/a/d"));

        assert!(cache.get_listing(&RemotePath::new("/a/d")).is_none());
        assert!(cache.get_entry(&RemotePath::new("/a/d/f")).is_none());
        assert!(cache.get_listing(&RemotePath::new("/a")).is_none());
        assert!(cache.get_entry(&RemotePath::new("/ab")).is_some());
    }

    #[test]
    fn test_listing_fetched_across_child_invalidation_is_not_cached() {
        let cache = cache();
        let dir = RemotePath::new("/a");
        let epoch = cache.epoch(&dir);
        cache.invalidate(&RemotePath::new("/a/x.txt"));

        let listing = cache.put_listing_since(&dir, vec![file("x.txt", 1)], &epoch);
        assert_eq!(listing.len(), 1);
        assert!(cache.get_listing(&dir).is_none());
        assert!(cache.get_entry(&RemotePath::new("/a/x.txt")).is_none());

        let fresh = cache.epoch(&dir);
        cache.put_listing_since(&dir, vec![], &fresh);
        assert!(cache.get_listing(&dir).is_some());
    }

    #[test]
    fn test_entry_fetched_across_ancestor_rename_is_not_cached() {
        let cache = cache();
        let path = RemotePath::new("/a/b/c.txt");
        let epoch = cache.epoch(&path);
        cache.invalidate_subtree(&RemotePath::new("/a"));

        cache.put_entry_since(&path, file("c.txt", 1), &epoch);
        assert!(cache.get_entry(&path).is_none());
    }

    #[test]
    fn test_unrelated_invalidation_keeps_insert() {
        let cache = cache();
        let path = RemotePath::new("/a/c.txt");
        let epoch = cache.epoch(&path);
        let other = (0..64)
            .map(|i| RemotePath::new(format!("/z{i}/f")))
            .find(|p| Epochs::stripe(p) != Epochs::stripe(&path) && Epochs::stripe(&p.parent().unwrap()) != Epochs::stripe(&path))
            .unwrap();
        cache.invalidate(&other);

        cache.put_entry_since(&path, file("c.txt", 1), &epoch);
        assert!(cache.get_entry(&path).is_some());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = MetadataCache::new(CacheConfig::disabled());
        let path = RemotePath::new("/f");
        cache.put_entry(&path, file("f", 1));
        cache.put_listing(&RemotePath::root(), vec![file("f", 1)]);
        assert!(cache.get_entry(&path).is_none());
        assert!(cache.get_listing(&RemotePath::root()).is_none());
        assert_eq!(cache.entry_stats().miss_count(), 1);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = cache();
        let path = RemotePath::new("/s");
        assert!(cache.get_entry(&path).is_none());
        cache.put_entry(&path, file("s", 3));
        assert!(cache.get_entry(&path).is_some());
        let snap = cache.entry_stats().snapshot();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.inserts, 1);
    }

    #[test]
    fn test_clear() {
        let cache = cache();
        cache.put_listing(&RemotePath::new("/a"), vec![file("b", 1)]);
        cache.clear();
        assert!(cache.get_listing(&RemotePath::new("/a")).is_none());
        assert!(cache.get_entry(&RemotePath::new("/a/b")).is_none());
    }

    #[test]
    fn test_concurrent_access_on_disjoint_paths() {
        let cache = Arc::new(cache());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let path = RemotePath::new(format!("/dir{i}/file"));
                    for n in 0..200 {
                        cache.put_entry(&path, file("file", n));
                        assert!(cache.get_entry(&path).is_some());
                        if n % 10 == 0 {
                            cache.invalidate(&path);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
