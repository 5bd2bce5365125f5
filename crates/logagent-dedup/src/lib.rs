//! Bounded LRU-with-TTL set of content hashes.
//!
//! Lock discipline: a single coarse `parking_lot::Mutex` guards the whole
//! cache. `lru::LruCache` keeps `seen_or_insert` at O(1), which is enough
//! to hold the hot path under a microsecond even behind one lock —
//! striping would only help if profiling showed contention here.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use logagent_core::DedupKey;
use lru::LruCache;
use metrics::{counter, gauge};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct DedupCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<DedupKey, Instant>,
    hits: u64,
    misses: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns `true` if `key` was already seen within `ttl` (duplicate).
    /// Otherwise records it as first-seen at `now` and returns `false`.
    pub fn seen_or_insert(&self, key: DedupKey) -> bool {
        let now = Instant::now();
        let mut guard = self.inner.lock();

        if let Some(first_seen) = guard.entries.peek(&key).copied() {
            if now.duration_since(first_seen) <= self.ttl {
                guard.hits += 1;
                counter!("logagent.dedup.hits", 1);
                return true;
            }
            // TTL-expired: lazily remove and treat as a fresh insert.
            guard.entries.pop(&key);
        }

        guard.misses += 1;
        guard.entries.push(key, now);
        counter!("logagent.dedup.misses", 1);
        gauge!("logagent.dedup.cache_size", guard.entries.len() as f64);
        false
    }

    /// Background sweep: drop TTL-expired entries. Rebuilds the cache into
    /// a freshly allocated `LruCache` rather than removing in place, so the
    /// backing array's capacity is actually released when a burst of
    /// short-lived keys ages out instead of leaving a sparsely populated
    /// table at the old high-water size.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut guard = self.inner.lock();

        let live: Vec<(DedupKey, Instant)> = guard
            .entries
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) <= self.ttl)
            .map(|(k, v)| (*k, *v))
            .collect();

        let mut fresh = LruCache::new(NonZeroUsize::new(self.capacity).unwrap());
        for (key, seen) in live.into_iter().rev() {
            fresh.push(key, seen);
        }
        guard.entries = fresh;
        gauge!("logagent.dedup.cache_size", guard.entries.len() as f64);
    }

    pub fn stats(&self) -> DedupStats {
        let guard = self.inner.lock();
        DedupStats {
            size: guard.entries.len(),
            capacity: self.capacity,
            hits: guard.hits,
            misses: guard.misses,
        }
    }
}
