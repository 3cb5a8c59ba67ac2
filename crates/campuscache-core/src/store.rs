//! In-memory cache store.
//!
//! Entries are keyed by `resource:filterSignature:scopeId`, carry a TTL and a
//! set of tags, and are held in an LRU so the entry evicted under pressure is
//! the one read least recently (not merely written least recently).
//!
//! Nothing here returns an error. A poisoned lock is recovered and the store
//! keeps serving; the worst outcome of any internal problem is a miss.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::lock::mutex_lock;
use crate::stats::Telemetry;

const SOURCE: &str = "store";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Value>,
    pub created_at: Instant,
    pub ttl: Duration,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Valid for reads iff `now - created_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

/// `{hits, misses, size}` as reported by the store itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    /// Bumped on every invalidation or clear
    sequence: u64,
    tag_invalidated_at: HashMap<String, u64>,
    key_invalidated_at: HashMap<String, u64>,
    cleared_at: u64,
}

impl Inner {
    fn invalidated_since(&self, key: &str, tags: &BTreeSet<String>, since: u64) -> bool {
        if self.cleared_at > since {
            return true;
        }
        if self.key_invalidated_at.get(key).is_some_and(|&at| at > since) {
            return true;
        }
        tags.iter().any(|tag| {
            self.tag_invalidated_at
                .get(tag)
                .is_some_and(|&at| at > since)
        })
    }

    fn insert(&mut self, entry: CacheEntry, telemetry: &Telemetry) {
        let key = entry.key.clone();
        if let Some((evicted_key, _)) = self.entries.push(key.clone(), entry) {
            if evicted_key != key {
                debug!(key = %evicted_key, "Evicted least recently used cache entry");
                telemetry.record_eviction();
            }
        }
    }
}

pub struct CacheStore {
    inner: Mutex<Inner>,
    telemetry: Arc<Telemetry>,
}

impl CacheStore {
    pub fn new(max_entries: usize, telemetry: Arc<Telemetry>) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                sequence: 0,
                tag_invalidated_at: HashMap::new(),
                key_invalidated_at: HashMap::new(),
                cleared_at: 0,
            }),
            telemetry,
        }
    }

    /// Look up a fresh value, counting a hit or a miss.
    ///
    /// An expired entry is removed on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "get");

        let lookup = inner
            .entries
            .get(key)
            .map(|entry| entry.is_fresh(now).then(|| Arc::clone(&entry.value)));

        let fresh = match lookup {
            Some(Some(value)) => Some(value),
            Some(None) => {
                inner.entries.pop(key);
                self.telemetry.record_expiration();
                debug!(key = %key, "Cache entry expired");
                None
            }
            None => None,
        };

        match fresh {
            Some(value) => {
                self.telemetry.record_hit();
                Some(value)
            }
            None => {
                self.telemetry.record_miss();
                None
            }
        }
    }

    /// Insert or overwrite `key`, resetting its creation time.
    pub fn set(&self, key: &str, value: Arc<Value>, ttl: Duration, tags: &[String]) {
        let entry = Self::entry(key, value, ttl, tags);
        let mut inner = mutex_lock(&self.inner, SOURCE, "set");
        inner.insert(entry, &self.telemetry);
    }

    /// Store a fetch result only if nothing relevant was invalidated after
    /// `since` (a value of [`CacheStore::sequence`] taken when the fetch began).
    ///
    /// Returns whether the entry was written.
    pub fn set_unless_invalidated(
        &self,
        key: &str,
        value: Arc<Value>,
        ttl: Duration,
        tags: &[String],
        since: u64,
    ) -> bool {
        let entry = Self::entry(key, value, ttl, tags);
        let mut inner = mutex_lock(&self.inner, SOURCE, "set_unless_invalidated");
        if inner.invalidated_since(key, &entry.tags, since) {
            debug!(key = %key, since, "Discarding fetch result invalidated while in flight");
            self.telemetry.record_discarded_write();
            return false;
        }
        inner.insert(entry, &self.telemetry);
        true
    }

    /// Whether `key` or any of `tags` was invalidated (or the store cleared)
    /// after `since`.
    pub fn invalidated_since(&self, key: &str, tags: &[String], since: u64) -> bool {
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        mutex_lock(&self.inner, SOURCE, "invalidated_since").invalidated_since(key, &tags, since)
    }

    fn entry(key: &str, value: Arc<Value>, ttl: Duration, tags: &[String]) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value,
            created_at: Instant::now(),
            ttl,
            tags: tags.iter().cloned().collect(),
        }
    }

    /// Current invalidation sequence number.
    pub fn sequence(&self) -> u64 {
        mutex_lock(&self.inner, SOURCE, "sequence").sequence
    }

    pub fn invalidate_by_tag(&self, tag: &str) -> Vec<String> {
        self.invalidate_by_tags(&[tag.to_string()])
    }

    /// Remove every entry carrying any of `tags`. Returns the removed keys.
    ///
    /// Linear in the number of entries; the store is bounded and invalidation
    /// is rare compared to reads.
    pub fn invalidate_by_tags(&self, tags: &[String]) -> Vec<String> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_by_tags");
        inner.sequence += 1;
        let seq = inner.sequence;
        for tag in tags {
            inner.tag_invalidated_at.insert(tag.clone(), seq);
        }

        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.has_any_tag(tags))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.entries.pop(key);
        }

        self.telemetry.record_invalidated(doomed.len());
        debug!(?tags, removed = doomed.len(), "Invalidated cache entries by tag");
        doomed
    }

    /// Remove the given keys. Returns the keys that were actually present.
    pub fn invalidate_by_keys(&self, keys: &[String]) -> Vec<String> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_by_keys");
        inner.sequence += 1;
        let seq = inner.sequence;

        let mut removed = Vec::new();
        for key in keys {
            inner.key_invalidated_at.insert(key.clone(), seq);
            if inner.entries.pop(key).is_some() {
                removed.push(key.clone());
            }
        }

        self.telemetry.record_invalidated(removed.len());
        removed
    }

    pub fn clear(&self) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        inner.sequence += 1;
        inner.cleared_at = inner.sequence;
        inner.tag_invalidated_at.clear();
        inner.key_invalidated_at.clear();
        let removed = inner.entries.len();
        inner.entries.clear();
        debug!(removed, "Cleared in-memory cache");
    }

    /// Drop every expired entry now rather than waiting for a read.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "purge_expired");
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
            self.telemetry.record_expiration();
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.telemetry.hits(),
            misses: self.telemetry.misses(),
            size: self.len(),
        }
    }
}
