//! Cache telemetry counters.
//!
//! A single `Telemetry` instance is shared (via `Arc`) by every component of a
//! `CacheClient`. Counters are plain atomics so recording never blocks a read
//! path; `snapshot()` produces the serializable view an operator dashboard
//! consumes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Telemetry {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidated: AtomicU64,
    remote_fetches: AtomicU64,
    remote_failures: AtomicU64,
    timeouts: AtomicU64,
    deduplicated: AtomicU64,
    in_flight: AtomicU64,
    persisted_hits: AtomicU64,
    persisted_misses: AtomicU64,
    persisted_corrupted: AtomicU64,
    persisted_unavailable: AtomicU64,
    stale_served: AtomicU64,
    discarded_writes: AtomicU64,
    search_hits: AtomicU64,
    search_misses: AtomicU64,
    search_cancelled: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_hit => hits,
        record_miss => misses,
        record_eviction => evictions,
        record_expiration => expirations,
        record_remote_fetch => remote_fetches,
        record_remote_failure => remote_failures,
        record_timeout => timeouts,
        record_deduplicated => deduplicated,
        record_persisted_hit => persisted_hits,
        record_persisted_miss => persisted_misses,
        record_persisted_corrupted => persisted_corrupted,
        record_persisted_unavailable => persisted_unavailable,
        record_stale_served => stale_served,
        record_discarded_write => discarded_writes,
        record_search_hit => search_hits,
        record_search_miss => search_misses,
        record_search_cancelled => search_cancelled,
    }

    pub fn record_invalidated(&self, count: usize) {
        self.invalidated.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn fetch_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_settled(&self) {
        // Saturating: a settle without a matching start must not wrap around.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Take a point-in-time copy of every counter. `size` is supplied by the
    /// caller since entry count lives in the store, not here.
    pub fn snapshot(&self, size: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            hits: load(&self.hits),
            misses: load(&self.misses),
            size,
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            invalidated: load(&self.invalidated),
            remote_fetches: load(&self.remote_fetches),
            remote_failures: load(&self.remote_failures),
            timeouts: load(&self.timeouts),
            deduplicated: load(&self.deduplicated),
            in_flight: load(&self.in_flight),
            persisted_hits: load(&self.persisted_hits),
            persisted_misses: load(&self.persisted_misses),
            persisted_corrupted: load(&self.persisted_corrupted),
            persisted_unavailable: load(&self.persisted_unavailable),
            stale_served: load(&self.stale_served),
            discarded_writes: load(&self.discarded_writes),
            search_hits: load(&self.search_hits),
            search_misses: load(&self.search_misses),
            search_cancelled: load(&self.search_cancelled),
        }
    }
}

/// Serializable counters for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidated: u64,
    pub remote_fetches: u64,
    pub remote_failures: u64,
    pub timeouts: u64,
    /// Callers that joined an existing in-flight fetch instead of issuing one
    pub deduplicated: u64,
    /// Remote fetches currently outstanding (queue depth)
    pub in_flight: u64,
    pub persisted_hits: u64,
    pub persisted_misses: u64,
    pub persisted_corrupted: u64,
    pub persisted_unavailable: u64,
    pub stale_served: u64,
    /// Fetch results dropped because an invalidation raced the fetch
    pub discarded_writes: u64,
    pub search_hits: u64,
    pub search_misses: u64,
    pub search_cancelled: u64,
}

impl StatsSnapshot {
    /// Fraction of in-memory lookups that hit, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
