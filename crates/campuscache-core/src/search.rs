//! Debounced free-text search.
//!
//! [`SearchCache`] is a strict LRU of result lists keyed by the literal query
//! string. [`DebouncedSearch`] drives one search box:
//!
//! ```text
//! Idle -> Pending (debounce timer) -> Fetching -> Idle
//!                                        |
//!                                        +-> Cancelled -> Idle   (superseded or cancelled)
//! ```
//!
//! Every keystroke restarts the timer. A newer query aborts the task running
//! the older one, and each task also checks its generation before publishing,
//! so results of a superseded fetch can never replace those of a newer query.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SearchSettings;
use crate::lock::mutex_lock;
use crate::stats::Telemetry;

const SOURCE: &str = "search";

pub type SearchResults = Arc<Vec<Value>>;

/// Runs the remote query for a search string.
pub type SearchFetcher =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Vec<Value>>> + Send + Sync>;

struct SearchEntry {
    results: SearchResults,
    inserted_at: Instant,
}

pub struct SearchCache {
    entries: Mutex<LruCache<String, SearchEntry>>,
    ttl: Duration,
    /// Bumped by every removal, so fetches that started earlier are not stored
    epoch: AtomicU64,
    telemetry: Arc<Telemetry>,
}

impl SearchCache {
    pub fn new(max_entries: usize, ttl: Duration, telemetry: Arc<Telemetry>) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            epoch: AtomicU64::new(0),
            telemetry,
        }
    }

    /// Look up a query, marking it most recently used on a hit.
    pub fn get(&self, query: &str) -> Option<SearchResults> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let lookup = entries.get(query).map(|entry| {
            (now.saturating_duration_since(entry.inserted_at) < self.ttl)
                .then(|| Arc::clone(&entry.results))
        });

        match lookup {
            Some(Some(results)) => {
                self.telemetry.record_search_hit();
                Some(results)
            }
            Some(None) => {
                entries.pop(query);
                self.telemetry.record_search_miss();
                None
            }
            None => {
                self.telemetry.record_search_miss();
                None
            }
        }
    }

    pub fn put(&self, query: &str, results: Vec<Value>) -> SearchResults {
        let results = Arc::new(results);
        let entry = SearchEntry {
            results: Arc::clone(&results),
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = mutex_lock(&self.entries, SOURCE, "put").push(query.to_string(), entry) {
            if evicted != query {
                debug!(query = %evicted, "Evicted least recently used search results");
            }
        }
        results
    }

    /// Current removal epoch, taken before starting a fetch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// [`SearchCache::put`], unless anything was removed after `since`.
    /// The results are returned either way.
    pub fn put_since(&self, query: &str, results: Vec<Value>, since: u64) -> SearchResults {
        if self.epoch() != since {
            debug!(query = %query, "Not caching search results invalidated while in flight");
            return Arc::new(results);
        }
        self.put(query, results)
    }

    /// Drop every cached query whose key starts with `prefix`.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "remove_prefix");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn contains(&self, query: &str) -> bool {
        mutex_lock(&self.entries, SOURCE, "contains").contains(query)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "clear");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Idle,
    /// Debounce timer running
    Pending,
    Fetching,
    /// Explicitly cancelled; no fetch is live
    Cancelled,
}

/// What a search box should display.
#[derive(Debug, Clone)]
pub struct SearchSnapshot {
    pub query: String,
    pub results: SearchResults,
    pub phase: SearchPhase,
    pub from_cache: bool,
    pub error: Option<String>,
}

impl Default for SearchSnapshot {
    fn default() -> Self {
        Self {
            query: String::new(),
            results: Arc::new(Vec::new()),
            phase: SearchPhase::Idle,
            from_cache: false,
            error: None,
        }
    }
}

/// State shared between a search box and its worker tasks.
#[derive(Clone)]
struct SearchWorker {
    cache: Arc<SearchCache>,
    fetcher: SearchFetcher,
    debounce: Duration,
    min_query_len: usize,
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<SearchSnapshot>>,
}

impl SearchWorker {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Apply `update` only if `generation` is still the newest input.
    fn publish(&self, generation: u64, update: impl FnOnce(&mut SearchSnapshot)) -> bool {
        self.state.send_if_modified(|snapshot| {
            if self.is_current(generation) {
                update(snapshot);
                true
            } else {
                false
            }
        })
    }

    async fn run(self, query: String, generation: u64) {
        tokio::time::sleep(self.debounce).await;
        if !self.is_current(generation) {
            return;
        }

        if query.trim().chars().count() < self.min_query_len {
            self.publish(generation, |s| {
                s.results = Arc::new(Vec::new());
                s.phase = SearchPhase::Idle;
                s.from_cache = false;
                s.error = None;
            });
            return;
        }

        if let Some(results) = self.cache.get(&query) {
            debug!(query = %query, "Search served from cache");
            self.publish(generation, |s| {
                s.results = results;
                s.phase = SearchPhase::Idle;
                s.from_cache = true;
                s.error = None;
            });
            return;
        }

        self.publish(generation, |s| s.phase = SearchPhase::Fetching);
        let since = self.cache.epoch();
        let outcome = (self.fetcher)(query.clone()).await;

        if !self.is_current(generation) {
            debug!(query = %query, "Discarding results of superseded search");
            return;
        }

        match outcome {
            Ok(records) => {
                let results = self.cache.put_since(&query, records, since);
                self.publish(generation, |s| {
                    s.results = results;
                    s.phase = SearchPhase::Idle;
                    s.from_cache = false;
                    s.error = None;
                });
            }
            Err(e) => {
                warn!(query = %query, error = %e, "Search fetch failed");
                self.publish(generation, |s| {
                    s.phase = SearchPhase::Idle;
                    s.error = Some(format!("{:#}", e));
                });
            }
        }
    }
}

/// One search box. Must be used from within a tokio runtime.
pub struct DebouncedSearch {
    worker: SearchWorker,
    task: Mutex<Option<JoinHandle<()>>>,
    telemetry: Arc<Telemetry>,
}

impl DebouncedSearch {
    pub fn new(fetcher: SearchFetcher, settings: &SearchSettings, telemetry: Arc<Telemetry>) -> Self {
        let cache = Arc::new(SearchCache::new(
            settings.max_entries,
            settings.ttl(),
            Arc::clone(&telemetry),
        ));
        Self::with_cache(fetcher, settings, cache, telemetry)
    }

    /// A search box whose result cache is owned elsewhere, so it can be
    /// cleared when the searched data changes.
    pub fn with_cache(
        fetcher: SearchFetcher,
        settings: &SearchSettings,
        cache: Arc<SearchCache>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (state, _) = watch::channel(SearchSnapshot::default());
        Self {
            worker: SearchWorker {
                cache,
                fetcher,
                debounce: settings.debounce(),
                min_query_len: settings.min_query_len,
                generation: Arc::new(AtomicU64::new(0)),
                state: Arc::new(state),
            },
            task: Mutex::new(None),
            telemetry,
        }
    }

    /// Register a keystroke: restart the debounce timer for `query`.
    pub fn input(&self, query: impl Into<String>) {
        let query = query.into();
        let generation = self.worker.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut task = mutex_lock(&self.task, SOURCE, "input");
        self.stop(task.take());

        self.worker.state.send_modify(|s| {
            s.query = query.clone();
            s.phase = SearchPhase::Pending;
        });
        let worker = self.worker.clone();
        *task = Some(tokio::spawn(worker.run(query, generation)));
    }

    /// Abandon whatever is pending or in flight.
    pub fn cancel(&self) {
        self.worker.generation.fetch_add(1, Ordering::SeqCst);
        let mut task = mutex_lock(&self.task, SOURCE, "cancel");
        self.stop(task.take());
        self.worker.state.send_modify(|s| s.phase = SearchPhase::Cancelled);
        self.worker.state.send_modify(|s| s.phase = SearchPhase::Idle);
    }

    fn stop(&self, previous: Option<JoinHandle<()>>) {
        let Some(previous) = previous else {
            return;
        };
        if previous.is_finished() {
            return;
        }
        if self.phase() == SearchPhase::Fetching {
            debug!(query = %self.worker.state.borrow().query, "Cancelling in-flight search");
            self.telemetry.record_search_cancelled();
        }
        previous.abort();
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchSnapshot> {
        self.worker.state.subscribe()
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.worker.state.borrow().clone()
    }

    pub fn phase(&self) -> SearchPhase {
        self.worker.state.borrow().phase
    }

    pub fn cache(&self) -> &SearchCache {
        &self.worker.cache
    }
}

impl Drop for DebouncedSearch {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.task, SOURCE, "drop").take() {
            task.abort();
        }
    }
}
