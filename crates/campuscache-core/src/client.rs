//! The caller-facing cache API.
//!
//! A [`CacheClient`] is built once per application session and passed down
//! explicitly (it is cheap to clone). Reads go memory, then the persisted
//! fallback, then a deduplicated remote fetch; writes go through
//! [`CacheClient::mutate`], which invalidates everything the policy table
//! says the write affects.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use futures::future::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{CachePolicy, CacheSettings, PolicyTable, SearchSettings, GLOBAL_SCOPE};
use crate::dedup::RequestDeduplicator;
use crate::error::FetchError;
use crate::invalidate::{InvalidationReport, Invalidator};
use crate::lock::mutex_lock;
use crate::namespace::Namespace;
use crate::persist::PersistentStore;
use crate::remote::{FilterSpec, RemoteFetch};
use crate::search::{DebouncedSearch, SearchCache, SearchFetcher, SearchResults};
use crate::stats::{StatsSnapshot, Telemetry};
use crate::store::CacheStore;

const SOURCE: &str = "client";

/// Build the in-memory key for a query.
pub fn cache_key(resource: &str, filters: &FilterSpec, scope: &str) -> String {
    format!("{}:{}:{}", resource, filters.signature(), scope)
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filters: FilterSpec,
    /// Defaults to the signed-in scope, then [`GLOBAL_SCOPE`]
    pub scope: Option<String>,
    /// Overrides the policy table for this query
    pub policy: Option<CachePolicy>,
    /// Skip both cache tiers and go to the remote
    pub force_refresh: bool,
    /// Serve the persisted record, however old, if the remote fetch fails
    pub stale_on_error: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filters(mut self, filters: FilterSpec) -> Self {
        self.filters = filters;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn stale_on_error(mut self) -> Self {
        self.stale_on_error = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResult<T = Arc<Value>> {
    pub data: T,
    /// Served without a remote call
    pub from_cache: bool,
    /// Served from a persisted record past its TTL
    pub stale: bool,
}

impl<T> QueryResult<T> {
    fn fresh(data: T) -> Self {
        Self {
            data,
            from_cache: false,
            stale: false,
        }
    }

    fn cached(data: T) -> Self {
        Self {
            data,
            from_cache: true,
            stale: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Extra filters applied alongside the text search
    pub filters: FilterSpec,
}

#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    remote: Arc<dyn RemoteFetch>,
    memory: Arc<CacheStore>,
    persistent: Option<Arc<PersistentStore>>,
    invalidator: Invalidator,
    policies: Arc<PolicyTable>,
    dedup: RequestDeduplicator<Arc<Value>>,
    search_dedup: RequestDeduplicator<SearchResults>,
    search_cache: SearchCache,
    /// Result caches of live search boxes, by resource
    search_boxes: Mutex<Vec<(String, Weak<SearchCache>)>>,
    search_settings: SearchSettings,
    telemetry: Arc<Telemetry>,
    session: Mutex<Option<Namespace>>,
    offline: AtomicBool,
}

impl CacheClient {
    /// Build a client. The persistent store lives under
    /// [`CacheSettings::cache_dir`] unless persistence is disabled.
    pub fn new(settings: &CacheSettings, remote: Arc<dyn RemoteFetch>) -> Result<Self> {
        let telemetry = Arc::new(Telemetry::new());
        let policies = Arc::new(settings.policies.clone());
        let memory = Arc::new(CacheStore::new(settings.max_entries, Arc::clone(&telemetry)));

        let persistent = if settings.persist.enabled {
            let root = settings.cache_dir()?;
            debug!(root = %root.display(), "Using persistent cache directory");
            Some(Arc::new(PersistentStore::new(
                root,
                settings.persist.max_records,
                Arc::clone(&telemetry),
            )))
        } else {
            None
        };

        let invalidator = Invalidator::new(
            Arc::clone(&memory),
            persistent.clone(),
            Arc::clone(&policies),
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                remote,
                memory,
                persistent,
                invalidator,
                policies,
                dedup: RequestDeduplicator::new(settings.fetch_timeout(), Arc::clone(&telemetry)),
                search_dedup: RequestDeduplicator::new(
                    settings.fetch_timeout(),
                    Arc::clone(&telemetry),
                ),
                search_cache: SearchCache::new(
                    settings.search.max_entries,
                    settings.search.ttl(),
                    Arc::clone(&telemetry),
                ),
                search_boxes: Mutex::new(Vec::new()),
                search_settings: settings.search.clone(),
                telemetry,
                session: Mutex::new(None),
                offline: AtomicBool::new(false),
            }),
        })
    }

    /// Read `resource`, from cache when possible.
    pub async fn query(
        &self,
        resource: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, FetchError> {
        let inner = &self.inner;
        let scope = inner.resolve_scope(options.scope.as_deref());
        let policy = options
            .policy
            .clone()
            .unwrap_or_else(|| inner.policies.policy_for(resource, &scope));
        let key = cache_key(resource, &options.filters, &scope);
        let ns = inner.namespace_for(&scope);

        if self.is_offline() {
            return inner.serve_offline(&key, &policy, ns.as_ref()).await;
        }

        if !options.force_refresh {
            if let Some(data) = inner.memory.get(&key) {
                debug!(key = %key, "Memory cache hit");
                return Ok(QueryResult::cached(data));
            }
            if let Some(data) = inner.read_persisted(&key, &policy, ns.as_ref()).await {
                return Ok(QueryResult::cached(data));
            }
        }

        match ClientInner::fetch(inner, resource, &key, options.filters, policy.clone(), ns.clone()).await {
            Ok(data) => Ok(QueryResult::fresh(data)),
            Err(e) if options.stale_on_error => {
                match inner.read_stale(&key, &policy, ns.as_ref()).await {
                    Some(result) => {
                        warn!(key = %key, error = %e, "Remote fetch failed, serving persisted data");
                        Ok(result)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// [`CacheClient::query`], decoding the records into `T`.
    pub async fn query_as<T: DeserializeOwned>(
        &self,
        resource: &str,
        options: QueryOptions,
    ) -> Result<QueryResult<T>, FetchError> {
        let result = self.query(resource, options).await?;
        let data = T::deserialize(result.data.as_ref()).map_err(|e| {
            FetchError::remote(anyhow::Error::new(e).context(format!("Failed to decode {}", resource)))
        })?;
        Ok(QueryResult {
            data,
            from_cache: result.from_cache,
            stale: result.stale,
        })
    }

    /// Drop every cached entry carrying any of `tags`, in memory and in the
    /// persisted records of every user on this device.
    pub async fn invalidate(&self, tags: &[String]) -> InvalidationReport {
        self.inner.invalidator.invalidate(tags).await
    }

    /// Run a write against `resource` and, if it succeeds, invalidate every
    /// tag the policy table derives for it, along with cached searches over
    /// every affected resource. A failed write invalidates nothing.
    pub async fn mutate<T, Fut>(&self, resource: &str, scope: Option<&str>, write: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let inner = &self.inner;
        let scope = inner.resolve_scope(scope);
        match write.await {
            Ok(value) => {
                let report = inner.invalidator.invalidate_resource(resource, &scope).await;
                let searches = inner.drop_searches(&inner.policies.affected_resources(resource));
                debug!(
                    resource = %resource,
                    scope = %scope,
                    removed = report.removed_keys.len(),
                    searches,
                    "Write applied, dependent cache entries invalidated"
                );
                Ok(value)
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Write failed, cache left untouched");
                Err(e)
            }
        }
    }

    /// One-shot text search on `field` of `resource`. Queries shorter than
    /// the configured minimum return no results without fetching.
    pub async fn search(
        &self,
        resource: &str,
        field: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResults, FetchError> {
        let inner = &self.inner;
        if query.trim().chars().count() < inner.search_settings.min_query_len {
            return Ok(Arc::new(Vec::new()));
        }

        let key = format!(
            "{}:{}:{}:{}",
            resource,
            field,
            options.filters.signature(),
            query
        );
        if let Some(results) = inner.search_cache.get(&key) {
            return Ok(results);
        }
        if self.is_offline() {
            return Err(FetchError::Offline(key));
        }
        let since = inner.search_cache.epoch();

        let filter = options.filters.search(field, query);
        let fetch_inner = Arc::clone(inner);
        let resource_name = resource.to_string();
        let results = inner
            .search_dedup
            .fetch_once(&key, move || async move {
                fetch_inner.telemetry.record_remote_fetch();
                match fetch_inner.remote.fetch(&resource_name, &filter).await {
                    Ok(records) => Ok(Arc::new(records)),
                    Err(e) => {
                        fetch_inner.telemetry.record_remote_failure();
                        Err(FetchError::remote(e))
                    }
                }
            })
            .await?;

        inner
            .search_cache
            .put_since(&key, results.as_ref().clone(), since);
        Ok(results)
    }

    /// A search box over `field` of `resource`, debounced and cancellable.
    /// Its cached results are dropped whenever a write affects `resource`.
    /// Must be called from within a tokio runtime.
    pub fn debounced_search(
        &self,
        resource: &str,
        field: &str,
        options: SearchOptions,
    ) -> DebouncedSearch {
        let inner = Arc::clone(&self.inner);
        let field = field.to_string();

        let cache = Arc::new(SearchCache::new(
            inner.search_settings.max_entries,
            inner.search_settings.ttl(),
            Arc::clone(&inner.telemetry),
        ));
        {
            let mut boxes = mutex_lock(&inner.search_boxes, SOURCE, "debounced_search");
            boxes.retain(|(_, cache)| cache.strong_count() > 0);
            boxes.push((resource.to_string(), Arc::downgrade(&cache)));
        }
        let resource = resource.to_string();

        let fetcher: SearchFetcher = Arc::new(move |query: String| {
            let filter = options.filters.clone().search(field.clone(), query);
            let telemetry = Arc::clone(&inner.telemetry);
            let fetch = inner.remote.fetch(&resource, &filter);
            async move {
                telemetry.record_remote_fetch();
                let outcome = fetch.await;
                if outcome.is_err() {
                    telemetry.record_remote_failure();
                }
                outcome
            }
            .boxed()
        });

        DebouncedSearch::with_cache(
            fetcher,
            &self.inner.search_settings,
            cache,
            Arc::clone(&self.inner.telemetry),
        )
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.telemetry.snapshot(self.inner.memory.len())
    }

    /// Start a session. Switching to a different user drops everything held
    /// in memory so nothing read by the previous user is served.
    pub fn sign_in(&self, namespace: Namespace) {
        let previous = mutex_lock(&self.inner.session, SOURCE, "sign_in").replace(namespace.clone());
        if previous.as_ref().map(|ns| &ns.user_id) != Some(&namespace.user_id) {
            self.inner.memory.clear();
            self.inner.clear_searches();
        }
        info!(user = %namespace.user_id, scope = %namespace.scope_id, "Signed in");
    }

    /// End the session: clear memory and wipe the user's persisted records.
    pub async fn sign_out(&self) {
        let previous = mutex_lock(&self.inner.session, SOURCE, "sign_out").take();
        self.inner.clear_searches();
        let user = previous.as_ref().map(|ns| ns.user_id.as_str());
        self.inner.invalidator.wipe_user(user).await;

        if let Some(user) = user {
            info!(user = %user, "Signed out, cache cleared");
        }
    }

    pub fn session(&self) -> Option<Namespace> {
        mutex_lock(&self.inner.session, SOURCE, "session").clone()
    }

    /// While offline, queries are answered from cache only, accepting stale
    /// persisted records.
    pub fn set_offline(&self, offline: bool) {
        let was = self.inner.offline.swap(offline, Ordering::SeqCst);
        if was != offline {
            info!(offline, "Connectivity changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.memory.purge_expired()
    }

    pub fn persistent_store(&self) -> Option<&PersistentStore> {
        self.inner.persistent.as_deref()
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.inner.policies
    }

    /// Number of remote fetches currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.in_flight() + self.inner.search_dedup.in_flight()
    }
}

impl ClientInner {
    fn resolve_scope(&self, scope: Option<&str>) -> String {
        if let Some(scope) = scope {
            return scope.to_string();
        }
        mutex_lock(&self.session, SOURCE, "resolve_scope")
            .as_ref()
            .map(|ns| ns.scope_id.clone())
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string())
    }

    fn user_id(&self) -> Option<String> {
        mutex_lock(&self.session, SOURCE, "user_id")
            .as_ref()
            .map(|ns| ns.user_id.clone())
    }

    /// Persisted records are only read or written for a signed-in user.
    fn namespace_for(&self, scope: &str) -> Option<Namespace> {
        self.user_id().map(|user| Namespace::new(user, scope))
    }

    /// Drop cached searches over any of `resources`, in the client's own
    /// cache and in every live search box. Returns how many were dropped.
    fn drop_searches(&self, resources: &[String]) -> usize {
        let mut dropped = 0;
        for resource in resources {
            dropped += self.search_cache.remove_prefix(&format!("{}:", resource));
        }

        let mut boxes = mutex_lock(&self.search_boxes, SOURCE, "drop_searches");
        boxes.retain(|(_, cache)| cache.strong_count() > 0);
        for (resource, cache) in boxes.iter() {
            if !resources.contains(resource) {
                continue;
            }
            if let Some(cache) = cache.upgrade() {
                dropped += cache.len();
                cache.clear();
            }
        }
        dropped
    }

    fn clear_searches(&self) {
        self.search_cache.clear();
        let boxes = mutex_lock(&self.search_boxes, SOURCE, "clear_searches");
        for cache in boxes.iter().filter_map(|(_, cache)| cache.upgrade()) {
            cache.clear();
        }
    }

    /// Fresh persisted record, promoted into memory for the rest of its TTL.
    /// A record whose key or tags were invalidated while it was being read
    /// is a miss.
    async fn read_persisted(
        &self,
        key: &str,
        policy: &CachePolicy,
        ns: Option<&Namespace>,
    ) -> Option<Arc<Value>> {
        let (persistent, ns) = self.persistent.as_ref().zip(ns)?;
        let since = self.memory.sequence();
        let _access = self.invalidator.persisted_access().await;

        let record = match persistent.get_stale(key, policy, ns).await {
            Some(record) if !record.stale => record,
            _ => {
                self.telemetry.record_persisted_miss();
                return None;
            }
        };

        let data = Arc::new(record.data);
        let remaining = policy.ttl.saturating_sub(record.age);
        let promoted = if remaining > Duration::ZERO {
            self.memory
                .set_unless_invalidated(key, Arc::clone(&data), remaining, &policy.tags, since)
        } else {
            !self.memory.invalidated_since(key, &policy.tags, since)
        };
        if !promoted {
            debug!(key = %key, namespace = %ns, "Persisted record invalidated during read");
            self.telemetry.record_persisted_miss();
            return None;
        }

        self.telemetry.record_persisted_hit();
        debug!(key = %key, namespace = %ns, "Persisted cache hit");
        Some(data)
    }

    /// Persisted record at any age.
    async fn read_stale(
        &self,
        key: &str,
        policy: &CachePolicy,
        ns: Option<&Namespace>,
    ) -> Option<QueryResult> {
        let (persistent, ns) = self.persistent.as_ref().zip(ns)?;
        let _access = self.invalidator.persisted_access().await;
        let record = persistent.get_stale(key, policy, ns).await?;
        if record.stale {
            self.telemetry.record_stale_served();
        }
        Some(QueryResult {
            data: Arc::new(record.data),
            from_cache: true,
            stale: record.stale,
        })
    }

    async fn serve_offline(
        &self,
        key: &str,
        policy: &CachePolicy,
        ns: Option<&Namespace>,
    ) -> Result<QueryResult, FetchError> {
        if let Some(data) = self.memory.get(key) {
            return Ok(QueryResult::cached(data));
        }
        match self.read_stale(key, policy, ns).await {
            Some(result) => Ok(result),
            None => {
                debug!(key = %key, "Offline with nothing cached");
                Err(FetchError::Offline(key.to_string()))
            }
        }
    }

    /// Fetch through the deduplicator, then fill both cache tiers. A result
    /// whose tags were invalidated while the fetch was in flight is returned
    /// to the waiters but not cached.
    async fn fetch(
        this: &Arc<Self>,
        resource: &str,
        key: &str,
        filters: FilterSpec,
        policy: CachePolicy,
        ns: Option<Namespace>,
    ) -> Result<Arc<Value>, FetchError> {
        let since = this.memory.sequence();
        let inner = Arc::clone(this);
        let resource = resource.to_string();
        let task_key = key.to_string();

        this.dedup
            .fetch_once(key, move || async move {
                inner.telemetry.record_remote_fetch();
                let records = match inner.remote.fetch(&resource, &filters).await {
                    Ok(records) => records,
                    Err(e) => {
                        inner.telemetry.record_remote_failure();
                        error!(key = %task_key, error = %format!("{:#}", e), "Remote fetch failed");
                        return Err(FetchError::remote(e));
                    }
                };

                let data = Arc::new(Value::Array(records));
                let stored = inner.memory.set_unless_invalidated(
                    &task_key,
                    Arc::clone(&data),
                    policy.ttl,
                    &policy.tags,
                    since,
                );
                if stored {
                    if let (Some(persistent), Some(ns)) = (&inner.persistent, &ns) {
                        let _access = inner.invalidator.persisted_access().await;
                        let written = persistent.set(&task_key, &data, &policy, ns).await;
                        if written && inner.memory.invalidated_since(&task_key, &policy.tags, since) {
                            debug!(key = %task_key, "Removing persisted record invalidated during write");
                            persistent.remove(&task_key, ns).await;
                        }
                    }
                }
                Ok(data)
            })
            .await
    }
}
