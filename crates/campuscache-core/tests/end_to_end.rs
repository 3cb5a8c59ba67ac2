use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Value};
use tempfile::TempDir;

use campuscache_core::{
    CachePolicy, CacheClient, CacheSettings, FetchError, FilterSpec, Namespace, QueryOptions,
    RemoteFetch, SearchOptions, SearchPhase,
};

/// Backend double: counts calls, answers after a delay, can be made to fail.
struct FakeRemote {
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl FakeRemote {
    fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl RemoteFetch for FakeRemote {
    fn fetch(&self, resource: &str, filter: &FilterSpec) -> BoxFuture<'static, Result<Vec<Value>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.failing.load(Ordering::SeqCst);
        let delay = self.delay;
        let row = json!({
            "resource": resource,
            "search": filter.search.as_ref().map(|s| s.query.clone()),
            "call": call,
        });
        async move {
            tokio::time::sleep(delay).await;
            if failing {
                anyhow::bail!("backend unavailable");
            }
            Ok(vec![row])
        }
        .boxed()
    }
}

fn settings(dir: &TempDir) -> CacheSettings {
    let mut settings = CacheSettings::default();
    settings.persist.dir = Some(dir.path().to_path_buf());
    settings
}

fn client(dir: &TempDir, remote: &Arc<FakeRemote>) -> CacheClient {
    let client = CacheClient::new(&settings(dir), remote.clone()).unwrap();
    client.sign_in(Namespace::new("teacher-1", "S1"));
    client
}

fn tags(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|t| t.to_string()).collect()
}

fn classes_in_s1() -> QueryOptions {
    QueryOptions::new()
        .filters(FilterSpec::new().eq("school", "S1"))
        .policy(CachePolicy::new(
            Duration::from_millis(300_000),
            tags(&["classes-S1"]),
        ))
}

#[tokio::test]
async fn test_miss_hit_invalidate_refetch() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(5);
    let client = client(&dir, &remote);

    let first = client.query("classes", classes_in_s1()).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(remote.calls(), 1);

    let second = client.query("classes", classes_in_s1()).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.data, first.data);
    assert_eq!(remote.calls(), 1);

    let report = client.invalidate(&tags(&["classes-S1"])).await;
    assert_eq!(report.removed_keys.len(), 1);
    assert_eq!(report.persisted_removed, 1);

    let third = client.query("classes", classes_in_s1()).await.unwrap();
    assert!(!third.from_cache);
    assert_eq!(remote.calls(), 2);
    assert_eq!(third.data[0]["call"], 2);

    let stats = client.stats();
    assert_eq!((stats.hits, stats.size), (1, 1));
    assert_eq!(stats.remote_fetches, 2);
}

#[tokio::test]
async fn test_concurrent_queries_share_one_fetch() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(50);
    let client = client(&dir, &remote);

    let queries = (0..8).map(|_| client.query("students", QueryOptions::new()));
    let results = join_all(queries).await;

    assert_eq!(remote.calls(), 1);
    let first = &results[0].as_ref().unwrap().data;
    assert!(results.iter().all(|r| Arc::ptr_eq(&r.as_ref().unwrap().data, first)));
    assert_eq!(client.stats().deduplicated, 7);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_distinct_filters_and_scopes_cache_separately() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    let grade5 = QueryOptions::new().filters(FilterSpec::new().eq("grade", 5));
    let grade6 = QueryOptions::new().filters(FilterSpec::new().eq("grade", 6));
    client.query("students", grade5.clone()).await.unwrap();
    client.query("students", grade6).await.unwrap();
    client.query("students", grade5.clone().scope("S2")).await.unwrap();
    assert_eq!(remote.calls(), 3);

    assert!(client.query("students", grade5).await.unwrap().from_cache);
    assert_eq!(remote.calls(), 3);
}

#[tokio::test]
async fn test_mutation_invalidates_dependent_resources() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    for resource in ["students", "dashboard_stats", "subjects"] {
        client.query(resource, QueryOptions::new()).await.unwrap();
    }
    assert_eq!(remote.calls(), 3);

    let failed: Result<()> = client
        .mutate("students", None, async { anyhow::bail!("insert rejected") })
        .await;
    assert!(failed.is_err());
    assert!(client.query("students", QueryOptions::new()).await.unwrap().from_cache);

    let created = client
        .mutate("students", Some("S1"), async { Ok(json!({"id": "st-9"})) })
        .await
        .unwrap();
    assert_eq!(created["id"], "st-9");

    assert!(!client.query("students", QueryOptions::new()).await.unwrap().from_cache);
    assert!(!client.query("dashboard_stats", QueryOptions::new()).await.unwrap().from_cache);
    assert!(client.query("subjects", QueryOptions::new()).await.unwrap().from_cache);
    assert_eq!(remote.calls(), 5);
}

#[tokio::test]
async fn test_fetch_failure_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    remote.fail(true);
    let err = client.query("fees", QueryOptions::new()).await.unwrap_err();
    assert!(matches!(err, FetchError::Remote(_)));
    assert!(err.to_string().contains("backend unavailable"));

    remote.fail(false);
    let ok = client.query("fees", QueryOptions::new()).await.unwrap();
    assert!(!ok.from_cache);
    assert_eq!(remote.calls(), 2);
    assert_eq!(client.stats().remote_failures, 1);
}

#[tokio::test]
async fn test_fetch_racing_invalidation_is_not_stored() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(50);
    let client = client(&dir, &remote);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query("classes", QueryOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.invalidate(&tags(&["classes-S1"])).await;

    let raced = pending.await.unwrap().unwrap();
    assert!(!raced.from_cache);

    let next = client.query("classes", QueryOptions::new()).await.unwrap();
    assert!(!next.from_cache, "pre-invalidation result must not be served");
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_timeout_reaches_every_caller() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(500);
    let mut settings = settings(&dir);
    settings.fetch_timeout_ms = Some(20);
    let client = CacheClient::new(&settings, remote.clone()).unwrap();

    let results = join_all((0..3).map(|_| client.query("grades", QueryOptions::new()))).await;
    assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_timeout())));
    assert_eq!(remote.calls(), 1);
    assert_eq!(client.stats().timeouts, 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_persisted_data_survives_restart() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    client(&dir, &remote)
        .query("teachers", QueryOptions::new())
        .await
        .unwrap();

    let restarted_remote = FakeRemote::new(1);
    let restarted = client(&dir, &restarted_remote);
    let result = restarted.query("teachers", QueryOptions::new()).await.unwrap();
    assert!(result.from_cache);
    assert!(!result.stale);
    assert_eq!(restarted_remote.calls(), 0);
    assert_eq!(restarted.stats().persisted_hits, 1);

    // Promoted into memory: the next read never touches disk.
    restarted.query("teachers", QueryOptions::new()).await.unwrap();
    assert_eq!(restarted.stats().hits, 1);
}

#[tokio::test]
async fn test_offline_serves_stale_records() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);
    let short = QueryOptions::new().policy(CachePolicy::new(
        Duration::from_millis(20),
        tags(&["attendance-S1"]),
    ));

    client.query("attendance", short.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    client.set_offline(true);
    let result = client.query("attendance", short).await.unwrap();
    assert!(result.from_cache);
    assert!(result.stale);
    assert_eq!(client.stats().stale_served, 1);

    let missing = client.query("grades", QueryOptions::new()).await.unwrap_err();
    assert!(matches!(missing, FetchError::Offline(_)));
    assert_eq!(remote.calls(), 1);

    let search = client
        .search("students", "name", "ali", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(search, FetchError::Offline(_)));
}

#[tokio::test]
async fn test_stale_on_error_falls_back_to_persisted() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    client.query("classes", QueryOptions::new()).await.unwrap();
    remote.fail(true);

    let forced = QueryOptions::new().force_refresh();
    assert!(client.query("classes", forced.clone()).await.is_err());

    let result = client
        .query("classes", forced.stale_on_error())
        .await
        .unwrap();
    assert!(result.from_cache);
    assert!(!result.stale, "record is still within its TTL");
    assert_eq!(result.data[0]["call"], 1);
}

#[tokio::test]
async fn test_sign_out_wipes_user_data() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    client.query("user_profile", QueryOptions::new()).await.unwrap();
    let store = client.persistent_store().unwrap();
    assert_eq!(store.records("teacher-1").await.len(), 1);

    client.sign_out().await;
    assert!(client.session().is_none());
    assert_eq!(client.stats().size, 0);
    assert!(store.records("teacher-1").await.is_empty());

    client.sign_in(Namespace::new("teacher-2", "S1"));
    let other = client.query("user_profile", QueryOptions::new()).await.unwrap();
    assert!(!other.from_cache);
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_records_are_isolated_per_user() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    client(&dir, &remote)
        .query("grades", QueryOptions::new())
        .await
        .unwrap();

    let other = CacheClient::new(&settings(&dir), remote.clone()).unwrap();
    other.sign_in(Namespace::new("teacher-2", "S1"));
    let result = other.query("grades", QueryOptions::new()).await.unwrap();
    assert!(!result.from_cache);
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_persisted_records_pruned_to_newest() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let mut settings = settings(&dir);
    settings.persist.max_records = 3;
    let client = CacheClient::new(&settings, remote.clone()).unwrap();
    client.sign_in(Namespace::new("teacher-1", "S1"));

    for grade in 1..=5 {
        let options = QueryOptions::new().filters(FilterSpec::new().eq("grade", grade));
        client.query("students", options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let records = client.persistent_store().unwrap().records("teacher-1").await;
    assert_eq!(records.len(), 3);
    assert!(records[0].key.contains(r#""grade":5"#));
    assert!(records.iter().all(|r| !r.key.contains(r#""grade":1"#)));
}

#[tokio::test]
async fn test_debounced_search_through_client() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(5);
    let client = client(&dir, &remote);

    let search = client.debounced_search("students", "name", SearchOptions::default());
    let mut rx = search.subscribe();
    search.input("al");
    search.input("ali");

    loop {
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.phase == SearchPhase::Idle && !snapshot.results.is_empty() {
            assert_eq!(snapshot.query, "ali");
            assert_eq!(snapshot.results[0]["search"], "ali");
            break;
        }
    }
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_invalidation_during_persist_write_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(0);
    let client = client(&dir, &remote);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query("classes", QueryOptions::new()).await })
    };
    // Stored in memory; the disk write is still under way.
    for _ in 0..10_000 {
        if client.stats().size == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    client.invalidate(&tags(&["classes-S1"])).await;
    pending.await.unwrap().unwrap();

    let store = client.persistent_store().unwrap();
    assert!(store.records("teacher-1").await.is_empty());

    let next = client.query("classes", QueryOptions::new()).await.unwrap();
    assert!(!next.from_cache, "pre-invalidation record must not be served");
    assert_eq!(next.data[0]["call"], 2);
}

#[tokio::test]
async fn test_read_during_invalidation_is_not_promoted() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(0);
    let client = client(&dir, &remote);
    client.query("classes", QueryOptions::new()).await.unwrap();

    let invalidation = {
        let client = client.clone();
        tokio::spawn(async move { client.invalidate(&tags(&["classes-S1"])).await })
    };
    // Memory is cleared; the persisted delete is still under way.
    for _ in 0..10_000 {
        if client.stats().size == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    let during = client.query("classes", QueryOptions::new()).await.unwrap();
    assert!(!during.from_cache);
    assert_eq!(during.data[0]["call"], 2);
    assert_eq!(invalidation.await.unwrap().persisted_removed, 1);

    let after = client.query("classes", QueryOptions::new()).await.unwrap();
    assert_eq!(after.data[0]["call"], 2);
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_mutation_clears_search_box_results() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);
    let search = client.debounced_search("students", "name", SearchOptions::default());

    async fn settle(search: &campuscache_core::DebouncedSearch, query: &str) -> bool {
        let mut rx = search.subscribe();
        search.input(query);
        loop {
            rx.changed().await.unwrap();
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.phase == SearchPhase::Idle && !snapshot.results.is_empty() {
                return snapshot.from_cache;
            }
        }
    }

    assert!(!settle(&search, "ali").await);
    assert!(settle(&search, "ali").await);
    assert_eq!(remote.calls(), 1);

    client
        .mutate("students", None, async { Ok(()) })
        .await
        .unwrap();
    assert!(search.cache().is_empty());
    assert!(!settle(&search, "ali").await);
    assert_eq!(remote.calls(), 2);

    // A write the box does not depend on leaves it alone.
    client.mutate("fees", None, async { Ok(()) }).await.unwrap();
    assert!(settle(&search, "ali").await);
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_mutation_clears_searches_of_dependent_resources() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::new(1);
    let client = client(&dir, &remote);

    client
        .search("students", "name", "ali", SearchOptions::default())
        .await
        .unwrap();
    client
        .mutate("classes", None, async { Ok(()) })
        .await
        .unwrap();
    let results = client
        .search("students", "name", "ali", SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(results[0]["call"], 2);
    assert_eq!(remote.calls(), 2);
}
