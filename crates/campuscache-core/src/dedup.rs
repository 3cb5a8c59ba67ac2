//! Request deduplication.
//!
//! Concurrent callers asking for the same key share one remote fetch. The
//! first caller's fetch is spawned onto the runtime and wrapped in a
//! [`Shared`] future; later callers clone that future and await the same
//! outcome. The table entry is removed as soon as the fetch settles, so a
//! caller arriving afterwards starts a fresh fetch.
//!
//! Fetches cannot be cancelled by callers: dropping every waiter leaves the
//! spawned task running to completion. The only bound is the optional timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, warn};

use crate::error::FetchError;
use crate::lock::mutex_lock;
use crate::stats::Telemetry;

const SOURCE: &str = "dedup";

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;
type InFlightTable<T> = Arc<Mutex<HashMap<String, SharedFetch<T>>>>;

pub struct RequestDeduplicator<T> {
    in_flight: InFlightTable<T>,
    timeout: Option<Duration>,
    telemetry: Arc<Telemetry>,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(timeout: Option<Duration>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            telemetry,
        }
    }

    /// Run `fetch` for `key` unless a fetch for it is already in flight, in
    /// which case wait for that one instead. `fetch` is only called when this
    /// caller starts the request.
    pub async fn fetch_once<F, Fut>(&self, key: &str, fetch: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let shared = {
            let mut table = mutex_lock(&self.in_flight, SOURCE, "fetch_once");
            match table.get(key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    self.telemetry.record_deduplicated();
                    existing.clone()
                }
                None => {
                    let shared = self.spawn(key.to_string(), fetch());
                    table.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn<Fut>(&self, key: String, fetch: Fut) -> SharedFetch<T>
    where
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let table = Arc::clone(&self.in_flight);
        let telemetry = Arc::clone(&self.telemetry);
        let timeout = self.timeout;
        let task_key = key.clone();

        telemetry.fetch_started();
        let handle = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fetch).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(key = %task_key, timeout_ms = limit.as_millis() as u64, "Remote fetch timed out");
                        telemetry.record_timeout();
                        Err(FetchError::TimedOut(limit))
                    }
                },
                None => fetch.await,
            };

            mutex_lock(&table, SOURCE, "settle").remove(&task_key);
            telemetry.fetch_settled();
            result
        });

        let table = Arc::clone(&self.in_flight);
        let telemetry = Arc::clone(&self.telemetry);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    // The task never reached its own cleanup.
                    error!(key = %key, error = %join_err, "Remote fetch task failed");
                    mutex_lock(&table, SOURCE, "settle_aborted").remove(&key);
                    telemetry.fetch_settled();
                    Err(FetchError::Aborted(join_err.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.in_flight, SOURCE, "in_flight").len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        mutex_lock(&self.in_flight, SOURCE, "is_in_flight").contains_key(key)
    }
}
