//! HTTP remote for a PostgREST-style backend.
//!
//! Resources map to `GET {base}/rest/v1/{resource}`; filters become query
//! parameters (`school_id=eq.S1`, `name=ilike.*ali*`, `order=name`, `limit=20`).

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, FilterSpec, RemoteFetch};

/// Path prefix of the REST endpoint under the project base URL
const REST_PATH: &str = "rest/v1";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) and 5xx responses.
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            token: None,
        })
    }

    /// Project API key, sent as the `apikey` header.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Create a copy carrying a user's bearer token, sharing the connection pool.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..self.clone()
        }
    }

    fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, resource)
    }

    fn headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref key) = self.api_key {
            headers.insert("apikey", header::HeaderValue::from_str(key)?);
        }
        // Without a user token the API key doubles as the bearer.
        if let Some(bearer) = self.token.as_ref().or(self.api_key.as_ref()) {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", bearer))?,
            );
        }
        Ok(headers)
    }

    /// Translate a filter into PostgREST query parameters.
    pub fn query_params(filter: &FilterSpec) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = filter
            .eq
            .iter()
            .map(|(field, value)| {
                let op = match value {
                    Value::Null => "is.null".to_string(),
                    Value::String(s) => format!("eq.{}", s),
                    other => format!("eq.{}", other),
                };
                (field.clone(), op)
            })
            .collect();

        if let Some(ref search) = filter.search {
            params.push((search.field.clone(), format!("ilike.*{}*", search.query)));
        }
        if let Some(ref order) = filter.order_by {
            params.push(("order".to_string(), order.clone()));
        }
        if let Some(limit) = filter.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }

    /// Split a response into success or the backend's error.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }

    async fn get_records(&self, resource: &str, params: &[(String, String)]) -> Result<Vec<Value>> {
        let url = self.resource_url(resource);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .get(&url)
                .headers(self.headers()?)
                .query(params)
                .send()
                .await
                .with_context(|| format!("Failed to send GET request to {}", url))?;

            match Self::check_response(response).await {
                Ok(response) => {
                    let records: Vec<Value> = response
                        .json()
                        .await
                        .with_context(|| format!("Failed to parse JSON response from {}", url))?;
                    debug!(resource = %resource, count = records.len(), "Fetched records");
                    return Ok(records);
                }
                Err(e) if e.is_retryable() && retries < MAX_RETRIES => {
                    retries += 1;
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, error = %e, "Request failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl RemoteFetch for HttpRemote {
    fn fetch(&self, resource: &str, filter: &FilterSpec) -> BoxFuture<'static, Result<Vec<Value>>> {
        let remote = self.clone();
        let resource = resource.to_string();
        let params = Self::query_params(filter);
        async move {
            remote
                .get_records(&resource, &params)
                .await
                .with_context(|| format!("Failed to fetch {}", resource))
        }
        .boxed()
    }
}
