//! The boundary to the backend data store.
//!
//! The cache layer never speaks a query language itself. Callers supply a
//! [`RemoteFetch`] implementation that turns a resource name and a
//! [`FilterSpec`] into JSON records; [`HttpRemote`] is the stock one for a
//! PostgREST-style REST endpoint.

pub mod error;
pub mod http;

use std::collections::BTreeMap;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::ApiError;
pub use http::HttpRemote;

/// Async "fetch records of this resource matching this filter" capability.
///
/// The returned future must not borrow `self` or the arguments: it may be
/// driven on another task after the call returns.
pub trait RemoteFetch: Send + Sync {
    fn fetch(&self, resource: &str, filter: &FilterSpec) -> BoxFuture<'static, Result<Vec<Value>>>;
}

/// Case-insensitive substring match on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSearch {
    pub field: String,
    pub query: String,
}

/// Backend-agnostic filter. Serializes deterministically (sorted maps), so
/// its JSON form doubles as the filter signature in cache keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eq: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<TextSearch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.insert(field.into(), value.into());
        self
    }

    pub fn search(mut self, field: impl Into<String>, query: impl Into<String>) -> Self {
        self.search = Some(TextSearch {
            field: field.into(),
            query: query.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Stable textual form of the filter, used inside cache keys.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
