//! campuscache core library.
//!
//! A client-side caching layer between application screens and a hosted
//! database. Screens ask a [`CacheClient`] for a resource; the client serves it
//! from memory, from a persisted offline copy, or from one shared remote fetch,
//! and keeps both tiers consistent when data is written.
//!
//! - [`store`]: in-memory TTL/tag cache with LRU eviction
//! - [`persist`]: per-user JSON file store for offline access
//! - [`dedup`]: one in-flight remote fetch per key
//! - [`invalidate`]: tag-based invalidation across both tiers
//! - [`search`]: debounced, cancellable free-text search
//! - [`remote`]: the backend seam and its HTTP implementation
//! - [`config`]: settings and the resource policy table

pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod invalidate;
mod lock;
pub mod namespace;
pub mod persist;
pub mod remote;
pub mod search;
pub mod stats;
pub mod store;

pub use client::{cache_key, CacheClient, QueryOptions, QueryResult, SearchOptions};
pub use config::{CachePolicy, CacheSettings, PolicyTable, ResourcePolicy, TtlSetting};
pub use error::FetchError;
pub use invalidate::InvalidationReport;
pub use namespace::Namespace;
pub use remote::{FilterSpec, HttpRemote, RemoteFetch};
pub use search::{DebouncedSearch, SearchPhase, SearchSnapshot};
pub use stats::StatsSnapshot;
