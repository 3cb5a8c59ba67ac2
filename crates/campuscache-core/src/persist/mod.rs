//! Persistent fallback store for offline access.
//!
//! Fetched results are written as JSON files so they survive restarts and can
//! be served when the device has no connection. Records are namespaced by user
//! and scope, pruned to the newest few per user after every write, and wiped
//! on sign-out.

mod record;
mod store;

pub use record::PersistedRecord;
pub use store::{PersistentStore, RecordInfo, StaleRecord};
