//! Tag-based invalidation across both cache tiers.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::config::PolicyTable;
use crate::persist::PersistentStore;
use crate::store::CacheStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// In-memory keys that were removed
    pub removed_keys: Vec<String>,
    /// Persisted records deleted, across every user on the device
    pub persisted_removed: usize,
}

pub struct Invalidator {
    memory: Arc<CacheStore>,
    persistent: Option<Arc<PersistentStore>>,
    policies: Arc<PolicyTable>,
    /// Shared by persisted reads and writes, exclusive while records are
    /// being deleted.
    persisted_gate: RwLock<()>,
}

impl Invalidator {
    pub fn new(
        memory: Arc<CacheStore>,
        persistent: Option<Arc<PersistentStore>>,
        policies: Arc<PolicyTable>,
    ) -> Self {
        Self {
            memory,
            persistent,
            policies,
            persisted_gate: RwLock::new(()),
        }
    }

    /// Hold this across any persisted read or write whose outcome must not
    /// interleave with a delete. A reader that takes
    /// [`CacheStore::sequence`] before acquiring it and checks
    /// [`CacheStore::invalidated_since`] while holding it sees every
    /// invalidation either in memory or on disk.
    pub async fn persisted_access(&self) -> RwLockReadGuard<'_, ()> {
        self.persisted_gate.read().await
    }

    /// Remove every entry carrying any of `tags`, in memory and in the
    /// persisted records of every user on the device.
    ///
    /// Memory is cleared before the first await. Persisted reads and writes
    /// already in progress finish before the delete starts, and new ones wait
    /// for it, so nothing read before the call can be promoted back into
    /// memory or left on disk once it returns. Invalidating tags that match
    /// nothing is a no-op.
    pub async fn invalidate(&self, tags: &[String]) -> InvalidationReport {
        let removed_keys = self.memory.invalidate_by_tags(tags);

        let persisted_removed = match self.persistent {
            Some(ref persistent) => {
                let _exclusive = self.persisted_gate.write().await;
                persistent.remove_tagged(tags).await
            }
            None => 0,
        };

        if !removed_keys.is_empty() || persisted_removed > 0 {
            info!(
                ?tags,
                memory = removed_keys.len(),
                persisted = persisted_removed,
                "Invalidated cached data"
            );
        }

        InvalidationReport {
            removed_keys,
            persisted_removed,
        }
    }

    /// Invalidate everything a write to `resource` within `scope` affects.
    pub async fn invalidate_resource(&self, resource: &str, scope: &str) -> InvalidationReport {
        let tags = self.policies.mutation_tags(resource, scope);
        self.invalidate(&tags).await
    }

    /// Drop all of memory and, when given, everything persisted for `user_id`.
    pub async fn wipe_user(&self, user_id: Option<&str>) {
        self.memory.clear();
        if let (Some(persistent), Some(user)) = (&self.persistent, user_id) {
            let _exclusive = self.persisted_gate.write().await;
            persistent.clear_user_cache(user).await;
        }
    }
}
