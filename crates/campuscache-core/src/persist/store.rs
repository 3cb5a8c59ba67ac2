use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CachePolicy;
use crate::namespace::Namespace;
use crate::stats::Telemetry;

use super::record::PersistedRecord;

const RECORD_EXTENSION: &str = "json";

/// Why a persisted read or write did not succeed. Never leaves this module:
/// every failure becomes a miss after being logged and counted.
#[derive(Error, Debug)]
enum PersistError {
    #[error("Corrupted cache record {path}: {source}")]
    Corrupted {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Cache storage unavailable at {path}: {source}")]
    Unavailable { path: PathBuf, source: io::Error },
}

impl PersistError {
    fn unavailable(path: &Path, source: io::Error) -> Self {
        PersistError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A persisted value served regardless of TTL, for offline use.
#[derive(Debug, Clone)]
pub struct StaleRecord {
    pub data: Value,
    pub age: Duration,
    /// True when the record is older than the policy TTL
    pub stale: bool,
}

/// Summary of one persisted record, for inspection.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub scope_id: String,
    pub key: String,
    pub timestamp: i64,
    pub age_display: String,
    pub tags: Vec<String>,
}

/// Device-local fallback store.
///
/// Layout: `{root}/{user}/{scope}/{key}.json`, each path component
/// percent-encoded. Wiping a user is a single directory removal.
pub struct PersistentStore {
    root: PathBuf,
    max_records: usize,
    telemetry: Arc<Telemetry>,
}

impl PersistentStore {
    pub fn new(root: PathBuf, max_records: usize, telemetry: Arc<Telemetry>) -> Self {
        Self {
            root,
            max_records,
            telemetry,
        }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join(encode_component(user_id))
    }

    fn record_path(&self, key: &str, ns: &Namespace) -> PathBuf {
        self.user_dir(&ns.user_id)
            .join(encode_component(&ns.scope_id))
            .join(format!("{}.{}", encode_component(key), RECORD_EXTENSION))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<PersistedRecord<Value>>, PersistError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::unavailable(path, e)),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| PersistError::Corrupted {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Log and count a swallowed failure. Corrupted records are deleted so
    /// they do not keep failing.
    async fn report(&self, op: &'static str, err: PersistError) {
        match err {
            PersistError::Corrupted { ref path, .. } => {
                warn!(op, failure = "corrupted_record", error = %err, "Discarding unreadable cache record");
                self.telemetry.record_persisted_corrupted();
                if let Err(e) = tokio::fs::remove_file(path).await {
                    debug!(path = %path.display(), error = %e, "Failed to remove corrupted cache record");
                }
            }
            PersistError::Unavailable { .. } => {
                warn!(op, failure = "storage_unavailable", error = %err, "Cache storage unavailable");
                self.telemetry.record_persisted_unavailable();
            }
        }
    }

    /// Read a value that is still within the policy TTL.
    pub async fn get(&self, key: &str, policy: &CachePolicy, ns: &Namespace) -> Option<Value> {
        let path = self.record_path(key, ns);
        match self.read_record(&path).await {
            Ok(Some(record)) if record.is_fresh(policy.ttl) => {
                debug!(key = %key, namespace = %ns, "Persisted cache hit");
                self.telemetry.record_persisted_hit();
                Some(record.data)
            }
            Ok(Some(record)) => {
                debug!(key = %key, namespace = %ns, age = %record.age_display(), "Persisted record expired");
                self.telemetry.record_persisted_miss();
                None
            }
            Ok(None) => {
                self.telemetry.record_persisted_miss();
                None
            }
            Err(e) => {
                self.report("get", e).await;
                None
            }
        }
    }

    /// Read a value regardless of TTL, flagging whether it has expired.
    pub async fn get_stale(
        &self,
        key: &str,
        policy: &CachePolicy,
        ns: &Namespace,
    ) -> Option<StaleRecord> {
        let path = self.record_path(key, ns);
        match self.read_record(&path).await {
            Ok(Some(record)) => {
                let stale = !record.is_fresh(policy.ttl);
                Some(StaleRecord {
                    age: record.age(),
                    stale,
                    data: record.data,
                })
            }
            Ok(None) => None,
            Err(e) => {
                self.report("get_stale", e).await;
                None
            }
        }
    }

    /// Write a record, then prune the user's oldest records beyond the limit.
    /// Returns whether the record was written.
    pub async fn set(&self, key: &str, value: &Value, policy: &CachePolicy, ns: &Namespace) -> bool {
        if !policy.persist {
            return false;
        }

        let path = self.record_path(key, ns);
        let record = PersistedRecord::new(value, policy.tags.clone());
        if let Err(e) = self.write_record(&path, &record).await {
            self.report("set", e).await;
            return false;
        }

        debug!(key = %key, namespace = %ns, "Persisted cache record");
        self.prune(&ns.user_id).await;
        true
    }

    async fn write_record(
        &self,
        path: &Path,
        record: &PersistedRecord<&Value>,
    ) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::unavailable(parent, e))?;
        }
        let contents = serde_json::to_vec(record).map_err(|source| PersistError::Corrupted {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| PersistError::unavailable(path, e))
    }

    /// Delete one record. Missing records are not an error.
    pub async fn remove(&self, key: &str, ns: &Namespace) -> bool {
        let path = self.record_path(key, ns);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                self.report("remove", PersistError::unavailable(&path, e)).await;
                false
            }
        }
    }

    /// Delete every record carrying one of `tags`, for every user and scope
    /// on this device.
    pub async fn remove_tagged(&self, tags: &[String]) -> usize {
        let user_dirs = match list_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                self.report("remove_tagged", PersistError::unavailable(&self.root, e))
                    .await;
                return 0;
            }
        };

        let mut removed = 0;
        for user_dir in user_dirs {
            for (path, record) in self.scan_dir(&user_dir).await {
                let tagged = record
                    .as_ref()
                    .is_some_and(|r| r.tags.iter().any(|t| tags.contains(t)));
                if tagged && tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, ?tags, "Removed persisted records by tag");
        }
        removed
    }

    /// Wipe everything stored for `user_id`. Called on sign-out.
    pub async fn clear_user_cache(&self, user_id: &str) -> bool {
        let dir = self.user_dir(user_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(user = %user_id, "Cleared persisted cache for user");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                self.report("clear_user_cache", PersistError::unavailable(&dir, e))
                    .await;
                false
            }
        }
    }

    /// List a user's records, newest first.
    pub async fn records(&self, user_id: &str) -> Vec<RecordInfo> {
        let user_dir = self.user_dir(user_id);
        let mut infos: Vec<RecordInfo> = self
            .scan_user(user_id)
            .await
            .into_iter()
            .filter_map(|(path, record)| {
                let record = record?;
                let scope_dir = path.parent()?;
                let scope = scope_dir.strip_prefix(&user_dir).ok()?.to_str()?;
                let key = path.file_stem()?.to_str()?;
                Some(RecordInfo {
                    scope_id: decode_component(scope),
                    key: decode_component(key),
                    timestamp: record.timestamp,
                    age_display: record.age_display(),
                    tags: record.tags,
                })
            })
            .collect();
        infos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        infos
    }

    /// Keep only the newest `max_records` records of a user.
    async fn prune(&self, user_id: &str) {
        let mut entries: Vec<(PathBuf, i64)> = self
            .scan_user(user_id)
            .await
            .into_iter()
            .map(|(path, record)| {
                // Unreadable records sort oldest and go first.
                let timestamp = record.map(|r| r.timestamp).unwrap_or(i64::MIN);
                (path, timestamp)
            })
            .collect();

        if entries.len() <= self.max_records {
            return;
        }

        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        for (path, _) in entries.split_off(self.max_records) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Pruned old cache record"),
                Err(e) => debug!(path = %path.display(), error = %e, "Failed to prune cache record"),
            }
        }
    }

    async fn scan_user(&self, user_id: &str) -> Vec<(PathBuf, Option<PersistedRecord<Value>>)> {
        self.scan_dir(&self.user_dir(user_id)).await
    }

    /// Every record file under a user directory with its parsed contents
    /// (`None` when unreadable).
    async fn scan_dir(&self, user_dir: &Path) -> Vec<(PathBuf, Option<PersistedRecord<Value>>)> {
        let mut found = Vec::new();

        let scope_dirs = match list_dir(user_dir).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return found,
            Err(e) => {
                self.report("scan", PersistError::unavailable(user_dir, e)).await;
                return found;
            }
        };

        for scope_dir in scope_dirs {
            let files = match list_dir(&scope_dir).await {
                Ok(files) => files,
                Err(e) => {
                    debug!(path = %scope_dir.display(), error = %e, "Skipping unreadable scope directory");
                    continue;
                }
            };
            for path in files {
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                    continue;
                }
                let record = self.read_record(&path).await.ok().flatten();
                found.push((path, record));
            }
        }

        found
    }
}

async fn list_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

/// Make an arbitrary string safe as a single path component.
/// Percent-encodes everything outside the unreserved set, and `.` as well so
/// no component can be `.` or `..`. The empty string becomes `%`.
pub(crate) fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    urlencoding::encode(raw).replace('.', "%2E")
}

pub(crate) fn decode_component(encoded: &str) -> String {
    if encoded == "%" {
        return String::new();
    }
    String::from_utf8_lossy(&urlencoding::decode_binary(encoded.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path, max_records: usize) -> (PersistentStore, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::new());
        (
            PersistentStore::new(dir.to_path_buf(), max_records, Arc::clone(&telemetry)),
            telemetry,
        )
    }

    fn policy(ttl_secs: u64, tags: &[&str]) -> CachePolicy {
        CachePolicy::new(
            Duration::from_secs(ttl_secs),
            tags.iter().map(|t| t.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let (store, telemetry) = store(dir.path(), 10);
        let ns = Namespace::new("teacher-1", "S1");

        assert!(store.set("classes:{}:S1", &json!([{"id": 1}]), &policy(300, &[]), &ns).await);
        let value = store.get("classes:{}:S1", &policy(300, &[]), &ns).await;
        assert_eq!(value, Some(json!([{"id": 1}])));
        assert_eq!(telemetry.snapshot(0).persisted_hits, 1);
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let p = policy(300, &[]);

        store
            .set("grades", &json!(["A"]), &p, &Namespace::new("userA", "S1"))
            .await;

        assert!(store.get("grades", &p, &Namespace::new("userB", "S1")).await.is_none());
        assert!(store.get("grades", &p, &Namespace::new("userA", "S2")).await.is_none());
        assert!(store
            .get_stale("grades", &p, &Namespace::new("userB", "S1"))
            .await
            .is_none());
        assert!(store.get("grades", &p, &Namespace::new("userA", "S1")).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_record_is_miss_but_available_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let ns = Namespace::new("u", "S1");

        store.set("k", &json!(1), &policy(0, &[]), &ns).await;
        assert!(store.get("k", &policy(0, &[]), &ns).await.is_none());

        let stale = store.get_stale("k", &policy(0, &[]), &ns).await.unwrap();
        assert!(stale.stale);
        assert_eq!(stale.data, json!(1));

        let fresh = store.get_stale("k", &policy(300, &[]), &ns).await.unwrap();
        assert!(!fresh.stale);
    }

    #[tokio::test]
    async fn test_corrupted_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (store, telemetry) = store(dir.path(), 10);
        let ns = Namespace::new("u", "S1");
        store.set("k", &json!(1), &policy(300, &[]), &ns).await;

        let path = store.record_path("k", &ns);
        std::fs::write(&path, "{not json").unwrap();

        assert!(store.get("k", &policy(300, &[]), &ns).await.is_none());
        assert_eq!(telemetry.snapshot(0).persisted_corrupted, 1);
        assert!(!path.exists(), "corrupted record is removed");
    }

    #[tokio::test]
    async fn test_unavailable_storage_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let (store, telemetry) = store(&blocker, 10);
        let ns = Namespace::new("u", "S1");

        assert!(!store.set("k", &json!(1), &policy(300, &[]), &ns).await);
        assert!(store.get("k", &policy(300, &[]), &ns).await.is_none());
        assert!(telemetry.snapshot(0).persisted_unavailable >= 1);
        assert_eq!(telemetry.snapshot(0).persisted_corrupted, 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_records() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 3);
        let p = policy(300, &[]);

        for i in 0..5 {
            let scope = if i % 2 == 0 { "S1" } else { "S2" };
            store
                .set(&format!("k{}", i), &json!(i), &p, &Namespace::new("u", scope))
                .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let keys: Vec<String> = store.records("u").await.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["k4", "k3", "k2"]);
    }

    #[tokio::test]
    async fn test_prune_is_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 1);
        let p = policy(300, &[]);

        store.set("a", &json!(1), &p, &Namespace::global("u1")).await;
        store.set("b", &json!(2), &p, &Namespace::global("u2")).await;

        assert_eq!(store.records("u1").await.len(), 1);
        assert_eq!(store.records("u2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_user_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let p = policy(300, &[]);

        store.set("k", &json!(1), &p, &Namespace::new("u1", "S1")).await;
        store.set("k", &json!(2), &p, &Namespace::new("u2", "S1")).await;

        assert!(store.clear_user_cache("u1").await);
        assert!(store.get("k", &p, &Namespace::new("u1", "S1")).await.is_none());
        assert!(store.get("k", &p, &Namespace::new("u2", "S1")).await.is_some());

        // Clearing a user with nothing stored is fine.
        assert!(store.clear_user_cache("nobody").await);
    }

    #[tokio::test]
    async fn test_remove_and_remove_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let ns = Namespace::new("u", "S1");

        store.set("a", &json!(1), &policy(300, &["classes-S1"]), &ns).await;
        store.set("b", &json!(2), &policy(300, &["fees-S1"]), &ns).await;
        store.set("c", &json!(3), &policy(300, &["classes-S1"]), &Namespace::new("u", "S2")).await;

        assert!(store.remove("b", &ns).await);
        assert!(!store.remove("b", &ns).await);

        let removed = store.remove_tagged(&["classes-S1".to_string()]).await;
        assert_eq!(removed, 2);
        assert!(store.records("u").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_tagged_covers_every_user() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let tagged = policy(300, &["classes-S1"]);

        store.set("k", &json!(1), &tagged, &Namespace::new("u1", "S1")).await;
        store.set("k", &json!(2), &tagged, &Namespace::new("u2", "S1")).await;
        store.set("f", &json!(3), &policy(300, &["fees-S1"]), &Namespace::new("u2", "S1")).await;

        assert_eq!(store.remove_tagged(&["classes-S1".to_string()]).await, 2);
        assert!(store.records("u1").await.is_empty());
        let left: Vec<String> = store.records("u2").await.into_iter().map(|r| r.key).collect();
        assert_eq!(left, vec!["f"]);
    }

    #[tokio::test]
    async fn test_remove_tagged_without_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(&dir.path().join("never-created"), 10);
        assert_eq!(store.remove_tagged(&["classes-S1".to_string()]).await, 0);
    }

    #[tokio::test]
    async fn test_policy_without_persist_skips_write() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path(), 10);
        let mut p = policy(300, &[]);
        p.persist = false;

        assert!(!store.set("k", &json!(1), &p, &Namespace::global("u")).await);
        assert!(store.records("u").await.is_empty());
    }

    #[test]
    fn test_component_encoding() {
        let raw = r#"classes:{"school":"S1"}:S1"#;
        let encoded = encode_component(raw);
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || "-_~%".contains(c)));
        assert_eq!(decode_component(&encoded), raw);

        assert_eq!(encode_component("../etc"), "%2E%2E%2Fetc");
        assert_eq!(encode_component("."), "%2E");
        assert_eq!(decode_component(&encode_component("a.b c")), "a.b c");
        assert_eq!(decode_component(&encode_component("")), "");
        assert_eq!(decode_component(&encode_component("élève")), "élève");
    }
}
