//! Cache configuration.
//!
//! Settings are supplied once at startup. They are read from
//! `~/.config/campuscache/cache.json` when present, otherwise the defaults
//! below apply. The file only needs to name the values it overrides.
//!
//! The `policies` table is the single place that says how long each resource
//! may be cached, which tags its entries carry, and which other resources a
//! write to it affects. Mutation call sites never list tags themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "campuscache";

/// Config file name
const CONFIG_FILE: &str = "cache.json";

/// Placeholder replaced by the scope id in tag templates
pub const SCOPE_PLACEHOLDER: &str = "{scope}";

/// Scope used when a query does not name one
pub const GLOBAL_SCOPE: &str = "global";

pub const PRESET_DEFAULT: &str = "DEFAULT";
pub const PRESET_USER_PROFILE: &str = "USER_PROFILE";
pub const PRESET_DASHBOARD_STATS: &str = "DASHBOARD_STATS";
pub const PRESET_REFERENCE_DATA: &str = "REFERENCE_DATA";

const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;
const USER_PROFILE_TTL_MS: u64 = 10 * 60 * 1000;
const DASHBOARD_STATS_TTL_MS: u64 = 2 * 60 * 1000;
const REFERENCE_DATA_TTL_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of entries held in memory before LRU eviction
    pub max_entries: usize,
    /// Upper bound on a single remote fetch; `None` waits indefinitely
    pub fetch_timeout_ms: Option<u64>,
    pub persist: PersistSettings,
    pub search: SearchSettings,
    pub policies: PolicyTable,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 200,
            fetch_timeout_ms: Some(30_000),
            persist: PersistSettings::default(),
            search: SearchSettings::default(),
            policies: PolicyTable::default(),
        }
    }
}

impl CacheSettings {
    /// Load settings from the user config directory, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache config: {}", path.display()))?;
        settings.policies.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the persistent fallback store.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.persist.dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistSettings {
    pub enabled: bool,
    /// Records kept per user; older ones are pruned after each write
    pub max_records: usize,
    /// Overrides the platform cache directory
    pub dir: Option<PathBuf>,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: 10,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub debounce_ms: u64,
    /// Queries shorter than this (after trimming) clear results without fetching
    pub min_query_len: usize,
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            min_query_len: 2,
            max_entries: 50,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl SearchSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// TTL given either in milliseconds or as the name of a preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TtlSetting {
    Millis(u64),
    Preset(String),
}

/// Declared cache behavior of one resource (collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub ttl: Option<TtlSetting>,
    /// Tag templates; `{scope}` is replaced by the scope id
    pub tags: Vec<String>,
    /// Resources whose cached data also changes when this one is written
    pub invalidates: Vec<String>,
    /// Whether fetched results are written to the persistent fallback store
    pub persist: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            invalidates: Vec::new(),
            persist: true,
        }
    }
}

impl ResourcePolicy {
    fn new(ttl: TtlSetting, tag: &str) -> Self {
        Self {
            ttl: Some(ttl),
            tags: vec![tag.to_string()],
            invalidates: Vec::new(),
            persist: true,
        }
    }

    fn invalidating(mut self, resources: &[&str]) -> Self {
        self.invalidates = resources.iter().map(|r| r.to_string()).collect();
        self
    }
}

/// Resolved policy for a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub persist: bool,
}

impl CachePolicy {
    pub fn new(ttl: Duration, tags: Vec<String>) -> Self {
        Self {
            ttl,
            tags,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub ttl_presets: BTreeMap<String, u64>,
    pub resources: BTreeMap<String, ResourcePolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let ttl_presets = BTreeMap::from([
            (PRESET_DEFAULT.to_string(), DEFAULT_TTL_MS),
            (PRESET_USER_PROFILE.to_string(), USER_PROFILE_TTL_MS),
            (PRESET_DASHBOARD_STATS.to_string(), DASHBOARD_STATS_TTL_MS),
            (PRESET_REFERENCE_DATA.to_string(), REFERENCE_DATA_TTL_MS),
        ]);

        let preset = |name: &str| TtlSetting::Preset(name.to_string());
        let resources = BTreeMap::from([
            (
                "classes".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "classes-{scope}")
                    .invalidating(&["students", "dashboard_stats"]),
            ),
            (
                "students".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "students-{scope}")
                    .invalidating(&["classes", "dashboard_stats"]),
            ),
            (
                "teachers".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "teachers-{scope}")
                    .invalidating(&["dashboard_stats"]),
            ),
            (
                "subjects".to_string(),
                ResourcePolicy::new(preset(PRESET_REFERENCE_DATA), "subjects-{scope}"),
            ),
            (
                "attendance".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "attendance-{scope}")
                    .invalidating(&["dashboard_stats"]),
            ),
            (
                "grades".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "grades-{scope}")
                    .invalidating(&["dashboard_stats"]),
            ),
            (
                "fees".to_string(),
                ResourcePolicy::new(preset(PRESET_DEFAULT), "fees-{scope}")
                    .invalidating(&["dashboard_stats"]),
            ),
            (
                "dashboard_stats".to_string(),
                ResourcePolicy::new(preset(PRESET_DASHBOARD_STATS), "dashboard-{scope}"),
            ),
            (
                "user_profile".to_string(),
                ResourcePolicy::new(preset(PRESET_USER_PROFILE), "profile-{scope}"),
            ),
        ]);

        Self {
            ttl_presets,
            resources,
        }
    }
}

impl PolicyTable {
    /// Check that every preset and `invalidates` reference resolves.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.resources {
            if let Some(TtlSetting::Preset(ref preset)) = policy.ttl {
                if !self.ttl_presets.contains_key(preset) {
                    anyhow::bail!("Resource '{}' refers to unknown TTL preset '{}'", name, preset);
                }
            }
            for dependent in &policy.invalidates {
                if !self.resources.contains_key(dependent) {
                    anyhow::bail!(
                        "Resource '{}' invalidates unknown resource '{}'",
                        name,
                        dependent
                    );
                }
            }
        }
        Ok(())
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_millis(
            self.ttl_presets
                .get(PRESET_DEFAULT)
                .copied()
                .unwrap_or(DEFAULT_TTL_MS),
        )
    }

    pub fn resolve_ttl(&self, ttl: &TtlSetting) -> Duration {
        match ttl {
            TtlSetting::Millis(ms) => Duration::from_millis(*ms),
            TtlSetting::Preset(name) => match self.ttl_presets.get(name) {
                Some(ms) => Duration::from_millis(*ms),
                None => {
                    warn!(preset = %name, "Unknown TTL preset, using default");
                    self.default_ttl()
                }
            },
        }
    }

    /// Resolve the cache policy for reading `resource` within `scope`.
    ///
    /// Resources missing from the table get the default TTL and a single
    /// `{resource}-{scope}` tag, so they can still be invalidated.
    pub fn policy_for(&self, resource: &str, scope: &str) -> CachePolicy {
        match self.resources.get(resource) {
            Some(policy) => CachePolicy {
                ttl: policy
                    .ttl
                    .as_ref()
                    .map(|ttl| self.resolve_ttl(ttl))
                    .unwrap_or_else(|| self.default_ttl()),
                tags: expand_tags(&policy.tags, scope),
                persist: policy.persist,
            },
            None => CachePolicy::new(self.default_ttl(), vec![fallback_tag(resource, scope)]),
        }
    }

    /// `resource` plus every resource a write to it transitively affects,
    /// following `invalidates`.
    pub fn affected_resources(&self, resource: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut pending = vec![resource.to_string()];

        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(policy) = self.resources.get(&current) {
                pending.extend(policy.invalidates.iter().cloned());
            }
        }

        visited.into_iter().collect()
    }

    /// Every tag a write to `resource` within `scope` must invalidate: the
    /// resource's own tags plus those of everything it transitively affects.
    pub fn mutation_tags(&self, resource: &str, scope: &str) -> Vec<String> {
        let mut tags = BTreeSet::new();
        for affected in self.affected_resources(resource) {
            match self.resources.get(&affected) {
                Some(policy) => tags.extend(expand_tags(&policy.tags, scope)),
                None => {
                    tags.insert(fallback_tag(&affected, scope));
                }
            }
        }
        tags.into_iter().collect()
    }
}

fn fallback_tag(resource: &str, scope: &str) -> String {
    format!("{}-{}", resource, scope)
}

/// Replace `{scope}` in each template, dropping duplicates.
pub fn expand_tags(templates: &[String], scope: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    templates
        .iter()
        .map(|t| t.replace(SCOPE_PLACEHOLDER, scope))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
