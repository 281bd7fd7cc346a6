//! Cache policies and the layered policy registry.
//!
//! A [`RuntimePolicy`] is the fully-resolved set of caching rules for one
//! call site. The [`PolicyRegistry`] merges partial policies from layered
//! sources — runtime overrides > programmatic > file-based (JSON/YAML) >
//! registered defaults — field by field, later sources winning. Resolution is
//! read-heavy: the registry keeps an immutable snapshot behind a
//! reader-writer lock and swaps the whole snapshot on reload, so in-flight
//! resolutions see either the old or the new state, never a torn mix.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};

/// How concurrent misses for the same key are handled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StampedeMode {
    /// No protection beyond in-process single-flight.
    None,
    /// Cross-process mutual exclusion through the configured lock provider.
    DistributedLock,
    /// Serve slightly-stale hits and refresh in the background when the
    /// remaining TTL drops below the refresh-ahead window.
    RefreshAhead,
    /// XFetch probabilistic early recomputation. `beta <= 0` disables early
    /// refresh entirely.
    Probabilistic { beta: f64 },
}

/// Which canonical encoding non-`CacheKeyProvider` arguments use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySerializer {
    /// Structured JSON with recursively sorted object keys. Stable across
    /// process restarts; the default.
    CanonicalJson,
    /// Plain `serde_json` output. Faster, but map ordering follows the
    /// serializer; only safe for argument types with deterministic ordering.
    PlainJson,
}

/// Options for the distributed-lock stampede mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedLockOptions {
    /// Lock lease duration; renewal runs every `timeout / 3`.
    pub timeout: Duration,
    /// Upper bound on concurrent holders (1 = mutual exclusion).
    pub max_concurrency: usize,
}

impl Default for DistributedLockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_concurrency: 1,
        }
    }
}

/// Fully-resolved caching rules for one call. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    /// Time the value stays valid.
    pub duration: Duration,
    /// Tags attached to the entry for mass invalidation.
    pub tags: Vec<String>,
    /// Optional version discriminator appended to the key outside the hash.
    pub version: Option<String>,
    pub stampede_mode: StampedeMode,
    /// Remaining-TTL window inside which refresh-ahead triggers.
    pub refresh_ahead_window: Option<Duration>,
    pub lock: DistributedLockOptions,
    pub serializer: KeySerializer,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            tags: Vec::new(),
            version: None,
            stampede_mode: StampedeMode::None,
            refresh_ahead_window: None,
            lock: DistributedLockOptions::default(),
            serializer: KeySerializer::CanonicalJson,
        }
    }
}

impl RuntimePolicy {
    /// Builder-style constructor for programmatic policies.
    #[must_use]
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn stampede(mut self, mode: StampedeMode) -> Self {
        self.stampede_mode = mode;
        self
    }

    #[must_use]
    pub fn refresh_ahead(mut self, window: Duration) -> Self {
        self.refresh_ahead_window = Some(window);
        self.stampede_mode = StampedeMode::RefreshAhead;
        self
    }
}

/// A partial policy from one source layer. Unset fields fall through to the
/// next layer down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFragment {
    pub duration_secs: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub version: Option<String>,
    pub stampede_mode: Option<StampedeMode>,
    pub refresh_ahead_window_secs: Option<u64>,
    pub lock_timeout_secs: Option<u64>,
    pub lock_max_concurrency: Option<usize>,
    pub serializer: Option<KeySerializer>,
}

impl PolicyFragment {
    fn apply(&self, policy: &mut RuntimePolicy) {
        if let Some(secs) = self.duration_secs {
            policy.duration = Duration::from_secs(secs);
        }
        if let Some(tags) = &self.tags {
            policy.tags = tags.clone();
        }
        if let Some(version) = &self.version {
            policy.version = Some(version.clone());
        }
        if let Some(mode) = self.stampede_mode {
            policy.stampede_mode = mode;
        }
        if let Some(secs) = self.refresh_ahead_window_secs {
            policy.refresh_ahead_window = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.lock_timeout_secs {
            policy.lock.timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.lock_max_concurrency {
            policy.lock.max_concurrency = n;
        }
        if let Some(serializer) = self.serializer {
            policy.serializer = serializer;
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// On-disk policy file shape (JSON or YAML): optional global defaults plus
/// per-method fragments keyed by `Type::method`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub defaults: PolicyFragment,
    pub methods: HashMap<String, PolicyFragment>,
}

#[derive(Default)]
struct RegistrySnapshot {
    registered_defaults: HashMap<String, PolicyFragment>,
    file_defaults: PolicyFragment,
    file_methods: HashMap<String, PolicyFragment>,
    programmatic: HashMap<String, PolicyFragment>,
    runtime: HashMap<String, PolicyFragment>,
}

/// Layered policy resolution with copy-on-write snapshots.
pub struct PolicyRegistry {
    base: RuntimePolicy,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl PolicyRegistry {
    /// Create a registry whose unresolved fields fall back to `base`.
    #[must_use]
    pub fn new(base: RuntimePolicy) -> Self {
        Self {
            base,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Resolve the effective policy for `method` (conventionally
    /// `Type::method`). Pure map lookups on an immutable snapshot.
    #[must_use]
    pub fn resolve(&self, method: &str) -> RuntimePolicy {
        let snapshot = Arc::clone(&self.snapshot.read());
        let mut policy = self.base.clone();

        if let Some(fragment) = snapshot.registered_defaults.get(method) {
            fragment.apply(&mut policy);
        }
        if !snapshot.file_defaults.is_empty() {
            snapshot.file_defaults.apply(&mut policy);
        }
        if let Some(fragment) = snapshot.file_methods.get(method) {
            fragment.apply(&mut policy);
        }
        if let Some(fragment) = snapshot.programmatic.get(method) {
            fragment.apply(&mut policy);
        }
        if let Some(fragment) = snapshot.runtime.get(method) {
            fragment.apply(&mut policy);
        }
        policy
    }

    /// Register the lowest-priority per-method defaults (the declarative
    /// layer populated at startup).
    pub fn register_default(&self, method: impl Into<String>, fragment: PolicyFragment) {
        self.mutate(|snapshot| {
            snapshot.registered_defaults.insert(method.into(), fragment);
        });
    }

    /// Set a programmatic fragment (wins over file and defaults).
    pub fn set_programmatic(&self, method: impl Into<String>, fragment: PolicyFragment) {
        self.mutate(|snapshot| {
            snapshot.programmatic.insert(method.into(), fragment);
        });
    }

    /// Set a runtime override (wins over everything).
    pub fn set_runtime_override(&self, method: impl Into<String>, fragment: PolicyFragment) {
        self.mutate(|snapshot| {
            snapshot.runtime.insert(method.into(), fragment);
        });
    }

    /// Drop a runtime override.
    pub fn clear_runtime_override(&self, method: &str) {
        self.mutate(|snapshot| {
            snapshot.runtime.remove(method);
        });
    }

    /// Replace the file-based layer from parsed content. The swap is atomic.
    pub fn load_file_content(&self, file: PolicyFile) {
        let count = file.methods.len();
        self.mutate(move |snapshot| {
            snapshot.file_defaults = file.defaults;
            snapshot.file_methods = file.methods;
        });
        info!(methods = count, "policy file layer reloaded");
    }

    /// Load the file-based layer from a JSON (`.json`) or YAML
    /// (`.yaml`/`.yml`) policy file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> CacheResult<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("cannot read policy file {path:?}: {e}")))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let file: PolicyFile = match extension {
            "json" => serde_json::from_str(&raw)
                .map_err(|e| CacheError::Config(format!("invalid JSON policy file: {e}")))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .map_err(|e| CacheError::Config(format!("invalid YAML policy file: {e}")))?,
            other => {
                return Err(CacheError::Config(format!(
                    "unsupported policy file extension '{other}' (expected json, yaml or yml)"
                )));
            }
        };
        self.load_file_content(file);
        Ok(())
    }

    fn mutate(&self, op: impl FnOnce(&mut RegistrySnapshot)) {
        let mut guard = self.snapshot.write();
        let current = guard.as_ref();
        let mut next = RegistrySnapshot {
            registered_defaults: current.registered_defaults.clone(),
            file_defaults: current.file_defaults.clone(),
            file_methods: current.file_methods.clone(),
            programmatic: current.programmatic.clone(),
            runtime: current.runtime.clone(),
        };
        op(&mut next);
        *guard = Arc::new(next);
        debug!("policy registry snapshot swapped");
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(RuntimePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_base() {
        let registry = PolicyRegistry::default();
        let policy = registry.resolve("Svc::method");
        assert_eq!(policy.duration, Duration::from_secs(300));
        assert_eq!(policy.stampede_mode, StampedeMode::None);
    }

    #[test]
    fn later_layers_win_field_by_field() {
        let registry = PolicyRegistry::default();
        registry.register_default(
            "Svc::m",
            PolicyFragment {
                duration_secs: Some(60),
                tags: Some(vec!["default-tag".to_string()]),
                ..PolicyFragment::default()
            },
        );
        registry.load_file_content(PolicyFile {
            defaults: PolicyFragment::default(),
            methods: HashMap::from([(
                "Svc::m".to_string(),
                PolicyFragment {
                    duration_secs: Some(120),
                    ..PolicyFragment::default()
                },
            )]),
        });
        registry.set_runtime_override(
            "Svc::m",
            PolicyFragment {
                version: Some("2".to_string()),
                ..PolicyFragment::default()
            },
        );

        let policy = registry.resolve("Svc::m");
        // runtime sets version, file wins duration, defaults keep tags
        assert_eq!(policy.duration, Duration::from_secs(120));
        assert_eq!(policy.tags, vec!["default-tag"]);
        assert_eq!(policy.version.as_deref(), Some("2"));
    }

    #[test]
    fn runtime_override_clears() {
        let registry = PolicyRegistry::default();
        registry.set_runtime_override(
            "Svc::m",
            PolicyFragment {
                duration_secs: Some(5),
                ..PolicyFragment::default()
            },
        );
        assert_eq!(registry.resolve("Svc::m").duration, Duration::from_secs(5));
        registry.clear_runtime_override("Svc::m");
        assert_eq!(
            registry.resolve("Svc::m").duration,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn parses_yaml_policy_file() {
        let yaml = r#"
defaults:
  duration_secs: 30
methods:
  "Users::get":
    duration_secs: 90
    tags: ["users"]
    stampede_mode: distributed_lock
"#;
        let file: PolicyFile = serde_yaml::from_str(yaml).unwrap();
        let registry = PolicyRegistry::default();
        registry.load_file_content(file);

        let policy = registry.resolve("Users::get");
        assert_eq!(policy.duration, Duration::from_secs(90));
        assert_eq!(policy.tags, vec!["users"]);
        assert_eq!(policy.stampede_mode, StampedeMode::DistributedLock);

        let other = registry.resolve("Users::list");
        assert_eq!(other.duration, Duration::from_secs(30));
    }

    #[test]
    fn parses_probabilistic_mode_from_json() {
        let json = r#"{
            "methods": {
                "Feed::front_page": {
                    "duration_secs": 10,
                    "stampede_mode": { "probabilistic": { "beta": 1.5 } }
                }
            }
        }"#;
        let file: PolicyFile = serde_json::from_str(json).unwrap();
        let registry = PolicyRegistry::default();
        registry.load_file_content(file);

        match registry.resolve("Feed::front_page").stampede_mode {
            StampedeMode::Probabilistic { beta } => assert!((beta - 1.5).abs() < f64::EPSILON),
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
