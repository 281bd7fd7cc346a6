//! Core trait abstractions for the storage pipeline.
//!
//! - `CacheCodec`: pluggable value serialization
//! - `StorageLayer`: uniform capability every tier implements; the
//!   coordinator composes tiers through this trait alone
//! - `RemoteBackend`: key/value + tag-set contract for distributed and
//!   persistent stores (concrete drivers live outside this crate)
//!
//! All tier operations receive an [`OperationContext`] carrying the caller's
//! cancellation token and collecting a per-tier hit/miss trace.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::CacheResult;

/// Trait for cache value serialization/deserialization.
///
/// Implementations must be `Send + Sync + Debug` so they can be shared across
/// async tasks.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Vec<u8>>;

    /// Deserialize bytes to a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T>;

    /// Codec name, used for logging.
    fn name(&self) -> &'static str;
}

/// Outcome of a single tier's `get`.
#[derive(Debug, Clone)]
pub enum TierGet {
    /// The tier holds the key. `remaining_ttl` is `None` when the backend
    /// cannot report one.
    Found {
        value: Bytes,
        remaining_ttl: Option<Duration>,
    },
    /// The tier does not hold the key.
    Miss,
    /// The tier instructs the coordinator to stop walking lower tiers and
    /// report a miss.
    StopPropagation,
}

/// Health of a single tier, aggregated by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Inclusive TTL bounds a tier accepts for stored entries. Promotions into
/// the tier are clamped into these bounds.
#[derive(Debug, Clone, Copy)]
pub struct TtlBounds {
    pub default: Duration,
    pub max: Duration,
}

impl TtlBounds {
    /// Clamp a remaining TTL into this tier's bounds, substituting the
    /// default when the source tier reported none.
    #[must_use]
    pub fn clamp(&self, remaining: Option<Duration>) -> Duration {
        remaining.unwrap_or(self.default).min(self.max)
    }
}

/// Atomic operation counters kept by every tier.
#[derive(Debug, Default)]
pub struct LayerCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub removes: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub errors: AtomicU64,
}

impl LayerCounters {
    pub fn snapshot(&self, layer_id: &'static str) -> LayerStats {
        LayerStats {
            layer_id,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics snapshot for one tier.
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub layer_id: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
}

/// Per-operation context: cancellation plus a trace of which tiers hit.
#[derive(Debug)]
pub struct OperationContext {
    cancel: CancellationToken,
    trace: Mutex<Vec<(&'static str, bool)>>,
}

impl OperationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            trace: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record(&self, layer_id: &'static str, hit: bool) {
        self.trace.lock().push((layer_id, hit));
    }

    /// Tier-by-tier hit/miss trace of this operation, in walk order.
    #[must_use]
    pub fn trace(&self) -> Vec<(&'static str, bool)> {
        self.trace.lock().clone()
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform capability implemented by every storage tier.
///
/// The coordinator never sees concrete tier types; composition, promotion,
/// fan-out and health all go through this trait.
#[async_trait]
pub trait StorageLayer: Send + Sync {
    /// Short stable identifier ("L1", "L2", "L3").
    fn layer_id(&self) -> &'static str;

    /// Walk order: lower priority runs first.
    fn priority(&self) -> u8;

    /// Disabled tiers are skipped by the coordinator.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether a hit in this tier should be copied into higher tiers.
    fn promotes_on_hit(&self) -> bool {
        false
    }

    /// TTL bounds for entries stored in this tier.
    fn ttl_bounds(&self) -> TtlBounds;

    async fn get(&self, key: &str, ctx: &OperationContext) -> TierGet;

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        ctx: &OperationContext,
    ) -> CacheResult<()>;

    async fn remove(&self, key: &str, ctx: &OperationContext) -> CacheResult<()>;

    async fn remove_by_tag(&self, tag: &str, ctx: &OperationContext) -> CacheResult<()>;

    /// Best-effort tag-pattern invalidation. Tiers without support return
    /// `Unsupported`; the manager logs and continues.
    async fn remove_by_tag_pattern(
        &self,
        pattern: &str,
        ctx: &OperationContext,
    ) -> CacheResult<usize>;

    async fn exists(&self, key: &str, ctx: &OperationContext) -> bool;

    async fn clear(&self, ctx: &OperationContext) -> CacheResult<()>;

    async fn health(&self) -> HealthStatus;

    fn stats(&self) -> LayerStats;

    /// Release tier resources. Called by the coordinator in reverse priority
    /// order during shutdown.
    async fn dispose(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// Contract for remote key/value stores backing the L2 and L3 tiers.
///
/// Concrete drivers (Redis, SQL, object stores) implement this trait outside
/// the crate. Tag membership is modeled as named sets so tiers can resolve
/// tag→keys server-side.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Backend name, used for logging.
    fn name(&self) -> &'static str;

    /// Whether `set_with_tags_atomic` performs value + both index directions
    /// in one server-side operation.
    fn supports_atomic_tagging(&self) -> bool {
        false
    }

    /// Fetch a value and its remaining TTL. `Ok(None)` is a miss.
    async fn get_with_ttl(&self, key: &str) -> anyhow::Result<Option<(Bytes, Option<Duration>)>>;

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> anyhow::Result<()>;

    /// Atomically store the value and register it under each tag set, with a
    /// tag-set expiry of at least `ttl`. Backends that do not support
    /// server-side scripting keep the default and the tier falls back to a
    /// two-phase write.
    async fn set_with_tags_atomic(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tag_set_keys: &[String],
    ) -> anyhow::Result<()> {
        let _ = (key, value, ttl, tag_set_keys);
        Err(anyhow::anyhow!("atomic tagging not supported"))
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn remove_many(&self, keys: &[String]) -> anyhow::Result<usize>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Add members to a tag set, extending the set's expiry to at least
    /// `min_ttl`.
    async fn set_add(
        &self,
        set_key: &str,
        members: &[String],
        min_ttl: Duration,
    ) -> anyhow::Result<()>;

    /// All members of a tag set. Missing sets return an empty vector.
    async fn set_members(&self, set_key: &str) -> anyhow::Result<Vec<String>>;

    /// Glob-scan for keys (used for tag-pattern invalidation). Backends
    /// without server-side scanning keep the default.
    async fn scan_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let _ = pattern;
        Err(anyhow::anyhow!("key scanning not supported"))
    }

    /// Remove every key in the backend's namespace.
    async fn clear(&self) -> anyhow::Result<()>;

    /// Connectivity probe.
    async fn ping(&self) -> bool;
}
