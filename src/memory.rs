//! Memory tier (L1): in-process store with tag-indexed invalidation.
//!
//! Backed by a concurrent keyed map with per-entry absolute expiration.
//! Every write with tags updates the bidirectional [`TagIndex`]; every
//! removal path (explicit, expiry, eviction) runs through one callback that
//! keeps the index consistent with the store. Eviction is policy-driven and
//! runs until the tier is back under its entry and byte caps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::tags::TagIndex;
use crate::traits::{
    HealthStatus, LayerCounters, LayerStats, OperationContext, StorageLayer, TierGet, TtlBounds,
};

/// Eviction policy for the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry first (default).
    Lru,
    /// Evict the least frequently accessed entry first.
    Lfu,
    /// Evict the oldest entry first.
    Fifo,
    /// Evict the largest entry first.
    SizeBased,
}

/// Fixed per-entry bookkeeping overhead used by the size heuristic.
const ENTRY_OVERHEAD: u64 = 64;

/// Approximate an entry's memory footprint: exact byte lengths for key,
/// payload and tags plus a constant for the bookkeeping around them.
fn estimate_size(key: &str, value: &Bytes, tags: &[String]) -> u64 {
    let tag_bytes: usize = tags.iter().map(String::len).sum();
    key.len() as u64 + value.len() as u64 + tag_bytes as u64 + ENTRY_OVERHEAD
}

#[derive(Debug)]
struct MemoryEntry {
    value: Bytes,
    expires_at: Instant,
    tags: Vec<String>,
    size: u64,
    inserted_seq: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl MemoryEntry {
    /// Expiration exactly at `now` counts as expired.
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalCause {
    Explicit,
    Expired,
    Evicted,
}

/// Configuration for the memory tier.
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    pub max_entries: u64,
    pub max_bytes: u64,
    pub eviction_policy: EvictionPolicy,
    pub default_expiration: Duration,
    pub max_expiration: Duration,
    pub efficient_tag_invalidation: bool,
    pub max_tag_mappings: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            default_expiration: Duration::from_secs(300),
            max_expiration: Duration::from_secs(3600),
            efficient_tag_invalidation: true,
            max_tag_mappings: 100_000,
        }
    }
}

/// In-process cache tier with tag index and policy-driven eviction.
pub struct MemoryTier {
    store: DashMap<String, MemoryEntry>,
    tag_index: TagIndex,
    config: MemoryTierConfig,
    current_bytes: AtomicU64,
    clock: AtomicU64,
    counters: LayerCounters,
}

impl MemoryTier {
    #[must_use]
    pub fn new(config: MemoryTierConfig) -> Self {
        Self {
            store: DashMap::new(),
            tag_index: TagIndex::new(config.max_tag_mappings),
            config,
            current_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            counters: LayerCounters::default(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Post-removal callback: keeps byte accounting and both tag-index
    /// directions consistent with the store, whatever the removal cause.
    fn on_entry_removed(&self, key: &str, entry: &MemoryEntry, cause: RemovalCause) {
        self.current_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        if !entry.tags.is_empty() {
            self.tag_index.remove_key(key);
        }
        match cause {
            RemovalCause::Explicit => {
                self.counters.removes.fetch_add(1, Ordering::Relaxed);
            }
            RemovalCause::Expired => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
            RemovalCause::Evicted => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn remove_entry(&self, key: &str, cause: RemovalCause) -> bool {
        match self.store.remove(key) {
            Some((removed_key, entry)) => {
                self.on_entry_removed(&removed_key, &entry, cause);
                true
            }
            None => false,
        }
    }

    /// Evict by the configured policy until the tier is under both caps.
    /// Expired entries go first and count as expirations, not evictions. The
    /// entry whose insertion triggered the eviction is never its own victim.
    fn evict_to_target(&self, protect: &str) {
        let now = Instant::now();

        let expired: Vec<String> = self
            .store
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.remove_entry(&key, RemovalCause::Expired);
        }

        while self.store.len() as u64 > self.config.max_entries
            || self.current_bytes.load(Ordering::Relaxed) > self.config.max_bytes
        {
            let Some(victim) = self.pick_victim(protect) else {
                break;
            };
            if self.remove_entry(&victim, RemovalCause::Evicted) {
                debug!(key = %victim, policy = ?self.config.eviction_policy, "evicted entry");
            }
        }
    }

    fn pick_victim(&self, protect: &str) -> Option<String> {
        let mut victim: Option<(String, u64)> = None;
        for entry in &self.store {
            if entry.key() == protect {
                continue;
            }
            let score = match self.config.eviction_policy {
                EvictionPolicy::Lru => entry.value().last_access.load(Ordering::Relaxed),
                EvictionPolicy::Lfu => entry.value().access_count.load(Ordering::Relaxed),
                EvictionPolicy::Fifo => entry.value().inserted_seq,
                // largest first: invert so the min-score scan picks it
                EvictionPolicy::SizeBased => u64::MAX - entry.value().size,
            };
            match &victim {
                Some((_, best)) if *best <= score => {}
                _ => victim = Some((entry.key().clone(), score)),
            }
        }
        victim.map(|(key, _)| key)
    }

    /// Number of live entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    /// Approximate bytes held.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Total key↔tag mappings currently indexed.
    #[must_use]
    pub fn tag_mapping_count(&self) -> usize {
        self.tag_index.mapping_count()
    }
}

#[async_trait]
impl StorageLayer for MemoryTier {
    fn layer_id(&self) -> &'static str {
        "L1"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn ttl_bounds(&self) -> TtlBounds {
        TtlBounds {
            default: self.config.default_expiration,
            max: self.config.max_expiration,
        }
    }

    async fn get(&self, key: &str, ctx: &OperationContext) -> TierGet {
        let now = Instant::now();
        let hit = match self.store.get(key) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.remove_entry(key, RemovalCause::Expired);
                None
            }
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                let remaining = entry.expires_at.saturating_duration_since(now);
                Some((entry.value.clone(), remaining))
            }
            None => None,
        };

        match hit {
            Some((value, remaining)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                ctx.record(self.layer_id(), true);
                TierGet::Found {
                    value,
                    remaining_ttl: Some(remaining),
                }
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                ctx.record(self.layer_id(), false);
                TierGet::Miss
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        _ctx: &OperationContext,
    ) -> CacheResult<()> {
        let ttl = ttl.min(self.config.max_expiration);
        let size = estimate_size(key, &value, tags);
        let seq = self.tick();
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
            tags: tags.to_vec(),
            size,
            inserted_seq: seq,
            last_access: AtomicU64::new(seq),
            access_count: AtomicU64::new(0),
        };

        // Replacement: retire the old entry's size and mappings first so the
        // index never holds duplicates for the key.
        if let Some(old) = self.store.insert(key.to_string(), entry) {
            self.current_bytes.fetch_sub(old.size, Ordering::Relaxed);
            if !old.tags.is_empty() {
                self.tag_index.remove_key(key);
            }
        }
        self.current_bytes.fetch_add(size, Ordering::Relaxed);
        if !tags.is_empty() {
            self.tag_index.insert(key, tags);
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        if self.store.len() as u64 > self.config.max_entries
            || self.current_bytes.load(Ordering::Relaxed) > self.config.max_bytes
        {
            self.evict_to_target(key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str, _ctx: &OperationContext) -> CacheResult<()> {
        self.remove_entry(key, RemovalCause::Explicit);
        Ok(())
    }

    async fn remove_by_tag(&self, tag: &str, ctx: &OperationContext) -> CacheResult<()> {
        if !self.config.efficient_tag_invalidation {
            warn!(
                tag = %tag,
                "efficient tag invalidation disabled, clearing entire memory tier"
            );
            return self.clear(ctx).await;
        }

        let keys = self.tag_index.take_tag(tag);
        let count = keys.len();
        for key in keys {
            self.remove_entry(&key, RemovalCause::Explicit);
        }
        if count > 0 {
            debug!(tag = %tag, count, "removed entries by tag");
        }
        Ok(())
    }

    async fn remove_by_tag_pattern(
        &self,
        pattern: &str,
        ctx: &OperationContext,
    ) -> CacheResult<usize> {
        let mut removed = 0;
        for tag in self.tag_index.tags_matching(pattern) {
            let before = self.store.len();
            self.remove_by_tag(&tag, ctx).await?;
            removed += before.saturating_sub(self.store.len());
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str, _ctx: &OperationContext) -> bool {
        let now = Instant::now();
        match self.store.get(key) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.remove_entry(key, RemovalCause::Expired);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn clear(&self, _ctx: &OperationContext) -> CacheResult<()> {
        self.store.clear();
        self.tag_index.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        // Liveness probe in the write-read-remove style shared by all tiers.
        let probe_key = "__memotier_health_probe__";
        let ctx = OperationContext::new();
        let value = Bytes::from_static(b"ok");
        if self
            .set(probe_key, value.clone(), Duration::from_secs(5), &[], &ctx)
            .await
            .is_err()
        {
            return HealthStatus::Unhealthy;
        }
        let healthy = matches!(
            self.get(probe_key, &ctx).await,
            TierGet::Found { value: v, .. } if v == value
        );
        let _ = self.remove(probe_key, &ctx).await;
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    fn stats(&self) -> LayerStats {
        self.counters.snapshot(self.layer_id())
    }

    async fn dispose(&self) -> CacheResult<()> {
        self.clear(&OperationContext::new())
            .await
            .map_err(|e| CacheError::Config(format!("memory tier dispose failed: {e}")))
    }
}
