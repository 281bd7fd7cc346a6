//! Storage configuration.
//!
//! `StorageOptions` collects every knob recognized by the storage pipeline.
//! Invalid combinations are rejected once, by [`validate`](StorageOptions::validate),
//! when the cache is built. Call-time code assumes a validated configuration.

use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::memory::EvictionPolicy;

/// Configuration for the tiered storage pipeline.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Hard ceiling for any entry stored in L1. Promotions and direct writes
    /// are clamped to this value.
    pub l1_max_expiration: Duration,
    /// TTL used for L1 writes when the source tier reports no remaining TTL.
    pub l1_default_expiration: Duration,
    /// Maximum number of entries held by L1 before eviction starts.
    pub l1_max_entries: u64,
    /// Approximate maximum payload bytes held by L1 before eviction starts.
    pub l1_max_bytes: u64,
    /// Eviction policy for L1 (LRU by default).
    pub l1_eviction_policy: EvictionPolicy,

    /// Whether the distributed tier participates in the pipeline.
    pub l2_enabled: bool,
    /// TTL used for L2 writes when the caller's policy does not set one.
    pub l2_default_expiration: Duration,

    /// Whether the persistent tier participates in the pipeline.
    pub l3_enabled: bool,
    /// Lower bound for L3 expirations; also the promotion TTL when the
    /// backend reports none.
    pub l3_default_expiration: Duration,
    /// Upper bound for L3 expirations.
    pub l3_max_expiration: Duration,

    /// Maximum outstanding operations against the L2 backend.
    pub max_concurrent_l2_operations: usize,
    /// Maximum outstanding operations against the L3 backend.
    pub max_concurrent_l3_operations: usize,

    /// Route L2 writes through the async write queue.
    pub enable_async_l2_writes: bool,
    /// Route L3 writes through the async write queue.
    pub enable_async_l3_writes: bool,
    /// Capacity of the async write queue. `0` disables the queue entirely and
    /// forces synchronous writes.
    pub async_write_queue_capacity: usize,

    /// Populate L2/L1 when a read is served from L3.
    pub enable_l3_promotion: bool,

    /// Publish and consume cross-instance invalidation messages.
    pub enable_backplane: bool,

    /// Maintain the bidirectional L1 tag index. When disabled, tag
    /// invalidation falls back to clearing L1 entirely.
    pub enable_efficient_l1_tag_invalidation: bool,
    /// Cap on total key↔tag mappings in the L1 index. Mappings beyond the cap
    /// are skipped; values are still stored.
    pub max_tag_mappings: usize,

    /// Identity of this cache instance on the backplane. Generated when empty.
    pub instance_id: String,
    /// Prefix prepended to every generated key and tag-set key, isolating
    /// applications sharing a backend.
    pub key_prefix: String,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            l1_max_expiration: Duration::from_secs(3600),
            l1_default_expiration: Duration::from_secs(300),
            l1_max_entries: 10_000,
            l1_max_bytes: 64 * 1024 * 1024,
            l1_eviction_policy: EvictionPolicy::Lru,
            l2_enabled: false,
            l2_default_expiration: Duration::from_secs(1800),
            l3_enabled: false,
            l3_default_expiration: Duration::from_secs(3600),
            l3_max_expiration: Duration::from_secs(24 * 3600),
            max_concurrent_l2_operations: 64,
            max_concurrent_l3_operations: 16,
            enable_async_l2_writes: false,
            enable_async_l3_writes: false,
            async_write_queue_capacity: 1024,
            enable_l3_promotion: true,
            enable_backplane: false,
            enable_efficient_l1_tag_invalidation: true,
            max_tag_mappings: 100_000,
            instance_id: String::new(),
            key_prefix: "memotier:".to_string(),
        }
    }
}

impl StorageOptions {
    /// Validate the configuration. Called by the builder; all violations are
    /// configuration errors surfaced at build time, never at call time.
    pub fn validate(&self) -> CacheResult<()> {
        if self.l1_max_expiration < self.l1_default_expiration {
            return Err(CacheError::Config(format!(
                "l1_max_expiration ({:?}) must be >= l1_default_expiration ({:?})",
                self.l1_max_expiration, self.l1_default_expiration
            )));
        }
        if self.l1_max_entries == 0 {
            return Err(CacheError::Config(
                "l1_max_entries must be at least 1".to_string(),
            ));
        }
        if self.l3_max_expiration < self.l3_default_expiration {
            return Err(CacheError::Config(format!(
                "l3_max_expiration ({:?}) must be >= l3_default_expiration ({:?})",
                self.l3_max_expiration, self.l3_default_expiration
            )));
        }
        if self.l2_enabled && self.max_concurrent_l2_operations == 0 {
            return Err(CacheError::Config(
                "max_concurrent_l2_operations must be at least 1 when L2 is enabled".to_string(),
            ));
        }
        if self.l3_enabled && self.max_concurrent_l3_operations == 0 {
            return Err(CacheError::Config(
                "max_concurrent_l3_operations must be at least 1 when L3 is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved instance id, generating one when the field is empty.
    #[must_use]
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }
}
