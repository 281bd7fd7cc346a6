//! Persistent tier (L3): durable storage with promotion.
//!
//! Shares the remote-store contract with L2 but owns stricter expiration
//! rules: every stored entry's TTL is clamped into
//! `[default_expiration, max_expiration]`, and hits are promoted into the
//! faster tiers when promotion is enabled. Failures are logged and swallowed
//! by the pipeline like any lower-tier failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::distributed::RemoteCore;
use crate::error::CacheResult;
use crate::traits::{
    HealthStatus, LayerStats, OperationContext, RemoteBackend, StorageLayer, TierGet, TtlBounds,
};
use crate::write_queue::AsyncWriteQueue;

/// Configuration for the persistent tier.
#[derive(Debug, Clone)]
pub struct PersistentTierConfig {
    pub enabled: bool,
    /// Lower bound for stored TTLs; also the promotion TTL when the backend
    /// reports none.
    pub default_expiration: Duration,
    /// Upper bound for stored TTLs.
    pub max_expiration: Duration,
    pub max_concurrency: usize,
    pub async_writes: bool,
    /// Copy hits into the faster tiers.
    pub promotion: bool,
    pub key_prefix: String,
}

/// Persistent tier (L3).
pub struct PersistentTier {
    core: RemoteCore,
    config: PersistentTierConfig,
    queue: Option<Arc<AsyncWriteQueue>>,
}

impl PersistentTier {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        config: PersistentTierConfig,
        queue: Option<Arc<AsyncWriteQueue>>,
    ) -> Self {
        let core = RemoteCore::new(
            "L3",
            backend,
            config.max_concurrency,
            config.key_prefix.clone(),
        );
        Self {
            core,
            config,
            queue,
        }
    }

    fn write_queue(&self) -> Option<&AsyncWriteQueue> {
        if self.config.async_writes {
            self.queue.as_deref().filter(|q| q.is_enabled())
        } else {
            None
        }
    }

    /// Durable entries live at least the default and at most the maximum.
    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.max(self.config.default_expiration)
            .min(self.config.max_expiration)
    }
}

#[async_trait]
impl StorageLayer for PersistentTier {
    fn layer_id(&self) -> &'static str {
        "L3"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn promotes_on_hit(&self) -> bool {
        self.config.promotion
    }

    fn ttl_bounds(&self) -> TtlBounds {
        TtlBounds {
            default: self.config.default_expiration,
            max: self.config.max_expiration,
        }
    }

    async fn get(&self, key: &str, ctx: &OperationContext) -> TierGet {
        self.core.get(key, ctx).await
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        ctx: &OperationContext,
    ) -> CacheResult<()> {
        let ttl = self.clamp_ttl(ttl);
        self.core
            .set(key, value, ttl, tags, ctx, self.write_queue())
            .await
    }

    async fn remove(&self, key: &str, ctx: &OperationContext) -> CacheResult<()> {
        self.core.remove(key, ctx).await
    }

    async fn remove_by_tag(&self, tag: &str, ctx: &OperationContext) -> CacheResult<()> {
        self.core.remove_by_tag(tag, ctx).await
    }

    async fn remove_by_tag_pattern(
        &self,
        pattern: &str,
        ctx: &OperationContext,
    ) -> CacheResult<usize> {
        self.core.remove_by_tag_pattern(pattern, ctx).await
    }

    async fn exists(&self, key: &str, ctx: &OperationContext) -> bool {
        self.core.exists(key, ctx).await
    }

    async fn clear(&self, ctx: &OperationContext) -> CacheResult<()> {
        self.core.clear(ctx).await
    }

    async fn health(&self) -> HealthStatus {
        self.core.health().await
    }

    fn stats(&self) -> LayerStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryRemoteBackend;

    fn config() -> PersistentTierConfig {
        PersistentTierConfig {
            enabled: true,
            default_expiration: Duration::from_secs(600),
            max_expiration: Duration::from_secs(3600),
            max_concurrency: 2,
            async_writes: false,
            promotion: true,
            key_prefix: "t:".to_string(),
        }
    }

    #[tokio::test]
    async fn ttl_clamped_into_bounds() {
        let backend = Arc::new(MemoryRemoteBackend::new());
        let tier = PersistentTier::new(backend.clone(), config(), None);
        let ctx = OperationContext::new();

        // below the floor: raised to default_expiration
        tier.set(
            "short",
            Bytes::from_static(b"v"),
            Duration::from_secs(5),
            &[],
            &ctx,
        )
        .await
        .unwrap();
        let (_, ttl) = backend.get_with_ttl("short").await.unwrap().unwrap();
        assert!(ttl.unwrap() > Duration::from_secs(500));

        // above the ceiling: clamped to max_expiration
        tier.set(
            "long",
            Bytes::from_static(b"v"),
            Duration::from_secs(1_000_000),
            &[],
            &ctx,
        )
        .await
        .unwrap();
        let (_, ttl) = backend.get_with_ttl("long").await.unwrap().unwrap();
        assert!(ttl.unwrap() <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn promotion_flag_follows_config() {
        let backend = Arc::new(MemoryRemoteBackend::new());
        let promoted = PersistentTier::new(backend.clone(), config(), None);
        assert!(promoted.promotes_on_hit());

        let unpromoted = PersistentTier::new(
            backend,
            PersistentTierConfig {
                promotion: false,
                ..config()
            },
            None,
        );
        assert!(!unpromoted.promotes_on_hit());
    }
}
