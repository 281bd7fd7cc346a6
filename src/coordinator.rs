//! Storage coordinator: composes tiers into one pipeline.
//!
//! Tiers are sorted by ascending priority. Reads walk the tiers in order and
//! promote hits upward with TTLs clamped to each upper tier's bounds; writes
//! and invalidations fan out to every enabled tier in parallel, logging and
//! swallowing per-tier failures so one cold tier cannot fail an operation the
//! hot tier already committed. Disposal runs in reverse priority order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::traits::{HealthStatus, LayerStats, OperationContext, StorageLayer, TierGet};

/// A read served by the pipeline, with its source tier.
#[derive(Debug, Clone)]
pub struct CoordinatorHit {
    pub value: Bytes,
    pub remaining_ttl: Option<Duration>,
    pub layer_id: &'static str,
}

/// Aggregated pipeline statistics.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub layers: Vec<LayerStats>,
    pub promotions: u64,
}

/// Composes storage tiers by priority.
pub struct StorageCoordinator {
    tiers: Vec<Arc<dyn StorageLayer>>,
    promotions: AtomicU64,
}

impl StorageCoordinator {
    /// Build a coordinator over `tiers`, sorted by ascending priority.
    #[must_use]
    pub fn new(mut tiers: Vec<Arc<dyn StorageLayer>>) -> Self {
        tiers.sort_by_key(|tier| tier.priority());
        Self {
            tiers,
            promotions: AtomicU64::new(0),
        }
    }

    fn enabled(&self) -> impl Iterator<Item = &Arc<dyn StorageLayer>> {
        self.tiers.iter().filter(|tier| tier.is_enabled())
    }

    /// Walk tiers in priority order; on a hit in a promoting tier, populate
    /// every enabled higher-priority tier with a clamped TTL.
    pub async fn get(&self, key: &str, ctx: &OperationContext) -> Option<CoordinatorHit> {
        let enabled: Vec<&Arc<dyn StorageLayer>> = self.enabled().collect();
        for (index, tier) in enabled.iter().enumerate() {
            match tier.get(key, ctx).await {
                TierGet::Found {
                    value,
                    remaining_ttl,
                } => {
                    if tier.promotes_on_hit() && index > 0 {
                        self.promote(key, &value, remaining_ttl, &enabled[..index], ctx)
                            .await;
                    }
                    return Some(CoordinatorHit {
                        value,
                        remaining_ttl,
                        layer_id: tier.layer_id(),
                    });
                }
                TierGet::Miss => {}
                TierGet::StopPropagation => {
                    debug!(
                        layer = tier.layer_id(),
                        key = %key,
                        "tier stopped propagation, reporting miss"
                    );
                    return None;
                }
            }
        }
        None
    }

    /// Copy a hit into the tiers above its source, nearest-first. Tags are
    /// not reconstructed on promotion; tag invalidations reach promoted
    /// copies through the backplane and the source tier's tag sets.
    async fn promote(
        &self,
        key: &str,
        value: &Bytes,
        remaining_ttl: Option<Duration>,
        upper_tiers: &[&Arc<dyn StorageLayer>],
        ctx: &OperationContext,
    ) {
        for upper in upper_tiers.iter().rev() {
            let ttl = upper.ttl_bounds().clamp(remaining_ttl);
            match upper.set(key, value.clone(), ttl, &[], ctx).await {
                Ok(()) => {
                    self.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %key,
                        into = upper.layer_id(),
                        ttl_secs = ttl.as_secs(),
                        "promoted entry"
                    );
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        into = upper.layer_id(),
                        error = %e,
                        "promotion failed"
                    );
                }
            }
        }
    }

    /// Fan the write out to every enabled tier in parallel. Partial failure
    /// is success as long as one tier committed; total failure propagates the
    /// last error.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        ctx: &OperationContext,
    ) -> CacheResult<()> {
        let writes = self
            .enabled()
            .map(|tier| {
                let value = value.clone();
                async move {
                    let result = tier.set(key, value, ttl, tags, ctx).await;
                    (tier.layer_id(), result)
                }
            })
            .collect::<Vec<_>>();

        let mut succeeded = 0usize;
        let mut last_error = None;
        for (layer_id, result) in join_all(writes).await {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(layer = layer_id, key = %key, error = %e, "tier write failed");
                    last_error = Some(e);
                }
            }
        }

        if succeeded > 0 {
            Ok(())
        } else {
            Err(last_error
                .unwrap_or_else(|| CacheError::Config("no storage tiers enabled".to_string())))
        }
    }

    /// Remove the key from every enabled tier in parallel. Best-effort:
    /// per-tier failures are logged and swallowed.
    pub async fn remove(&self, key: &str, ctx: &OperationContext) -> CacheResult<()> {
        let removals = self
            .enabled()
            .map(|tier| async move { (tier.layer_id(), tier.remove(key, ctx).await) })
            .collect::<Vec<_>>();
        for (layer_id, result) in join_all(removals).await {
            if let Err(e) = result {
                warn!(layer = layer_id, key = %key, error = %e, "tier remove failed");
            }
        }
        Ok(())
    }

    /// Invalidate a tag across every enabled tier in parallel, best-effort.
    pub async fn remove_by_tag(&self, tag: &str, ctx: &OperationContext) -> CacheResult<()> {
        let removals = self
            .enabled()
            .map(|tier| async move { (tier.layer_id(), tier.remove_by_tag(tag, ctx).await) })
            .collect::<Vec<_>>();
        for (layer_id, result) in join_all(removals).await {
            if let Err(e) = result {
                warn!(layer = layer_id, tag = %tag, error = %e, "tier tag invalidation failed");
            }
        }
        Ok(())
    }

    /// Best-effort pattern invalidation across tiers that support it.
    /// Returns the number of entries removed by participating tiers.
    pub async fn remove_by_tag_pattern(
        &self,
        pattern: &str,
        ctx: &OperationContext,
    ) -> CacheResult<usize> {
        let mut removed = 0usize;
        for tier in self.enabled() {
            match tier.remove_by_tag_pattern(pattern, ctx).await {
                Ok(count) => removed += count,
                Err(CacheError::Unsupported { layer, .. }) => {
                    debug!(layer, pattern = %pattern, "tier skips tag-pattern invalidation");
                }
                Err(e) => {
                    warn!(
                        layer = tier.layer_id(),
                        pattern = %pattern,
                        error = %e,
                        "tier pattern invalidation failed"
                    );
                }
            }
        }
        Ok(removed)
    }

    /// Short-circuit on the first tier that confirms existence.
    pub async fn exists(&self, key: &str, ctx: &OperationContext) -> bool {
        for tier in self.enabled() {
            if tier.exists(key, ctx).await {
                return true;
            }
        }
        false
    }

    /// Clear every enabled tier in parallel, best-effort.
    pub async fn clear(&self, ctx: &OperationContext) -> CacheResult<()> {
        let clears = self
            .enabled()
            .map(|tier| async move { (tier.layer_id(), tier.clear(ctx).await) })
            .collect::<Vec<_>>();
        for (layer_id, result) in join_all(clears).await {
            if let Err(e) = result {
                warn!(layer = layer_id, error = %e, "tier clear failed");
            }
        }
        Ok(())
    }

    /// Aggregate health: any unhealthy tier wins, then any degraded.
    pub async fn health(&self) -> HealthStatus {
        let mut aggregate = HealthStatus::Healthy;
        for tier in self.enabled() {
            match tier.health().await {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Degraded => aggregate = HealthStatus::Degraded,
                HealthStatus::Healthy => {}
            }
        }
        aggregate
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            layers: self.enabled().map(|tier| tier.stats()).collect(),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }

    /// Dispose tiers in reverse priority order, logging and swallowing
    /// per-tier errors so one failure does not block the rest.
    pub async fn dispose(&self) {
        for tier in self.tiers.iter().rev() {
            if let Err(e) = tier.dispose().await {
                warn!(layer = tier.layer_id(), error = %e, "tier dispose failed");
            }
        }
    }

    /// The highest-priority enabled tier (normally L1), the target for
    /// backplane invalidations.
    #[must_use]
    pub fn primary_tier(&self) -> Option<Arc<dyn StorageLayer>> {
        self.enabled().next().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryRemoteBackend;
    use crate::distributed::{DistributedTier, DistributedTierConfig};
    use crate::memory::{MemoryTier, MemoryTierConfig};
    use crate::persistent::{PersistentTier, PersistentTierConfig};
    use crate::traits::{RemoteBackend, TtlBounds};
    use async_trait::async_trait;

    fn l1() -> Arc<MemoryTier> {
        Arc::new(MemoryTier::new(MemoryTierConfig::default()))
    }

    fn l2(backend: Arc<MemoryRemoteBackend>) -> Arc<DistributedTier> {
        Arc::new(DistributedTier::new(
            backend,
            DistributedTierConfig {
                enabled: true,
                default_expiration: Duration::from_secs(60),
                max_concurrency: 4,
                async_writes: false,
                key_prefix: "t:".to_string(),
            },
            None,
        ))
    }

    fn l3(backend: Arc<MemoryRemoteBackend>) -> Arc<PersistentTier> {
        Arc::new(PersistentTier::new(
            backend,
            PersistentTierConfig {
                enabled: true,
                default_expiration: Duration::from_secs(120),
                max_expiration: Duration::from_secs(600),
                max_concurrency: 2,
                async_writes: false,
                promotion: true,
                key_prefix: "t:".to_string(),
            },
            None,
        ))
    }

    fn stack(
        l1_tier: Arc<MemoryTier>,
        l2_backend: Arc<MemoryRemoteBackend>,
        l3_backend: Arc<MemoryRemoteBackend>,
    ) -> StorageCoordinator {
        StorageCoordinator::new(vec![
            l1_tier as Arc<dyn StorageLayer>,
            l2(l2_backend) as Arc<dyn StorageLayer>,
            l3(l3_backend) as Arc<dyn StorageLayer>,
        ])
    }

    #[tokio::test]
    async fn set_then_get_hits_l1() {
        let coordinator = stack(
            l1(),
            Arc::new(MemoryRemoteBackend::new()),
            Arc::new(MemoryRemoteBackend::new()),
        );
        let ctx = OperationContext::new();
        coordinator
            .set(
                "k",
                Bytes::from_static(b"v"),
                Duration::from_secs(60),
                &[],
                &ctx,
            )
            .await
            .unwrap();

        let hit = coordinator.get("k", &ctx).await.unwrap();
        assert_eq!(hit.value, Bytes::from_static(b"v"));
        assert_eq!(hit.layer_id, "L1");
    }

    #[tokio::test]
    async fn l3_hit_promotes_into_l1_and_l2() {
        let l1_tier = l1();
        let l2_backend = Arc::new(MemoryRemoteBackend::new());
        let l3_backend = Arc::new(MemoryRemoteBackend::new());
        // seed only the durable tier
        l3_backend
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(300))
            .await
            .unwrap();

        let coordinator = stack(l1_tier.clone(), l2_backend.clone(), l3_backend);
        let ctx = OperationContext::new();

        let hit = coordinator.get("k", &ctx).await.unwrap();
        assert_eq!(hit.layer_id, "L3");
        assert_eq!(ctx.trace(), vec![("L1", false), ("L2", false), ("L3", true)]);

        // both upper tiers were populated
        assert!(l2_backend.get_with_ttl("k").await.unwrap().is_some());
        let second = OperationContext::new();
        let hit = coordinator.get("k", &second).await.unwrap();
        assert_eq!(hit.layer_id, "L1");
        assert_eq!(coordinator.stats().promotions, 2);
    }

    #[tokio::test]
    async fn write_fan_out_reaches_all_tiers() {
        let l2_backend = Arc::new(MemoryRemoteBackend::new());
        let l3_backend = Arc::new(MemoryRemoteBackend::new());
        let coordinator = stack(l1(), l2_backend.clone(), l3_backend.clone());
        let ctx = OperationContext::new();

        coordinator
            .set(
                "k",
                Bytes::from_static(b"v"),
                Duration::from_secs(60),
                &["t".to_string()],
                &ctx,
            )
            .await
            .unwrap();

        assert!(l2_backend.get_with_ttl("k").await.unwrap().is_some());
        assert!(l3_backend.get_with_ttl("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lower_tier_write_failure_is_swallowed() {
        let l2_backend = Arc::new(MemoryRemoteBackend::new());
        l2_backend.fail_writes(true);
        let coordinator = stack(l1(), l2_backend, Arc::new(MemoryRemoteBackend::new()));
        let ctx = OperationContext::new();

        // L1 and L3 succeed, so the operation succeeds
        coordinator
            .set(
                "k",
                Bytes::from_static(b"v"),
                Duration::from_secs(60),
                &[],
                &ctx,
            )
            .await
            .unwrap();
        assert!(coordinator.get("k", &ctx).await.is_some());
    }

    #[tokio::test]
    async fn tag_invalidation_spans_tiers() {
        let l2_backend = Arc::new(MemoryRemoteBackend::new());
        let coordinator = stack(l1(), l2_backend.clone(), Arc::new(MemoryRemoteBackend::new()));
        let ctx = OperationContext::new();

        coordinator
            .set(
                "k",
                Bytes::from_static(b"v"),
                Duration::from_secs(60),
                &["t".to_string()],
                &ctx,
            )
            .await
            .unwrap();
        coordinator.remove_by_tag("t", &ctx).await.unwrap();

        assert!(coordinator.get("k", &ctx).await.is_none());
        assert!(l2_backend.get_with_ttl("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exists_short_circuits() {
        let l3_backend = Arc::new(MemoryRemoteBackend::new());
        l3_backend
            .set_with_ttl("deep", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        let coordinator = stack(l1(), Arc::new(MemoryRemoteBackend::new()), l3_backend);
        let ctx = OperationContext::new();

        assert!(coordinator.exists("deep", &ctx).await);
        assert!(!coordinator.exists("absent", &ctx).await);
    }

    #[tokio::test]
    async fn health_aggregates_worst_status() {
        let l2_backend = Arc::new(MemoryRemoteBackend::new());
        let coordinator = stack(l1(), l2_backend.clone(), Arc::new(MemoryRemoteBackend::new()));
        assert_eq!(coordinator.health().await, HealthStatus::Healthy);

        l2_backend.fail_reads(true);
        assert_eq!(coordinator.health().await, HealthStatus::Unhealthy);
    }

    struct StoppingTier;

    #[async_trait]
    impl StorageLayer for StoppingTier {
        fn layer_id(&self) -> &'static str {
            "stop"
        }
        fn priority(&self) -> u8 {
            5
        }
        fn ttl_bounds(&self) -> TtlBounds {
            TtlBounds {
                default: Duration::from_secs(60),
                max: Duration::from_secs(60),
            }
        }
        async fn get(&self, _key: &str, _ctx: &OperationContext) -> TierGet {
            TierGet::StopPropagation
        }
        async fn set(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Duration,
            _tags: &[String],
            _ctx: &OperationContext,
        ) -> CacheResult<()> {
            Ok(())
        }
        async fn remove(&self, _key: &str, _ctx: &OperationContext) -> CacheResult<()> {
            Ok(())
        }
        async fn remove_by_tag(&self, _tag: &str, _ctx: &OperationContext) -> CacheResult<()> {
            Ok(())
        }
        async fn remove_by_tag_pattern(
            &self,
            _pattern: &str,
            _ctx: &OperationContext,
        ) -> CacheResult<usize> {
            Ok(0)
        }
        async fn exists(&self, _key: &str, _ctx: &OperationContext) -> bool {
            false
        }
        async fn clear(&self, _ctx: &OperationContext) -> CacheResult<()> {
            Ok(())
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus::Healthy
        }
        fn stats(&self) -> LayerStats {
            crate::traits::LayerCounters::default().snapshot("stop")
        }
    }

    #[tokio::test]
    async fn stop_propagation_aborts_the_walk() {
        let l1_tier = l1();
        let coordinator = StorageCoordinator::new(vec![
            Arc::new(StoppingTier) as Arc<dyn StorageLayer>,
            l1_tier.clone() as Arc<dyn StorageLayer>,
        ]);
        let ctx = OperationContext::new();
        // seed the lower tier; the stopping tier must mask it
        l1_tier
            .set(
                "k",
                Bytes::from_static(b"v"),
                Duration::from_secs(60),
                &[],
                &ctx,
            )
            .await
            .unwrap();

        assert!(coordinator.get("k", &ctx).await.is_none());
    }
}
