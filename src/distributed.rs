//! Distributed tier (L2): a shared remote key/value store behind the
//! [`RemoteBackend`] contract.
//!
//! Concurrency against the backend is bounded by a semaphore; acquisition
//! respects cancellation and permits release on drop. Write errors are
//! recorded and surfaced to the coordinator, which logs and swallows them
//! (the L1 write already succeeded); read errors degrade to a miss. With
//! async writes enabled, `set` hands the work to the shared write queue and
//! acquires its permit inside the queued job, never while enqueuing.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::traits::{
    HealthStatus, LayerCounters, LayerStats, OperationContext, RemoteBackend, StorageLayer,
    TierGet, TtlBounds,
};
use crate::write_queue::{AsyncWriteQueue, WriteWork};

/// Shared implementation for tiers backed by a [`RemoteBackend`]: bounded
/// concurrency, tag-set maintenance, and the swallow/degrade error policy.
pub(crate) struct RemoteCore {
    layer_id: &'static str,
    backend: Arc<dyn RemoteBackend>,
    semaphore: Arc<Semaphore>,
    counters: LayerCounters,
    key_prefix: String,
}

impl RemoteCore {
    pub(crate) fn new(
        layer_id: &'static str,
        backend: Arc<dyn RemoteBackend>,
        max_concurrency: usize,
        key_prefix: String,
    ) -> Self {
        Self {
            layer_id,
            backend,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            counters: LayerCounters::default(),
            key_prefix,
        }
    }

    fn tag_set_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.key_prefix, tag)
    }

    /// Acquire a backend permit, honoring the caller's cancellation token.
    async fn permit(&self, ctx: &OperationContext) -> CacheResult<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = ctx.cancel_token().cancelled() => Err(CacheError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| CacheError::transient(self.layer_id, anyhow::anyhow!("semaphore closed")))
            }
        }
    }

    pub(crate) async fn get(&self, key: &str, ctx: &OperationContext) -> TierGet {
        let Ok(_permit) = self.permit(ctx).await else {
            ctx.record(self.layer_id, false);
            return TierGet::Miss;
        };
        match self.backend.get_with_ttl(key).await {
            Ok(Some((value, remaining_ttl))) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                ctx.record(self.layer_id, true);
                TierGet::Found {
                    value,
                    remaining_ttl,
                }
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                ctx.record(self.layer_id, false);
                TierGet::Miss
            }
            Err(e) => {
                // read failures degrade to a miss
                warn!(layer = self.layer_id, key = %key, error = %e, "backend read failed");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                ctx.record(self.layer_id, false);
                TierGet::Miss
            }
        }
    }

    /// Synchronous write path, shared by the direct call and the queued job.
    async fn write(
        backend: &Arc<dyn RemoteBackend>,
        layer_id: &'static str,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        tag_set_keys: &[String],
    ) -> anyhow::Result<()> {
        if tags.is_empty() {
            return backend.set_with_ttl(key, value, ttl).await;
        }
        if backend.supports_atomic_tagging() {
            return backend
                .set_with_tags_atomic(key, value, ttl, tag_set_keys)
                .await;
        }
        // Two-phase fallback: value first, then each tag set with an expiry
        // at least as long as the value so tag sets never orphan early.
        backend.set_with_ttl(key, value, ttl).await?;
        for (tag, set_key) in tags.iter().zip(tag_set_keys) {
            if let Err(e) = backend.set_add(set_key, &[key.to_string()], ttl).await {
                warn!(
                    layer = layer_id,
                    tag = %tag,
                    key = %key,
                    error = %e,
                    "non-atomic tag index write failed"
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
        ctx: &OperationContext,
        queue: Option<&AsyncWriteQueue>,
    ) -> CacheResult<()> {
        if let Some(queue) = queue {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&self.semaphore);
            let layer_id = self.layer_id;
            let key_owned = key.to_string();
            let tags_owned = tags.to_vec();
            let tag_set_keys: Vec<String> = tags.iter().map(|t| self.tag_set_key(t)).collect();
            let value_for_queue = value.clone();

            let work = WriteWork::new(format!("{layer_id} set {key}"), move |cancel| async move {
                let _permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(CacheError::Cancelled),
                    permit = semaphore.acquire_owned() => permit
                        .map_err(|_| CacheError::transient(layer_id, anyhow::anyhow!("semaphore closed")))?,
                };
                Self::write(
                    &backend,
                    layer_id,
                    &key_owned,
                    value_for_queue,
                    ttl,
                    &tags_owned,
                    &tag_set_keys,
                )
                .await
                .map_err(|e| CacheError::transient(layer_id, e))
            });

            match queue.try_schedule(work) {
                Ok(()) => {
                    self.counters.sets.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(work) => {
                    debug!(
                        layer = self.layer_id,
                        key = %key,
                        "write queue unavailable, writing synchronously"
                    );
                    // the work acquires its own permit
                    let result = work.execute_now(ctx.cancel_token().clone()).await;
                    if result.is_ok() {
                        self.counters.sets.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    return result;
                }
            }
        }

        let _permit = self.permit(ctx).await?;
        let tag_set_keys: Vec<String> = tags.iter().map(|t| self.tag_set_key(t)).collect();
        match Self::write(
            &self.backend,
            self.layer_id,
            key,
            value,
            ttl,
            tags,
            &tag_set_keys,
        )
        .await
        {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::transient(self.layer_id, e))
            }
        }
    }

    pub(crate) async fn remove(&self, key: &str, ctx: &OperationContext) -> CacheResult<()> {
        let _permit = self.permit(ctx).await?;
        match self.backend.remove(key).await {
            Ok(()) => {
                self.counters.removes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::transient(self.layer_id, e))
            }
        }
    }

    pub(crate) async fn remove_by_tag(&self, tag: &str, ctx: &OperationContext) -> CacheResult<()> {
        let _permit = self.permit(ctx).await?;
        let set_key = self.tag_set_key(tag);
        let keys = self
            .backend
            .set_members(&set_key)
            .await
            .map_err(|e| CacheError::transient(self.layer_id, e))?;
        if !keys.is_empty() {
            let removed = self
                .backend
                .remove_many(&keys)
                .await
                .map_err(|e| CacheError::transient(self.layer_id, e))?;
            self.counters
                .removes
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(layer = self.layer_id, tag = %tag, removed, "bulk tag invalidation");
        }
        self.backend
            .remove(&set_key)
            .await
            .map_err(|e| CacheError::transient(self.layer_id, e))?;
        Ok(())
    }

    pub(crate) async fn remove_by_tag_pattern(
        &self,
        pattern: &str,
        ctx: &OperationContext,
    ) -> CacheResult<usize> {
        let _permit = self.permit(ctx).await?;
        let scan_pattern = self.tag_set_key(pattern);
        let set_keys = match self.backend.scan_keys(&scan_pattern).await {
            Ok(keys) => keys,
            Err(_) => {
                return Err(CacheError::Unsupported {
                    layer: self.layer_id,
                    operation: "remove_by_tag_pattern",
                });
            }
        };
        drop(_permit);

        let mut removed = 0usize;
        let prefix = self.tag_set_key("");
        for set_key in set_keys {
            let Some(tag) = set_key.strip_prefix(&prefix) else {
                continue;
            };
            let before = self.counters.removes.load(Ordering::Relaxed);
            self.remove_by_tag(tag, ctx).await?;
            removed += (self.counters.removes.load(Ordering::Relaxed) - before) as usize;
        }
        Ok(removed)
    }

    pub(crate) async fn exists(&self, key: &str, ctx: &OperationContext) -> bool {
        let Ok(_permit) = self.permit(ctx).await else {
            return false;
        };
        self.backend.exists(key).await.unwrap_or(false)
    }

    pub(crate) async fn clear(&self, ctx: &OperationContext) -> CacheResult<()> {
        let _permit = self.permit(ctx).await?;
        self.backend
            .clear()
            .await
            .map_err(|e| CacheError::transient(self.layer_id, e))
    }

    pub(crate) async fn health(&self) -> HealthStatus {
        if !self.backend.ping().await {
            return HealthStatus::Unhealthy;
        }
        if self.semaphore.available_permits() == 0 {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    pub(crate) fn stats(&self) -> LayerStats {
        self.counters.snapshot(self.layer_id)
    }
}

/// Configuration for the distributed tier.
#[derive(Debug, Clone)]
pub struct DistributedTierConfig {
    pub enabled: bool,
    pub default_expiration: Duration,
    pub max_concurrency: usize,
    pub async_writes: bool,
    pub key_prefix: String,
}

/// Distributed tier (L2).
pub struct DistributedTier {
    core: RemoteCore,
    config: DistributedTierConfig,
    queue: Option<Arc<AsyncWriteQueue>>,
}

impl DistributedTier {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        config: DistributedTierConfig,
        queue: Option<Arc<AsyncWriteQueue>>,
    ) -> Self {
        let core = RemoteCore::new(
            "L2",
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
}

#[async_trait]
impl StorageLayer for DistributedTier {
    fn layer_id(&self) -> &'static str {
        "L2"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn promotes_on_hit(&self) -> bool {
        true
    }

    fn ttl_bounds(&self) -> TtlBounds {
        TtlBounds {
            default: self.config.default_expiration,
            max: Duration::MAX,
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
