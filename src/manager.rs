//! Cache manager: read-through front door with stampede protection.
//!
//! `get_or_create` resolves the call's policy, generates the key, and serves
//! the value from the tier pipeline, running the caller's factory on a miss.
//! Every compute passes through an in-process single-flight slot (one factory
//! per key per instance); the policy's stampede mode layers distributed
//! locking, refresh-ahead or probabilistic early expiration on top.
//! Explicit invalidations fan out across tiers and are published to peers on
//! the backplane.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backplane::{BackplaneHandle, BackplaneStats};
use crate::codecs::JsonCodec;
use crate::coordinator::{CoordinatorHit, StorageCoordinator};
use crate::error::{CacheError, CacheResult};
use crate::keys::{KeyArgs, KeyGenerator};
use crate::lock::{LockProvider, spawn_renewal};
use crate::policy::{PolicyRegistry, RuntimePolicy, StampedeMode};
use crate::traits::{CacheCodec, HealthStatus, LayerStats, OperationContext};
use crate::write_queue::AsyncWriteQueue;

/// How long an unlucky caller waits before re-checking the cache and retrying
/// the lock once.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

/// RAII cleanup for the in-flight map: the slot disappears even on early
/// return or panic.
struct CleanupGuard<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Debug, Default)]
struct ManagerCounters {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    factory_executions: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    early_recomputes: AtomicU64,
    lock_fallbacks: AtomicU64,
}

/// Aggregated cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub factory_executions: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub early_recomputes: u64,
    pub lock_fallbacks: u64,
    pub in_flight: usize,
    pub promotions: u64,
    pub layers: Vec<LayerStats>,
    pub backplane: Option<BackplaneStats>,
}

pub(crate) struct CacheManagerInner<C: CacheCodec> {
    coordinator: Arc<StorageCoordinator>,
    keygen: KeyGenerator,
    registry: Arc<PolicyRegistry>,
    codec: Arc<C>,
    lock_provider: Arc<dyn LockProvider>,
    backplane: Option<BackplaneHandle>,
    write_queue: Option<Arc<AsyncWriteQueue>>,
    in_flight: InFlightMap,
    refreshing: DashMap<String, ()>,
    counters: ManagerCounters,
    shutdown: CancellationToken,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Read-through cache manager. Cheap to clone; all state is shared.
pub struct CacheManager<C: CacheCodec = JsonCodec> {
    inner: Arc<CacheManagerInner<C>>,
}

impl<C: CacheCodec> Clone for CacheManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CacheCodec + 'static> CacheManager<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        coordinator: Arc<StorageCoordinator>,
        keygen: KeyGenerator,
        registry: Arc<PolicyRegistry>,
        codec: C,
        lock_provider: Arc<dyn LockProvider>,
        backplane: Option<BackplaneHandle>,
        write_queue: Option<Arc<AsyncWriteQueue>>,
        shutdown: CancellationToken,
        listener: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheManagerInner {
                coordinator,
                keygen,
                registry,
                codec: Arc::new(codec),
                lock_provider,
                backplane,
                write_queue,
                in_flight: DashMap::new(),
                refreshing: DashMap::new(),
                counters: ManagerCounters::default(),
                shutdown,
                listener: parking_lot::Mutex::new(listener),
            }),
        }
    }

    /// The key this manager would use for `(method, args)` under the
    /// registry-resolved policy. Useful for targeted invalidation.
    pub fn cache_key(&self, method: &str, args: &KeyArgs) -> CacheResult<String> {
        let policy = self.inner.registry.resolve(method);
        self.inner.keygen.generate_key(method, args, &policy)
    }

    /// Policy registry backing this manager.
    #[must_use]
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.inner.registry
    }

    /// The composed tier pipeline.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<StorageCoordinator> {
        &self.inner.coordinator
    }

    /// Read-through lookup with the policy resolved from the registry.
    pub async fn get_or_create<T, F, Fut>(
        &self,
        method: &str,
        args: KeyArgs,
        factory: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let policy = self.inner.registry.resolve(method);
        self.get_or_create_with_policy(method, args, policy, factory)
            .await
    }

    /// Read-through lookup with an explicit policy.
    pub async fn get_or_create_with_policy<T, F, Fut>(
        &self,
        method: &str,
        args: KeyArgs,
        policy: RuntimePolicy,
        factory: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = self.inner.keygen.generate_key(method, &args, &policy)?;
        self.inner
            .counters
            .total_requests
            .fetch_add(1, Ordering::Relaxed);
        let ctx = OperationContext::new();
        let mut force_recompute = false;

        if let Some(hit) = self.inner.coordinator.get(&key, &ctx).await {
            match policy.stampede_mode {
                StampedeMode::RefreshAhead
                    if should_refresh_ahead(hit.remaining_ttl, policy.refresh_ahead_window) =>
                {
                    if let Some(value) = self.decode_hit::<T>(&key, &hit, &ctx).await {
                        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        self.spawn_refresh(key, policy, factory);
                        return Ok(value);
                    }
                }
                StampedeMode::Probabilistic { beta }
                    if should_recompute_early(hit.remaining_ttl, policy.duration, beta) =>
                {
                    self.inner
                        .counters
                        .early_recomputes
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "probabilistic early recompute triggered");
                    // the entry is still live; treat this call as a miss and
                    // skip the single-flight re-check so the factory runs
                    force_recompute = true;
                }
                _ => {
                    if let Some(value) = self.decode_hit::<T>(&key, &hit, &ctx).await {
                        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    // corrupt payload: removed, treated as a miss
                }
            }
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.compute_single_flight(&key, &policy, factory, &ctx, force_recompute)
            .await
    }

    /// Cache-only lookup; never runs a factory.
    pub async fn try_get<T: DeserializeOwned>(
        &self,
        method: &str,
        args: &KeyArgs,
    ) -> CacheResult<Option<T>> {
        let policy = self.inner.registry.resolve(method);
        let key = self.inner.keygen.generate_key(method, args, &policy)?;
        self.try_get_key(&key).await
    }

    /// Cache-only lookup by generated key.
    pub async fn try_get_key<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        self.inner
            .counters
            .total_requests
            .fetch_add(1, Ordering::Relaxed);
        let ctx = OperationContext::new();
        match self.inner.coordinator.get(key, &ctx).await {
            Some(hit) => match self.decode_hit::<T>(key, &hit, &ctx).await {
                Some(value) => {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(value))
                }
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Remove the given generated keys from every tier and notify peers.
    pub async fn invalidate_by_keys<I, S>(&self, keys: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ctx = OperationContext::new();
        for key in keys {
            let key = key.as_ref();
            self.inner.coordinator.remove(key, &ctx).await?;
            if let Some(backplane) = &self.inner.backplane {
                if let Err(e) = backplane.publish_invalidation(key).await {
                    warn!(key = %key, error = %e, "failed to publish key invalidation");
                }
            }
        }
        Ok(())
    }

    /// Invalidate every entry carrying any of the tags, across every tier,
    /// and notify peers.
    pub async fn invalidate_by_tags<I, S>(&self, tags: I) -> CacheResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ctx = OperationContext::new();
        for tag in tags {
            let tag = tag.as_ref();
            self.inner.coordinator.remove_by_tag(tag, &ctx).await?;
            if let Some(backplane) = &self.inner.backplane {
                if let Err(e) = backplane.publish_tag_invalidation(tag).await {
                    warn!(tag = %tag, error = %e, "failed to publish tag invalidation");
                }
            }
        }
        Ok(())
    }

    /// Best-effort glob invalidation over tags, server-side where the tier
    /// supports scanning. Returns the number of entries removed locally;
    /// peers are not notified (no pattern message exists on the wire).
    pub async fn invalidate_by_tag_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let ctx = OperationContext::new();
        let removed = self
            .inner
            .coordinator
            .remove_by_tag_pattern(pattern, &ctx)
            .await?;
        info!(pattern = %pattern, removed, "tag-pattern invalidation completed");
        Ok(removed)
    }

    /// Clear every tier and tell peers to do the same.
    pub async fn clear(&self) -> CacheResult<()> {
        let ctx = OperationContext::new();
        self.inner.coordinator.clear(&ctx).await?;
        if let Some(backplane) = &self.inner.backplane {
            if let Err(e) = backplane.publish_clear_all().await {
                warn!(error = %e, "failed to publish clear-all");
            }
        }
        Ok(())
    }

    /// Aggregate pipeline health.
    pub async fn health(&self) -> HealthStatus {
        self.inner.coordinator.health().await
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let coordinator = self.inner.coordinator.stats();
        let total = self.inner.counters.total_requests.load(Ordering::Relaxed);
        let hits = self.inner.counters.hits.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            total_requests: total,
            hits,
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            hit_rate,
            factory_executions: self
                .inner
                .counters
                .factory_executions
                .load(Ordering::Relaxed),
            refreshes: self.inner.counters.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.inner.counters.refresh_failures.load(Ordering::Relaxed),
            early_recomputes: self.inner.counters.early_recomputes.load(Ordering::Relaxed),
            lock_fallbacks: self.inner.counters.lock_fallbacks.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
            promotions: coordinator.promotions,
            layers: coordinator.layers,
            backplane: self.inner.backplane.as_ref().map(BackplaneHandle::stats),
        }
    }

    /// Stop background work: the backplane listener, the write queue (bounded
    /// drain) and the tiers, in that order; tiers dispose in reverse
    /// priority.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let listener = self.inner.listener.lock().take();
        if let Some(handle) = listener {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        if let Some(queue) = &self.inner.write_queue {
            queue.shutdown(Duration::from_secs(5)).await;
        }
        self.inner.coordinator.dispose().await;
        info!("cache manager shut down");
    }

    async fn decode_hit<T: DeserializeOwned>(
        &self,
        key: &str,
        hit: &CoordinatorHit,
        ctx: &OperationContext,
    ) -> Option<T> {
        match self.inner.codec.deserialize(&hit.value) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    key = %key,
                    layer = hit.layer_id,
                    error = %e,
                    "corrupt cache payload, removing"
                );
                let _ = self.inner.coordinator.remove(key, ctx).await;
                None
            }
        }
    }

    /// The miss path: one factory per key per instance, with the policy's
    /// stampede mode layered on top. `force_recompute` skips the post-slot
    /// cache re-check: a probabilistic early recompute targets an entry that
    /// is still live, so re-checking would just hand the stale value back.
    async fn compute_single_flight<T, F, Fut>(
        &self,
        key: &str,
        policy: &RuntimePolicy,
        factory: F,
        ctx: &OperationContext,
        force_recompute: bool,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let slot = self
            .inner
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock().await;
        let _cleanup = CleanupGuard {
            map: &self.inner.in_flight,
            key: key.to_string(),
        };

        // A winner may have populated the cache while we waited on the slot.
        if !force_recompute {
            if let Some(hit) = self.inner.coordinator.get(key, ctx).await {
                if let Some(value) = self.decode_hit::<T>(key, &hit, ctx).await {
                    return Ok(value);
                }
            }
        }

        match policy.stampede_mode {
            StampedeMode::DistributedLock => self.compute_locked(key, policy, factory, ctx).await,
            _ => self.run_factory_and_set(key, policy, factory, ctx).await,
        }
    }

    /// Distributed-lock path: acquire `lock:{key}`, double-check, compute
    /// under renewal; on an unavailable lock wait briefly, re-check, retry
    /// once, then fall back to an uncached compute.
    async fn compute_locked<T, F, Fut>(
        &self,
        key: &str,
        policy: &RuntimePolicy,
        factory: F,
        ctx: &OperationContext,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let resource = format!("lock:{key}");
        let timeout = policy.lock.timeout;

        let handle = self
            .inner
            .lock_provider
            .acquire(&resource, timeout, timeout, policy.lock.max_concurrency)
            .await?;
        if handle.is_acquired() {
            return self
                .compute_under_lock(key, policy, factory, ctx, &resource, handle)
                .await;
        }

        // brief wait, re-check the cache, then retry the lock once
        tokio::time::sleep(LOCK_RETRY_DELAY).await;
        if let Some(hit) = self.inner.coordinator.get(key, ctx).await {
            if let Some(value) = self.decode_hit::<T>(key, &hit, ctx).await {
                return Ok(value);
            }
        }
        let handle = self
            .inner
            .lock_provider
            .acquire(&resource, timeout, timeout, policy.lock.max_concurrency)
            .await?;
        if handle.is_acquired() {
            return self
                .compute_under_lock(key, policy, factory, ctx, &resource, handle)
                .await;
        }

        warn!(
            key = %key,
            resource = %resource,
            "lock unavailable after retry, executing factory without caching"
        );
        self.inner
            .counters
            .lock_fallbacks
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .factory_executions
            .fetch_add(1, Ordering::Relaxed);
        factory().await.map_err(CacheError::Factory)
    }

    /// Compute while holding the lock: double-check the cache, run the
    /// factory with a lease-renewal task, release on scope exit.
    async fn compute_under_lock<T, F, Fut>(
        &self,
        key: &str,
        policy: &RuntimePolicy,
        factory: F,
        ctx: &OperationContext,
        resource: &str,
        handle: crate::lock::LockHandle,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if let Some(hit) = self.inner.coordinator.get(key, ctx).await {
            if let Some(value) = self.decode_hit::<T>(key, &hit, ctx).await {
                return Ok(value);
            }
        }

        let stop = CancellationToken::new();
        let renewal = handle
            .lease()
            .map(|lease| spawn_renewal(resource.to_string(), lease, policy.lock.timeout, stop.clone()));
        let result = self.run_factory_and_set(key, policy, factory, ctx).await;
        stop.cancel();
        if let Some(task) = renewal {
            let _ = task.await;
        }
        drop(handle);
        result
    }

    /// Run the factory and store its value. Factory errors propagate and
    /// cache nothing; storage errors are telemetry, the fresh value is still
    /// returned.
    async fn run_factory_and_set<T, F, Fut>(
        &self,
        key: &str,
        policy: &RuntimePolicy,
        factory: F,
        ctx: &OperationContext,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        self.inner
            .counters
            .factory_executions
            .fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "computing fresh value");
        let value = factory().await.map_err(CacheError::Factory)?;

        match self.inner.codec.serialize(&value) {
            Ok(bytes) => {
                if let Err(e) = self
                    .inner
                    .coordinator
                    .set(
                        key,
                        Bytes::from(bytes),
                        policy.duration,
                        &policy.tags,
                        ctx,
                    )
                    .await
                {
                    warn!(key = %key, error = %e, "failed to cache computed value");
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "computed value not serializable, returning uncached");
            }
        }
        Ok(value)
    }

    /// Background refresh behind a per-key guard: the caller already has the
    /// stale value; the winner recomputes and overwrites, a failed refresh
    /// keeps the old value.
    fn spawn_refresh<T, F, Fut>(&self, key: String, policy: RuntimePolicy, factory: F)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.inner.refreshing.insert(key.clone(), ()).is_some() {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let ctx = OperationContext::new();
            manager
                .inner
                .counters
                .refreshes
                .fetch_add(1, Ordering::Relaxed);
            match factory().await {
                Ok(value) => match manager.inner.codec.serialize(&value) {
                    Ok(bytes) => {
                        if let Err(e) = manager
                            .inner
                            .coordinator
                            .set(
                                &key,
                                Bytes::from(bytes),
                                policy.duration,
                                &policy.tags,
                                &ctx,
                            )
                            .await
                        {
                            warn!(key = %key, error = %e, "refresh-ahead store failed");
                        } else {
                            debug!(key = %key, "refresh-ahead completed");
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "refreshed value not serializable");
                    }
                },
                Err(e) => {
                    // keep the stale value
                    manager
                        .inner
                        .counters
                        .refresh_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "refresh-ahead factory failed, keeping stale value");
                }
            }
            manager.inner.refreshing.remove(&key);
        });
    }
}

/// Refresh when the remaining TTL has dropped inside the window.
fn should_refresh_ahead(remaining: Option<Duration>, window: Option<Duration>) -> bool {
    match (remaining, window) {
        (Some(remaining), Some(window)) => remaining <= window,
        _ => false,
    }
}

/// XFetch: with remaining ratio `r`, keep the cached value with probability
/// `exp(-beta * (1 - r))`. `beta <= 0` disables early refresh.
fn should_recompute_early(remaining: Option<Duration>, duration: Duration, beta: f64) -> bool {
    if beta <= 0.0 {
        return false;
    }
    let Some(remaining) = remaining else {
        return false;
    };
    if duration.is_zero() {
        return false;
    }
    let r = (remaining.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0);
    let keep_probability = (-beta * (1.0 - r)).exp();
    rand::random::<f64>() > keep_probability
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_window_boundary() {
        let window = Some(Duration::from_secs(3));
        assert!(should_refresh_ahead(Some(Duration::from_secs(2)), window));
        assert!(should_refresh_ahead(Some(Duration::from_secs(3)), window));
        assert!(!should_refresh_ahead(Some(Duration::from_secs(4)), window));
        assert!(!should_refresh_ahead(None, window));
        assert!(!should_refresh_ahead(Some(Duration::from_secs(1)), None));
    }

    #[test]
    fn xfetch_disabled_by_nonpositive_beta() {
        for _ in 0..100 {
            assert!(!should_recompute_early(
                Some(Duration::from_millis(1)),
                Duration::from_secs(60),
                0.0
            ));
            assert!(!should_recompute_early(
                Some(Duration::from_millis(1)),
                Duration::from_secs(60),
                -1.0
            ));
        }
    }

    #[test]
    fn xfetch_fresh_entries_are_kept() {
        // r == 1 gives keep probability 1.0; recompute never fires
        for _ in 0..100 {
            assert!(!should_recompute_early(
                Some(Duration::from_secs(60)),
                Duration::from_secs(60),
                1.0
            ));
        }
    }

    #[test]
    fn xfetch_stale_entries_eventually_recompute() {
        // near-zero remaining TTL with a large beta recomputes almost surely
        let fired = (0..200).any(|_| {
            should_recompute_early(
                Some(Duration::from_millis(1)),
                Duration::from_secs(60),
                50.0,
            )
        });
        assert!(fired);
    }
}
