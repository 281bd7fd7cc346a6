//! Cache builder: assembles tiers, queue, backplane and manager.
//!
//! The builder is where configuration errors surface: `build` validates the
//! options once and wires everything so call sites never see invariant
//! violations. L1 always exists; L2/L3 join when enabled and given a backend;
//! the backplane listener and the write-queue worker are the only background
//! tasks started here.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backplane::{Backplane, BackplaneHandle, InMemoryBackplane};
use crate::codecs::JsonCodec;
use crate::config::StorageOptions;
use crate::coordinator::StorageCoordinator;
use crate::distributed::{DistributedTier, DistributedTierConfig};
use crate::error::{CacheError, CacheResult};
use crate::keys::KeyGenerator;
use crate::lock::{LocalLockProvider, LockProvider};
use crate::manager::CacheManager;
use crate::memory::{MemoryTier, MemoryTierConfig};
use crate::persistent::{PersistentTier, PersistentTierConfig};
use crate::policy::PolicyRegistry;
use crate::traits::{CacheCodec, RemoteBackend, StorageLayer};
use crate::write_queue::AsyncWriteQueue;

/// Builder for a [`CacheManager`] and its storage pipeline.
pub struct CacheBuilder<C: CacheCodec = JsonCodec> {
    options: StorageOptions,
    codec: C,
    l2_backend: Option<Arc<dyn RemoteBackend>>,
    l3_backend: Option<Arc<dyn RemoteBackend>>,
    backplane: Option<Arc<dyn Backplane>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    registry: Option<Arc<PolicyRegistry>>,
}

impl CacheBuilder<JsonCodec> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: StorageOptions::default(),
            codec: JsonCodec,
            l2_backend: None,
            l3_backend: None,
            backplane: None,
            lock_provider: None,
            registry: None,
        }
    }
}

impl Default for CacheBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CacheCodec + 'static> CacheBuilder<C> {
    #[must_use]
    pub fn options(mut self, options: StorageOptions) -> Self {
        self.options = options;
        self
    }

    /// Backend for the distributed tier. Also sets `l2_enabled`.
    #[must_use]
    pub fn l2_backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.l2_backend = Some(backend);
        self.options.l2_enabled = true;
        self
    }

    /// Backend for the persistent tier. Also sets `l3_enabled`.
    #[must_use]
    pub fn l3_backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.l3_backend = Some(backend);
        self.options.l3_enabled = true;
        self
    }

    /// Backplane transport. Also sets `enable_backplane`.
    #[must_use]
    pub fn backplane(mut self, transport: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(transport);
        self.options.enable_backplane = true;
        self
    }

    /// Distributed lock provider; defaults to the in-process provider.
    #[must_use]
    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    /// Pre-populated policy registry; defaults to an empty one.
    #[must_use]
    pub fn policy_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Swap the value codec.
    #[must_use]
    pub fn codec<D: CacheCodec>(self, codec: D) -> CacheBuilder<D> {
        CacheBuilder {
            options: self.options,
            codec,
            l2_backend: self.l2_backend,
            l3_backend: self.l3_backend,
            backplane: self.backplane,
            lock_provider: self.lock_provider,
            registry: self.registry,
        }
    }

    /// Validate the configuration and assemble the cache.
    ///
    /// Must run inside a Tokio runtime when async writes or the backplane
    /// are enabled: those features spawn their worker tasks here.
    pub fn build(self) -> CacheResult<CacheManager<C>> {
        self.options.validate()?;
        let instance_id = self.options.resolve_instance_id();
        let shutdown = CancellationToken::new();

        debug!(
            instance = %instance_id,
            l2 = self.options.l2_enabled,
            l3 = self.options.l3_enabled,
            backplane = self.options.enable_backplane,
            codec = self.codec.name(),
            "building cache"
        );

        let memory: Arc<MemoryTier> = Arc::new(MemoryTier::new(MemoryTierConfig {
            max_entries: self.options.l1_max_entries,
            max_bytes: self.options.l1_max_bytes,
            eviction_policy: self.options.l1_eviction_policy,
            default_expiration: self.options.l1_default_expiration,
            max_expiration: self.options.l1_max_expiration,
            efficient_tag_invalidation: self.options.enable_efficient_l1_tag_invalidation,
            max_tag_mappings: self.options.max_tag_mappings,
        }));

        let queue = if self.options.enable_async_l2_writes || self.options.enable_async_l3_writes {
            Some(Arc::new(AsyncWriteQueue::new(
                self.options.async_write_queue_capacity,
            )))
        } else {
            None
        };

        let mut tiers: Vec<Arc<dyn StorageLayer>> = vec![memory.clone()];

        if self.options.l2_enabled {
            let backend = self.l2_backend.ok_or_else(|| {
                CacheError::Config("L2 is enabled but no distributed backend was provided".into())
            })?;
            tiers.push(Arc::new(DistributedTier::new(
                backend,
                DistributedTierConfig {
                    enabled: true,
                    default_expiration: self.options.l2_default_expiration,
                    max_concurrency: self.options.max_concurrent_l2_operations,
                    async_writes: self.options.enable_async_l2_writes,
                    key_prefix: self.options.key_prefix.clone(),
                },
                queue.clone(),
            )));
        }

        if self.options.l3_enabled {
            let backend = self.l3_backend.ok_or_else(|| {
                CacheError::Config("L3 is enabled but no persistent backend was provided".into())
            })?;
            tiers.push(Arc::new(PersistentTier::new(
                backend,
                PersistentTierConfig {
                    enabled: true,
                    default_expiration: self.options.l3_default_expiration,
                    max_expiration: self.options.l3_max_expiration,
                    max_concurrency: self.options.max_concurrent_l3_operations,
                    async_writes: self.options.enable_async_l3_writes,
                    promotion: self.options.enable_l3_promotion,
                    key_prefix: self.options.key_prefix.clone(),
                },
                queue.clone(),
            )));
        }

        let coordinator = Arc::new(StorageCoordinator::new(tiers));

        let (backplane_handle, listener) = if self.options.enable_backplane {
            let transport = self
                .backplane
                .unwrap_or_else(|| Arc::new(InMemoryBackplane::new()) as Arc<dyn Backplane>);
            let handle = BackplaneHandle::new(transport, &instance_id);
            let listener = handle.start_listener(
                vec![memory.clone() as Arc<dyn StorageLayer>],
                shutdown.child_token(),
            );
            (Some(handle), Some(listener))
        } else {
            (None, None)
        };

        let lock_provider = self
            .lock_provider
            .unwrap_or_else(|| Arc::new(LocalLockProvider::default()) as Arc<dyn LockProvider>);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(PolicyRegistry::default()));
        let keygen = KeyGenerator::new(self.options.key_prefix.clone());

        info!(instance = %instance_id, "cache built");
        Ok(CacheManager::assemble(
            coordinator,
            keygen,
            registry,
            self.codec,
            lock_provider,
            backplane_handle,
            queue,
            shutdown,
            listener,
        ))
    }
}
