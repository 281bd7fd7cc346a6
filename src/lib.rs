//! memotier — multi-tier method-result cache
//!
//! Memoizes the results of expensive, deterministic procedures behind a
//! uniform key/value contract, composing:
//! - **L1**: in-process memory tier with tag-indexed invalidation and
//!   policy-driven eviction
//! - **L2**: optional shared distributed tier behind the pluggable
//!   [`RemoteBackend`] contract
//! - **L3**: optional durable tier with upward promotion
//! - a **backplane** propagating invalidations to peer instances
//! - **stampede protection**: in-process single-flight, distributed locks,
//!   refresh-ahead and probabilistic (XFetch) early expiration
//!
//! # Quick start
//!
//! ```rust
//! use memotier::{CacheBuilder, KeyArgs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheBuilder::new().build()?;
//!
//!     // read-through: the factory runs only on a miss
//!     let report: String = cache
//!         .get_or_create("Reports::daily", KeyArgs::new().arg(&"2024-06-01"), || async {
//!             Ok("expensive result".to_string())
//!         })
//!         .await?;
//!     assert_eq!(report, "expensive result");
//!
//!     // second call is served from L1
//!     let cached: String = cache
//!         .get_or_create("Reports::daily", KeyArgs::new().arg(&"2024-06-01"), || async {
//!             unreachable!("cached")
//!         })
//!         .await?;
//!     assert_eq!(cached, "expensive result");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! get_or_create → KeyGenerator → Coordinator.get
//!                  L1 → L2 → L3          ↑ promote on hit
//!                  miss → single-flight → factory → Coordinator.set (fan-out)
//! invalidate_by_tags → every tier + backplane → peers drop their L1 copies
//! ```
//!
//! Policies come from the [`PolicyRegistry`] (runtime overrides >
//! programmatic > JSON/YAML file > registered defaults) or are passed
//! explicitly per call.

pub mod backends;
pub mod backplane;
pub mod builder;
pub mod codecs;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod keys;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod persistent;
pub mod policy;
pub mod tags;
pub mod traits;
pub mod write_queue;

pub use backends::MemoryRemoteBackend;
pub use backplane::{
    Backplane, BackplaneHandle, BackplaneMessage, BackplaneStats, InMemoryBackplane, MessageKind,
};
pub use builder::CacheBuilder;
pub use codecs::JsonCodec;
pub use config::StorageOptions;
pub use coordinator::{CoordinatorHit, CoordinatorStats, StorageCoordinator};
pub use distributed::{DistributedTier, DistributedTierConfig};
pub use error::{CacheError, CacheResult};
pub use keys::{CacheKeyProvider, KeyArgs, KeyGenerator};
pub use lock::{LocalLockProvider, LockHandle, LockProvider};
pub use manager::{CacheManager, CacheStats};
pub use memory::{EvictionPolicy, MemoryTier, MemoryTierConfig};
pub use persistent::{PersistentTier, PersistentTierConfig};
pub use policy::{
    DistributedLockOptions, KeySerializer, PolicyFile, PolicyFragment, PolicyRegistry,
    RuntimePolicy, StampedeMode,
};
pub use traits::{
    CacheCodec, HealthStatus, LayerStats, OperationContext, RemoteBackend, StorageLayer, TierGet,
    TtlBounds,
};
pub use write_queue::{AsyncWriteQueue, WriteQueueStats, WriteWork};

// Re-export async_trait for custom backend implementations.
pub use async_trait::async_trait;
