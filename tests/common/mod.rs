//! Shared test infrastructure: cache builders over in-memory backends,
//! unique key helpers and test data.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use memotier::{
    Backplane, CacheBuilder, CacheManager, InMemoryBackplane, MemoryRemoteBackend, StorageOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Unique method name so concurrent tests never share keys.
pub fn test_method(name: &str) -> String {
    format!("Test::{}_{}", name, rand_suffix())
}

fn rand_suffix() -> u32 {
    rand::random::<u32>()
}

/// Memory-only cache (L1 alone).
pub fn memory_only_cache() -> CacheManager {
    CacheBuilder::new().build().expect("build memory-only cache")
}

/// Cache with L1 + shared L2 backend.
pub fn cache_with_l2(l2: Arc<MemoryRemoteBackend>) -> CacheManager {
    CacheBuilder::new()
        .l2_backend(l2)
        .build()
        .expect("build L1+L2 cache")
}

/// Full stack: L1 + L2 + L3 over the given shared backends.
pub fn full_stack(
    l2: Arc<MemoryRemoteBackend>,
    l3: Arc<MemoryRemoteBackend>,
    options: StorageOptions,
) -> CacheManager {
    CacheBuilder::new()
        .l2_backend(l2)
        .l3_backend(l3)
        .options(StorageOptions {
            l2_enabled: true,
            l3_enabled: true,
            ..options
        })
        .build()
        .expect("build full stack")
}

/// Instance attached to a shared backplane and shared L2, as one peer of a
/// multi-instance deployment.
pub fn peer_instance(
    instance_id: &str,
    l2: Arc<MemoryRemoteBackend>,
    backplane: Arc<dyn Backplane>,
) -> CacheManager {
    CacheBuilder::new()
        .l2_backend(l2)
        .backplane(backplane)
        .options(StorageOptions {
            l2_enabled: true,
            enable_backplane: true,
            instance_id: instance_id.to_string(),
            ..StorageOptions::default()
        })
        .build()
        .expect("build peer instance")
}

/// Shared in-process backplane transport.
pub fn shared_backplane() -> Arc<dyn Backplane> {
    Arc::new(InMemoryBackplane::new())
}

/// Serialize a value the way the default codec stores it, for seeding
/// backends directly.
pub fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("encode test value"))
}

/// Poll `probe` every 10ms until it returns `Some` or `deadline` elapses.
pub async fn eventually<T, F, Fut>(deadline: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if start.elapsed() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub mod test_data {
    use super::{DeserializeOwned, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub roles: Vec<String>,
    }

    impl User {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("user-{id}"),
                roles: vec!["reader".to_string()],
            }
        }
    }

    pub fn assert_roundtrips<T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug>(
        value: &T,
    ) {
        let bytes = serde_json::to_vec(value).unwrap();
        let back: T = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(&back, value);
    }
}
