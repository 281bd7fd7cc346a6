//! Distributed locks for cross-process stampede protection.
//!
//! A [`LockProvider`] hands out [`LockHandle`]s with a lease: the handle
//! releases on drop (scope exit), can be renewed while the protected work
//! runs, and reports whether acquisition actually succeeded. The in-process
//! [`LocalLockProvider`] implements the contract with keyed semaphores;
//! multi-process providers (Redis, database advisory locks) implement the
//! same trait outside this crate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CacheResult;

/// Live lease behind an acquired lock. Shared between the holding scope and
/// its renewal task.
#[async_trait]
pub trait LockLease: Send + Sync {
    /// Extend the lease by `expiry` from now.
    async fn renew(&self, expiry: Duration) -> CacheResult<()>;

    /// Remaining lease time, if the provider tracks one.
    fn remaining(&self) -> Option<Duration>;
}

/// Handle returned by [`LockProvider::acquire`]. Dropping the handle releases
/// the lock.
pub struct LockHandle {
    resource: String,
    lease: Option<Arc<dyn LockLease>>,
    // Held solely for its Drop: releasing the permit releases the lock.
    _permit: Option<OwnedSemaphorePermit>,
}

impl LockHandle {
    /// A handle representing a failed acquisition.
    #[must_use]
    pub fn not_acquired(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            lease: None,
            _permit: None,
        }
    }

    #[must_use]
    pub fn is_acquired(&self) -> bool {
        self.lease.is_some()
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Extend the lease by `expiry` from now.
    pub async fn renew(&self, expiry: Duration) -> CacheResult<()> {
        match &self.lease {
            Some(lease) => lease.renew(expiry).await,
            None => Ok(()),
        }
    }

    /// Remaining lease time, if acquired and tracked.
    #[must_use]
    pub fn remaining_lease(&self) -> Option<Duration> {
        self.lease.as_ref().and_then(|lease| lease.remaining())
    }

    /// Shareable lease for a background renewal task.
    #[must_use]
    pub fn lease(&self) -> Option<Arc<dyn LockLease>> {
        self.lease.clone()
    }
}

/// Provider of named locks.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to acquire `resource` with a lease of `expiry`, waiting at most
    /// `wait`. `max_concurrency` is the policy's bound on simultaneous
    /// holders of the resource (1 = mutual exclusion); providers that cannot
    /// express shared holders may treat any value as 1. A timed-out
    /// acquisition returns a handle with `is_acquired() == false`; transport
    /// failures return an error.
    async fn acquire(
        &self,
        resource: &str,
        expiry: Duration,
        wait: Duration,
        max_concurrency: usize,
    ) -> CacheResult<LockHandle>;
}

struct LocalLease {
    expires_at: Mutex<Instant>,
}

#[async_trait]
impl LockLease for LocalLease {
    async fn renew(&self, expiry: Duration) -> CacheResult<()> {
        *self.expires_at.lock() = Instant::now() + expiry;
        Ok(())
    }

    fn remaining(&self) -> Option<Duration> {
        Some(
            self.expires_at
                .lock()
                .saturating_duration_since(Instant::now()),
        )
    }
}

/// In-process lock provider: one semaphore per resource, sized by the
/// acquiring policy's holder bound.
///
/// Sufficient for single-process deployments and the default when no external
/// provider is configured; the permits bound holders exactly like the remote
/// variants bound lease owners. The first acquisition of a resource fixes
/// its holder bound; callers are expected to use one policy per resource.
pub struct LocalLockProvider {
    semaphores: DashMap<String, Arc<Semaphore>>,
}

impl LocalLockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphores: DashMap::new(),
        }
    }
}

impl Default for LocalLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn acquire(
        &self,
        resource: &str,
        expiry: Duration,
        wait: Duration,
        max_concurrency: usize,
    ) -> CacheResult<LockHandle> {
        let semaphore = self
            .semaphores
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max_concurrency.max(1))))
            .clone();

        match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(resource = %resource, "lock acquired");
                let lease = Arc::new(LocalLease {
                    expires_at: Mutex::new(Instant::now() + expiry),
                });
                Ok(LockHandle {
                    resource: resource.to_string(),
                    lease: Some(lease),
                    _permit: Some(permit),
                })
            }
            Ok(Err(_closed)) => Ok(LockHandle::not_acquired(resource)),
            Err(_elapsed) => {
                debug!(resource = %resource, waited = ?wait, "lock acquisition timed out");
                Ok(LockHandle::not_acquired(resource))
            }
        }
    }
}

/// Spawn a task renewing `lease` every `expiry / 3` until `stop` fires.
/// Renewal failures are logged; the protected work keeps running on its
/// original lease.
pub(crate) fn spawn_renewal(
    resource: String,
    lease: Arc<dyn LockLease>,
    expiry: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let interval = (expiry / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = lease.renew(expiry).await {
                        warn!(resource = %resource, error = %e, "lock renewal failed");
                    }
                }
            }
        }
    })
}
