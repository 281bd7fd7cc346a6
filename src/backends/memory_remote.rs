//! In-memory reference implementation of [`RemoteBackend`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::tags::glob_match;
use crate::traits::RemoteBackend;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct StoredSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

fn expired(expires_at: Option<Instant>) -> bool {
    expires_at.is_some_and(|at| at <= Instant::now())
}

/// Process-local remote store: full contract support, including atomic
/// tagging and glob scanning. Share one instance between cache managers to
/// emulate a store shared by multiple application instances.
pub struct MemoryRemoteBackend {
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, StoredSet>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    atomic_tagging: bool,
}

impl MemoryRemoteBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            atomic_tagging: true,
        }
    }

    /// Disable atomic tagging to exercise the two-phase write path.
    #[must_use]
    pub fn without_atomic_tagging() -> Self {
        Self {
            atomic_tagging: false,
            ..Self::new()
        }
    }

    /// Make every read fail (fault injection for tests).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail (fault injection for tests).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of live (unexpired) values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values
            .iter()
            .filter(|entry| !expired(entry.value().expires_at))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_read(&self) -> anyhow::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("injected read failure");
        }
        Ok(())
    }

    fn check_write(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("injected write failure");
        }
        Ok(())
    }
}

impl Default for MemoryRemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemoteBackend {
    fn name(&self) -> &'static str {
        "memory-remote"
    }

    fn supports_atomic_tagging(&self) -> bool {
        self.atomic_tagging
    }

    async fn get_with_ttl(&self, key: &str) -> anyhow::Result<Option<(Bytes, Option<Duration>)>> {
        self.check_read()?;
        match self.values.get(key) {
            Some(entry) if expired(entry.expires_at) => {
                drop(entry);
                self.values.remove(key);
                Ok(None)
            }
            Some(entry) => {
                let remaining = entry
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()));
                Ok(Some((entry.value.clone(), remaining)))
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> anyhow::Result<()> {
        self.check_write()?;
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_with_tags_atomic(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tag_set_keys: &[String],
    ) -> anyhow::Result<()> {
        if !self.atomic_tagging {
            anyhow::bail!("atomic tagging not supported");
        }
        self.check_write()?;
        self.set_with_ttl(key, value, ttl).await?;
        for set_key in tag_set_keys {
            self.set_add(set_key, &[key.to_string()], ttl).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.check_write()?;
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> anyhow::Result<usize> {
        self.check_write()?;
        let mut removed = 0;
        for key in keys {
            if self.values.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.check_read()?;
        match self.values.get(key) {
            Some(entry) => Ok(!expired(entry.expires_at)),
            None => Ok(false),
        }
    }

    async fn set_add(
        &self,
        set_key: &str,
        members: &[String],
        min_ttl: Duration,
    ) -> anyhow::Result<()> {
        self.check_write()?;
        let floor = Instant::now() + min_ttl;
        let mut entry = self.sets.entry(set_key.to_string()).or_default();
        if expired(entry.expires_at) {
            entry.members.clear();
            entry.expires_at = None;
        }
        entry.members.extend(members.iter().cloned());
        // tag sets must outlive the values they index
        entry.expires_at = Some(entry.expires_at.map_or(floor, |at| at.max(floor)));
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> anyhow::Result<Vec<String>> {
        self.check_read()?;
        match self.sets.get(set_key) {
            Some(entry) if expired(entry.expires_at) => {
                drop(entry);
                self.sets.remove(set_key);
                Ok(Vec::new())
            }
            Some(entry) => Ok(entry.members.iter().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        self.check_read()?;
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| !expired(entry.value().expires_at))
            .map(|entry| entry.key().clone())
            .chain(
                self.sets
                    .iter()
                    .filter(|entry| !expired(entry.value().expires_at))
                    .map(|entry| entry.key().clone()),
            )
            .filter(|key| glob_match(pattern, key))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.check_write()?;
        self.values.clear();
        self.sets.clear();
        Ok(())
    }

    async fn ping(&self) -> bool {
        !self.fail_reads.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_with_ttl() {
        let backend = MemoryRemoteBackend::new();
        backend
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        let (value, ttl) = backend.get_with_ttl("k").await.unwrap().unwrap();
        assert_eq!(value, Bytes::from_static(b"v"));
        assert!(ttl.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn expired_values_vanish() {
        let backend = MemoryRemoteBackend::new();
        backend
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        assert!(backend.get_with_ttl("k").await.unwrap().is_none());
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn tag_set_expiry_extends_not_shrinks() {
        let backend = MemoryRemoteBackend::new();
        backend
            .set_add("tag:a", &["k1".to_string()], Duration::from_secs(600))
            .await
            .unwrap();
        backend
            .set_add("tag:a", &["k2".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        let mut members = backend.set_members("tag:a").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1", "k2"]);
        let expires = backend.sets.get("tag:a").unwrap().expires_at.unwrap();
        assert!(expires > Instant::now() + Duration::from_secs(300));
    }

    #[tokio::test]
    async fn scan_matches_values_and_sets() {
        let backend = MemoryRemoteBackend::new();
        backend
            .set_with_ttl("app:k1", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set_add("app:tag:users", &["app:k1".to_string()], Duration::from_secs(60))
            .await
            .unwrap();

        let keys = backend.scan_keys("app:tag:*").await.unwrap();
        assert_eq!(keys, vec!["app:tag:users"]);
        let all = backend.scan_keys("app:*").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn fault_injection_toggles() {
        let backend = MemoryRemoteBackend::new();
        backend.fail_writes(true);
        assert!(
            backend
                .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(1))
                .await
                .is_err()
        );
        backend.fail_writes(false);
        backend
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        backend.fail_reads(true);
        assert!(backend.get_with_ttl("k").await.is_err());
        assert!(!backend.ping().await);
    }
}
