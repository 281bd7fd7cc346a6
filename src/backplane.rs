//! Cross-instance invalidation backplane.
//!
//! Peers publish invalidation messages; every instance consumes them and
//! applies removals to its local tiers. Delivery is at-least-once and
//! unordered; handlers are naturally idempotent (removal of an absent key is
//! a no-op). Messages originating from the local instance are dropped by the
//! consumer. Missed messages during a reconnect are not replayed: the
//! backplane is best-effort eventual consistency for L1.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::traits::{OperationContext, StorageLayer};

/// What a backplane message asks peers to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    KeyInvalidation { key: String },
    TagInvalidation { tag: String },
    ClearAll,
}

/// Wire payload exchanged between instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackplaneMessage {
    #[serde(flatten)]
    pub kind: MessageKind,
    /// Originating instance; consumers drop their own messages.
    pub origin: String,
    /// Publisher wall-clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

impl BackplaneMessage {
    #[must_use]
    pub fn key_invalidation(key: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::KeyInvalidation { key: key.into() },
            origin: origin.into(),
            timestamp_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn tag_invalidation(tag: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::TagInvalidation { tag: tag.into() },
            origin: origin.into(),
            timestamp_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn clear_all(origin: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::ClearAll,
            origin: origin.into(),
            timestamp_ms: now_ms(),
        }
    }

    /// Serialize for transmission.
    pub fn to_json(&self) -> CacheResult<String> {
        serde_json::to_string(self).map_err(|e| CacheError::Serialize(e.into()))
    }

    /// Deserialize from the wire.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        serde_json::from_str(json).map_err(|e| CacheError::Serialize(e.into()))
    }
}

/// Transport for invalidation messages. Implementations connect instances
/// through an external broker; the in-memory implementation connects
/// instances within one process (and tests).
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish to all subscribers, including (transport permitting) the local
    /// instance; loopback suppression happens on the consumer side.
    async fn publish(&self, message: BackplaneMessage) -> CacheResult<()>;

    /// Open a subscription. Each call returns an independent stream of
    /// messages received after the call.
    async fn subscribe(&self) -> CacheResult<mpsc::Receiver<BackplaneMessage>>;
}

/// Thread-safe counters for backplane activity.
#[derive(Debug, Default)]
pub struct AtomicBackplaneStats {
    pub published: AtomicU64,
    pub received: AtomicU64,
    pub loopback_dropped: AtomicU64,
    pub keys_applied: AtomicU64,
    pub tags_applied: AtomicU64,
    pub clears_applied: AtomicU64,
    pub errors: AtomicU64,
}

/// Snapshot of [`AtomicBackplaneStats`].
#[derive(Debug, Clone, Default)]
pub struct BackplaneStats {
    pub published: u64,
    pub received: u64,
    pub loopback_dropped: u64,
    pub keys_applied: u64,
    pub tags_applied: u64,
    pub clears_applied: u64,
    pub errors: u64,
}

impl AtomicBackplaneStats {
    #[must_use]
    pub fn snapshot(&self) -> BackplaneStats {
        BackplaneStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            loopback_dropped: self.loopback_dropped.load(Ordering::Relaxed),
            keys_applied: self.keys_applied.load(Ordering::Relaxed),
            tags_applied: self.tags_applied.load(Ordering::Relaxed),
            clears_applied: self.clears_applied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// In-memory backplane on a broadcast channel. Connects cache instances in
/// the same process; the reference transport for tests and single-binary
/// deployments.
pub struct InMemoryBackplane {
    sender: broadcast::Sender<BackplaneMessage>,
}

impl InMemoryBackplane {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for InMemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for InMemoryBackplane {
    async fn publish(&self, message: BackplaneMessage) -> CacheResult<()> {
        // No subscribers is not an error: peers may not have joined yet.
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(&self) -> CacheResult<mpsc::Receiver<BackplaneMessage>> {
        let mut upstream = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // at-least-once, no replay: skipped messages are lost
                        warn!(skipped, "backplane subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Publishing half used by the cache manager: stamps the local origin and
/// counts messages.
#[derive(Clone)]
pub struct BackplaneHandle {
    transport: Arc<dyn Backplane>,
    instance_id: Arc<str>,
    stats: Arc<AtomicBackplaneStats>,
}

impl BackplaneHandle {
    #[must_use]
    pub fn new(transport: Arc<dyn Backplane>, instance_id: &str) -> Self {
        Self {
            transport,
            instance_id: Arc::from(instance_id),
            stats: Arc::new(AtomicBackplaneStats::default()),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn stats(&self) -> BackplaneStats {
        self.stats.snapshot()
    }

    pub async fn publish_invalidation(&self, key: &str) -> CacheResult<()> {
        self.publish(BackplaneMessage::key_invalidation(
            key,
            self.instance_id.as_ref(),
        ))
        .await
    }

    pub async fn publish_tag_invalidation(&self, tag: &str) -> CacheResult<()> {
        self.publish(BackplaneMessage::tag_invalidation(
            tag,
            self.instance_id.as_ref(),
        ))
        .await
    }

    pub async fn publish_clear_all(&self) -> CacheResult<()> {
        self.publish(BackplaneMessage::clear_all(self.instance_id.as_ref()))
            .await
    }

    async fn publish(&self, message: BackplaneMessage) -> CacheResult<()> {
        self.transport.publish(message).await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Spawn the subscription consumer applying peer invalidations to
    /// `targets` (the local tiers that expose removal, normally just L1).
    /// The task reconnects on stream loss; missed messages are not replayed.
    pub fn start_listener(
        &self,
        targets: Vec<Arc<dyn StorageLayer>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let instance_id = Arc::clone(&self.instance_id);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            loop {
                let mut rx = match transport.subscribe().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        error!(error = %e, "backplane subscribe failed, retrying in 5s");
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(5)) => continue,
                            () = shutdown.cancelled() => break,
                        }
                    }
                };
                info!(instance = %instance_id, "backplane subscription established");

                loop {
                    tokio::select! {
                        maybe = rx.recv() => match maybe {
                            Some(message) => {
                                apply_message(&message, &instance_id, &targets, &stats).await;
                            }
                            None => {
                                warn!("backplane stream ended, reconnecting");
                                stats.errors.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        },
                        () = shutdown.cancelled() => return,
                    }
                }
            }
        })
    }
}

async fn apply_message(
    message: &BackplaneMessage,
    instance_id: &str,
    targets: &[Arc<dyn StorageLayer>],
    stats: &AtomicBackplaneStats,
) {
    stats.received.fetch_add(1, Ordering::Relaxed);
    if message.origin == instance_id {
        stats.loopback_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let ctx = OperationContext::new();
    for target in targets {
        let result = match &message.kind {
            MessageKind::KeyInvalidation { key } => target.remove(key, &ctx).await,
            MessageKind::TagInvalidation { tag } => target.remove_by_tag(tag, &ctx).await,
            MessageKind::ClearAll => target.clear(&ctx).await,
        };
        if let Err(e) = result {
            warn!(
                layer = target.layer_id(),
                error = %e,
                "failed to apply backplane invalidation"
            );
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    match &message.kind {
        MessageKind::KeyInvalidation { key } => {
            stats.keys_applied.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, origin = %message.origin, "applied peer key invalidation");
        }
        MessageKind::TagInvalidation { tag } => {
            stats.tags_applied.fetch_add(1, Ordering::Relaxed);
            debug!(tag = %tag, origin = %message.origin, "applied peer tag invalidation");
        }
        MessageKind::ClearAll => {
            stats.clears_applied.fetch_add(1, Ordering::Relaxed);
            debug!(origin = %message.origin, "applied peer clear-all");
        }
    }
}
