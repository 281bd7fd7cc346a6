//! Error types for the cache library.
//!
//! Tier-internal failures (network timeouts, corrupt payloads) are telemetry
//! events: they are logged at the tier that observed them and degrade the
//! operation (a read becomes a miss, a write falls back to the remaining
//! tiers). Only two kinds of error surface to callers: factory failures from
//! `get_or_create`, and configuration errors raised when the cache is built.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Transient I/O failure in a remote tier (network, timeout). Reads
    /// degrade to a miss; writes degrade to the tiers that succeeded.
    #[error("transient backend failure in {layer}: {source}")]
    Transient {
        layer: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A stored payload could not be deserialized. The entry is treated as
    /// corrupt and removed from the tier that returned it.
    #[error("corrupt payload for key '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration detected while building the cache.
    #[error("configuration error: {0}")]
    Config(String),

    /// The value factory failed. Never cached; always propagated.
    #[error("factory failed: {0}")]
    Factory(#[source] anyhow::Error),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A distributed lock could not be acquired within its timeout.
    #[error("lock '{resource}' unavailable after {waited:?}")]
    LockUnavailable { resource: String, waited: Duration },

    /// The operation is not supported by this tier or backend.
    #[error("operation not supported by {layer}: {operation}")]
    Unsupported {
        layer: &'static str,
        operation: &'static str,
    },

    /// Serialization of a caller value failed before it reached any tier.
    #[error("serialization failed: {0}")]
    Serialize(#[source] anyhow::Error),
}

impl CacheError {
    pub(crate) fn transient(layer: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Transient {
            layer,
            source: source.into(),
        }
    }

    /// Whether the error is swallowed by the storage pipeline rather than
    /// surfaced to the caller.
    #[must_use]
    pub fn is_telemetry_only(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Corrupt { .. } | Self::Unsupported { .. }
        )
    }
}
