//! Response caching keyed by request fingerprints.
//!
//! Entries expire lazily: a reader that finds a dead entry treats it as a
//! miss and removes the backing record. Cache failures never abort a model
//! request; callers degrade them to misses.

mod file;
mod memory;

pub use file::FileCache;
pub use memory::InMemoryCache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a cache write or sweep cannot be persisted.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache directory could not be created or listed.
    #[error("Cache directory {path} is unusable: {source}")]
    Directory {
        /// The directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be written.
    #[error("Failed to write cache record {path}: {source}")]
    Write {
        /// The record path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be removed.
    #[error("Failed to remove cache record {path}: {source}")]
    Remove {
        /// The record path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The value could not be encoded.
    #[error("Failed to encode cache value for key '{key}': {source}")]
    Encode {
        /// The cache key.
        key: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Current wall-clock time as fractional Unix seconds.
#[must_use]
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// A cached value with its creation time and optional lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key.
    pub key: String,
    /// The cached payload.
    pub value: Value,
    /// Unix seconds at creation.
    pub created_at: f64,
    /// Lifetime in seconds. `None` never expires.
    pub ttl: Option<f64>,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    ///
    /// A zero TTL is stored as `None`.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: unix_now(),
            ttl: ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| ttl.as_secs_f64()),
        }
    }

    /// Returns true if the entry is live at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: f64) -> bool {
        match self.ttl {
            Some(ttl) if ttl > 0.0 => now < self.created_at + ttl,
            _ => true,
        }
    }

    /// Returns true if the entry is live now.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.is_live_at(unix_now())
    }
}

/// Counts reported by [`ResponseCache::get_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Records present before the sweep.
    pub total_entries: usize,
    /// Records still live.
    pub active_entries: usize,
    /// Records found expired (and removed).
    pub expired_entries: usize,
    /// Bytes held by live records.
    pub size_bytes: u64,
}

/// Key-value store with per-entry expiration.
///
/// Implementations must be safe for concurrent use and must never let a
/// reader observe a partially written entry.
#[async_trait]
pub trait ResponseCache: Send + Sync + std::fmt::Debug {
    /// Returns the live value for `key`, if any.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`.
    ///
    /// `ttl` of `None` applies the cache's default TTL; a zero TTL never expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Removes one entry, or every entry when `key` is `None`.
    async fn clear(&self, key: Option<&str>) -> Result<(), CacheError>;

    /// Counts entries and sweeps dead records.
    async fn get_stats(&self) -> Result<CacheStats, CacheError>;
}

/// Computes a stable fingerprint for a model request.
///
/// The fingerprint is the SHA-256 of the canonical (key-sorted) JSON of the
/// request parts, so option maps with different insertion orders agree.
#[must_use]
pub fn fingerprint(
    kind: &str,
    model: &str,
    payload: &Value,
    options: &Value,
    format: Option<&Value>,
) -> String {
    let canonical = serde_json::json!({
        "kind": kind,
        "model": model,
        "payload": payload,
        "options": options,
        "format": format,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
