//! Replay protection
//!
//! Each accepted `(key_id, nonce)` pair is recorded in a shared cache for the
//! length of the clock-skew window. Anything older than that window is already
//! rejected by the timestamp check, so entries never need to outlive it.
//!
//! The cache must offer an atomic "insert if absent, with TTL" primitive; a
//! read followed by a write would let two replicas accept the same nonce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Inserts between sweeps of expired entries in `MemoryNonceCache`.
const SWEEP_INTERVAL: usize = 256;

#[derive(Error, Debug)]
pub enum NonceCacheError {
    #[error("Nonce cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum ReplayError {
    #[error("Nonce {nonce} already used by key {key_id}")]
    ReplayDetected { key_id: String, nonce: String },

    #[error("Replay store unavailable: {0}")]
    StorageUnavailable(String),
}

/// Shared key-value cache used only for nonce bookkeeping.
#[async_trait]
pub trait NonceCache: Send + Sync {
    /// Atomically insert `key` with the given TTL unless a live entry exists.
    /// Returns `true` if this call inserted the entry.
    async fn insert_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, NonceCacheError>;
}

/// Process-local nonce cache. Suitable for a single verifier instance.
#[derive(Default)]
pub struct MemoryNonceCache {
    inner: Mutex<MemoryCacheState>,
}

#[derive(Default)]
struct MemoryCacheState {
    /// `None` marks an entry whose expiry lies past any representable instant
    entries: HashMap<String, Option<Instant>>,
    inserts_since_sweep: usize,
}

impl MemoryNonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held (live or not yet swept).
    pub fn len(&self) -> usize {
        self.inner.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NonceCache for MemoryNonceCache {
    async fn insert_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, NonceCacheError> {
        let now = Instant::now();
        let mut state = self
            .inner
            .lock()
            .map_err(|e| NonceCacheError::Unavailable(format!("nonce cache poisoned: {}", e)))?;

        state.inserts_since_sweep += 1;
        if state.inserts_since_sweep >= SWEEP_INTERVAL {
            state.entries.retain(|_, expires_at| is_live(*expires_at, now));
            state.inserts_since_sweep = 0;
        }

        match state.entries.get(key) {
            Some(expires_at) if is_live(*expires_at, now) => Ok(false),
            _ => {
                state.entries.insert(key.to_string(), now.checked_add(ttl));
                Ok(true)
            }
        }
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| at > now)
}

/// What to do when the nonce cache cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFailurePolicy {
    /// Accept the request without replay protection
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// Result of a replay check that did not reject the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Nonce recorded for the first time
    Fresh,
    /// Cache unavailable; accepted under `FailOpen`
    Unchecked,
}

/// Nonce bookkeeping in front of a `NonceCache`.
pub struct ReplayGuard {
    cache: Arc<dyn NonceCache>,
    policy: CacheFailurePolicy,
    timeout: Duration,
}

impl ReplayGuard {
    pub fn new(cache: Arc<dyn NonceCache>, policy: CacheFailurePolicy, timeout: Duration) -> Self {
        Self {
            cache,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> CacheFailurePolicy {
        self.policy
    }

    fn cache_key(key_id: &str, nonce: &str) -> String {
        format!("kg:nonce:{}:{}", key_id, nonce)
    }

    /// Record `(key_id, nonce)` for `ttl`, failing if it was already recorded.
    pub async fn check_and_mark(
        &self,
        key_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<ReplayOutcome, ReplayError> {
        let key = Self::cache_key(key_id, nonce);

        let failure = match tokio::time::timeout(self.timeout, self.cache.insert_if_absent(&key, ttl)).await {
            Ok(Ok(true)) => return Ok(ReplayOutcome::Fresh),
            Ok(Ok(false)) => {
                return Err(ReplayError::ReplayDetected {
                    key_id: key_id.to_string(),
                    nonce: nonce.to_string(),
                })
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("nonce cache timed out after {:?}", self.timeout),
        };

        match self.policy {
            CacheFailurePolicy::FailOpen => {
                log::warn!(
                    "storage_unavailable: accepting key {} without replay check ({})",
                    key_id,
                    failure
                );
                Ok(ReplayOutcome::Unchecked)
            }
            CacheFailurePolicy::FailClosed => Err(ReplayError::StorageUnavailable(failure)),
        }
    }
}
