//! Server-side signature verification
//!
//! A request is accepted only when every check passes, in this order:
//!
//! 0. headers well-formed, algorithm tag supported
//! 1. key id enrolled
//! 2. device active
//! 3. timestamp inside the clock-skew window (past and future)
//! 4. body hash matches the received body
//! 5. canonical payload rebuilt from what the server observed
//! 6. P1363 signature valid for the enrolled public key
//! 7. nonce not seen before for this key
//!
//! The first failure rejects the request. Each rejection maps to a
//! `RejectReason` so logs can tell forgery, replay and revoked devices apart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::CanonicalPayload;
use crate::crypto::{self, PublicKey};
use crate::headers::{SignedRequestHeaders, ALGORITHM};
use crate::registry::{DeviceRegistry, DeviceStatus};
use crate::replay::{CacheFailurePolicy, MemoryNonceCache, NonceCache, ReplayError, ReplayGuard, ReplayOutcome};

/// Default symmetric clock-skew window (5 minutes).
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Largest accepted clock-skew window (1 day).
pub const MAX_CLOCK_SKEW_LIMIT_SECS: u64 = 86_400;

/// Default bound on a single nonce-cache call.
pub const DEFAULT_NONCE_CACHE_TIMEOUT_MS: u64 = 250;

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Malformed signed-request headers: {0}")]
    MalformedHeaders(String),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unknown key id: {0}")]
    UnknownKey(String),

    #[error("Device for key {key_id} is {status}")]
    DeviceNotActive { key_id: String, status: DeviceStatus },

    #[error("Timestamp {timestamp} is outside the {max_skew_secs}s skew window")]
    StaleOrFutureTimestamp {
        timestamp: String,
        max_skew_secs: u64,
    },

    #[error("Body hash does not match the received body")]
    BodyTamperedOrMismatched,

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Replay detected: nonce {nonce} already used by key {key_id}")]
    ReplayDetected { key_id: String, nonce: String },

    #[error("Replay store unavailable: {0}")]
    StorageUnavailable(String),
}

/// Stable, log-friendly classification of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    MalformedHeaders,
    UnsupportedAlgorithm,
    UnknownKey,
    DeviceNotActive,
    StaleOrFutureTimestamp,
    BodyTamperedOrMismatched,
    InvalidSignature,
    ReplayDetected,
    StorageUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MalformedHeaders => "malformed_headers",
            RejectReason::UnsupportedAlgorithm => "unsupported_algorithm",
            RejectReason::UnknownKey => "unknown_key",
            RejectReason::DeviceNotActive => "device_not_active",
            RejectReason::StaleOrFutureTimestamp => "stale_or_future_timestamp",
            RejectReason::BodyTamperedOrMismatched => "body_tampered_or_mismatched",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::ReplayDetected => "replay_detected",
            RejectReason::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VerificationError {
    pub fn reason(&self) -> RejectReason {
        match self {
            VerificationError::MalformedHeaders(_) => RejectReason::MalformedHeaders,
            VerificationError::UnsupportedAlgorithm(_) => RejectReason::UnsupportedAlgorithm,
            VerificationError::UnknownKey(_) => RejectReason::UnknownKey,
            VerificationError::DeviceNotActive { .. } => RejectReason::DeviceNotActive,
            VerificationError::StaleOrFutureTimestamp { .. } => RejectReason::StaleOrFutureTimestamp,
            VerificationError::BodyTamperedOrMismatched => RejectReason::BodyTamperedOrMismatched,
            VerificationError::InvalidSignature(_) => RejectReason::InvalidSignature,
            VerificationError::ReplayDetected { .. } => RejectReason::ReplayDetected,
            VerificationError::StorageUnavailable(_) => RejectReason::StorageUnavailable,
        }
    }
}

impl From<ReplayError> for VerificationError {
    fn from(e: ReplayError) -> Self {
        match e {
            ReplayError::ReplayDetected { key_id, nonce } => {
                VerificationError::ReplayDetected { key_id, nonce }
            }
            ReplayError::StorageUnavailable(detail) => VerificationError::StorageUnavailable(detail),
        }
    }
}

/// Verifier settings. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Symmetric clock-skew window; also the nonce TTL
    #[serde(deserialize_with = "bounded_clock_skew")]
    pub max_clock_skew_secs: u64,
    /// Upper bound on one nonce-cache call
    pub nonce_cache_timeout_ms: u64,
    /// Behaviour when the nonce cache is unreachable
    pub cache_failure_policy: CacheFailurePolicy,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            nonce_cache_timeout_ms: DEFAULT_NONCE_CACHE_TIMEOUT_MS,
            cache_failure_policy: CacheFailurePolicy::default(),
        }
    }
}

fn bounded_clock_skew<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    if secs > MAX_CLOCK_SKEW_LIMIT_SECS {
        return Err(serde::de::Error::custom(format!(
            "max_clock_skew_secs {} exceeds the limit of {}",
            secs, MAX_CLOCK_SKEW_LIMIT_SECS
        )));
    }
    Ok(secs)
}

impl VerifierConfig {
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn nonce_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.nonce_cache_timeout_ms)
    }
}

/// A received request, as the server observed it.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// Path plus query string exactly as received
    pub path_and_query: &'a str,
    pub headers: &'a SignedRequestHeaders,
    pub body: &'a [u8],
}

/// An accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    pub device_id: Uuid,
    pub key_id: String,
    pub label: String,
    pub api_key: String,
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
    pub replay_check: ReplayOutcome,
}

/// Verifies signed requests against a device registry.
pub struct SignatureVerifier {
    registry: Arc<DeviceRegistry>,
    replay_guard: ReplayGuard,
    config: VerifierConfig,
}

impl SignatureVerifier {
    pub fn new(registry: Arc<DeviceRegistry>, nonce_cache: Arc<dyn NonceCache>, config: VerifierConfig) -> Self {
        let replay_guard = ReplayGuard::new(
            nonce_cache,
            config.cache_failure_policy,
            config.nonce_cache_timeout(),
        );
        Self {
            registry,
            replay_guard,
            config,
        }
    }

    /// Verifier with a process-local nonce cache.
    pub fn with_memory_cache(registry: Arc<DeviceRegistry>, config: VerifierConfig) -> Self {
        Self::new(registry, Arc::new(MemoryNonceCache::new()), config)
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Verify against the wall clock.
    pub async fn verify(&self, request: &IncomingRequest<'_>) -> Result<VerifiedRequest, VerificationError> {
        self.verify_at(request, Utc::now()).await
    }

    /// Verify with an explicit "now".
    pub async fn verify_at(
        &self,
        request: &IncomingRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<VerifiedRequest, VerificationError> {
        match self.run_checks(request, now).await {
            Ok(verified) => {
                log::debug!(
                    "Accepted {} {} from key {}",
                    request.method,
                    request.path_and_query,
                    verified.key_id
                );
                if let Err(e) = self.registry.record_seen(&verified.key_id, now).await {
                    log::warn!("Failed to update last-seen for key {}: {}", verified.key_id, e);
                }
                Ok(verified)
            }
            Err(e) => {
                log::warn!(
                    "Rejected {} {} [{}] key={}: {}",
                    request.method,
                    request.path_and_query,
                    e.reason(),
                    request.headers.key_id,
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_checks(
        &self,
        request: &IncomingRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<VerifiedRequest, VerificationError> {
        let headers = request.headers;

        if headers.algorithm != ALGORITHM {
            return Err(VerificationError::UnsupportedAlgorithm(headers.algorithm.clone()));
        }

        // `/path?` and `/path` name the same target; signers drop the bare `?`
        let path_and_query = request
            .path_and_query
            .strip_suffix('?')
            .unwrap_or(request.path_and_query);

        let canonical = CanonicalPayload {
            timestamp: &headers.timestamp,
            method: request.method,
            path_and_query,
            body_hash: &headers.body_hash,
            nonce: &headers.nonce,
            api_key: &headers.api_key,
            key_id: &headers.key_id,
        };
        canonical
            .validate()
            .map_err(|e| VerificationError::MalformedHeaders(e.to_string()))?;

        // 1. enrolled
        let record = self
            .registry
            .find_by_key_id(&headers.key_id)
            .await
            .ok_or_else(|| VerificationError::UnknownKey(headers.key_id.clone()))?;

        // 2. active
        if !record.status.is_active() {
            return Err(VerificationError::DeviceNotActive {
                key_id: record.key_id,
                status: record.status,
            });
        }

        // 3. fresh
        let timestamp = DateTime::parse_from_rfc3339(&headers.timestamp)
            .map_err(|e| VerificationError::MalformedHeaders(format!("timestamp: {}", e)))?
            .with_timezone(&Utc);
        let skew = (now - timestamp).num_milliseconds().unsigned_abs();
        if skew > self.config.max_clock_skew_secs.saturating_mul(1000) {
            return Err(VerificationError::StaleOrFutureTimestamp {
                timestamp: headers.timestamp.clone(),
                max_skew_secs: self.config.max_clock_skew_secs,
            });
        }

        // 4. body
        if crypto::hash_sha256_base64(request.body) != headers.body_hash {
            return Err(VerificationError::BodyTamperedOrMismatched);
        }

        // 5 + 6. signature over the server-side canonical payload
        let signature = crypto::base64_decode(&headers.signature)
            .map_err(|e| VerificationError::InvalidSignature(e.to_string()))?;
        let public_key = PublicKey::from_base64(&record.public_key)
            .map_err(|e| VerificationError::InvalidSignature(format!("enrolled key unusable: {}", e)))?;
        public_key
            .verify(canonical.encode().as_bytes(), &signature)
            .map_err(|e| VerificationError::InvalidSignature(e.to_string()))?;

        // 7. not replayed
        let replay_check = self
            .replay_guard
            .check_and_mark(&headers.key_id, &headers.nonce, self.config.max_clock_skew())
            .await?;

        Ok(VerifiedRequest {
            device_id: record.device_id,
            key_id: record.key_id,
            label: record.label,
            api_key: headers.api_key.clone(),
            nonce: headers.nonce.clone(),
            timestamp,
            replay_check,
        })
    }
}
