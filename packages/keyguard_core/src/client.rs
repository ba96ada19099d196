//! Device binding client
//!
//! Orchestrates the device side of the protocol:
//! - `enroll`: fingerprint the device, generate a key pair, claim the key
//!   store slot and produce the payload the registry needs
//! - `sign_request`: produce the seven signed-request headers for one call
//! - `unenroll`: destroy the local key pair
//!
//! Per storage instance the client moves `Unenrolled -> Enrolled -> Unenrolled`.
//! Enrollment is serialized by a per-client mutex and the store's atomic
//! `save_if_absent` claim, so concurrent `enroll` calls never overwrite each
//! other's key pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::canonical::{reduce_to_path_and_query, CanonicalPayload, CodecError};
use crate::crypto::{self, CryptoError, KeyPair, KeyRef, DEFAULT_NONCE_BYTES};
use crate::fingerprint::{FingerprintConfig, FingerprintError, FingerprintProvider};
use crate::headers::{SignedRequestHeaders, ALGORITHM};
use crate::keystore::{KeyStore, KeyStoreConfig, KeyStoreError};

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Device is already enrolled (key id {0}); unenroll first")]
    AlreadyEnrolled(String),

    #[error("Device is not enrolled")]
    NotEnrolled,

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Key storage failure: {0}")]
    Storage(#[from] KeyStoreError),

    #[error("Fingerprint failure: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Cannot sign request: {0}")]
    InvalidField(#[from] CodecError),

    #[error("Request body cannot be signed: {0}")]
    UnsignableBody(String),

    #[error("Header {0} cannot carry its value")]
    InvalidHeader(&'static str),
}

/// Sent to the registry's enrollment endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentPayload {
    /// Base64 SPKI DER
    pub public_key: String,
    pub key_id: String,
    pub device_fingerprint: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// An outbound request to be signed.
#[derive(Debug, Clone, Copy)]
pub struct RequestToSign<'a> {
    pub method: &'a str,
    /// Full URL or bare path-and-query
    pub url: &'a str,
    pub body: Option<&'a [u8]>,
}

impl<'a> RequestToSign<'a> {
    pub fn new(method: &'a str, url: &'a str) -> Self {
        Self {
            method,
            url,
            body: None,
        }
    }

    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }
}

/// Everything needed to construct a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub user_agent: Option<String>,
    pub key_store: KeyStoreConfig,
    pub fingerprint: FingerprintConfig,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            user_agent: None,
            key_store: KeyStoreConfig::default(),
            fingerprint: FingerprintConfig::default(),
        }
    }
}

/// Client-side half of the device binding protocol.
pub struct DeviceBindingClient {
    api_key: String,
    user_agent: Option<String>,
    key_store: Arc<dyn KeyStore>,
    fingerprint: Arc<dyn FingerprintProvider>,
    enroll_lock: Mutex<()>,
}

impl DeviceBindingClient {
    pub fn new(
        api_key: impl Into<String>,
        key_store: Arc<dyn KeyStore>,
        fingerprint: Arc<dyn FingerprintProvider>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            user_agent: None,
            key_store,
            fingerprint,
            enroll_lock: Mutex::new(()),
        }
    }

    /// In-memory key store and host fingerprint.
    pub fn with_platform_defaults(api_key: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(api_key))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        let mut client = Self::new(
            config.api_key,
            config.key_store.build(),
            config.fingerprint.build(),
        );
        client.user_agent = config.user_agent;
        client
    }

    /// User agent reported in the enrollment payload.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Create and store a key pair, returning the registry enrollment payload.
    pub async fn enroll(&self, device_name: Option<&str>) -> Result<EnrollmentPayload, BindingError> {
        let _guard = self.enroll_lock.lock().await;

        if let Some(existing) = self.key_store.get_key_pair().await? {
            return Err(BindingError::AlreadyEnrolled(existing.key_id()));
        }

        let fingerprint = self.fingerprint.get_fingerprint().await?;
        let pair = crypto::generate_key_pair()?;

        if !self.key_store.save_if_absent(&pair).await? {
            // Another client sharing this store claimed the slot first
            let winner = self
                .key_store
                .get_key_pair()
                .await?
                .map(|p| p.key_id())
                .unwrap_or_default();
            return Err(BindingError::AlreadyEnrolled(winner));
        }

        let key_id = pair.key_id();
        log::info!("Enrolled device key {}", key_id);

        Ok(EnrollmentPayload {
            public_key: pair.public_key().to_base64(),
            key_id,
            device_fingerprint: fingerprint.visitor_id,
            label: device_name
                .map(str::to_string)
                .unwrap_or(fingerprint.label),
            user_agent: self.user_agent.clone(),
            metadata: (!fingerprint.metadata.is_empty()).then_some(fingerprint.metadata),
        })
    }

    /// Destroy the local key pair.
    pub async fn unenroll(&self) -> Result<(), BindingError> {
        let _guard = self.enroll_lock.lock().await;
        self.key_store.clear().await?;
        log::info!("Cleared device key");
        Ok(())
    }

    /// Whether a key pair is stored. Storage failures count as not enrolled.
    pub async fn is_enrolled(&self) -> bool {
        match self.key_store.get_key_pair().await {
            Ok(pair) => pair.is_some(),
            Err(e) => {
                log::warn!("Key store probe failed: {}", e);
                false
            }
        }
    }

    /// Key id of the stored pair.
    pub async fn key_id(&self) -> Result<String, BindingError> {
        Ok(self.require_pair().await?.key_id())
    }

    /// Produce the signed-request headers for one outbound request.
    pub async fn sign_request(
        &self,
        request: &RequestToSign<'_>,
    ) -> Result<SignedRequestHeaders, BindingError> {
        let pair = self.require_pair().await?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let nonce = crypto::generate_nonce(DEFAULT_NONCE_BYTES)?;

        sign_with_pair(&pair, &self.api_key, request, &timestamp, &nonce)
    }

    async fn require_pair(&self) -> Result<KeyPair, BindingError> {
        self.key_store
            .get_key_pair()
            .await?
            .ok_or(BindingError::NotEnrolled)
    }
}

/// Sign with explicit timestamp and nonce.
pub(crate) fn sign_with_pair(
    pair: &KeyPair,
    api_key: &str,
    request: &RequestToSign<'_>,
    timestamp: &str,
    nonce: &str,
) -> Result<SignedRequestHeaders, BindingError> {
    let key_id = pair.key_id();
    let body_hash = crypto::hash_sha256_base64(request.body.unwrap_or_default());
    let path_and_query = reduce_to_path_and_query(request.url);

    let payload = CanonicalPayload {
        timestamp,
        method: request.method,
        path_and_query: &path_and_query,
        body_hash: &body_hash,
        nonce,
        api_key,
        key_id: &key_id,
    };
    payload.validate()?;

    let signature = crypto::sign(KeyRef::Private(pair.private_key()), &payload.encode())?;

    Ok(SignedRequestHeaders {
        api_key: api_key.to_string(),
        key_id,
        timestamp: timestamp.to_string(),
        nonce: nonce.to_string(),
        body_hash,
        algorithm: ALGORITHM.to_string(),
        signature: crypto::base64_encode(&signature),
    })
}
