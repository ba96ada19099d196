//! Device fingerprinting
//!
//! The fingerprint is an advisory identifier sent with the enrollment payload
//! so operators can recognise a device when approving it. It plays no part in
//! signature verification.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MACHINE_ID_PATH: &str = "/etc/machine-id";
const UNKNOWN_LABEL: &str = "unknown-device";

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Fingerprint unavailable: {0}")]
    Unavailable(String),
}

/// What a fingerprint provider reports about the current device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    /// Stable identifier for this device
    pub visitor_id: String,
    /// Human-friendly default name
    pub label: String,
    /// Free-form attributes (OS, architecture, ...)
    pub metadata: BTreeMap<String, String>,
}

/// Pluggable source of device fingerprints.
#[async_trait]
pub trait FingerprintProvider: Send + Sync {
    async fn get_fingerprint(&self) -> Result<DeviceFingerprint, FingerprintError>;
}

/// Fingerprint derived from the host: hostname, machine id (when readable),
/// OS and architecture.
pub struct HostFingerprintProvider;

impl HostFingerprintProvider {
    fn collect() -> DeviceFingerprint {
        let hostname = hostname::get()
            .ok()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.is_empty());
        let machine_id = std::fs::read_to_string(MACHINE_ID_PATH)
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let mut parts = Vec::new();
        if let Some(name) = &hostname {
            parts.push(name.clone());
        }
        if let Some(id) = &machine_id {
            parts.push(id.clone());
        }
        parts.push(format!("{}:{}", std::env::consts::OS, std::env::consts::ARCH));

        let digest = Sha256::digest(parts.join("|").as_bytes());

        let mut metadata = BTreeMap::new();
        metadata.insert("os".to_string(), std::env::consts::OS.to_string());
        metadata.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        if let Some(name) = &hostname {
            metadata.insert("hostname".to_string(), name.clone());
        }

        DeviceFingerprint {
            visitor_id: hex::encode(&digest[..16]),
            label: hostname.unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
            metadata,
        }
    }
}

#[async_trait]
impl FingerprintProvider for HostFingerprintProvider {
    async fn get_fingerprint(&self) -> Result<DeviceFingerprint, FingerprintError> {
        tokio::task::spawn_blocking(Self::collect)
            .await
            .map_err(|e| FingerprintError::Unavailable(e.to_string()))
    }
}

/// Always reports the same fingerprint.
pub struct StaticFingerprintProvider {
    fingerprint: DeviceFingerprint,
}

impl StaticFingerprintProvider {
    pub fn new(fingerprint: DeviceFingerprint) -> Self {
        Self { fingerprint }
    }

    /// Fingerprint with the given id and label and no metadata.
    pub fn with_id(visitor_id: &str, label: &str) -> Self {
        Self::new(DeviceFingerprint {
            visitor_id: visitor_id.to_string(),
            label: label.to_string(),
            metadata: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl FingerprintProvider for StaticFingerprintProvider {
    async fn get_fingerprint(&self) -> Result<DeviceFingerprint, FingerprintError> {
        Ok(self.fingerprint.clone())
    }
}

/// Which fingerprint provider a client should use.
#[derive(Clone, Default)]
pub enum FingerprintConfig {
    #[default]
    Host,
    Custom(Arc<dyn FingerprintProvider>),
}

impl FingerprintConfig {
    pub fn build(self) -> Arc<dyn FingerprintProvider> {
        match self {
            FingerprintConfig::Host => Arc::new(HostFingerprintProvider),
            FingerprintConfig::Custom(provider) => provider,
        }
    }
}

impl std::fmt::Debug for FingerprintConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FingerprintConfig::Host => f.write_str("Host"),
            FingerprintConfig::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_fingerprint_is_stable() {
        let provider = HostFingerprintProvider;
        let first = provider.get_fingerprint().await.unwrap();
        let second = provider.get_fingerprint().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.visitor_id.len(), 32);
        assert!(!first.label.is_empty());
        assert_eq!(first.metadata.get("os").map(String::as_str), Some(std::env::consts::OS));
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticFingerprintProvider::with_id("visitor-1", "Test Laptop");
        let fp = provider.get_fingerprint().await.unwrap();
        assert_eq!(fp.visitor_id, "visitor-1");
        assert_eq!(fp.label, "Test Laptop");
        assert!(fp.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_config_custom_arm() {
        let custom: Arc<dyn FingerprintProvider> =
            Arc::new(StaticFingerprintProvider::with_id("abc", "custom"));
        let provider = FingerprintConfig::Custom(custom).build();
        assert_eq!(provider.get_fingerprint().await.unwrap().visitor_id, "abc");
    }
}
