//! Device key storage
//!
//! A `KeyStore` holds at most one `KeyPair`: the device's single enrollment
//! slot. Implementations must make `save_if_absent` atomic so that two
//! concurrent enrollments cannot both claim the slot.
//!
//! Built-in stores:
//! - `MemoryKeyStore`: process-lifetime slot behind a mutex
//! - `SealedFileKeyStore`: JSON file with the private scalar sealed under a wrapping key

pub mod sealed_file;

pub use sealed_file::{SealedFileKeyStore, WrappingKey};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::KeyPair;

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stored key is corrupt: {0}")]
    Corrupt(String),

    #[error("Sealing error: {0}")]
    Sealing(String),
}

/// Pluggable persistence for the device key pair.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Store a pair, replacing any existing one.
    async fn save_key_pair(&self, pair: &KeyPair) -> Result<(), KeyStoreError>;

    /// Store a pair only if the slot is empty. Returns whether the pair was stored.
    async fn save_if_absent(&self, pair: &KeyPair) -> Result<bool, KeyStoreError>;

    /// The stored pair, if any.
    async fn get_key_pair(&self) -> Result<Option<KeyPair>, KeyStoreError>;

    /// Remove the stored pair. Clearing an empty store is not an error.
    async fn clear(&self) -> Result<(), KeyStoreError>;
}

/// In-memory key store. The pair lives as long as the store.
#[derive(Default)]
pub struct MemoryKeyStore {
    slot: Mutex<Option<KeyPair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<KeyPair>>, KeyStoreError> {
        self.slot
            .lock()
            .map_err(|e| KeyStoreError::Unavailable(format!("key slot poisoned: {}", e)))
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn save_key_pair(&self, pair: &KeyPair) -> Result<(), KeyStoreError> {
        *self.lock()? = Some(pair.clone());
        Ok(())
    }

    async fn save_if_absent(&self, pair: &KeyPair) -> Result<bool, KeyStoreError> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(pair.clone());
        Ok(true)
    }

    async fn get_key_pair(&self) -> Result<Option<KeyPair>, KeyStoreError> {
        Ok(self.lock()?.clone())
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        *self.lock()? = None;
        Ok(())
    }
}

/// Which key store a client should use.
#[derive(Clone, Default)]
pub enum KeyStoreConfig {
    /// `MemoryKeyStore`
    #[default]
    Memory,
    /// `SealedFileKeyStore` at `path`
    SealedFile { path: PathBuf, wrapping_key: WrappingKey },
    /// Caller-supplied implementation (platform keychain, HSM, ...)
    Custom(Arc<dyn KeyStore>),
}

impl KeyStoreConfig {
    /// Instantiate the configured store.
    pub fn build(self) -> Arc<dyn KeyStore> {
        match self {
            KeyStoreConfig::Memory => Arc::new(MemoryKeyStore::new()),
            KeyStoreConfig::SealedFile { path, wrapping_key } => {
                Arc::new(SealedFileKeyStore::new(path, wrapping_key))
            }
            KeyStoreConfig::Custom(store) => store,
        }
    }
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyStoreConfig::Memory => f.write_str("Memory"),
            KeyStoreConfig::SealedFile { path, .. } => {
                f.debug_struct("SealedFile").field("path", path).finish()
            }
            KeyStoreConfig::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
