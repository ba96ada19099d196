//! File-backed key store with a sealed private key
//!
//! The key pair is persisted as a small JSON document. The public key is
//! stored in the clear; the private scalar is encrypted with AES-256-GCM under
//! a caller-supplied `WrappingKey`, using the SPKI bytes as associated data so
//! a sealed scalar cannot be paired with a different public key.
//!
//! The wrapping key is expected to come from a platform secret store
//! (keychain, TPM-sealed blob, environment of a locked-down service).

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KeyPair, PrivateKeyHandle, PublicKey};

use super::{KeyStore, KeyStoreError};

const FILE_FORMAT_VERSION: u32 = 1;
const KEY_ALGORITHM: &str = "ECDSA_P256";
const GCM_NONCE_LEN: usize = 12;

/// 256-bit key used to seal the device's private scalar at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey([u8; 32]);

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyStoreError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|e| KeyStoreError::Sealing(format!("wrapping key is not hex: {}", e)))?;

        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(KeyStoreError::Sealing(format!(
                "wrapping key must be 32 bytes, got {}",
                len
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    /// Fresh random wrapping key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm, KeyStoreError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| KeyStoreError::Sealing(e.to_string()))
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(<redacted>)")
    }
}

/// On-disk form of a sealed key pair.
#[derive(Serialize, Deserialize)]
struct SealedKeyFile {
    version: u32,
    algorithm: String,
    /// Base64 SPKI DER
    public_key: String,
    /// Base64 AES-GCM nonce
    nonce: String,
    /// Base64 AES-GCM ciphertext of the private scalar
    sealed_private_key: String,
}

/// Key store persisting a sealed key pair to a single file.
pub struct SealedFileKeyStore {
    path: PathBuf,
    wrapping_key: WrappingKey,
}

impl SealedFileKeyStore {
    pub fn new(path: PathBuf, wrapping_key: WrappingKey) -> Self {
        Self { path, wrapping_key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, pair: &KeyPair) -> Result<Vec<u8>, KeyStoreError> {
        let cipher = self.wrapping_key.cipher()?;

        let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let scalar = pair.private_key().scalar_bytes();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &scalar[..],
                    aad: pair.public_key().spki(),
                },
            )
            .map_err(|e| KeyStoreError::Sealing(e.to_string()))?;

        let file = SealedKeyFile {
            version: FILE_FORMAT_VERSION,
            algorithm: KEY_ALGORITHM.to_string(),
            public_key: pair.public_key().to_base64(),
            nonce: STANDARD.encode(nonce_bytes),
            sealed_private_key: STANDARD.encode(sealed),
        };

        serde_json::to_vec_pretty(&file).map_err(|e| KeyStoreError::Corrupt(e.to_string()))
    }

    fn unseal(&self, data: &[u8]) -> Result<KeyPair, KeyStoreError> {
        let file: SealedKeyFile =
            serde_json::from_slice(data).map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;

        if file.version != FILE_FORMAT_VERSION || file.algorithm != KEY_ALGORITHM {
            return Err(KeyStoreError::Corrupt(format!(
                "unsupported key file (version {}, algorithm {})",
                file.version, file.algorithm
            )));
        }

        let public_key = PublicKey::from_base64(&file.public_key)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        let nonce_bytes = STANDARD
            .decode(&file.nonce)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        if nonce_bytes.len() != GCM_NONCE_LEN {
            return Err(KeyStoreError::Corrupt("bad nonce length".to_string()));
        }
        let sealed = STANDARD
            .decode(&file.sealed_private_key)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;

        let cipher = self.wrapping_key.cipher()?;
        let mut scalar = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: public_key.spki(),
                },
            )
            .map_err(|_| {
                KeyStoreError::Sealing("unseal failed (wrong wrapping key or tampered file)".to_string())
            })?;

        let handle = PrivateKeyHandle::from_scalar_bytes(&scalar);
        scalar.zeroize();
        let pair = KeyPair::from_private(handle.map_err(|e| KeyStoreError::Corrupt(e.to_string()))?)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;

        if pair.public_key() != &public_key {
            return Err(KeyStoreError::Corrupt(
                "private key does not match stored public key".to_string(),
            ));
        }
        Ok(pair)
    }

    /// Sibling path unique to this write, e.g. `.device_key.json.3f9a...tmp`.
    fn temp_path(&self) -> PathBuf {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, hex::encode(suffix)))
    }

    /// Write `contents` to a fresh private temp file and flush it to disk.
    async fn write_temp(&self, contents: &[u8]) -> Result<PathBuf, KeyStoreError> {
        let tmp_path = self.temp_path();
        let written = Self::write_private(&tmp_path, contents).await;

        match written {
            Ok(()) => Ok(tmp_path),
            Err(e) => {
                Self::discard_temp(&tmp_path).await;
                Err(KeyStoreError::Unavailable(e.to_string()))
            }
        }
    }

    async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Self::restrict_permissions(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    }

    async fn discard_temp(tmp_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(tmp_path).await {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to remove temp key file {}: {}", tmp_path.display(), e);
            }
        }
    }

    /// Move a zero-length file at the key path out of the way. Returns whether
    /// the slot is free again.
    async fn reclaim_empty(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.len() == 0 => {}
            _ => return false,
        }

        // Rename first and inspect after; a key published in between is put back
        let aside = self.temp_path();
        if tokio::fs::rename(&self.path, &aside).await.is_err() {
            return false;
        }
        let emptied = matches!(tokio::fs::metadata(&aside).await, Ok(meta) if meta.len() == 0);

        if emptied {
            log::warn!("Reclaimed empty key file {}", self.path.display());
        } else if let Err(e) = tokio::fs::hard_link(&aside, &self.path).await {
            log::error!(
                "Failed to restore key file {} (kept at {}): {}",
                self.path.display(),
                aside.display(),
                e
            );
            return false;
        }
        Self::discard_temp(&aside).await;
        emptied
    }

    async fn ensure_parent(&self) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KeyStoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    }

    #[cfg(not(unix))]
    async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl KeyStore for SealedFileKeyStore {
    async fn save_key_pair(&self, pair: &KeyPair) -> Result<(), KeyStoreError> {
        self.ensure_parent().await?;
        let contents = self.seal(pair)?;

        // Write-then-rename so readers never see a half-written file
        let tmp_path = self.write_temp(&contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            Self::discard_temp(&tmp_path).await;
            return Err(KeyStoreError::Unavailable(e.to_string()));
        }

        log::debug!("Saved sealed key pair to {}", self.path.display());
        Ok(())
    }

    async fn save_if_absent(&self, pair: &KeyPair) -> Result<bool, KeyStoreError> {
        self.ensure_parent().await?;
        let contents = self.seal(pair)?;
        let tmp_path = self.write_temp(&contents).await?;

        // hard_link publishes the complete file or fails if the slot is taken
        let mut claimed = tokio::fs::hard_link(&tmp_path, &self.path).await;
        if matches!(&claimed, Err(e) if e.kind() == ErrorKind::AlreadyExists) && self.reclaim_empty().await {
            claimed = tokio::fs::hard_link(&tmp_path, &self.path).await;
        }
        Self::discard_temp(&tmp_path).await;

        match claimed {
            Ok(()) => {
                log::debug!("Claimed key slot at {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(KeyStoreError::Unavailable(e.to_string())),
        }
    }

    async fn get_key_pair(&self) -> Result<Option<KeyPair>, KeyStoreError> {
        match tokio::fs::read(&self.path).await {
            // Leftover from an interrupted legacy claim; holds no key
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => self.unseal(&data).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeyStoreError::Unavailable(e.to_string())),
        }
    }

    async fn clear(&self) -> Result<(), KeyStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                log::debug!("Removed key file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyStoreError::Unavailable(e.to_string())),
        }
    }
}
