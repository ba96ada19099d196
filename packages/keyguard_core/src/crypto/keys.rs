//! Device key pairs
//!
//! A device holds exactly one ECDSA P-256 key pair:
//! - The public half is exported as SubjectPublicKeyInfo (SPKI) DER and sent
//!   to the registry during enrollment.
//! - The private half is a `PrivateKeyHandle`, which can sign but never hands
//!   out its scalar. Persistent stores seal it through crate-private accessors.
//!
//! Signatures use the IEEE P1363 layout (`r || s`, 64 bytes), never ASN.1 DER.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::CryptoError;

/// Length of a P1363-encoded P-256 signature.
pub const P1363_SIGNATURE_LEN: usize = 64;

/// Length of a P-256 private scalar.
pub(crate) const SCALAR_LEN: usize = 32;

/// Rejection-sampling attempts before giving up on key generation.
const KEYGEN_ATTEMPTS: usize = 8;

/// The exportable half of a device key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
    spki: Vec<u8>,
}

impl PublicKey {
    fn from_verifying_key(verifying_key: VerifyingKey) -> Result<Self, CryptoError> {
        let spki = verifying_key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self { verifying_key, spki })
    }

    /// Parse a P-256 public key from SPKI DER.
    pub fn from_spki(spki: &[u8]) -> Result<Self, CryptoError> {
        let verifying_key = VerifyingKey::from_public_key_der(spki)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Self::from_verifying_key(verifying_key)
    }

    /// Parse a P-256 public key from base64-encoded SPKI DER (the enrollment wire form).
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let spki = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Self::from_spki(&spki)
    }

    /// SPKI DER bytes.
    pub fn spki(&self) -> &[u8] {
        &self.spki
    }

    /// Base64 SPKI, as sent in the enrollment payload.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.spki)
    }

    /// Derived key id (see `derive_key_id`).
    pub fn key_id(&self) -> String {
        derive_key_id(&self.spki)
    }

    /// Verify a P1363 signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != P1363_SIGNATURE_LEN {
            return Err(CryptoError::MalformedSignature(format!(
                "expected {} bytes (P1363), got {}",
                P1363_SIGNATURE_LEN,
                signature.len()
            )));
        }
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;

        self.verifying_key
            .verify(data, &signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("key_id", &self.key_id())
            .finish()
    }
}

/// Opaque, sign-only handle to a device's private key.
///
/// Clones share the same underlying key. The scalar is zeroized when the last
/// clone is dropped.
#[derive(Clone)]
pub struct PrivateKeyHandle {
    signing_key: Arc<SigningKey>,
}

impl PrivateKeyHandle {
    fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key: Arc::new(signing_key),
        }
    }

    /// Sign `data` with ECDSA/SHA-256. Returns the 64-byte P1363 encoding.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(data);
        signature.to_bytes().to_vec()
    }

    /// The matching public key.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_verifying_key(self.signing_key.verifying_key().clone())
    }

    /// Raw scalar, for sealing by a persistent key store only.
    pub(crate) fn scalar_bytes(&self) -> Zeroizing<[u8; SCALAR_LEN]> {
        let mut out = Zeroizing::new([0u8; SCALAR_LEN]);
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Rebuild a handle from an unsealed scalar.
    pub(crate) fn from_scalar_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidKeyType(format!("not a P-256 scalar: {}", e)))?;
        Ok(Self::new(signing_key))
    }
}

impl fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyHandle(<redacted>)")
    }
}

/// A device key pair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public_key: PublicKey,
    private_key: PrivateKeyHandle,
}

impl KeyPair {
    /// Pair a private handle with its derived public key.
    pub fn from_private(private_key: PrivateKeyHandle) -> Result<Self, CryptoError> {
        let public_key = private_key.public_key()?;
        Ok(Self {
            public_key,
            private_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &PrivateKeyHandle {
        &self.private_key
    }

    pub fn key_id(&self) -> String {
        self.public_key.key_id()
    }
}

/// Either half of a key pair, for the untyped entry points below.
#[derive(Clone, Copy, Debug)]
pub enum KeyRef<'a> {
    Public(&'a PublicKey),
    Private(&'a PrivateKeyHandle),
}

/// Generate a P-256 key pair from the OS CSPRNG.
pub fn generate_key_pair() -> Result<KeyPair, CryptoError> {
    let mut seed = Zeroizing::new([0u8; SCALAR_LEN]);

    for _ in 0..KEYGEN_ATTEMPTS {
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        // Zero or >= group order: draw again
        if let Ok(signing_key) = SigningKey::from_slice(&seed[..]) {
            return KeyPair::from_private(PrivateKeyHandle::new(signing_key));
        }
    }

    Err(CryptoError::KeyGeneration(format!(
        "no valid scalar after {} attempts",
        KEYGEN_ATTEMPTS
    )))
}

/// Export a public key as SPKI DER. Private handles cannot be exported.
pub fn export_public_key(key: KeyRef<'_>) -> Result<Vec<u8>, CryptoError> {
    match key {
        KeyRef::Public(public_key) => Ok(public_key.spki().to_vec()),
        KeyRef::Private(_) => Err(CryptoError::InvalidKeyType(
            "expected a public key, got a private key handle".to_string(),
        )),
    }
}

/// Sign a canonical payload. Only private handles can sign.
pub fn sign(key: KeyRef<'_>, payload: &str) -> Result<Vec<u8>, CryptoError> {
    match key {
        KeyRef::Private(handle) => Ok(handle.sign(payload.as_bytes())),
        KeyRef::Public(_) => Err(CryptoError::InvalidKeyType(
            "expected a private key handle, got a public key".to_string(),
        )),
    }
}

/// Verify a P1363 signature over `payload` against an SPKI-encoded public key.
pub fn verify(spki: &[u8], payload: &str, signature: &[u8]) -> Result<(), CryptoError> {
    PublicKey::from_spki(spki)?.verify(payload.as_bytes(), signature)
}

/// `hex(first 16 bytes of SHA-256(base64(spki)))`.
///
/// The hash input is the base64 text, not the DER bytes.
pub fn derive_key_id(spki: &[u8]) -> String {
    let encoded = STANDARD.encode(spki);
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(&digest[..16])
}
