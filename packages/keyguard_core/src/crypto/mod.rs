//! Cryptographic primitives for device binding
//!
//! This module provides everything the signer and verifier need:
//! - `KeyPair`: a P-256 device key pair whose private half is an opaque signing handle
//! - `derive_key_id`: the stable 32-hex-char identifier of a public key
//! - P1363 (fixed-length `r || s`) ECDSA/SHA-256 signing and verification
//! - SHA-256 body hashing and random nonces, both base64-encoded

pub mod digest;
pub mod keys;

pub use digest::{
    base64_decode, base64_encode, generate_nonce, hash_sha256_base64, DEFAULT_NONCE_BYTES,
};
pub use keys::{
    derive_key_id, export_public_key, generate_key_pair, sign, verify, KeyPair, KeyRef,
    PrivateKeyHandle, PublicKey, P1363_SIGNATURE_LEN,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key type: {0}")]
    InvalidKeyType(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature does not verify")]
    SignatureMismatch,

    #[error("Invalid base64: {0}")]
    Encoding(String),

    #[error("Random source unavailable: {0}")]
    RandomSource(String),
}
