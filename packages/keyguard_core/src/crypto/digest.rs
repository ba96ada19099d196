//! Hashing and nonce generation

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::CryptoError;

/// Nonce length used when signing requests.
pub const DEFAULT_NONCE_BYTES: usize = 16;

/// SHA-256 of `data`, base64-encoded (standard alphabet, padded).
pub fn hash_sha256_base64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(Sha256::digest(data.as_ref()))
}

/// Standard base64 (padded), the encoding of every binary wire field.
pub fn base64_encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

pub fn base64_decode(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// `byte_length` bytes from the OS CSPRNG, base64-encoded.
pub fn generate_nonce(byte_length: usize) -> Result<String, CryptoError> {
    let mut bytes = vec![0u8; byte_length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}
