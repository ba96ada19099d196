//! Signed-request wire headers
//!
//! Seven headers travel together on every signed request. They are produced
//! by `DeviceBindingClient::sign_request` and consumed by `SignatureVerifier`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const API_KEY_HEADER: &str = "x-kg-api-key";
pub const KEY_ID_HEADER: &str = "x-kg-key-id";
pub const TIMESTAMP_HEADER: &str = "x-kg-timestamp";
pub const NONCE_HEADER: &str = "x-kg-nonce";
pub const BODY_HASH_HEADER: &str = "x-kg-body-sha256";
pub const ALGORITHM_HEADER: &str = "x-kg-alg";
pub const SIGNATURE_HEADER: &str = "x-kg-signature";

/// All header names, in wire order.
pub const HEADER_NAMES: [&str; 7] = [
    API_KEY_HEADER,
    KEY_ID_HEADER,
    TIMESTAMP_HEADER,
    NONCE_HEADER,
    BODY_HASH_HEADER,
    ALGORITHM_HEADER,
    SIGNATURE_HEADER,
];

/// The only supported algorithm tag.
pub const ALGORITHM: &str = "ECDSA_P256_SHA256_P1363";

#[derive(Error, Debug, PartialEq)]
pub enum HeaderError {
    #[error("Missing header: {0}")]
    Missing(&'static str),

    #[error("Header {0} is not valid text")]
    NotText(&'static str),
}

/// The seven signed-request header values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequestHeaders {
    pub api_key: String,
    pub key_id: String,
    pub timestamp: String,
    pub nonce: String,
    pub body_hash: String,
    pub algorithm: String,
    pub signature: String,
}

impl SignedRequestHeaders {
    /// `(name, value)` pairs in wire order.
    pub fn to_pairs(&self) -> [(&'static str, &str); 7] {
        [
            (API_KEY_HEADER, self.api_key.as_str()),
            (KEY_ID_HEADER, self.key_id.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (NONCE_HEADER, self.nonce.as_str()),
            (BODY_HASH_HEADER, self.body_hash.as_str()),
            (ALGORITHM_HEADER, self.algorithm.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }

    /// Collect the headers through a lookup function (header names are lowercase).
    /// All seven must be present.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, HeaderError>
    where
        F: FnMut(&'static str) -> Option<String>,
    {
        let mut take = |name: &'static str| lookup(name).ok_or(HeaderError::Missing(name));

        Ok(Self {
            api_key: take(API_KEY_HEADER)?,
            key_id: take(KEY_ID_HEADER)?,
            timestamp: take(TIMESTAMP_HEADER)?,
            nonce: take(NONCE_HEADER)?,
            body_hash: take(BODY_HASH_HEADER)?,
            algorithm: take(ALGORITHM_HEADER)?,
            signature: take(SIGNATURE_HEADER)?,
        })
    }

    /// Read the headers from an HTTP header map.
    pub fn from_header_map(headers: &warp::http::HeaderMap) -> Result<Self, HeaderError> {
        for name in HEADER_NAMES {
            if let Some(value) = headers.get(name) {
                if value.to_str().is_err() {
                    return Err(HeaderError::NotText(name));
                }
            }
        }

        Self::from_lookup(|name| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use warp::http::{HeaderMap, HeaderValue};

    fn sample() -> SignedRequestHeaders {
        SignedRequestHeaders {
            api_key: "kg_prod_test".to_string(),
            key_id: "7faae436148a14c8165c5358f33d1605".to_string(),
            timestamp: "2024-01-15T10:30:00.000Z".to_string(),
            nonce: "bm9uY2U=".to_string(),
            body_hash: "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=".to_string(),
            algorithm: ALGORITHM.to_string(),
            signature: "c2ln".to_string(),
        }
    }

    #[test]
    fn test_pairs_then_lookup() {
        let headers = sample();
        let map: HashMap<&str, String> = headers
            .to_pairs()
            .iter()
            .map(|(name, value)| (*name, value.to_string()))
            .collect();

        let parsed = SignedRequestHeaders::from_lookup(|name| map.get(name).cloned()).unwrap();
        assert_eq!(parsed, headers);
    }

    #[test]
    fn test_missing_header() {
        let headers = sample();
        let mut map: HashMap<&str, String> = headers
            .to_pairs()
            .iter()
            .map(|(name, value)| (*name, value.to_string()))
            .collect();
        map.remove(NONCE_HEADER);

        let result = SignedRequestHeaders::from_lookup(|name| map.get(name).cloned());
        assert_eq!(result, Err(HeaderError::Missing(NONCE_HEADER)));
    }

    #[test]
    fn test_from_header_map_is_case_insensitive() {
        let mut map = HeaderMap::new();
        for (name, value) in sample().to_pairs() {
            map.insert(
                warp::http::header::HeaderName::from_bytes(name.to_uppercase().as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }

        assert_eq!(SignedRequestHeaders::from_header_map(&map).unwrap(), sample());
    }

    #[test]
    fn test_non_text_header_rejected() {
        let mut map = HeaderMap::new();
        for (name, value) in sample().to_pairs() {
            map.insert(name, HeaderValue::from_str(value).unwrap());
        }
        map.insert(NONCE_HEADER, HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());

        assert_eq!(
            SignedRequestHeaders::from_header_map(&map),
            Err(HeaderError::NotText(NONCE_HEADER))
        );
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("apiKey").is_some());
        assert!(json.get("bodyHash").is_some());
        assert!(json.get("api_key").is_none());
    }
}
