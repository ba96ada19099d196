//! Canonical signing payload
//!
//! Signer and verifier must build byte-identical strings from the same request
//! parameters. The layout is fixed:
//!
//! ```text
//! kg-v1|timestamp|METHOD|pathAndQuery|bodyHashBase64|nonce|apiKey|keyId
//! ```
//!
//! The delimiter is never escaped. Every field except `path_and_query` must be
//! free of `|`, which keeps the string uniquely decodable.

use thiserror::Error;
use url::Url;

/// Protocol version token, always the first field.
pub const PROTOCOL_VERSION: &str = "kg-v1";

/// Field separator.
pub const DELIMITER: char = '|';

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Field `{field}` must not contain '|'")]
    DelimiterInField { field: &'static str },

    #[error("Field `{field}` must not be empty")]
    EmptyField { field: &'static str },
}

/// The parameters covered by a request signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPayload<'a> {
    pub timestamp: &'a str,
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub body_hash: &'a str,
    pub nonce: &'a str,
    pub api_key: &'a str,
    pub key_id: &'a str,
}

impl CanonicalPayload<'_> {
    /// Build the canonical string. Pure: identical inputs give identical output.
    pub fn encode(&self) -> String {
        let method = self.method.to_uppercase();
        let fields = [
            PROTOCOL_VERSION,
            self.timestamp,
            method.as_str(),
            self.path_and_query,
            self.body_hash,
            self.nonce,
            self.api_key,
            self.key_id,
        ];
        fields.join("|")
    }

    /// Check the fields that must stay delimiter-free.
    pub fn validate(&self) -> Result<(), CodecError> {
        let fixed = [
            ("timestamp", self.timestamp),
            ("method", self.method),
            ("body_hash", self.body_hash),
            ("nonce", self.nonce),
            ("api_key", self.api_key),
            ("key_id", self.key_id),
        ];

        for (field, value) in fixed {
            if value.is_empty() {
                return Err(CodecError::EmptyField { field });
            }
            if value.contains(DELIMITER) {
                return Err(CodecError::DelimiterInField { field });
            }
        }

        if self.path_and_query.is_empty() {
            return Err(CodecError::EmptyField {
                field: "path_and_query",
            });
        }
        Ok(())
    }
}

/// Reduce a URL to its path and query (no scheme, host or fragment).
///
/// Anything that does not parse as an absolute URL, including a bare
/// `/path?query`, is kept as given. An empty query is dropped in both cases,
/// since servers see `/path?` and `/path` as the same request target.
pub fn reduce_to_path_and_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) if parsed.has_host() => match parsed.query() {
            Some(query) if !query.is_empty() => format!("{}?{}", parsed.path(), query),
            _ => parsed.path().to_string(),
        },
        _ => url.strip_suffix('?').unwrap_or(url).to_string(),
    }
}

/// The version token of a canonical string (everything before the first `|`).
pub fn protocol_version(canonical: &str) -> Option<&str> {
    canonical
        .split_once(DELIMITER)
        .map(|(version, _)| version)
        .filter(|version| !version.is_empty())
}
