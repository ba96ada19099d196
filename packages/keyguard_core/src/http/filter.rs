//! Warp filter guarding routes with signature verification

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use warp::http::{HeaderMap, Method, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

use crate::headers::SignedRequestHeaders;
use crate::verifier::{IncomingRequest, RejectReason, SignatureVerifier, VerifiedRequest};

/// A request refused by the verifier.
#[derive(Debug)]
pub struct SignatureRejection {
    pub reason: RejectReason,
    pub message: String,
}

impl warp::reject::Reject for SignatureRejection {}

impl SignatureRejection {
    pub fn status(&self) -> StatusCode {
        match self.reason {
            RejectReason::DeviceNotActive => StatusCode::FORBIDDEN,
            RejectReason::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

/// Extracts a `VerifiedRequest`, or rejects with `SignatureRejection`.
///
/// Consumes the request body; handlers needing it should read it from the
/// same request through their own `warp::body` filter ahead of this one.
pub fn signed_request(
    verifier: Arc<SignatureVerifier>,
) -> impl Filter<Extract = (VerifiedRequest,), Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(with_verifier(verifier))
        .and_then(verify_request)
}

fn with_verifier(
    verifier: Arc<SignatureVerifier>,
) -> impl Filter<Extract = (Arc<SignatureVerifier>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&verifier))
}

async fn verify_request(
    method: Method,
    path: FullPath,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    verifier: Arc<SignatureVerifier>,
) -> Result<VerifiedRequest, Rejection> {
    let signed = SignedRequestHeaders::from_header_map(&headers).map_err(|e| {
        log::warn!("Rejected {} {} [{}]: {}", method, path.as_str(), RejectReason::MalformedHeaders, e);
        warp::reject::custom(SignatureRejection {
            reason: RejectReason::MalformedHeaders,
            message: e.to_string(),
        })
    })?;

    let path_and_query = if query.is_empty() {
        path.as_str().to_string()
    } else {
        format!("{}?{}", path.as_str(), query)
    };

    let incoming = IncomingRequest {
        method: method.as_str(),
        path_and_query: &path_and_query,
        headers: &signed,
        body: &body,
    };

    verifier.verify(&incoming).await.map_err(|e| {
        warp::reject::custom(SignatureRejection {
            reason: e.reason(),
            message: e.to_string(),
        })
    })
}

/// Turn a `SignatureRejection` into a JSON error response.
/// Other rejections pass through untouched.
pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Rejection> {
    if let Some(rejection) = err.find::<SignatureRejection>() {
        let body = ErrorBody {
            error: rejection.reason.as_str(),
            message: &rejection.message,
        };
        return Ok(warp::reply::with_status(warp::reply::json(&body), rejection.status()).into_response());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DeviceBindingClient, RequestToSign};
    use crate::fingerprint::StaticFingerprintProvider;
    use crate::keystore::MemoryKeyStore;
    use crate::registry::{DeviceRegistry, InitialStatus};
    use crate::verifier::VerifierConfig;

    async fn setup() -> (Arc<SignatureVerifier>, DeviceBindingClient) {
        let client = DeviceBindingClient::new(
            "kg_prod_test",
            Arc::new(MemoryKeyStore::new()),
            Arc::new(StaticFingerprintProvider::with_id("visitor-1", "Test Laptop")),
        );
        let payload = client.enroll(None).await.unwrap();

        let registry = Arc::new(DeviceRegistry::new());
        registry.register(payload, InitialStatus::Active).await.unwrap();

        let verifier = Arc::new(SignatureVerifier::with_memory_cache(registry, VerifierConfig::default()));
        (verifier, client)
    }

    fn signed(method: &str, path: &str, headers: &SignedRequestHeaders, body: &[u8]) -> warp::test::RequestBuilder {
        let mut builder = warp::test::request().method(method).path(path).body(body.to_vec());
        for (name, value) in headers.to_pairs() {
            builder = builder.header(name, value);
        }
        builder
    }

    fn route(
        verifier: Arc<SignatureVerifier>,
    ) -> impl Filter<Extract = (warp::reply::Response,), Error = Infallible> + Clone {
        signed_request(verifier)
            .map(|verified: VerifiedRequest| warp::reply::json(&verified.key_id).into_response())
            .recover(|err: Rejection| async move {
                handle_rejection(err)
                    .await
                    .or_else(|_| Ok::<_, Infallible>(StatusCode::NOT_FOUND.into_response()))
            })
            .unify()
    }

    #[tokio::test]
    async fn test_filter_accepts_signed_request() {
        let (verifier, client) = setup().await;
        let body = br#"{"prompt":"hi"}"#;
        let headers = client
            .sign_request(&RequestToSign::new("POST", "https://api.example.com/v1/complete?stream=false").with_body(body))
            .await
            .unwrap();

        let verified = signed("POST", "/v1/complete?stream=false", &headers, body)
            .filter(&signed_request(verifier))
            .await
            .unwrap();
        assert_eq!(verified.key_id, client.key_id().await.unwrap());
    }

    #[tokio::test]
    async fn test_filter_without_query() {
        let (verifier, client) = setup().await;
        let headers = client.sign_request(&RequestToSign::new("GET", "/v1/models")).await.unwrap();

        let result = signed("GET", "/v1/models", &headers, b"")
            .filter(&signed_request(verifier))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_filter_with_empty_query() {
        let (verifier, client) = setup().await;
        let route = route(verifier);

        for url in ["https://api.example.com/v1/models?", "/v1/models?"] {
            let headers = client.sign_request(&RequestToSign::new("GET", url)).await.unwrap();
            let response = signed("GET", "/v1/models?", &headers, b"").reply(&route).await;
            assert_eq!(response.status(), StatusCode::OK, "signed as {}", url);
        }
    }

    #[tokio::test]
    async fn test_missing_headers_is_401() {
        let (verifier, _) = setup().await;

        let response = warp::test::request()
            .method("GET")
            .path("/v1/models")
            .reply(&route(verifier))
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "malformed_headers");
    }

    #[tokio::test]
    async fn test_replay_is_401() {
        let (verifier, client) = setup().await;
        let headers = client.sign_request(&RequestToSign::new("GET", "/v1/models")).await.unwrap();
        let route = route(verifier);

        let first = signed("GET", "/v1/models", &headers, b"").reply(&route).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = signed("GET", "/v1/models", &headers, b"").reply(&route).await;
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(second.body()).unwrap();
        assert_eq!(body["error"], "replay_detected");
    }

    #[tokio::test]
    async fn test_suspended_device_is_403() {
        let (verifier, client) = setup().await;
        let key_id = client.key_id().await.unwrap();
        let record = verifier.registry().find_by_key_id(&key_id).await.unwrap();
        verifier.registry().suspend(&record.device_id).await.unwrap();

        let headers = client.sign_request(&RequestToSign::new("GET", "/v1/models")).await.unwrap();
        let response = signed("GET", "/v1/models", &headers, b"").reply(&route(verifier)).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "device_not_active");
    }

    #[test]
    fn test_status_mapping() {
        let rejection = |reason| SignatureRejection {
            reason,
            message: String::new(),
        };
        assert_eq!(rejection(RejectReason::InvalidSignature).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection(RejectReason::DeviceNotActive).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            rejection(RejectReason::StorageUnavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
