//! Signing outbound `reqwest` requests

use reqwest::header::{HeaderName, HeaderValue};

use crate::client::{BindingError, DeviceBindingClient, RequestToSign};

/// Sign `request` in place, adding the seven signed-request headers.
///
/// The body must be fully buffered; streaming bodies cannot be hashed ahead
/// of sending and are refused with `BindingError::UnsignableBody`.
pub async fn sign_reqwest_request(
    client: &DeviceBindingClient,
    request: &mut reqwest::Request,
) -> Result<(), BindingError> {
    let body = match request.body() {
        Some(body) => body
            .as_bytes()
            .ok_or_else(|| BindingError::UnsignableBody("streaming body".to_string()))?
            .to_vec(),
        None => Vec::new(),
    };
    let method = request.method().as_str().to_string();
    let url = request.url().as_str().to_string();

    let headers = client
        .sign_request(&RequestToSign::new(&method, &url).with_body(&body))
        .await?;

    let target = request.headers_mut();
    for (name, value) in headers.to_pairs() {
        let value = HeaderValue::from_str(value).map_err(|_| BindingError::InvalidHeader(name))?;
        target.insert(HeaderName::from_static(name), value);
    }

    log::debug!("Signed {} {} with key {}", method, url, headers.key_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::fingerprint::StaticFingerprintProvider;
    use crate::headers::{SignedRequestHeaders, HEADER_NAMES};
    use crate::keystore::MemoryKeyStore;
    use crate::registry::{DeviceRegistry, InitialStatus};
    use crate::verifier::{IncomingRequest, SignatureVerifier, VerifierConfig};

    fn client() -> DeviceBindingClient {
        DeviceBindingClient::new(
            "kg_prod_test",
            Arc::new(MemoryKeyStore::new()),
            Arc::new(StaticFingerprintProvider::with_id("visitor-1", "Test Laptop")),
        )
    }

    fn request(method: reqwest::Method, url: &str) -> reqwest::Request {
        reqwest::Request::new(method, reqwest::Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_signed_request_verifies() {
        let client = client();
        let payload = client.enroll(None).await.unwrap();
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(payload, InitialStatus::Active).await.unwrap();
        let verifier = SignatureVerifier::with_memory_cache(registry, VerifierConfig::default());

        let body = br#"{"model":"small"}"#.to_vec();
        let mut outbound = request(reqwest::Method::POST, "https://api.example.com/v1/chat?beta=1");
        *outbound.body_mut() = Some(reqwest::Body::from(body.clone()));

        sign_reqwest_request(&client, &mut outbound).await.unwrap();
        for name in HEADER_NAMES {
            assert!(outbound.headers().contains_key(name), "missing {}", name);
        }

        let received = SignedRequestHeaders::from_lookup(|name| {
            outbound
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap();

        let verified = verifier
            .verify(&IncomingRequest {
                method: "POST",
                path_and_query: "/v1/chat?beta=1",
                headers: &received,
                body: &body,
            })
            .await
            .unwrap();
        assert_eq!(verified.key_id, client.key_id().await.unwrap());
    }

    #[tokio::test]
    async fn test_bodyless_request_hashes_empty_body() {
        let client = client();
        client.enroll(None).await.unwrap();

        let mut outbound = request(reqwest::Method::GET, "https://api.example.com/v1/models");
        sign_reqwest_request(&client, &mut outbound).await.unwrap();

        assert_eq!(
            outbound.headers()["x-kg-body-sha256"],
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[tokio::test]
    async fn test_not_enrolled() {
        let mut outbound = request(reqwest::Method::GET, "https://api.example.com/v1/models");
        let result = sign_reqwest_request(&client(), &mut outbound).await;

        assert!(matches!(result, Err(BindingError::NotEnrolled)));
        assert!(outbound.headers().is_empty());
    }
}
