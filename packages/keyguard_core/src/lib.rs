// Keyguard - Device-bound request signing

pub mod canonical;
pub mod client;
pub mod crypto;
pub mod fingerprint;
pub mod headers;
pub mod http;
pub mod keystore;
pub mod registry;
pub mod replay;
pub mod verifier;

pub use canonical::{CanonicalPayload, CodecError, PROTOCOL_VERSION};
pub use client::{BindingError, ClientConfig, DeviceBindingClient, EnrollmentPayload, RequestToSign};
pub use fingerprint::{DeviceFingerprint, FingerprintConfig, FingerprintProvider};
pub use headers::{SignedRequestHeaders, ALGORITHM};
pub use keystore::{KeyStore, KeyStoreConfig, MemoryKeyStore, SealedFileKeyStore, WrappingKey};
pub use registry::{DeviceRegistry, DeviceStatus, EnrollmentRecord, InitialStatus, RegistryError};
pub use replay::{CacheFailurePolicy, MemoryNonceCache, NonceCache, ReplayOutcome};
pub use verifier::{
    IncomingRequest, RejectReason, SignatureVerifier, VerificationError, VerifiedRequest, VerifierConfig,
};
