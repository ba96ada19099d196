//! Device registry: enrollment records and their trust state
//!
//! Every enrolled key has one `EnrollmentRecord`. Its `DeviceStatus` gates
//! verification: only `Active` devices may have requests accepted.
//!
//! ```text
//! Pending --approve--> Active --suspend--> Suspended
//!                        |                    |
//!                        +------revoke--------+--> Revoked (terminal)
//! ```

pub mod record;
pub mod store;

pub use record::{DeviceStatus, EnrollmentRecord, InitialStatus, StatusAction};
pub use store::{DeviceRegistry, LAST_SEEN_WRITE_INTERVAL_SECS};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid enrollment: {0}")]
    InvalidEnrollment(String),

    #[error("Cannot {action} a device that is {from}")]
    InvalidTransition {
        from: DeviceStatus,
        action: StatusAction,
    },
}
