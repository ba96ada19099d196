//! Enrollment record and device status types

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::EnrollmentPayload;

use super::RegistryError;

/// Trust state of an enrolled device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Enrolled, awaiting approval
    Pending,
    /// Requests are accepted
    Active,
    /// Temporarily blocked; can only move on to `Revoked`
    Suspended,
    /// Permanently blocked
    Revoked,
}

/// Administrative action on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusAction {
    Approve,
    Suspend,
    Revoke,
}

/// Status a newly registered device starts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InitialStatus {
    /// Requires `approve` before requests are accepted
    #[default]
    Pending,
    /// Trusted immediately (auto-approve flows)
    Active,
}

impl DeviceStatus {
    /// Apply an administrative action. `Revoked` accepts no action.
    pub fn apply(self, action: StatusAction) -> Result<DeviceStatus, RegistryError> {
        match (self, action) {
            (DeviceStatus::Pending, StatusAction::Approve) => Ok(DeviceStatus::Active),
            (DeviceStatus::Active, StatusAction::Suspend) => Ok(DeviceStatus::Suspended),
            (DeviceStatus::Active, StatusAction::Revoke)
            | (DeviceStatus::Suspended, StatusAction::Revoke) => Ok(DeviceStatus::Revoked),
            (from, action) => Err(RegistryError::InvalidTransition { from, action }),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DeviceStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceStatus::Revoked)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Suspended => "suspended",
            DeviceStatus::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

impl fmt::Display for StatusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusAction::Approve => "approve",
            StatusAction::Suspend => "suspend",
            StatusAction::Revoke => "revoke",
        };
        f.write_str(name)
    }
}

impl From<InitialStatus> for DeviceStatus {
    fn from(initial: InitialStatus) -> Self {
        match initial {
            InitialStatus::Pending => DeviceStatus::Pending,
            InitialStatus::Active => DeviceStatus::Active,
        }
    }
}

/// A registered device key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnrollmentRecord {
    /// Registry-assigned id used by the management surface
    pub device_id: Uuid,
    pub key_id: String,
    /// Base64 SPKI DER
    pub public_key: String,
    pub device_fingerprint: String,
    pub label: String,
    pub user_agent: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl EnrollmentRecord {
    /// Build a fresh record from a (validated) enrollment payload.
    pub fn from_payload(payload: EnrollmentPayload, status: DeviceStatus) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            key_id: payload.key_id,
            public_key: payload.public_key,
            device_fingerprint: payload.device_fingerprint,
            label: payload.label,
            user_agent: payload.user_agent,
            metadata: payload.metadata,
            status,
            created_at: Utc::now(),
            last_seen_at: None,
        }
    }
}
