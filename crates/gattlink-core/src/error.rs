//! Error types for GATT client operations
//!
//! Every failure a caller can observe is a [`GattError`]. The type is `Clone`
//! because a single link failure is latched once and then replayed to every
//! pending and future operation on that link.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Status Codes
// ----------------------------------------------------------------------------

/// Numeric status reported by the platform alongside every callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub u16);

impl GattStatus {
    /// Operation completed successfully
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure used when the platform gives no specific code
    pub const FAILURE: GattStatus = GattStatus(0x101);
    /// Status attached to disconnections that did not come from a callback
    pub const UNKNOWN: GattStatus = GattStatus(u16::MAX);

    pub fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }

    /// Human readable name of well-known status codes
    pub fn description(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "GATT_SUCCESS",
            2 => "GATT_READ_NOT_PERMITTED",
            3 => "GATT_WRITE_NOT_PERMITTED",
            5 => "GATT_INSUFFICIENT_AUTHENTICATION",
            6 => "GATT_REQUEST_NOT_SUPPORTED",
            7 => "GATT_INVALID_OFFSET",
            8 => "GATT_CONN_TIMEOUT",
            13 => "GATT_INVALID_ATTRIBUTE_LENGTH",
            15 => "GATT_INSUFFICIENT_ENCRYPTION",
            19 => "GATT_CONN_TERMINATE_PEER_USER",
            22 => "GATT_CONN_TERMINATE_LOCAL_HOST",
            34 => "GATT_CONN_LMP_TIMEOUT",
            62 => "GATT_CONN_FAIL_ESTABLISH",
            133 => "GATT_ERROR",
            0x101 => "GATT_FAILURE",
            u16::MAX => "UNKNOWN",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

// ----------------------------------------------------------------------------
// Operation Types
// ----------------------------------------------------------------------------

/// Tag identifying which kind of GATT operation a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattOperationType {
    ConnectionState,
    ServiceDiscovery,
    CharacteristicRead,
    CharacteristicWrite,
    CharacteristicLongWrite,
    CharacteristicChanged,
    DescriptorRead,
    DescriptorWrite,
    ReliableWrite,
    ReadRssi,
    OnMtuChanged,
    ConnectionPriorityChange,
    ConnectionParametersUpdate,
    Custom,
}

impl GattOperationType {
    pub fn name(self) -> &'static str {
        match self {
            GattOperationType::ConnectionState => "CONNECTION_STATE",
            GattOperationType::ServiceDiscovery => "SERVICE_DISCOVERY",
            GattOperationType::CharacteristicRead => "CHARACTERISTIC_READ",
            GattOperationType::CharacteristicWrite => "CHARACTERISTIC_WRITE",
            GattOperationType::CharacteristicLongWrite => "CHARACTERISTIC_LONG_WRITE",
            GattOperationType::CharacteristicChanged => "CHARACTERISTIC_CHANGED",
            GattOperationType::DescriptorRead => "DESCRIPTOR_READ",
            GattOperationType::DescriptorWrite => "DESCRIPTOR_WRITE",
            GattOperationType::ReliableWrite => "RELIABLE_WRITE",
            GattOperationType::ReadRssi => "READ_RSSI",
            GattOperationType::OnMtuChanged => "ON_MTU_CHANGED",
            GattOperationType::ConnectionPriorityChange => "CONNECTION_PRIORITY_CHANGE",
            GattOperationType::ConnectionParametersUpdate => "CONNECTION_PARAMETERS_UPDATE",
            GattOperationType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for GattOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Platform Errors
// ----------------------------------------------------------------------------

/// Refusal returned synchronously by a platform "start" call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl PlatformError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

// ----------------------------------------------------------------------------
// GATT Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the coordination core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GattError {
    #[error("Disconnected from {address} (status {status})")]
    Disconnected { address: String, status: GattStatus },

    #[error("{operation} on {address} failed with status {status}")]
    Gatt {
        address: String,
        status: GattStatus,
        operation: GattOperationType,
    },

    #[error("{operation} of characteristic {characteristic} on {address} failed with status {status}")]
    CharacteristicStatus {
        address: String,
        characteristic: Uuid,
        status: GattStatus,
        operation: GattOperationType,
    },

    #[error("{operation} of descriptor {descriptor} on {address} failed with status {status}")]
    DescriptorStatus {
        address: String,
        descriptor: Uuid,
        status: GattStatus,
        operation: GattOperationType,
    },

    #[error("Platform refused to start {operation} on {address}: {reason}")]
    CannotStart {
        address: String,
        operation: GattOperationType,
        reason: String,
    },

    #[error("{operation} on {address} timed out after {timeout:?}")]
    Timeout {
        address: String,
        operation: GattOperationType,
        timeout: Duration,
    },

    #[error("Characteristic {characteristic} is already set up for {}", armed_kind(.already_indication))]
    ConflictingNotification {
        characteristic: Uuid,
        already_indication: bool,
    },

    #[error("Cannot set up notification for {characteristic}: {reason}")]
    CannotSetNotification { characteristic: Uuid, reason: String },

    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: Uuid },

    #[error("Service not found: {uuid}")]
    ServiceNotFound { uuid: Uuid },

    #[error("Characteristic {characteristic} does not support {operation} (supported: {supported})")]
    IllegalOperation {
        characteristic: Uuid,
        operation: String,
        supported: String,
    },

    #[error("Device {address} already has a connection in progress")]
    AlreadyConnected { address: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation queue terminated: {reason}")]
    QueueTerminated { reason: String },
}

fn armed_kind(already_indication: &bool) -> &'static str {
    if *already_indication {
        "indication"
    } else {
        "notification"
    }
}

impl GattError {
    /// True for errors that mean the link itself is gone
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            GattError::Disconnected { .. }
                | GattError::Gatt {
                    operation: GattOperationType::ConnectionState,
                    ..
                }
        )
    }

    /// Status code carried by the error, if any
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            GattError::Disconnected { status, .. }
            | GattError::Gatt { status, .. }
            | GattError::CharacteristicStatus { status, .. }
            | GattError::DescriptorStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
