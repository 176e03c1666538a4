//! Connection Configuration
//!
//! Protocol constants and the tunables applied to one connection attempt.

use crate::error::GattError;
use crate::types::uuid_from_u16;
use crate::Result;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Protocol Constants
// ----------------------------------------------------------------------------

/// MTU every link starts with
pub const GATT_MTU_MINIMUM: u16 = 23;
/// Largest MTU a central may request
pub const GATT_MTU_MAXIMUM: u16 = 517;
/// ATT header bytes consumed by a write request
pub const GATT_WRITE_MTU_OVERHEAD: u16 = 3;
/// Longest attribute value a GATT server may hold
pub const GATT_MAX_ATTR_LENGTH: usize = 512;

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid_from_u16(0x2902);
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(35);
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest payload that fits in one write for a given MTU
pub fn max_write_payload(mtu: u16) -> usize {
    let payload = mtu.saturating_sub(GATT_WRITE_MTU_OVERHEAD) as usize;
    payload.min(GATT_MAX_ATTR_LENGTH)
}

// ----------------------------------------------------------------------------
// Connection Setup
// ----------------------------------------------------------------------------

/// How the platform should establish the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Connect now, failing after the connect timeout
    #[default]
    Direct,
    /// Let the platform connect whenever the peripheral shows up
    Auto,
}

/// Options applied to one connection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSetup {
    pub mode: ConnectMode,
    /// Ceiling for every single-response operation on the link
    pub operation_timeout: Duration,
    /// Ceiling for a direct connection attempt to reach CONNECTED
    pub connect_timeout: Duration,
    /// Ceiling for the platform to confirm a disconnect
    pub disconnect_timeout: Duration,
    /// Log property mismatches instead of failing the operation
    pub suppress_illegal_operation_check: bool,
}

impl Default for ConnectionSetup {
    fn default() -> Self {
        Self {
            mode: ConnectMode::Direct,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            suppress_illegal_operation_check: false,
        }
    }
}

impl ConnectionSetup {
    pub fn new(mode: ConnectMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_suppressed_illegal_operation_check(mut self, suppress: bool) -> Self {
        self.suppress_illegal_operation_check = suppress;
        self
    }

    /// Reject zero timeouts
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("operation_timeout", self.operation_timeout),
            ("connect_timeout", self.connect_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(GattError::InvalidArgument(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_write_payload() {
        assert_eq!(max_write_payload(GATT_MTU_MINIMUM), 20);
        assert_eq!(max_write_payload(185), 182);
        assert_eq!(max_write_payload(GATT_MTU_MAXIMUM), GATT_MAX_ATTR_LENGTH);
        assert_eq!(max_write_payload(0), 0);
    }

    #[test]
    fn test_setup_builder_and_validation() {
        let setup = ConnectionSetup::new(ConnectMode::Auto)
            .with_operation_timeout(Duration::from_secs(5))
            .with_suppressed_illegal_operation_check(true);
        assert_eq!(setup.mode, ConnectMode::Auto);
        assert_eq!(setup.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(setup.validate().is_ok());

        let bad = setup.with_disconnect_timeout(Duration::ZERO);
        assert!(matches!(bad.validate(), Err(GattError::InvalidArgument(_))));
    }

    #[test]
    fn test_ccc_uuid() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
