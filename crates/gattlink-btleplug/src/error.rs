//! Error types for the btleplug platform

use gattlink_core::{GattStatus, PlatformError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum BtleError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

pub type Result<T> = core::result::Result<T, BtleError>;

// ----------------------------------------------------------------------------
// Status Mapping
// ----------------------------------------------------------------------------

/// Closest GATT status for a failed btleplug call
pub(crate) fn status_of(error: &btleplug::Error) -> GattStatus {
    match error {
        btleplug::Error::PermissionDenied => GattStatus(0x05),
        btleplug::Error::NotSupported(_) => GattStatus(0x06),
        btleplug::Error::NotConnected => GattStatus(0x08),
        _ => GattStatus::FAILURE,
    }
}

pub(crate) fn platform_error(context: &str, error: &btleplug::Error) -> PlatformError {
    PlatformError::new(format!("{context}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&btleplug::Error::PermissionDenied), GattStatus(5));
        assert_eq!(status_of(&btleplug::Error::NotConnected), GattStatus(8));
        assert_eq!(
            status_of(&btleplug::Error::RuntimeError("gone".into())),
            GattStatus::FAILURE
        );
    }

    #[test]
    fn test_platform_error_keeps_context() {
        let error = platform_error("discover", &btleplug::Error::DeviceNotFound);
        assert!(error.0.starts_with("discover: "));
    }
}
