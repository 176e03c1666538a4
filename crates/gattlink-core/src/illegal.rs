//! Property checks run before an attribute operation is queued

use crate::error::GattError;
use crate::notification::NotificationKind;
use crate::types::{Characteristic, CharacteristicProperties};
use crate::Result;
use tracing::warn;

/// Rejects operations a characteristic does not advertise support for
#[derive(Debug, Clone, Copy, Default)]
pub struct IllegalOperationChecker {
    suppress: bool,
}

impl IllegalOperationChecker {
    /// With `suppress` set, mismatches are only logged
    pub fn new(suppress: bool) -> Self {
        Self { suppress }
    }

    pub fn check_read(&self, characteristic: &Characteristic) -> Result<()> {
        self.check(characteristic, CharacteristicProperties::READ, "read")
    }

    pub fn check_write(&self, characteristic: &Characteristic) -> Result<()> {
        let any_write = CharacteristicProperties::WRITE
            | CharacteristicProperties::WRITE_NO_RESPONSE
            | CharacteristicProperties::SIGNED_WRITE;
        self.check(characteristic, any_write, "write")
    }

    pub fn check_subscription(&self, characteristic: &Characteristic, kind: NotificationKind) -> Result<()> {
        match kind {
            NotificationKind::Notification => {
                self.check(characteristic, CharacteristicProperties::NOTIFY, "notify")
            }
            NotificationKind::Indication => {
                self.check(characteristic, CharacteristicProperties::INDICATE, "indicate")
            }
        }
    }

    fn check(
        &self,
        characteristic: &Characteristic,
        required: CharacteristicProperties,
        operation: &str,
    ) -> Result<()> {
        if characteristic.properties.intersects(required) {
            return Ok(());
        }

        let error = GattError::IllegalOperation {
            characteristic: characteristic.uuid,
            operation: operation.to_string(),
            supported: characteristic.properties.to_string(),
        };
        if self.suppress {
            warn!(%error, "Property check suppressed");
            return Ok(());
        }
        Err(error)
    }
}
