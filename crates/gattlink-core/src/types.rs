//! GATT attribute tree types
//!
//! Plain data holders describing services, characteristics and descriptors as
//! reported by service discovery.

use crate::error::GattError;
use crate::Result;
use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG assigned number into a full UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

bitflags::bitflags! {
    /// Property bit mask advertised by a characteristic
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_NO_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED_PROPS = 0x80;
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "[ {} ]", names.join(" "))
    }
}

/// How a characteristic write is acknowledged by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteType {
    #[default]
    WithResponse,
    WithoutResponse,
    Signed,
}

// ----------------------------------------------------------------------------
// Attribute Identity
// ----------------------------------------------------------------------------

/// Identity of one characteristic instance
///
/// A service may expose the same UUID several times, so the platform
/// instance id is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub uuid: Uuid,
    pub instance_id: u32,
}

impl CharacteristicId {
    pub fn new(uuid: Uuid, instance_id: u32) -> Self {
        Self { uuid, instance_id }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uuid, self.instance_id)
    }
}

/// Descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub characteristic: CharacteristicId,
}

// ----------------------------------------------------------------------------
// Characteristics and Services
// ----------------------------------------------------------------------------

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub instance_id: u32,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub write_type: WriteType,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Create a characteristic; the write type follows the advertised properties
    pub fn new(uuid: Uuid, instance_id: u32, properties: CharacteristicProperties) -> Self {
        let write_type = if properties.contains(CharacteristicProperties::WRITE) {
            WriteType::WithResponse
        } else if properties.contains(CharacteristicProperties::WRITE_NO_RESPONSE) {
            WriteType::WithoutResponse
        } else if properties.contains(CharacteristicProperties::SIGNED_WRITE) {
            WriteType::Signed
        } else {
            WriteType::WithResponse
        };
        Self {
            uuid,
            instance_id,
            service_uuid: Uuid::nil(),
            properties,
            write_type,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(Descriptor {
            uuid,
            service_uuid: self.service_uuid,
            characteristic: self.id(),
        });
        self
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn id(&self) -> CharacteristicId {
        CharacteristicId::new(self.uuid, self.instance_id)
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    fn attach_to(&mut self, service_uuid: Uuid) {
        self.service_uuid = service_uuid;
        for descriptor in &mut self.descriptors {
            descriptor.service_uuid = service_uuid;
        }
    }
}

/// A primary or secondary service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, mut characteristic: Characteristic) -> Self {
        characteristic.attach_to(self.uuid);
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Result of service discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattServices {
    services: Vec<Service>,
}

impl GattServices {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, uuid: Uuid) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.uuid == uuid)
            .ok_or(GattError::ServiceNotFound { uuid })
    }

    /// First characteristic with `uuid` across all services
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.services
            .iter()
            .find_map(|s| s.characteristic(uuid))
            .ok_or(GattError::CharacteristicNotFound { uuid })
    }

    pub fn characteristic_in(&self, service: Uuid, uuid: Uuid) -> Result<&Characteristic> {
        self.service(service)?
            .characteristic(uuid)
            .ok_or(GattError::CharacteristicNotFound { uuid })
    }

    /// Characteristic with an exact identity, used to resolve callbacks
    pub fn find(&self, id: CharacteristicId) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.id() == id)
    }
}

// ----------------------------------------------------------------------------
// Connection Priority
// ----------------------------------------------------------------------------

/// Link budget hint passed to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionPriority {
    #[default]
    Balanced,
    High,
    LowPower,
}

impl ConnectionPriority {
    /// Platform code of the priority
    pub fn code(self) -> u8 {
        match self {
            ConnectionPriority::Balanced => 0,
            ConnectionPriority::High => 1,
            ConnectionPriority::LowPower => 2,
        }
    }
}

/// Link layer timing reported after the peripheral or the platform renegotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Connection interval in units of 1.25 ms
    pub interval: u16,
    /// Connection events the peripheral may skip
    pub latency: u16,
    /// Supervision timeout in units of 10 ms
    pub supervision_timeout: u16,
}

impl ConnectionParameters {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.interval) * 1250)
    }

    pub fn supervision_timeout_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.supervision_timeout) * 10)
    }
}
