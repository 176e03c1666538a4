//! Conversion of the btleplug attribute tree
//!
//! btleplug identifies characteristics by UUID only. Instance ids are
//! assigned in enumeration order so the core can tell apart characteristics
//! that share a UUID.

use btleplug::api::{
    Characteristic as BtleCharacteristic, Descriptor as BtleDescriptor, Service as BtleService,
};
use gattlink_core::{Characteristic, CharacteristicId, CharacteristicProperties, GattServices, Service};
use std::collections::HashMap;
use uuid::Uuid;

/// btleplug handles for the ids handed to the core
#[derive(Debug, Default)]
pub(crate) struct AttributeMap {
    characteristics: HashMap<CharacteristicId, BtleCharacteristic>,
    descriptors: HashMap<(CharacteristicId, Uuid), BtleDescriptor>,
}

impl AttributeMap {
    pub(crate) fn characteristic(&self, id: CharacteristicId) -> Option<&BtleCharacteristic> {
        self.characteristics.get(&id)
    }

    pub(crate) fn descriptor(&self, characteristic: CharacteristicId, uuid: Uuid) -> Option<&BtleDescriptor> {
        self.descriptors.get(&(characteristic, uuid))
    }

    /// Instance a value notification belongs to
    ///
    /// Notifications carry only the UUID; the first instance wins.
    pub(crate) fn resolve(&self, uuid: Uuid) -> Option<CharacteristicId> {
        self.characteristics
            .keys()
            .filter(|id| id.uuid == uuid)
            .min_by_key(|id| id.instance_id)
            .copied()
    }
}

/// Build the core's service tree and the handle map from btleplug services
pub(crate) fn convert_services<'a>(
    services: impl IntoIterator<Item = &'a BtleService>,
) -> (GattServices, AttributeMap) {
    let mut attributes = AttributeMap::default();
    let mut converted = Vec::new();
    let mut next_instance = 1u32;

    for service in services {
        let mut target = Service::new(service.uuid);
        target.primary = service.primary;

        for characteristic in &service.characteristics {
            let mut entry = Characteristic::new(
                characteristic.uuid,
                next_instance,
                CharacteristicProperties::from_bits_truncate(characteristic.properties.bits()),
            );
            next_instance += 1;

            let id = entry.id();
            for descriptor in &characteristic.descriptors {
                entry = entry.with_descriptor(descriptor.uuid);
                attributes.descriptors.insert((id, descriptor.uuid), descriptor.clone());
            }
            attributes.characteristics.insert(id, characteristic.clone());
            target = target.with_characteristic(entry);
        }
        converted.push(target);
    }

    (GattServices::new(converted), attributes)
}
