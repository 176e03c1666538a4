//! Shared fixtures for the integration tests
//!
//! A UART-style peripheral with one write characteristic and one
//! notify/indicate characteristic, served by the in-memory platform.

#![allow(dead_code)]

use futures::{Stream, StreamExt};
use gattlink_core::config::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use gattlink_core::testing::{MockPeripheral, MockPlatform, PlatformCall};
use gattlink_core::{
    Characteristic, CharacteristicId, CharacteristicProperties, Connection, ConnectionSetup, ConnectionStream, GattClient,
    GattServices, Service,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:01";
pub const OTHER_ADDRESS: &str = "AA:BB:CC:DD:EE:02";

pub const SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const TX: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const RX: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const STATUS: Uuid = Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e_24dc_ca9e);

pub fn services() -> GattServices {
    let tx = Characteristic::new(TX, 1, CharacteristicProperties::WRITE);
    let rx = Characteristic::new(
        RX,
        2,
        CharacteristicProperties::READ | CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
    )
    .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID);
    // Notifies but has no configuration descriptor.
    let status = Characteristic::new(STATUS, 3, CharacteristicProperties::NOTIFY);

    GattServices::new(vec![Service::new(SERVICE)
        .with_characteristic(tx)
        .with_characteristic(rx)
        .with_characteristic(status)])
}

pub fn peripheral() -> MockPeripheral {
    MockPeripheral::new(services()).with_value(CharacteristicId::new(RX, 2), b"hello".to_vec())
}

pub fn platform() -> MockPlatform {
    MockPlatform::new()
        .with_peripheral(ADDRESS, peripheral())
        .with_peripheral(OTHER_ADDRESS, peripheral())
}

pub fn client(platform: &MockPlatform) -> GattClient {
    GattClient::new(Arc::new(platform.clone()))
}

/// Connect to [`ADDRESS`]; the returned stream keeps the link up
pub async fn connect(platform: &MockPlatform, setup: ConnectionSetup) -> (GattClient, ConnectionStream, Connection) {
    let client = client(platform);
    let mut stream = client.device(ADDRESS).establish_connection(setup);
    let connection = stream.connected().await.expect("connection should be established");
    (client, stream, connection)
}

pub async fn characteristic(connection: &Connection, uuid: Uuid) -> Characteristic {
    connection
        .characteristic(uuid)
        .await
        .expect("characteristic should be discovered")
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition should be reached");
}

/// True when `stream` ends within a second
pub async fn ended<S: Stream + Unpin>(stream: &mut S) -> bool {
    matches!(tokio::time::timeout(Duration::from_secs(1), stream.next()).await, Ok(None))
}

pub fn is_closed(platform: &MockPlatform, address: &str) -> bool {
    platform.link(address).is_some_and(|link| link.is_closed())
}

/// Values of every characteristic write in call order
pub fn written_values(platform: &MockPlatform) -> Vec<Vec<u8>> {
    platform
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            PlatformCall::WriteCharacteristic { value, .. } => Some(value),
            _ => None,
        })
        .collect()
}

/// Values of every descriptor write in call order
pub fn descriptor_writes(platform: &MockPlatform) -> Vec<Vec<u8>> {
    platform
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            PlatformCall::WriteDescriptor { value, .. } => Some(value),
            _ => None,
        })
        .collect()
}

/// Local notification toggles in call order
pub fn notification_toggles(platform: &MockPlatform) -> Vec<bool> {
    platform
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            PlatformCall::SetNotification { enable, .. } => Some(enable),
            _ => None,
        })
        .collect()
}
