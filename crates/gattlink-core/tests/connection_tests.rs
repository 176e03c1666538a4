//! Connection lifecycle tests against the in-memory platform

mod test_utils;

use futures::StreamExt;
use gattlink_core::testing::{MockRequest, MockResponse, PlatformCall};
use gattlink_core::{
    AdapterState, ConnectMode, ConnectionParameters, ConnectionSetup, GattError, GattOperationType, GattStatus,
    LinkState,
};
use std::time::Duration;
use test_utils::*;

#[tokio::test]
async fn test_direct_connect_yields_connection() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    assert_eq!(connection.state(), LinkState::Connected);
    assert_eq!(connection.address(), ADDRESS);
    assert_eq!(
        platform.calls()[0],
        PlatformCall::Open {
            address: ADDRESS.into(),
            mode: ConnectMode::Direct,
        }
    );
}

#[tokio::test]
async fn test_device_handles_are_shared_per_address() {
    let platform = platform();
    let client = client(&platform);
    let device = client.device(&ADDRESS.to_lowercase());

    assert_eq!(device.address(), ADDRESS);
    assert_eq!(device.state(), LinkState::Disconnected);

    let mut stream = device.establish_connection(ConnectionSetup::default());
    stream.connected().await.unwrap();
    assert_eq!(client.device(ADDRESS).state(), LinkState::Connected);
}

#[tokio::test]
async fn test_second_connection_is_rejected_while_first_is_held() {
    let platform = platform();
    let client = client(&platform);
    let device = client.device(ADDRESS);

    let mut first = device.establish_connection(ConnectionSetup::default());
    first.connected().await.unwrap();

    let mut second = device.establish_connection(ConnectionSetup::default());
    assert!(matches!(
        second.connected().await,
        Err(GattError::AlreadyConnected { .. })
    ));
    assert_eq!(platform.count(MockRequest::Connect), 1);
}

#[tokio::test]
async fn test_released_device_can_reconnect() {
    let platform = platform();
    let client = client(&platform);
    let device = client.device(ADDRESS);

    let mut first = device.establish_connection(ConnectionSetup::default());
    first.connected().await.unwrap();
    drop(first);

    eventually(|| is_closed(&platform, ADDRESS)).await;
    eventually(|| device.state() == LinkState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut second = device.establish_connection(ConnectionSetup::default());
    second.connected().await.unwrap();
    assert_eq!(platform.count(MockRequest::Connect), 2);
}

#[tokio::test]
async fn test_invalid_setup_is_rejected() {
    let platform = platform();
    let client = client(&platform);
    let setup = ConnectionSetup::default().with_operation_timeout(Duration::ZERO);

    let mut stream = client.device(ADDRESS).establish_connection(setup);
    assert!(matches!(
        stream.connected().await,
        Err(GattError::InvalidArgument(_))
    ));
    assert!(platform.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_direct_connect_times_out() {
    let platform = platform();
    platform.script(ADDRESS, MockRequest::Connect, MockResponse::Ignore);
    let client = client(&platform);
    let setup = ConnectionSetup::default().with_connect_timeout(Duration::from_secs(5));

    let mut stream = client.device(ADDRESS).establish_connection(setup);
    let error = stream.connected().await.unwrap_err();

    assert!(matches!(
        error,
        GattError::Timeout {
            operation: GattOperationType::ConnectionState,
            ..
        }
    ));
    eventually(|| is_closed(&platform, ADDRESS)).await;
}

#[tokio::test]
async fn test_refused_connect_fails_to_start() {
    let platform = platform();
    platform.script(ADDRESS, MockRequest::Connect, MockResponse::Refuse);
    let client = client(&platform);

    let mut stream = client.device(ADDRESS).establish_connection(ConnectionSetup::default());
    assert!(matches!(
        stream.connected().await,
        Err(GattError::CannotStart {
            operation: GattOperationType::ConnectionState,
            ..
        })
    ));
}

#[tokio::test]
async fn test_auto_connect_does_not_block_other_devices() {
    let platform = platform();
    platform.script(ADDRESS, MockRequest::Connect, MockResponse::Ignore);
    let client = client(&platform);

    let mut waiting = client
        .device(ADDRESS)
        .establish_connection(ConnectionSetup::new(ConnectMode::Auto));
    let mut other = client
        .device(OTHER_ADDRESS)
        .establish_connection(ConnectionSetup::default());

    let other = other.connected().await.unwrap();
    assert_eq!(other.address(), OTHER_ADDRESS);

    assert!(platform.connect_peer(ADDRESS));
    let connection = waiting.connected().await.unwrap();
    assert_eq!(connection.state(), LinkState::Connected);
}

#[tokio::test]
async fn test_adapter_off_fails_connection_immediately() {
    let platform = platform();
    platform.set_adapter_state(AdapterState::Off);
    let client = client(&platform);

    let mut stream = client.device(ADDRESS).establish_connection(ConnectionSetup::default());
    let error = stream.connected().await.unwrap_err();

    assert!(error.is_disconnection());
    assert_eq!(platform.count(MockRequest::Connect), 0);
}

#[tokio::test]
async fn test_adapter_turning_off_breaks_connection() {
    let platform = platform();
    let (_client, mut stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    platform.set_adapter_state(AdapterState::TurningOff);

    let error = stream.next().await.unwrap().unwrap_err();
    assert!(error.is_disconnection());
    assert!(connection.read_rssi().await.unwrap_err().is_disconnection());
}

#[tokio::test]
async fn test_peer_disconnect_ends_stream_and_fails_operations() {
    let platform = platform();
    let (_client, mut stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let rx = characteristic(&connection, RX).await;
    platform.script(ADDRESS, MockRequest::ReadCharacteristic, MockResponse::Ignore);

    let in_flight = tokio::spawn({
        let connection = connection.clone();
        let rx = rx.clone();
        async move { connection.read_characteristic(&rx).await }
    });
    let waiting = tokio::spawn({
        let connection = connection.clone();
        let rx = rx.clone();
        async move { connection.read_characteristic(&rx).await }
    });
    eventually(|| platform.count(MockRequest::ReadCharacteristic) == 1).await;

    assert!(platform.disconnect_from_peer(ADDRESS, GattStatus(8)));

    let expected = GattError::Disconnected {
        address: ADDRESS.into(),
        status: GattStatus(8),
    };
    assert_eq!(in_flight.await.unwrap(), Err(expected.clone()));
    assert_eq!(waiting.await.unwrap(), Err(expected.clone()));
    assert!(matches!(stream.next().await, Some(Err(ref error)) if *error == expected));
    assert_eq!(platform.count(MockRequest::ReadCharacteristic), 1);
    eventually(|| is_closed(&platform, ADDRESS)).await;
}

#[tokio::test]
async fn test_dropping_stream_disconnects_and_closes() {
    let platform = platform();
    let (client, stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    drop(stream);

    eventually(|| is_closed(&platform, ADDRESS)).await;
    assert_eq!(platform.count(MockRequest::Disconnect), 1);
    eventually(|| client.device(ADDRESS).state() == LinkState::Disconnected).await;
    assert!(connection.read_rssi().await.unwrap_err().is_disconnection());
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_still_closes() {
    let platform = platform();
    platform.script(ADDRESS, MockRequest::Disconnect, MockResponse::Ignore);
    let setup = ConnectionSetup::default().with_disconnect_timeout(Duration::from_secs(2));
    let (_client, stream, _connection) = connect(&platform, setup).await;

    let start = tokio::time::Instant::now();
    drop(stream);

    eventually(|| is_closed(&platform, ADDRESS)).await;
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_observe_state_reports_current_then_changes() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    let mut states = connection.observe_state();
    assert_eq!(states.next().await, Some(LinkState::Connected));

    platform.disconnect_from_peer(ADDRESS, GattStatus(19));
    assert_eq!(states.next().await, Some(LinkState::Disconnected));
    assert!(connection.observe_disconnect().await.is_disconnection());
}

#[tokio::test]
async fn test_services_are_discovered_once() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    let services = connection.services().await.unwrap();
    assert_eq!(services, test_utils::services());
    let tx = characteristic(&connection, TX).await;
    assert_eq!(tx.service_uuid, SERVICE);

    assert_eq!(platform.count(MockRequest::DiscoverServices), 1);
}

#[tokio::test]
async fn test_unknown_characteristic_is_reported() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    let missing = uuid::Uuid::from_u128(0xdead_beef);
    assert_eq!(
        connection.characteristic(missing).await,
        Err(GattError::CharacteristicNotFound { uuid: missing })
    );
}

#[tokio::test]
async fn test_failed_discovery_is_not_cached() {
    let platform = platform();
    platform.script(ADDRESS, MockRequest::DiscoverServices, MockResponse::Fail(GattStatus(129)));
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    assert!(matches!(
        connection.services().await,
        Err(GattError::Gatt {
            operation: GattOperationType::ServiceDiscovery,
            ..
        })
    ));
    assert!(connection.services().await.is_ok());
    assert_eq!(platform.count(MockRequest::DiscoverServices), 2);
}

#[tokio::test]
async fn test_connection_parameter_updates_end_with_link() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let mut updates = connection.observe_connection_parameters();
    let parameters = ConnectionParameters {
        interval: 12,
        latency: 4,
        supervision_timeout: 600,
    };

    assert!(platform.update_connection_parameters(ADDRESS, parameters));
    assert_eq!(updates.next().await.unwrap().unwrap(), parameters);

    assert!(platform.disconnect_from_peer(ADDRESS, GattStatus(19)));
    assert!(updates.next().await.unwrap().unwrap_err().is_disconnection());
    assert!(ended(&mut updates).await);
}
