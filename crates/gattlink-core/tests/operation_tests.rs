//! Queued GATT operation tests against the in-memory platform

mod test_utils;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use gattlink_core::config::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use gattlink_core::testing::{MockRequest, MockResponse, PlatformCall};
use gattlink_core::{
    ConnectionPriority, ConnectionSetup, CustomOperation, GattCallback, GattError, GattEventRouter, GattLink,
    GattOperationType, GattStatus, LinkState, OperationEmitter, Priority, QueueRelease, WriteType,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::*;

// ----------------------------------------------------------------------------
// Attribute Access
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_write_then_read_characteristic() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    let rx = characteristic(&connection, RX).await;

    assert_eq!(connection.read_characteristic(&rx).await.unwrap(), b"hello".to_vec());
    assert_eq!(connection.write_characteristic(&tx, &[1, 2, 3]).await.unwrap(), vec![1, 2, 3]);

    let write = platform
        .calls()
        .into_iter()
        .find(|call| matches!(call, PlatformCall::WriteCharacteristic { .. }));
    assert_eq!(
        write,
        Some(PlatformCall::WriteCharacteristic {
            address: ADDRESS.into(),
            characteristic: tx.id(),
            value: vec![1, 2, 3],
            write_type: WriteType::WithResponse,
        })
    );
}

#[tokio::test]
async fn test_error_status_maps_to_characteristic_error() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let rx = characteristic(&connection, RX).await;
    platform.script(ADDRESS, MockRequest::ReadCharacteristic, MockResponse::Fail(GattStatus(5)));

    assert_eq!(
        connection.read_characteristic(&rx).await,
        Err(GattError::CharacteristicStatus {
            address: ADDRESS.into(),
            characteristic: RX,
            status: GattStatus(5),
            operation: GattOperationType::CharacteristicRead,
        })
    );
    // An attribute error does not break the link.
    assert_eq!(connection.state(), LinkState::Connected);
    assert!(connection.read_characteristic(&rx).await.is_ok());
}

#[tokio::test]
async fn test_descriptor_write_then_read() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let rx = characteristic(&connection, RX).await;
    let ccc = rx.descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID).unwrap().clone();

    assert_eq!(connection.write_descriptor(&ccc, &[1, 0]).await.unwrap(), vec![1, 0]);
    assert_eq!(connection.read_descriptor(&ccc).await.unwrap(), vec![1, 0]);

    platform.script(ADDRESS, MockRequest::ReadDescriptor, MockResponse::Fail(GattStatus(2)));
    assert!(matches!(
        connection.read_descriptor(&ccc).await,
        Err(GattError::DescriptorStatus {
            operation: GattOperationType::DescriptorRead,
            ..
        })
    ));
}

#[tokio::test]
async fn test_illegal_operation_is_rejected_before_queueing() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let rx = characteristic(&connection, RX).await;
    let tx = characteristic(&connection, TX).await;

    assert!(matches!(
        connection.write_characteristic(&rx, &[1]).await,
        Err(GattError::IllegalOperation { .. })
    ));
    assert!(matches!(
        connection.read_characteristic(&tx).await,
        Err(GattError::IllegalOperation { .. })
    ));
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 0);
    assert_eq!(platform.count(MockRequest::ReadCharacteristic), 0);
}

#[tokio::test]
async fn test_suppressed_check_lets_operation_through() {
    let platform = platform();
    let setup = ConnectionSetup::default().with_suppressed_illegal_operation_check(true);
    let (_client, _stream, connection) = connect(&platform, setup).await;
    let rx = characteristic(&connection, RX).await;

    assert!(connection.write_characteristic(&rx, &[1]).await.is_ok());
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 1);
}

// ----------------------------------------------------------------------------
// Queue Behaviour
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_timed_out_operation_releases_queue() {
    let platform = platform();
    let setup = ConnectionSetup::default().with_operation_timeout(Duration::from_secs(1));
    let (_client, _stream, connection) = connect(&platform, setup).await;
    let rx = characteristic(&connection, RX).await;
    platform.script(ADDRESS, MockRequest::ReadCharacteristic, MockResponse::Ignore);

    assert_eq!(
        connection.read_characteristic(&rx).await,
        Err(GattError::Timeout {
            address: ADDRESS.into(),
            operation: GattOperationType::CharacteristicRead,
            timeout: Duration::from_secs(1),
        })
    );
    assert_eq!(connection.read_characteristic(&rx).await.unwrap(), b"hello".to_vec());
    assert_eq!(connection.state(), LinkState::Connected);
}

#[tokio::test]
async fn test_refused_start_releases_queue() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Refuse);

    assert!(matches!(
        connection.write_characteristic(&tx, &[9]).await,
        Err(GattError::CannotStart {
            operation: GattOperationType::CharacteristicWrite,
            ..
        })
    ));
    assert_eq!(connection.write_characteristic(&tx, &[9]).await.unwrap(), vec![9]);
}

#[tokio::test]
async fn test_concurrent_reads_each_get_a_response() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let rx = characteristic(&connection, RX).await;

    let reads = (0..5).map(|_| connection.read_characteristic(&rx));
    let results = join_all(reads).await;

    assert!(results.iter().all(|result| result.as_deref() == Ok(&b"hello"[..])));
    assert_eq!(platform.count(MockRequest::ReadCharacteristic), 5);
}

// ----------------------------------------------------------------------------
// Link Parameters
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_read_rssi() {
    let platform = platform().with_peripheral(ADDRESS, peripheral().with_rssi(-42));
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    assert_eq!(connection.read_rssi().await, Ok(-42));
}

#[tokio::test]
async fn test_request_mtu_stores_negotiated_value() {
    let platform = platform().with_peripheral(ADDRESS, peripheral().with_max_mtu(185));
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    assert_eq!(connection.mtu(), 23);

    assert_eq!(connection.request_mtu(247).await, Ok(185));
    assert_eq!(connection.mtu(), 185);

    assert!(matches!(
        connection.request_mtu(22).await,
        Err(GattError::InvalidArgument(_))
    ));
    assert_eq!(platform.count(MockRequest::RequestMtu), 1);
}

#[tokio::test]
async fn test_peer_initiated_mtu_change_is_tracked() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    platform.deliver(
        ADDRESS,
        GattCallback::MtuChanged {
            status: GattStatus::SUCCESS,
            mtu: 100,
        },
    );
    eventually(|| connection.mtu() == 100).await;

    // A failed exchange does not stop tracking.
    platform.deliver(
        ADDRESS,
        GattCallback::MtuChanged {
            status: GattStatus(4),
            mtu: 23,
        },
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    platform.deliver(
        ADDRESS,
        GattCallback::MtuChanged {
            status: GattStatus::SUCCESS,
            mtu: 150,
        },
    );
    eventually(|| connection.mtu() == 150).await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_priority_holds_queue_for_settle_delay() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    let start = tokio::time::Instant::now();
    let (priority, rssi) = tokio::join!(
        connection.request_connection_priority(ConnectionPriority::High, Duration::from_millis(100)),
        connection.read_rssi(),
    );

    assert_eq!(priority, Ok(()));
    assert!(rssi.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(platform.calls().contains(&PlatformCall::RequestConnectionPriority {
        address: ADDRESS.into(),
        priority: ConnectionPriority::High,
    }));
}

#[tokio::test]
async fn test_connection_priority_rejects_zero_delay_and_refusal() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    assert!(matches!(
        connection
            .request_connection_priority(ConnectionPriority::LowPower, Duration::ZERO)
            .await,
        Err(GattError::InvalidArgument(_))
    ));

    platform.script(ADDRESS, MockRequest::ConnectionPriority, MockResponse::Refuse);
    assert!(matches!(
        connection
            .request_connection_priority(ConnectionPriority::LowPower, Duration::from_millis(1))
            .await,
        Err(GattError::CannotStart {
            operation: GattOperationType::ConnectionPriorityChange,
            ..
        })
    ));
}

// ----------------------------------------------------------------------------
// Custom Operations
// ----------------------------------------------------------------------------

/// Logs when it starts and finishes so overlap would be visible
struct Traced {
    label: &'static str,
    priority: Priority,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CustomOperation for Traced {
    type Output = &'static str;

    fn priority(&self) -> Priority {
        self.priority
    }

    async fn run(
        self: Box<Self>,
        _link: Arc<dyn GattLink>,
        _router: Arc<GattEventRouter>,
        emitter: OperationEmitter<&'static str>,
        release: QueueRelease,
    ) {
        self.log.lock().unwrap().push(format!("start {}", self.label));
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.log.lock().unwrap().push(format!("end {}", self.label));
        release.release();
        emitter.emit(self.label);
    }
}

/// Reads the RSSI twice through the raw link within one queue slot
struct DoubleRssi;

#[async_trait]
impl CustomOperation for DoubleRssi {
    type Output = i16;

    async fn run(
        self: Box<Self>,
        link: Arc<dyn GattLink>,
        router: Arc<GattEventRouter>,
        emitter: OperationEmitter<i16>,
        release: QueueRelease,
    ) {
        let mut readings = router.on_rssi_read();
        for _ in 0..2 {
            if link.read_remote_rssi().is_err() {
                break;
            }
            match readings.next().await {
                Some(result) => {
                    emitter.send(result);
                }
                None => break,
            }
        }
        release.release();
    }
}

#[tokio::test]
async fn test_custom_operations_never_overlap() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    let streams = ["a", "b", "c"].map(|label| {
        connection.queue(Traced {
            label,
            priority: Priority::Normal,
            log: log.clone(),
        })
    });
    let results = join_all(streams.into_iter().map(|stream| stream.single())).await;

    assert_eq!(results, vec![Ok("a"), Ok("b"), Ok("c")]);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start a", "end a", "start b", "end b", "start c", "end c"]
    );
}

#[tokio::test]
async fn test_high_priority_custom_operation_runs_first() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let log = Arc::new(Mutex::new(Vec::new()));

    let traced = |label, priority| Traced {
        label,
        priority,
        log: log.clone(),
    };
    let first = connection.queue(traced("first", Priority::Normal));
    eventually(|| !log.lock().unwrap().is_empty()).await;
    let normal = connection.queue(traced("normal", Priority::Normal));
    let urgent = connection.queue(traced("urgent", Priority::High));

    let _ = tokio::join!(first.single(), normal.single(), urgent.single());

    let starts: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with("start"))
        .cloned()
        .collect();
    assert_eq!(starts, vec!["start first", "start urgent", "start normal"]);
}

#[tokio::test]
async fn test_custom_operation_can_emit_several_values() {
    let platform = platform().with_peripheral(ADDRESS, peripheral().with_rssi(-70));
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;

    let readings: Vec<_> = connection.queue(DoubleRssi).collect().await;

    assert_eq!(readings, vec![Ok(-70), Ok(-70)]);
    assert_eq!(platform.count(MockRequest::ReadRssi), 2);
}
