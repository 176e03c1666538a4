//! Long-write coordinator tests

mod test_utils;

use gattlink_core::testing::{MockRequest, MockResponse};
use gattlink_core::{
    ConnectionSetup, DelayedAck, GattError, GattOperationType, GattStatus, LongWriteOptions, RetryAttempts,
};
use proptest::prelude::*;
use std::time::Duration;
use test_utils::*;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[tokio::test]
async fn test_payload_is_split_into_batches() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    let data = payload(50);

    let written = connection
        .long_write()
        .with_characteristic(tx)
        .with_bytes(data.clone())
        .with_max_batch_size(20)
        .execute()
        .await
        .unwrap();

    assert_eq!(written, data);
    let batches = written_values(&platform);
    assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![20, 20, 10]);
    assert_eq!(batches.concat(), data);
}

#[tokio::test]
async fn test_default_batch_size_follows_mtu() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;

    connection
        .write_long(&tx, &payload(45), LongWriteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        written_values(&platform).iter().map(Vec::len).collect::<Vec<_>>(),
        vec![20, 20, 5]
    );

    connection.request_mtu(100).await.unwrap();
    connection
        .write_long(&tx, &payload(45), LongWriteOptions::default())
        .await
        .unwrap();
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 4);
}

#[tokio::test]
async fn test_failed_batch_is_retried_once() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    let data = payload(60);
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Succeed);
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Fail(GattStatus(133)));

    let written = connection
        .long_write()
        .with_characteristic(tx)
        .with_bytes(data.clone())
        .with_max_batch_size(20)
        .with_retry_policy(RetryAttempts::new(1))
        .execute()
        .await
        .unwrap();

    assert_eq!(written, data);
    let batches = written_values(&platform);
    assert_eq!(batches.len(), 4);
    assert_eq!(batches[1], batches[2]);
    assert_eq!(batches[1], data[20..40].to_vec());
}

#[tokio::test]
async fn test_failed_batch_without_retry_aborts() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Succeed);
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Fail(GattStatus(133)));

    let error = connection
        .long_write()
        .with_characteristic(tx)
        .with_bytes(payload(60))
        .with_max_batch_size(20)
        .execute()
        .await
        .unwrap_err();

    assert_eq!(
        error,
        GattError::CharacteristicStatus {
            address: ADDRESS.into(),
            characteristic: TX,
            status: GattStatus(133),
            operation: GattOperationType::CharacteristicWrite,
        }
    );
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 2);
}

#[tokio::test]
async fn test_exhausted_retries_abort() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    for _ in 0..3 {
        platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Refuse);
    }

    let error = connection
        .long_write()
        .with_characteristic(tx)
        .with_bytes(payload(30))
        .with_max_batch_size(20)
        .with_retry_policy(RetryAttempts::new(2))
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        GattError::CannotStart {
            operation: GattOperationType::CharacteristicLongWrite,
            ..
        }
    ));
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 3);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_ack_spaces_batches() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;

    let start = tokio::time::Instant::now();
    connection
        .long_write()
        .with_characteristic(tx)
        .with_bytes(payload(60))
        .with_max_batch_size(20)
        .with_ack_policy(DelayedAck(Duration::from_millis(100)))
        .execute()
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(300));
}

#[tokio::test]
async fn test_empty_payload_writes_nothing() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;

    let written = connection
        .long_write()
        .with_characteristic(tx)
        .execute()
        .await
        .unwrap();

    assert!(written.is_empty());
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 0);
}

#[tokio::test]
async fn test_invalid_long_writes_are_rejected() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;

    assert!(matches!(
        connection.long_write().with_bytes(payload(4)).execute().await,
        Err(GattError::InvalidArgument(_))
    ));
    assert!(matches!(
        connection
            .long_write()
            .with_characteristic(tx)
            .with_bytes(payload(4))
            .with_max_batch_size(0)
            .execute()
            .await,
        Err(GattError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_disconnect_aborts_long_write() {
    let platform = platform();
    let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
    let tx = characteristic(&connection, TX).await;
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Succeed);
    platform.script(ADDRESS, MockRequest::WriteCharacteristic, MockResponse::Ignore);

    let write = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .long_write()
                .with_characteristic(tx)
                .with_bytes(payload(60))
                .with_max_batch_size(20)
                .with_retry_policy(RetryAttempts::new(5))
                .execute()
                .await
        }
    });
    eventually(|| platform.count(MockRequest::WriteCharacteristic) == 2).await;
    platform.disconnect_from_peer(ADDRESS, GattStatus(8));

    assert!(write.await.unwrap().unwrap_err().is_disconnection());
    assert_eq!(platform.count(MockRequest::WriteCharacteristic), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: every byte is written exactly once, in order, in full batches
    #[test]
    fn batches_cover_payload(len in 0usize..300, batch_size in 1usize..40) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (written, batches) = runtime.block_on(async {
            let platform = platform();
            let (_client, _stream, connection) = connect(&platform, ConnectionSetup::default()).await;
            let tx = characteristic(&connection, TX).await;
            let written = connection
                .long_write()
                .with_characteristic(tx)
                .with_bytes(payload(len))
                .with_max_batch_size(batch_size)
                .execute()
                .await
                .unwrap();
            (written, written_values(&platform))
        });

        prop_assert_eq!(&written, &payload(len));
        prop_assert_eq!(batches.concat(), payload(len));
        prop_assert_eq!(batches.len(), len.div_ceil(batch_size));
        prop_assert!(batches.iter().all(|batch| batch.len() <= batch_size));
    }
}
