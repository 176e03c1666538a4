//! GATT Client Coordination Core
//!
//! Turns a single, strictly serial, callback-driven Bluetooth Low Energy link
//! into independently awaitable and cancelable asynchronous operations.
//!
//! The crate is organised leaves first:
//!
//! - [`platform`]: the consumed radio capability (`GattPlatform`, `GattLink`)
//!   and the raw callback vocabulary the platform reports back with.
//! - [`disconnection`]: a latch that turns adapter and link failures into one
//!   terminal error replayed to every consumer of a link.
//! - [`router`]: demultiplexes raw callbacks into typed per-category streams,
//!   each merged with the link failure signal.
//! - [`state`]: the connection state machine.
//! - [`queue`]: priority FIFO executors enforcing one in-flight operation.
//! - [`operations`]: the queued GATT operations themselves.
//! - [`notification`]: shared notification / indication subscriptions.
//! - [`long_write`]: chunked characteristic writes with ack and retry policies.
//! - [`connection`] and [`client`]: the application-facing surface.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod config;
pub mod connection;
pub mod disconnection;
pub mod error;
pub mod illegal;
pub mod long_write;
pub mod notification;
pub mod operations;
pub mod platform;
pub mod queue;
pub mod router;
pub mod state;
pub mod types;

mod relay;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{ConnectionStream, Device, GattClient};
pub use config::{ConnectMode, ConnectionSetup};
pub use connection::Connection;
pub use disconnection::DisconnectionRouter;
pub use error::{GattError, GattOperationType, GattStatus, PlatformError};
pub use long_write::{
    AckPolicy, DelayedAck, ImmediateAck, LongWriteBuilder, LongWriteFailure, LongWriteOptions,
    NoRetry, RetryAttempts, RetryPolicy,
};
pub use notification::{NotificationKind, NotificationManager, NotificationSetupMode, Notifications};
pub use operations::CustomOperation;
pub use platform::{AdapterState, GattCallback, GattCallbackSink, GattLink, GattPlatform};
pub use queue::{Operation, OperationEmitter, OperationQueue, OperationStream, Priority, QueueRelease};
pub use router::{EventStream, GattEventRouter};
pub use state::{ConnectionStateMachine, LinkState};
pub use types::{
    Characteristic, CharacteristicId, CharacteristicProperties, ConnectionParameters, ConnectionPriority, Descriptor,
    GattServices, Service, WriteType,
};

/// Result alias used across the crate
pub type Result<T> = core::result::Result<T, GattError>;
