//! Client and device surface
//!
//! The [`GattClient`] owns the platform and the process-wide queue that
//! serialises link establishment and teardown. A [`Device`] establishes at
//! most one connection at a time.

use crate::config::ConnectionSetup;
use crate::connection::Connection;
use crate::disconnection::DisconnectionRouter;
use crate::error::{GattError, GattStatus};
use crate::operations::{ConnectOperation, DisconnectOperation, LinkSlot};
use crate::platform::{AdapterState, GattPlatform};
use crate::queue::OperationQueue;
use crate::relay::lock;
use crate::router::GattEventRouter;
use crate::state::{ConnectionStateMachine, LinkState};
use crate::Result;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

struct ClientInner {
    platform: Arc<dyn GattPlatform>,
    queue: OperationQueue,
    devices: Mutex<HashMap<String, Device>>,
}

/// Entry point: hands out devices backed by one platform
#[derive(Clone)]
pub struct GattClient {
    inner: Arc<ClientInner>,
}

impl GattClient {
    /// Must be called from within a Tokio runtime
    pub fn new(platform: Arc<dyn GattPlatform>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                platform,
                queue: OperationQueue::new("client"),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Device handle for `address`; the same handle is returned for the same address
    pub fn device(&self, address: &str) -> Device {
        let address = address.to_uppercase();
        lock(&self.inner.devices)
            .entry(address.clone())
            .or_insert_with(|| Device {
                inner: Arc::new(DeviceInner {
                    address,
                    platform: self.inner.platform.clone(),
                    queue: self.inner.queue.clone(),
                    connecting: AtomicBool::new(false),
                    state: Mutex::new(None),
                }),
            })
            .clone()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.platform.adapter_state()
    }

    /// Queue shared by connection establishment and teardown
    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }
}

impl fmt::Debug for GattClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattClient")
            .field("devices", &lock(&self.inner.devices).len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

struct DeviceInner {
    address: String,
    platform: Arc<dyn GattPlatform>,
    queue: OperationQueue,
    connecting: AtomicBool,
    state: Mutex<Option<Arc<ConnectionStateMachine>>>,
}

/// A remote peripheral
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// State of the latest connection attempt
    pub fn state(&self) -> LinkState {
        lock(&self.inner.state)
            .as_ref()
            .map_or(LinkState::Disconnected, |machine| machine.current())
    }

    /// Connect and keep the link up while the returned stream is held
    ///
    /// The stream yields the connection once, then an error when the link
    /// breaks. Dropping it disconnects and closes the link.
    pub fn establish_connection(&self, setup: ConnectionSetup) -> ConnectionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = ConnectionStream { rx };

        if let Err(err) = setup.validate() {
            let _ = tx.send(Err(err));
            return stream;
        }
        if self.inner.connecting.swap(true, Ordering::AcqRel) {
            let _ = tx.send(Err(GattError::AlreadyConnected {
                address: self.inner.address.clone(),
            }));
            return stream;
        }

        tokio::spawn(run_connection(self.inner.clone(), setup, tx));
        stream
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the device's in-progress flag when a connection attempt ends
struct ConnectingFlag(Arc<DeviceInner>);

impl Drop for ConnectingFlag {
    fn drop(&mut self) {
        self.0.connecting.store(false, Ordering::Release);
    }
}

async fn run_connection(device: Arc<DeviceInner>, setup: ConnectionSetup, tx: mpsc::UnboundedSender<Result<Connection>>) {
    let _flag = ConnectingFlag(device.clone());
    let address = device.address.clone();

    let disconnection = DisconnectionRouter::new(address.clone());
    disconnection.monitor_adapter(
        device.platform.adapter_state().is_usable(),
        device.platform.adapter_states(),
    );
    let state = Arc::new(ConnectionStateMachine::new(address.clone()));
    *lock(&device.state) = Some(state.clone());
    let router = Arc::new(GattEventRouter::new(address.clone(), disconnection.clone(), state));
    let slot = LinkSlot::default();

    let connect = ConnectOperation::new(device.platform.clone(), setup.clone(), router.clone(), slot.clone());
    let connected = tokio::select! {
        result = device.queue.enqueue(connect).single() => Some(result),
        _ = tx.closed() => None,
    };

    match connected {
        Some(Ok(link)) => {
            let connection = Connection::new(setup.clone(), link, router.clone());
            if tx.send(Ok(connection)).is_ok() {
                tokio::select! {
                    error = disconnection.wait() => {
                        let _ = tx.send(Err(error));
                    }
                    _ = tx.closed() => {
                        debug!(%address, "Connection released by caller");
                    }
                }
            }
        }
        Some(Err(error)) => {
            let _ = tx.send(Err(error));
        }
        None => debug!(%address, "Connection attempt cancelled"),
    }

    // Everything still queued on the link fails from here on.
    disconnection.on_disconnected(GattStatus::UNKNOWN);

    let disconnect = DisconnectOperation::new(router, slot, setup.disconnect_timeout);
    if let Err(err) = device.queue.enqueue(disconnect).single().await {
        warn!(%address, %err, "Disconnect failed");
    }
    info!(%address, "Connection closed");
}

// ----------------------------------------------------------------------------
// Connection Stream
// ----------------------------------------------------------------------------

/// Result of [`Device::establish_connection`]
pub struct ConnectionStream {
    rx: mpsc::UnboundedReceiver<Result<Connection>>,
}

impl ConnectionStream {
    /// Wait for the connection to be established
    pub async fn connected(&mut self) -> Result<Connection> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(GattError::QueueTerminated {
                reason: "connection attempt ended".into(),
            }),
        }
    }
}

impl Stream for ConnectionStream {
    type Item = Result<Connection>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for ConnectionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStream").finish_non_exhaustive()
    }
}
