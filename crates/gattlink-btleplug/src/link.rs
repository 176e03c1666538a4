//! btleplug-backed link
//!
//! Each start call clones the peripheral handle and spawns the btleplug
//! future on the runtime the platform was created on. The outcome is
//! reported through the callback sink exactly like a radio stack callback.

use crate::attributes::{convert_services, AttributeMap};
use crate::error::{platform_error, status_of};
use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Peripheral as _, ScanFilter, ValueNotification,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use core::fmt;
use core::future::Future;
use core::time::Duration;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use gattlink_core::{
    Characteristic, CharacteristicId, ConnectMode, ConnectionPriority, Descriptor, GattCallback, GattCallbackSink,
    GattLink, GattServices, GattStatus, LinkState, PlatformError, WriteType,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const AUTO_CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Shared Link State
// ----------------------------------------------------------------------------

struct Shared {
    address: String,
    adapter: Adapter,
    sink: GattCallbackSink,
    peripheral: OnceLock<Peripheral>,
    attributes: Mutex<AttributeMap>,
    notifying: Mutex<HashSet<CharacteristicId>>,
    disconnected: AtomicBool,
}

impl Shared {
    /// Report the link as gone once, whichever path notices first
    fn report_disconnected(&self, status: GattStatus) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.sink.deliver(GattCallback::ConnectionStateChanged {
                status,
                state: LinkState::Disconnected,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

pub struct BtleLink {
    shared: Arc<Shared>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BtleLink {
    /// Start connecting to `address`; CONNECTED is reported through `sink`
    pub(crate) fn open(
        adapter: Adapter,
        runtime: Handle,
        address: &str,
        mode: ConnectMode,
        sink: GattCallbackSink,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            shared: Arc::new(Shared {
                address: address.to_string(),
                adapter,
                sink,
                peripheral: OnceLock::new(),
                attributes: Mutex::new(AttributeMap::default()),
                notifying: Mutex::new(HashSet::new()),
                disconnected: AtomicBool::new(true),
            }),
            runtime,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        link.spawn(run_link(link.shared.clone(), mode));
        link
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.spawn(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    fn connected(&self) -> Result<Peripheral, PlatformError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlatformError::new("link closed"));
        }
        self.shared
            .peripheral
            .get()
            .cloned()
            .ok_or_else(|| PlatformError::new("link not connected"))
    }

    fn handle(&self, id: CharacteristicId) -> Result<BtleCharacteristic, PlatformError> {
        lock(&self.shared.attributes)
            .characteristic(id)
            .cloned()
            .ok_or_else(|| PlatformError::new(format!("characteristic {id} not discovered")))
    }
}

impl fmt::Debug for BtleLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleLink")
            .field("address", &self.shared.address)
            .field("disconnected", &self.shared.disconnected.load(Ordering::Acquire))
            .finish()
    }
}

impl GattLink for BtleLink {
    fn address(&self) -> &str {
        &self.shared.address
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let shared = self.shared.clone();
        self.spawn(async move {
            let callback = match peripheral.discover_services().await {
                Ok(()) => {
                    let (services, attributes) = convert_services(&peripheral.services());
                    *lock(&shared.attributes) = attributes;
                    GattCallback::ServicesDiscovered {
                        status: GattStatus::SUCCESS,
                        services,
                    }
                }
                Err(err) => {
                    debug!(address = %shared.address, %err, "Service discovery failed");
                    GattCallback::ServicesDiscovered {
                        status: status_of(&err),
                        services: GattServices::default(),
                    }
                }
            };
            shared.sink.deliver(callback);
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let id = characteristic.id();
        let target = self.handle(id)?;
        let sink = self.shared.sink.clone();
        self.spawn(async move {
            let callback = match peripheral.read(&target).await {
                Ok(value) => GattCallback::CharacteristicRead {
                    status: GattStatus::SUCCESS,
                    characteristic: id,
                    value,
                },
                Err(err) => GattCallback::CharacteristicRead {
                    status: status_of(&err),
                    characteristic: id,
                    value: Vec::new(),
                },
            };
            sink.deliver(callback);
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let id = characteristic.id();
        let target = self.handle(id)?;
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            // btleplug has no signed writes.
            WriteType::WithoutResponse | WriteType::Signed => BtleWriteType::WithoutResponse,
        };
        let value = value.to_vec();
        let sink = self.shared.sink.clone();
        self.spawn(async move {
            trace!(characteristic = %id, value = %hex::encode(&value), "Writing");
            let status = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(err) => status_of(&err),
            };
            sink.deliver(GattCallback::CharacteristicWrite {
                status,
                characteristic: id,
                value,
            });
        });
        Ok(())
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let target = lock(&self.shared.attributes)
            .descriptor(descriptor.characteristic, descriptor.uuid)
            .cloned()
            .ok_or_else(|| PlatformError::new(format!("descriptor {} not discovered", descriptor.uuid)))?;
        let descriptor = descriptor.clone();
        let sink = self.shared.sink.clone();
        self.spawn(async move {
            let (status, value) = match peripheral.read_descriptor(&target).await {
                Ok(value) => (GattStatus::SUCCESS, value),
                Err(err) => (status_of(&err), Vec::new()),
            };
            sink.deliver(GattCallback::DescriptorRead {
                status,
                descriptor,
                value,
            });
        });
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let target = lock(&self.shared.attributes)
            .descriptor(descriptor.characteristic, descriptor.uuid)
            .cloned()
            .ok_or_else(|| PlatformError::new(format!("descriptor {} not discovered", descriptor.uuid)))?;
        let descriptor = descriptor.clone();
        let value = value.to_vec();
        let sink = self.shared.sink.clone();
        self.spawn(async move {
            let status = match peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(err) => status_of(&err),
            };
            sink.deliver(GattCallback::DescriptorWrite {
                status,
                descriptor,
                value,
            });
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let id = characteristic.id();
        let target = self.handle(id)?;
        {
            let mut notifying = lock(&self.shared.notifying);
            if enable {
                notifying.insert(id);
            } else {
                notifying.remove(&id);
            }
        }

        self.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(err) = result {
                warn!(characteristic = %id, enable, %err, "Failed to change subscription");
            }
        });
        Ok(())
    }

    fn read_remote_rssi(&self) -> Result<(), PlatformError> {
        let peripheral = self.connected()?;
        let sink = self.shared.sink.clone();
        self.spawn(async move {
            let callback = match peripheral.properties().await {
                Ok(properties) => match properties.and_then(|properties| properties.rssi) {
                    Some(rssi) => GattCallback::RemoteRssiRead {
                        status: GattStatus::SUCCESS,
                        rssi,
                    },
                    None => GattCallback::RemoteRssiRead {
                        status: GattStatus::FAILURE,
                        rssi: 0,
                    },
                },
                Err(err) => GattCallback::RemoteRssiRead {
                    status: status_of(&err),
                    rssi: 0,
                },
            };
            sink.deliver(callback);
        });
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), PlatformError> {
        Err(PlatformError::new("MTU requests are not supported by btleplug"))
    }

    fn request_connection_priority(&self, _priority: ConnectionPriority) -> Result<(), PlatformError> {
        Err(PlatformError::new("connection priority is not supported by btleplug"))
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        let Some(peripheral) = self.shared.peripheral.get().cloned() else {
            // Still connecting: stop trying.
            self.abort_tasks();
            self.shared.report_disconnected(GattStatus::SUCCESS);
            return Ok(());
        };

        let shared = self.shared.clone();
        self.spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => shared.report_disconnected(GattStatus::SUCCESS),
                Err(err) => {
                    warn!(address = %shared.address, %err, "Disconnect failed");
                    shared.report_disconnected(status_of(&err));
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(address = %self.shared.address, "Closing link");
            self.abort_tasks();
        }
    }

    fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ----------------------------------------------------------------------------
// Link Tasks
// ----------------------------------------------------------------------------

/// Connect, then pump notifications and watch for link loss until aborted
async fn run_link(shared: Arc<Shared>, mode: ConnectMode) {
    let peripheral = match connect(&shared.adapter, &shared.address, mode).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!(address = %shared.address, %err, "Connect failed");
            shared.report_disconnected(status_of(&err));
            return;
        }
    };

    // Subscribe to both streams before reporting the link as up.
    let notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(err) => {
            warn!(address = %shared.address, %err, "No notification stream");
            stream::empty().boxed()
        }
    };
    let events = match shared.adapter.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!(address = %shared.address, %err, "No adapter event stream");
            stream::pending().boxed()
        }
    };

    let id = peripheral.id();
    let _ = shared.peripheral.set(peripheral);
    shared.disconnected.store(false, Ordering::Release);
    info!(address = %shared.address, "Link up");
    shared.sink.deliver(GattCallback::ConnectionStateChanged {
        status: GattStatus::SUCCESS,
        state: LinkState::Connected,
    });

    tokio::join!(
        pump_notifications(&shared, notifications),
        watch_disconnects(&shared, events, id),
    );
}

async fn connect(adapter: &Adapter, address: &str, mode: ConnectMode) -> Result<Peripheral, btleplug::Error> {
    let peripheral = find_peripheral(adapter, address).await?;
    loop {
        match peripheral.connect().await {
            Ok(()) => return Ok(peripheral),
            Err(err) if mode == ConnectMode::Auto => {
                debug!(%address, %err, "Peripheral not reachable, retrying");
                tokio::time::sleep(AUTO_CONNECT_RETRY_INTERVAL).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Look the peripheral up among known devices, scanning until it shows up
async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral, btleplug::Error> {
    let mut scanning = false;
    loop {
        for peripheral in adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                if scanning {
                    if let Err(err) = adapter.stop_scan().await {
                        debug!(%err, "Failed to stop scan");
                    }
                }
                return Ok(peripheral);
            }
        }
        if !scanning {
            debug!(%address, "Peripheral unknown, scanning");
            adapter.start_scan(ScanFilter::default()).await?;
            scanning = true;
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }
}

async fn pump_notifications(shared: &Shared, mut notifications: BoxStream<'static, ValueNotification>) {
    while let Some(notification) = notifications.next().await {
        let id = lock(&shared.attributes).resolve(notification.uuid);
        match id {
            Some(id) if lock(&shared.notifying).contains(&id) => {
                shared.sink.deliver(GattCallback::CharacteristicChanged {
                    characteristic: id,
                    value: notification.value,
                });
            }
            _ => trace!(uuid = %notification.uuid, "Dropping value of unsubscribed characteristic"),
        }
    }
    debug!(address = %shared.address, "Notification stream ended");
}

async fn watch_disconnects(shared: &Shared, mut events: BoxStream<'static, CentralEvent>, id: PeripheralId) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected == id {
                info!(address = %shared.address, "Peripheral disconnected");
                shared.report_disconnected(GattStatus::UNKNOWN);
                return;
            }
        }
    }
}
