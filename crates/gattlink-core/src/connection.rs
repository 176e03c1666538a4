//! Application-facing connection
//!
//! A [`Connection`] bundles the link handle, its event router, its operation
//! queue and its notification manager. Every method queues an operation on
//! the link's queue, so callers may use a connection from many tasks at once.

use crate::config::{
    max_write_payload, ConnectionSetup, DEFAULT_DISCOVERY_TIMEOUT, GATT_MTU_MAXIMUM, GATT_MTU_MINIMUM,
};
use crate::error::GattError;
use crate::illegal::IllegalOperationChecker;
use crate::long_write::{LongWriteBuilder, LongWriteCoordinator, LongWriteOptions};
use crate::notification::{NotificationKind, NotificationManager, NotificationSetupMode, Notifications};
use crate::operations::{
    CharacteristicRead, CharacteristicWrite, ConnectionPriorityOperation, CustomAdapter, CustomOperation,
    DescriptorRead, DescriptorWrite, GattRequest, MtuRequest, ReadRssi, ServiceDiscovery, SingleResponse,
};
use crate::platform::GattLink;
use crate::queue::{OperationQueue, OperationStream};
use crate::router::{EventStream, GattEventRouter};
use crate::state::LinkState;
use crate::types::{Characteristic, ConnectionParameters, ConnectionPriority, Descriptor, GattServices};
use crate::Result;
use core::fmt;
use core::time::Duration;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

struct ConnectionInner {
    setup: ConnectionSetup,
    link: Arc<dyn GattLink>,
    router: Arc<GattEventRouter>,
    queue: OperationQueue,
    notifications: Arc<NotificationManager>,
    services: tokio::sync::Mutex<Option<GattServices>>,
    mtu: Arc<AtomicU16>,
    checker: IllegalOperationChecker,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Handle to an established link
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(setup: ConnectionSetup, link: Arc<dyn GattLink>, router: Arc<GattEventRouter>) -> Self {
        let queue = OperationQueue::new(format!("connection {}", router.address()));
        let notifications =
            NotificationManager::new(link.clone(), router.clone(), queue.clone(), setup.operation_timeout);
        let mtu = Arc::new(AtomicU16::new(GATT_MTU_MINIMUM));

        let tasks = vec![
            tokio::spawn(terminate_on_disconnect(
                router.disconnection().wait(),
                queue.clone(),
                Arc::downgrade(&notifications),
            )),
            tokio::spawn(watch_mtu(router.clone(), router.on_mtu_changed(), mtu.clone())),
        ];

        Self {
            inner: Arc::new(ConnectionInner {
                checker: IllegalOperationChecker::new(setup.suppress_illegal_operation_check),
                setup,
                link,
                router,
                queue,
                notifications,
                services: tokio::sync::Mutex::new(None),
                mtu,
                tasks,
            }),
        }
    }

    pub fn address(&self) -> &str {
        self.inner.router.address()
    }

    pub fn setup(&self) -> &ConnectionSetup {
        &self.inner.setup
    }

    pub fn state(&self) -> LinkState {
        self.inner.router.state().current()
    }

    /// Current link state followed by every change
    pub fn observe_state(&self) -> BoxStream<'static, LinkState> {
        self.inner.router.state().observe()
    }

    /// Resolves with the error that ended the link
    pub fn observe_disconnect(&self) -> BoxFuture<'static, GattError> {
        self.inner.router.disconnection().wait()
    }

    /// Negotiated MTU, updated from every successful MTU exchange
    pub fn mtu(&self) -> u16 {
        self.inner.mtu.load(Ordering::Acquire)
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.inner.notifications
    }

    fn request<R: GattRequest>(&self, request: R, timeout: Duration) -> OperationStream<R::Output> {
        let inner = &self.inner;
        inner.queue.enqueue(SingleResponse::new(
            request,
            inner.link.clone(),
            inner.router.clone(),
            timeout,
        ))
    }

    async fn single<R: GattRequest>(&self, request: R) -> Result<R::Output> {
        self.request(request, self.inner.setup.operation_timeout)
            .single()
            .await
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    /// Discover the attribute tree once and cache it
    pub async fn discover_services(&self, timeout: Duration) -> Result<GattServices> {
        let mut cached = self.inner.services.lock().await;
        if let Some(services) = cached.as_ref() {
            return Ok(services.clone());
        }
        let services = self.request(ServiceDiscovery, timeout).single().await?;
        debug!(address = %self.address(), count = services.services().len(), "Services discovered");
        *cached = Some(services.clone());
        Ok(services)
    }

    pub async fn services(&self) -> Result<GattServices> {
        self.discover_services(DEFAULT_DISCOVERY_TIMEOUT).await
    }

    /// First characteristic with `uuid` in the discovered tree
    pub async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.services().await?.characteristic(uuid).cloned()
    }

    // ------------------------------------------------------------------------
    // Attribute Access
    // ------------------------------------------------------------------------

    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.inner.checker.check_read(characteristic)?;
        self.single(CharacteristicRead::new(characteristic.clone())).await
    }

    /// Write `value` and resolve with the value echoed by the platform
    pub async fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> Result<Vec<u8>> {
        self.inner.checker.check_write(characteristic)?;
        self.single(CharacteristicWrite::new(characteristic.clone(), value.to_vec()))
            .await
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.single(DescriptorRead::new(descriptor.clone())).await
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<Vec<u8>> {
        self.single(DescriptorWrite::new(descriptor.clone(), value.to_vec()))
            .await
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    pub async fn subscribe(
        &self,
        characteristic: &Characteristic,
        kind: NotificationKind,
        mode: NotificationSetupMode,
    ) -> Result<Notifications> {
        self.inner.checker.check_subscription(characteristic, kind)?;
        self.inner.notifications.setup(characteristic, kind, mode).await
    }

    pub async fn setup_notification(
        &self,
        characteristic: &Characteristic,
        mode: NotificationSetupMode,
    ) -> Result<Notifications> {
        self.subscribe(characteristic, NotificationKind::Notification, mode)
            .await
    }

    pub async fn setup_indication(
        &self,
        characteristic: &Characteristic,
        mode: NotificationSetupMode,
    ) -> Result<Notifications> {
        self.subscribe(characteristic, NotificationKind::Indication, mode)
            .await
    }

    // ------------------------------------------------------------------------
    // Long Writes
    // ------------------------------------------------------------------------

    pub fn long_write(&self) -> LongWriteBuilder {
        LongWriteBuilder::new(self.clone())
    }

    /// Write a payload of any length in MTU-sized batches
    pub async fn write_long(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        options: LongWriteOptions,
    ) -> Result<Vec<u8>> {
        self.inner.checker.check_write(characteristic)?;
        let batch_size = options
            .max_batch_size
            .unwrap_or_else(|| max_write_payload(self.mtu()));
        let coordinator = LongWriteCoordinator {
            queue: self.inner.queue.clone(),
            link: self.inner.link.clone(),
            router: self.inner.router.clone(),
            operation_timeout: self.inner.setup.operation_timeout,
        };
        coordinator
            .write(characteristic, payload, batch_size, &options)
            .await
    }

    // ------------------------------------------------------------------------
    // Link Parameters
    // ------------------------------------------------------------------------

    pub async fn read_rssi(&self) -> Result<i16> {
        self.single(ReadRssi).await
    }

    /// Every later connection parameter update; ends with the error that ends the link
    pub fn observe_connection_parameters(&self) -> EventStream<ConnectionParameters> {
        self.inner.router.on_connection_parameters_updated()
    }

    /// Ask for a link budget and wait `settle_delay` before the next operation
    pub async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
        settle_delay: Duration,
    ) -> Result<()> {
        if settle_delay.is_zero() {
            return Err(GattError::InvalidArgument(
                "settle delay must be greater than zero".into(),
            ));
        }
        self.inner
            .queue
            .enqueue(ConnectionPriorityOperation::new(
                self.inner.link.clone(),
                priority,
                settle_delay,
            ))
            .single()
            .await
    }

    /// Negotiate a new MTU; resolves with the MTU the peripheral accepted
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        if !(GATT_MTU_MINIMUM..=GATT_MTU_MAXIMUM).contains(&mtu) {
            return Err(GattError::InvalidArgument(format!(
                "MTU must be within {GATT_MTU_MINIMUM}..={GATT_MTU_MAXIMUM}, got {mtu}"
            )));
        }
        let negotiated = self.single(MtuRequest::new(mtu)).await?;
        self.inner.mtu.store(negotiated, Ordering::Release);
        Ok(negotiated)
    }

    // ------------------------------------------------------------------------
    // Custom Operations
    // ------------------------------------------------------------------------

    /// Run caller-defined work with exclusive use of the link
    pub fn queue<C: CustomOperation>(&self, operation: C) -> OperationStream<C::Output> {
        let inner = &self.inner;
        inner
            .queue
            .enqueue(CustomAdapter::new(operation, inner.link.clone(), inner.router.clone()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("mtu", &self.mtu())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Background Tasks
// ----------------------------------------------------------------------------

async fn terminate_on_disconnect(
    disconnected: BoxFuture<'static, GattError>,
    queue: OperationQueue,
    notifications: Weak<NotificationManager>,
) {
    let error = disconnected.await;
    queue.terminate(error);
    if let Some(notifications) = notifications.upgrade() {
        notifications.abandon_all();
    }
}

async fn watch_mtu(router: Arc<GattEventRouter>, mut changes: EventStream<u16>, mtu: Arc<AtomicU16>) {
    loop {
        while let Some(change) = changes.next().await {
            match change {
                Ok(value) => mtu.store(value, Ordering::Release),
                Err(_) => break,
            }
        }
        // A failed MTU exchange ends the category stream; only a broken link stops the watcher.
        if router.disconnection().is_latched() {
            return;
        }
        changes = router.on_mtu_changed();
    }
}
