//! Single-response GATT operations
//!
//! Each request subscribes to its router category before starting the
//! platform call, waits for the matching callback under a timeout, releases
//! the queue and only then emits the outcome.

use crate::error::{GattError, GattOperationType, GattStatus, PlatformError};
use crate::platform::GattLink;
use crate::queue::{Operation, OperationEmitter, QueueRelease};
use crate::router::{matching, EventStream, GattEventRouter};
use crate::types::{Characteristic, Descriptor, GattServices, WriteType};
use crate::Result;
use async_trait::async_trait;
use core::fmt;
use core::time::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// A platform request answered by exactly one callback
pub trait GattRequest: fmt::Debug + Send + Sync + 'static {
    type Output: Send + 'static;

    fn operation(&self) -> GattOperationType;

    /// Stream the matching callback will arrive on
    fn subscribe(&self, router: &GattEventRouter) -> EventStream<Self::Output>;

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError>;
}

// ----------------------------------------------------------------------------
// Single Response Operation
// ----------------------------------------------------------------------------

/// Queue operation driving one [`GattRequest`]
pub struct SingleResponse<R> {
    request: R,
    link: Arc<dyn GattLink>,
    router: Arc<GattEventRouter>,
    timeout: Duration,
}

impl<R: GattRequest> SingleResponse<R> {
    pub fn new(request: R, link: Arc<dyn GattLink>, router: Arc<GattEventRouter>, timeout: Duration) -> Self {
        Self {
            request,
            link,
            router,
            timeout,
        }
    }

    async fn execute(&self) -> Result<R::Output> {
        let operation = self.request.operation();
        if let Some(err) = self.router.disconnection().current() {
            return Err(err);
        }
        let mut events = self.request.subscribe(&self.router);

        if let Err(err) = self.request.start(self.link.as_ref()) {
            return Err(GattError::CannotStart {
                address: self.router.address().to_string(),
                operation,
                reason: err.0,
            });
        }

        match tokio::time::timeout(self.timeout, events.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(GattError::Disconnected {
                address: self.router.address().to_string(),
                status: GattStatus::UNKNOWN,
            }),
            Err(_) => Err(GattError::Timeout {
                address: self.router.address().to_string(),
                operation,
                timeout: self.timeout,
            }),
        }
    }
}

impl<R: GattRequest> fmt::Debug for SingleResponse<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.request, f)
    }
}

#[async_trait]
impl<R: GattRequest> Operation for SingleResponse<R> {
    type Output = R::Output;

    async fn run(self: Box<Self>, emitter: OperationEmitter<R::Output>, release: QueueRelease) {
        if emitter.is_cancelled() {
            debug!(operation = ?self.request, "Cancelled before start");
            return;
        }
        // Once started the response is awaited even if the caller went away,
        // so the next operation never overlaps an in-flight request.
        let result = self.execute().await;
        release.release();
        emitter.send(result);
    }
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ServiceDiscovery;

impl GattRequest for ServiceDiscovery {
    type Output = GattServices;

    fn operation(&self) -> GattOperationType {
        GattOperationType::ServiceDiscovery
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<GattServices> {
        router.on_services_discovered()
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.discover_services()
    }
}

#[derive(Debug)]
pub struct CharacteristicRead {
    characteristic: Characteristic,
}

impl CharacteristicRead {
    pub fn new(characteristic: Characteristic) -> Self {
        Self { characteristic }
    }
}

impl GattRequest for CharacteristicRead {
    type Output = Vec<u8>;

    fn operation(&self) -> GattOperationType {
        GattOperationType::CharacteristicRead
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<Vec<u8>> {
        let id = self.characteristic.id();
        matching(router.on_characteristic_read(), move |event| {
            (event.characteristic == id).then_some(event.value)
        })
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.read_characteristic(&self.characteristic)
    }
}

pub struct CharacteristicWrite {
    characteristic: Characteristic,
    value: Vec<u8>,
    write_type: WriteType,
    operation: GattOperationType,
}

impl CharacteristicWrite {
    /// Write using the characteristic's own write type
    pub fn new(characteristic: Characteristic, value: Vec<u8>) -> Self {
        let write_type = characteristic.write_type;
        Self {
            characteristic,
            value,
            write_type,
            operation: GattOperationType::CharacteristicWrite,
        }
    }

    /// One slice of a long write
    pub fn batch(characteristic: Characteristic, value: Vec<u8>) -> Self {
        Self {
            operation: GattOperationType::CharacteristicLongWrite,
            ..Self::new(characteristic, value)
        }
    }
}

impl fmt::Debug for CharacteristicWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicWrite")
            .field("characteristic", &self.characteristic.id())
            .field("value", &hex::encode(&self.value))
            .field("write_type", &self.write_type)
            .field("operation", &self.operation)
            .finish()
    }
}

impl GattRequest for CharacteristicWrite {
    type Output = Vec<u8>;

    fn operation(&self) -> GattOperationType {
        self.operation
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<Vec<u8>> {
        let id = self.characteristic.id();
        matching(router.on_characteristic_write(), move |event| {
            (event.characteristic == id).then_some(event.value)
        })
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.write_characteristic(&self.characteristic, &self.value, self.write_type)
    }
}

#[derive(Debug)]
pub struct DescriptorRead {
    descriptor: Descriptor,
}

impl DescriptorRead {
    pub fn new(descriptor: Descriptor) -> Self {
        Self { descriptor }
    }
}

impl GattRequest for DescriptorRead {
    type Output = Vec<u8>;

    fn operation(&self) -> GattOperationType {
        GattOperationType::DescriptorRead
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<Vec<u8>> {
        let descriptor = self.descriptor.clone();
        matching(router.on_descriptor_read(), move |event| {
            (event.descriptor == descriptor).then_some(event.value)
        })
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.read_descriptor(&self.descriptor)
    }
}

pub struct DescriptorWrite {
    descriptor: Descriptor,
    value: Vec<u8>,
}

impl DescriptorWrite {
    pub fn new(descriptor: Descriptor, value: Vec<u8>) -> Self {
        Self { descriptor, value }
    }
}

impl fmt::Debug for DescriptorWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorWrite")
            .field("descriptor", &self.descriptor.uuid)
            .field("characteristic", &self.descriptor.characteristic)
            .field("value", &hex::encode(&self.value))
            .finish()
    }
}

impl GattRequest for DescriptorWrite {
    type Output = Vec<u8>;

    fn operation(&self) -> GattOperationType {
        GattOperationType::DescriptorWrite
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<Vec<u8>> {
        let descriptor = self.descriptor.clone();
        matching(router.on_descriptor_write(), move |event| {
            (event.descriptor == descriptor).then_some(event.value)
        })
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.write_descriptor(&self.descriptor, &self.value)
    }
}

#[derive(Debug)]
pub struct ReadRssi;

impl GattRequest for ReadRssi {
    type Output = i16;

    fn operation(&self) -> GattOperationType {
        GattOperationType::ReadRssi
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<i16> {
        router.on_rssi_read()
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.read_remote_rssi()
    }
}

#[derive(Debug)]
pub struct MtuRequest {
    mtu: u16,
}

impl MtuRequest {
    pub fn new(mtu: u16) -> Self {
        Self { mtu }
    }
}

impl GattRequest for MtuRequest {
    type Output = u16;

    fn operation(&self) -> GattOperationType {
        GattOperationType::OnMtuChanged
    }

    fn subscribe(&self, router: &GattEventRouter) -> EventStream<u16> {
        router.on_mtu_changed()
    }

    fn start(&self, link: &dyn GattLink) -> core::result::Result<(), PlatformError> {
        link.request_mtu(self.mtu)
    }
}
