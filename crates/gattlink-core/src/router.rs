//! GATT Event Router
//!
//! Demultiplexes the raw callbacks of one link into typed per-category
//! streams. Every exposed stream is merged with the shared link failure relay
//! and the disconnection latch, so a consumer of any category terminates with
//! an error as soon as the link breaks.

use crate::disconnection::DisconnectionRouter;
use crate::error::{GattError, GattOperationType, GattStatus};
use crate::platform::GattCallback;
use crate::relay::Relay;
use crate::state::{ConnectionEvent, ConnectionStateMachine, LinkState};
use crate::types::{CharacteristicId, ConnectionParameters, Descriptor, GattServices};
use crate::Result;
use futures::future;
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Category stream ending after its first error
pub type EventStream<T> = BoxStream<'static, Result<T>>;

// ----------------------------------------------------------------------------
// Decoded Events
// ----------------------------------------------------------------------------

/// Value carried by a characteristic read, write or change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

/// Value carried by a descriptor read or write event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorValue {
    pub descriptor: Descriptor,
    pub value: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

pub struct GattEventRouter {
    address: String,
    disconnection: Arc<DisconnectionRouter>,
    state: Arc<ConnectionStateMachine>,
    connection_state: Relay<LinkState>,
    services_discovered: Relay<Result<GattServices>>,
    characteristic_read: Relay<Result<CharacteristicValue>>,
    characteristic_write: Relay<Result<CharacteristicValue>>,
    characteristic_changed: Relay<CharacteristicValue>,
    descriptor_read: Relay<Result<DescriptorValue>>,
    descriptor_write: Relay<Result<DescriptorValue>>,
    reliable_write: Relay<Result<()>>,
    rssi_read: Relay<Result<i16>>,
    mtu_changed: Relay<Result<u16>>,
    connection_parameters: Relay<Result<ConnectionParameters>>,
    link_failure: Relay<GattError>,
}

impl GattEventRouter {
    pub fn new(
        address: impl Into<String>,
        disconnection: Arc<DisconnectionRouter>,
        state: Arc<ConnectionStateMachine>,
    ) -> Self {
        Self {
            address: address.into(),
            disconnection,
            state,
            connection_state: Relay::new(),
            services_discovered: Relay::new(),
            characteristic_read: Relay::new(),
            characteristic_write: Relay::new(),
            characteristic_changed: Relay::new(),
            descriptor_read: Relay::new(),
            descriptor_write: Relay::new(),
            reliable_write: Relay::new(),
            rssi_read: Relay::new(),
            mtu_changed: Relay::new(),
            connection_parameters: Relay::new(),
            link_failure: Relay::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn disconnection(&self) -> &Arc<DisconnectionRouter> {
        &self.disconnection
    }

    pub fn state(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }

    /// Route one raw platform callback
    pub fn dispatch(&self, callback: GattCallback) {
        trace!(address = %self.address, ?callback, "Platform callback");

        match callback {
            GattCallback::ConnectionStateChanged { status, state } => {
                debug!(address = %self.address, %status, %state, "Connection state callback");
                if matches!(state, LinkState::Disconnected | LinkState::Disconnecting) {
                    self.disconnection.on_disconnected(status);
                } else if !status.is_success() {
                    self.disconnection.on_link_state_error(GattError::Gatt {
                        address: self.address.clone(),
                        status,
                        operation: GattOperationType::ConnectionState,
                    });
                }
                // Rejections are logged by the state machine.
                let _ = self.state.apply(ConnectionEvent::PlatformReported(state));
                self.connection_state.publish(state);
            }
            GattCallback::ServicesDiscovered { status, services } => {
                let event = self
                    .link_status(status, GattOperationType::ServiceDiscovery)
                    .map(|()| services);
                self.services_discovered.publish(event);
            }
            GattCallback::CharacteristicRead {
                status,
                characteristic,
                value,
            } => {
                let event = self
                    .characteristic_status(status, characteristic, GattOperationType::CharacteristicRead)
                    .map(|()| CharacteristicValue { characteristic, value });
                self.characteristic_read.publish(event);
            }
            GattCallback::CharacteristicWrite {
                status,
                characteristic,
                value,
            } => {
                let event = self
                    .characteristic_status(status, characteristic, GattOperationType::CharacteristicWrite)
                    .map(|()| CharacteristicValue { characteristic, value });
                self.characteristic_write.publish(event);
            }
            GattCallback::CharacteristicChanged { characteristic, value } => {
                trace!(address = %self.address, %characteristic, value = %hex::encode(&value), "Characteristic changed");
                self.characteristic_changed
                    .publish(CharacteristicValue { characteristic, value });
            }
            GattCallback::DescriptorRead {
                status,
                descriptor,
                value,
            } => {
                let event = self
                    .descriptor_status(status, &descriptor, GattOperationType::DescriptorRead)
                    .map(|()| DescriptorValue { descriptor, value });
                self.descriptor_read.publish(event);
            }
            GattCallback::DescriptorWrite {
                status,
                descriptor,
                value,
            } => {
                let event = self
                    .descriptor_status(status, &descriptor, GattOperationType::DescriptorWrite)
                    .map(|()| DescriptorValue { descriptor, value });
                self.descriptor_write.publish(event);
            }
            GattCallback::ReliableWriteCompleted { status } => {
                let event = self.link_status(status, GattOperationType::ReliableWrite);
                self.reliable_write.publish(event);
            }
            GattCallback::RemoteRssiRead { status, rssi } => {
                let event = self
                    .link_status(status, GattOperationType::ReadRssi)
                    .map(|()| rssi);
                self.rssi_read.publish(event);
            }
            GattCallback::MtuChanged { status, mtu } => {
                let event = self
                    .link_status(status, GattOperationType::OnMtuChanged)
                    .map(|()| mtu);
                self.mtu_changed.publish(event);
            }
            GattCallback::ConnectionParametersUpdated { status, parameters } => {
                debug!(address = %self.address, %status, ?parameters, "Connection parameters updated");
                let event = self
                    .link_status(status, GattOperationType::ConnectionParametersUpdate)
                    .map(|()| parameters);
                self.connection_parameters.publish(event);
            }
        }
    }

    /// Fail every stream currently handed out without latching a disconnection
    pub fn fail_link(&self, error: GattError) {
        debug!(address = %self.address, %error, "Link failure");
        self.link_failure.publish(error);
    }

    fn link_status(&self, status: GattStatus, operation: GattOperationType) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(GattError::Gatt {
            address: self.address.clone(),
            status,
            operation,
        })
    }

    fn characteristic_status(
        &self,
        status: GattStatus,
        characteristic: CharacteristicId,
        operation: GattOperationType,
    ) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(GattError::CharacteristicStatus {
            address: self.address.clone(),
            characteristic: characteristic.uuid,
            status,
            operation,
        })
    }

    fn descriptor_status(
        &self,
        status: GattStatus,
        descriptor: &Descriptor,
        operation: GattOperationType,
    ) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(GattError::DescriptorStatus {
            address: self.address.clone(),
            descriptor: descriptor.uuid,
            status,
            operation,
        })
    }

    // ------------------------------------------------------------------------
    // Category Streams
    // ------------------------------------------------------------------------

    fn merged<T, S>(&self, category: S) -> EventStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        let failures = self.link_failure.subscribe().map(Err);
        let disconnection = self.disconnection.error_stream::<T>();
        until_first_error(stream::select(stream::select(category, failures), disconnection))
    }

    /// Raw connection states, not merged with the disconnection latch
    pub fn on_connection_state_change(&self) -> BoxStream<'static, LinkState> {
        self.connection_state.subscribe().boxed()
    }

    /// Connection states ending with the disconnection error
    pub fn observe_link_state(&self) -> EventStream<LinkState> {
        self.merged(self.connection_state.subscribe().map(Ok))
    }

    pub fn on_services_discovered(&self) -> EventStream<GattServices> {
        self.merged(self.services_discovered.subscribe())
    }

    pub fn on_characteristic_read(&self) -> EventStream<CharacteristicValue> {
        self.merged(self.characteristic_read.subscribe())
    }

    pub fn on_characteristic_write(&self) -> EventStream<CharacteristicValue> {
        self.merged(self.characteristic_write.subscribe())
    }

    pub fn on_characteristic_changed(&self) -> EventStream<CharacteristicValue> {
        self.merged(self.characteristic_changed.subscribe().map(Ok))
    }

    pub fn on_descriptor_read(&self) -> EventStream<DescriptorValue> {
        self.merged(self.descriptor_read.subscribe())
    }

    pub fn on_descriptor_write(&self) -> EventStream<DescriptorValue> {
        self.merged(self.descriptor_write.subscribe())
    }

    pub fn on_reliable_write_completed(&self) -> EventStream<()> {
        self.merged(self.reliable_write.subscribe())
    }

    pub fn on_rssi_read(&self) -> EventStream<i16> {
        self.merged(self.rssi_read.subscribe())
    }

    pub fn on_mtu_changed(&self) -> EventStream<u16> {
        self.merged(self.mtu_changed.subscribe())
    }

    pub fn on_connection_parameters_updated(&self) -> EventStream<ConnectionParameters> {
        self.merged(self.connection_parameters.subscribe())
    }

    /// Yields only the disconnection error
    pub fn observe_disconnect<T: Send + 'static>(&self) -> EventStream<T> {
        self.disconnection.error_stream()
    }
}

impl core::fmt::Debug for GattEventRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GattEventRouter")
            .field("address", &self.address)
            .field("state", &self.state.current())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Stream Helpers
// ----------------------------------------------------------------------------

/// Pass items through up to and including the first error, then end
pub fn until_first_error<T, S>(events: S) -> EventStream<T>
where
    T: Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    stream::unfold(Some(events.boxed()), |events| async move {
        let mut events = events?;
        let item = events.next().await?;
        let rest = item.is_ok().then_some(events);
        Some((item, rest))
    })
    .boxed()
}

/// Keep the events `select` maps to a value; errors always pass
pub fn matching<T, U, F>(events: EventStream<T>, mut select: F) -> EventStream<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    events
        .filter_map(move |item| {
            let mapped = match item {
                Ok(event) => select(event).map(Ok),
                Err(error) => Some(Err(error)),
            };
            future::ready(mapped)
        })
        .boxed()
}
