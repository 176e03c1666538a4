//! Platform Radio Capability
//!
//! The coordination core drives a platform it does not own. A platform opens
//! links, accepts one "start" call at a time on each link and reports the
//! outcome later through a [`GattCallbackSink`], from any thread and in no
//! particular order across categories.

use crate::config::ConnectMode;
use crate::error::{GattError, GattStatus, PlatformError};
use crate::router::GattEventRouter;
use crate::state::LinkState;
use crate::types::{
    Characteristic, CharacteristicId, ConnectionParameters, ConnectionPriority, Descriptor, GattServices, WriteType,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Adapter State
// ----------------------------------------------------------------------------

/// Radio adapter availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterState {
    On,
    TurningOn,
    TurningOff,
    Off,
}

impl AdapterState {
    /// Only a powered adapter can carry links
    pub fn is_usable(self) -> bool {
        matches!(self, AdapterState::On)
    }
}

// ----------------------------------------------------------------------------
// Platform Traits
// ----------------------------------------------------------------------------

/// Entry point of a platform radio stack
pub trait GattPlatform: Send + Sync + 'static {
    /// Start connecting to `address`; the outcome is reported through `sink`
    fn open(
        &self,
        address: &str,
        mode: ConnectMode,
        sink: GattCallbackSink,
    ) -> Result<Arc<dyn GattLink>, PlatformError>;

    fn adapter_state(&self) -> AdapterState;

    /// Future adapter transitions, starting after the current state
    fn adapter_states(&self) -> BoxStream<'static, AdapterState>;
}

/// Handle to one physical link
///
/// Every start call returns as soon as the request was handed to the radio.
/// An `Err` means the request never started and no callback will follow.
pub trait GattLink: Send + Sync + 'static {
    fn address(&self) -> &str;

    fn discover_services(&self) -> Result<(), PlatformError>;

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError>;

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), PlatformError>;

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError>;

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError>;

    /// Local switch routing value changes of `characteristic` to the callback sink
    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), PlatformError>;

    fn read_remote_rssi(&self) -> Result<(), PlatformError>;

    fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError>;

    /// Fire and forget; no callback confirms the new link parameters
    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<(), PlatformError>;

    fn disconnect(&self) -> Result<(), PlatformError>;

    /// Free the platform resources of the link
    fn close(&self);

    fn is_disconnected(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Raw Callbacks
// ----------------------------------------------------------------------------

/// Raw completion signal reported by the platform
#[derive(Debug, Clone, PartialEq)]
pub enum GattCallback {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: GattServices,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        status: GattStatus,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        status: GattStatus,
        descriptor: Descriptor,
        value: Vec<u8>,
    },
    DescriptorWrite {
        status: GattStatus,
        descriptor: Descriptor,
        value: Vec<u8>,
    },
    ReliableWriteCompleted {
        status: GattStatus,
    },
    RemoteRssiRead {
        status: GattStatus,
        rssi: i16,
    },
    MtuChanged {
        status: GattStatus,
        mtu: u16,
    },
    ConnectionParametersUpdated {
        status: GattStatus,
        parameters: ConnectionParameters,
    },
}

/// Where a platform delivers the callbacks of one link
#[derive(Clone)]
pub struct GattCallbackSink {
    router: Arc<GattEventRouter>,
}

impl GattCallbackSink {
    pub fn new(router: Arc<GattEventRouter>) -> Self {
        Self { router }
    }

    pub fn deliver(&self, callback: GattCallback) {
        self.router.dispatch(callback);
    }

    /// Fail every operation currently waiting on the link
    pub fn fail_link(&self, error: GattError) {
        self.router.fail_link(error);
    }
}

impl core::fmt::Debug for GattCallbackSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GattCallbackSink")
            .field("address", &self.router.address())
            .finish()
    }
}
