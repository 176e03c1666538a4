//! Scriptable in-memory platform
//!
//! [`MockPlatform`] answers every start call synchronously through the
//! callback sink, recording each call so tests can assert on the exact
//! sequence of platform interactions. Responses can be scripted per request
//! kind to fail with a status, refuse to start, or never answer.

use crate::config::ConnectMode;
use crate::error::{GattError, GattStatus, PlatformError};
use crate::platform::{AdapterState, GattCallback, GattCallbackSink, GattLink, GattPlatform};
use crate::relay::lock;
use crate::state::LinkState;
use crate::types::{
    Characteristic, CharacteristicId, ConnectionParameters, ConnectionPriority, Descriptor, GattServices, WriteType,
};
use crate::config::{GATT_MTU_MAXIMUM, GATT_MTU_MINIMUM};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Scripting Types
// ----------------------------------------------------------------------------

/// Kind of platform request a scripted response applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockRequest {
    Connect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    SetNotification,
    ReadRssi,
    RequestMtu,
    ConnectionPriority,
    Disconnect,
}

/// How the mock answers one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockResponse {
    /// Report success with the peripheral's data
    #[default]
    Succeed,
    /// Report the given non-success status
    Fail(GattStatus),
    /// Refuse to start the request
    Refuse,
    /// Start the request but never call back
    Ignore,
}

/// A recorded platform call
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    Open { address: String, mode: ConnectMode },
    DiscoverServices { address: String },
    ReadCharacteristic { address: String, characteristic: CharacteristicId },
    WriteCharacteristic {
        address: String,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor { address: String, descriptor: Uuid, characteristic: CharacteristicId },
    WriteDescriptor {
        address: String,
        descriptor: Uuid,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    SetNotification { address: String, characteristic: CharacteristicId, enable: bool },
    ReadRssi { address: String },
    RequestMtu { address: String, mtu: u16 },
    RequestConnectionPriority { address: String, priority: ConnectionPriority },
    Disconnect { address: String },
    Close { address: String },
}

impl PlatformCall {
    pub fn request(&self) -> Option<MockRequest> {
        let request = match self {
            PlatformCall::Open { .. } => MockRequest::Connect,
            PlatformCall::DiscoverServices { .. } => MockRequest::DiscoverServices,
            PlatformCall::ReadCharacteristic { .. } => MockRequest::ReadCharacteristic,
            PlatformCall::WriteCharacteristic { .. } => MockRequest::WriteCharacteristic,
            PlatformCall::ReadDescriptor { .. } => MockRequest::ReadDescriptor,
            PlatformCall::WriteDescriptor { .. } => MockRequest::WriteDescriptor,
            PlatformCall::SetNotification { .. } => MockRequest::SetNotification,
            PlatformCall::ReadRssi { .. } => MockRequest::ReadRssi,
            PlatformCall::RequestMtu { .. } => MockRequest::RequestMtu,
            PlatformCall::RequestConnectionPriority { .. } => MockRequest::ConnectionPriority,
            PlatformCall::Disconnect { .. } => MockRequest::Disconnect,
            PlatformCall::Close { .. } => return None,
        };
        Some(request)
    }
}

/// Simulated remote device
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    services: GattServices,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptor_values: HashMap<(CharacteristicId, Uuid), Vec<u8>>,
    rssi: i16,
    max_mtu: u16,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self::new(GattServices::default())
    }
}

impl MockPeripheral {
    pub fn new(services: GattServices) -> Self {
        Self {
            services,
            values: HashMap::new(),
            descriptor_values: HashMap::new(),
            rssi: -60,
            max_mtu: GATT_MTU_MAXIMUM,
        }
    }

    pub fn with_value(mut self, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_max_mtu(mut self, max_mtu: u16) -> Self {
        self.max_mtu = max_mtu;
        self
    }

    pub fn value(&self, characteristic: CharacteristicId) -> Option<&[u8]> {
        self.values.get(&characteristic).map(Vec::as_slice)
    }
}

// ----------------------------------------------------------------------------
// Mock Platform
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    peripherals: HashMap<String, MockPeripheral>,
    scripts: HashMap<(String, MockRequest), VecDeque<MockResponse>>,
    calls: Vec<PlatformCall>,
    links: HashMap<String, Arc<MockLink>>,
}

impl MockState {
    fn next_response(&mut self, address: &str, request: MockRequest) -> MockResponse {
        self.scripts
            .get_mut(&(address.to_string(), request))
            .and_then(VecDeque::pop_front)
            .unwrap_or_default()
    }
}

struct MockInner {
    state: Mutex<MockState>,
    adapter: watch::Sender<AdapterState>,
}

#[derive(Clone)]
pub struct MockPlatform {
    inner: Arc<MockInner>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::On);
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState::default()),
                adapter,
            }),
        }
    }

    pub fn with_peripheral(self, address: &str, peripheral: MockPeripheral) -> Self {
        lock(&self.inner.state)
            .peripherals
            .insert(address.to_string(), peripheral);
        self
    }

    /// Queue a response for the next `request` on `address`
    pub fn script(&self, address: &str, request: MockRequest, response: MockResponse) {
        lock(&self.inner.state)
            .scripts
            .entry((address.to_string(), request))
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        lock(&self.inner.state).calls.clone()
    }

    /// Number of recorded calls of one kind
    pub fn count(&self, request: MockRequest) -> usize {
        lock(&self.inner.state)
            .calls
            .iter()
            .filter(|call| call.request() == Some(request))
            .count()
    }

    pub fn peripheral(&self, address: &str) -> Option<MockPeripheral> {
        lock(&self.inner.state).peripherals.get(address).cloned()
    }

    pub fn link(&self, address: &str) -> Option<Arc<MockLink>> {
        lock(&self.inner.state).links.get(address).cloned()
    }

    /// Deliver an arbitrary callback on the link to `address`
    pub fn deliver(&self, address: &str, callback: GattCallback) -> bool {
        match self.link(address) {
            Some(link) => {
                link.sink.deliver(callback);
                true
            }
            None => false,
        }
    }

    /// Peripheral-initiated value change
    pub fn notify(&self, address: &str, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) -> bool {
        self.deliver(
            address,
            GattCallback::CharacteristicChanged {
                characteristic,
                value: value.into(),
            },
        )
    }

    /// Peripheral-initiated connection parameter update
    pub fn update_connection_parameters(&self, address: &str, parameters: ConnectionParameters) -> bool {
        self.deliver(
            address,
            GattCallback::ConnectionParametersUpdated {
                status: GattStatus::SUCCESS,
                parameters,
            },
        )
    }

    /// Report the link as connected, e.g. after an auto connect
    pub fn connect_peer(&self, address: &str) -> bool {
        let Some(link) = self.link(address) else {
            return false;
        };
        link.disconnected.store(false, Ordering::Release);
        link.sink.deliver(GattCallback::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
        true
    }

    /// Peripheral or radio dropped the link
    pub fn disconnect_from_peer(&self, address: &str, status: GattStatus) -> bool {
        let Some(link) = self.link(address) else {
            return false;
        };
        link.disconnected.store(true, Ordering::Release);
        link.sink.deliver(GattCallback::ConnectionStateChanged {
            status,
            state: LinkState::Disconnected,
        });
        true
    }

    pub fn fail_link(&self, address: &str, error: GattError) -> bool {
        match self.link(address) {
            Some(link) => {
                link.sink.fail_link(error);
                true
            }
            None => false,
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.inner.adapter.send_replace(state);
    }
}

impl GattPlatform for MockPlatform {
    fn open(
        &self,
        address: &str,
        mode: ConnectMode,
        sink: GattCallbackSink,
    ) -> Result<Arc<dyn GattLink>, PlatformError> {
        let link = Arc::new(MockLink {
            address: address.to_string(),
            platform: Arc::downgrade(&self.inner),
            sink,
            disconnected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });

        let callback = {
            let mut state = lock(&self.inner.state);
            state.calls.push(PlatformCall::Open {
                address: address.to_string(),
                mode,
            });
            let response = state.next_response(address, MockRequest::Connect);
            if response == MockResponse::Refuse {
                return Err(PlatformError::new("connect refused by script"));
            }
            state.links.insert(address.to_string(), link.clone());
            match response {
                MockResponse::Succeed => {
                    link.disconnected.store(false, Ordering::Release);
                    Some(GattCallback::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        state: LinkState::Connected,
                    })
                }
                MockResponse::Fail(status) => Some(GattCallback::ConnectionStateChanged {
                    status,
                    state: LinkState::Disconnected,
                }),
                MockResponse::Ignore | MockResponse::Refuse => None,
            }
        };

        if let Some(callback) = callback {
            link.sink.deliver(callback);
        }
        Ok(link)
    }

    fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.borrow()
    }

    fn adapter_states(&self) -> BoxStream<'static, AdapterState> {
        let mut receiver = self.inner.adapter.subscribe();
        receiver.borrow_and_update();
        stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let state = *receiver.borrow_and_update();
            Some((state, receiver))
        })
        .boxed()
    }
}

// ----------------------------------------------------------------------------
// Mock Link
// ----------------------------------------------------------------------------

pub struct MockLink {
    address: String,
    platform: Weak<MockInner>,
    sink: GattCallbackSink,
    disconnected: AtomicBool,
    closed: AtomicBool,
}

impl MockLink {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the call, pick the scripted response and deliver its callback
    fn respond(
        &self,
        call: PlatformCall,
        request: MockRequest,
        success: impl FnOnce(&mut MockPeripheral) -> Option<GattCallback>,
        failure: impl FnOnce(GattStatus) -> Option<GattCallback>,
    ) -> Result<(), PlatformError> {
        let platform = self
            .platform
            .upgrade()
            .ok_or_else(|| PlatformError::new("platform dropped"))?;

        let callback = {
            let mut state = lock(&platform.state);
            state.calls.push(call);
            if self.is_closed() {
                return Err(PlatformError::new("link closed"));
            }
            match state.next_response(&self.address, request) {
                MockResponse::Refuse => return Err(PlatformError::new("refused by script")),
                MockResponse::Ignore => None,
                MockResponse::Fail(status) => failure(status),
                MockResponse::Succeed => {
                    let peripheral = state.peripherals.entry(self.address.clone()).or_default();
                    success(peripheral)
                }
            }
        };

        if let Some(callback) = callback {
            self.sink.deliver(callback);
        }
        Ok(())
    }
}

impl GattLink for MockLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::DiscoverServices {
                address: self.address.clone(),
            },
            MockRequest::DiscoverServices,
            |peripheral| {
                Some(GattCallback::ServicesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: peripheral.services.clone(),
                })
            },
            |status| {
                Some(GattCallback::ServicesDiscovered {
                    status,
                    services: GattServices::default(),
                })
            },
        )
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<(), PlatformError> {
        let id = characteristic.id();
        self.respond(
            PlatformCall::ReadCharacteristic {
                address: self.address.clone(),
                characteristic: id,
            },
            MockRequest::ReadCharacteristic,
            |peripheral| {
                Some(GattCallback::CharacteristicRead {
                    status: GattStatus::SUCCESS,
                    characteristic: id,
                    value: peripheral.values.get(&id).cloned().unwrap_or_default(),
                })
            },
            |status| {
                Some(GattCallback::CharacteristicRead {
                    status,
                    characteristic: id,
                    value: Vec::new(),
                })
            },
        )
    }

    fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), PlatformError> {
        let id = characteristic.id();
        self.respond(
            PlatformCall::WriteCharacteristic {
                address: self.address.clone(),
                characteristic: id,
                value: value.to_vec(),
                write_type,
            },
            MockRequest::WriteCharacteristic,
            |peripheral| {
                peripheral.values.insert(id, value.to_vec());
                Some(GattCallback::CharacteristicWrite {
                    status: GattStatus::SUCCESS,
                    characteristic: id,
                    value: value.to_vec(),
                })
            },
            |status| {
                Some(GattCallback::CharacteristicWrite {
                    status,
                    characteristic: id,
                    value: value.to_vec(),
                })
            },
        )
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<(), PlatformError> {
        let key = (descriptor.characteristic, descriptor.uuid);
        self.respond(
            PlatformCall::ReadDescriptor {
                address: self.address.clone(),
                descriptor: descriptor.uuid,
                characteristic: descriptor.characteristic,
            },
            MockRequest::ReadDescriptor,
            |peripheral| {
                Some(GattCallback::DescriptorRead {
                    status: GattStatus::SUCCESS,
                    descriptor: descriptor.clone(),
                    value: peripheral.descriptor_values.get(&key).cloned().unwrap_or_default(),
                })
            },
            |status| {
                Some(GattCallback::DescriptorRead {
                    status,
                    descriptor: descriptor.clone(),
                    value: Vec::new(),
                })
            },
        )
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<(), PlatformError> {
        let key = (descriptor.characteristic, descriptor.uuid);
        self.respond(
            PlatformCall::WriteDescriptor {
                address: self.address.clone(),
                descriptor: descriptor.uuid,
                characteristic: descriptor.characteristic,
                value: value.to_vec(),
            },
            MockRequest::WriteDescriptor,
            |peripheral| {
                peripheral.descriptor_values.insert(key, value.to_vec());
                Some(GattCallback::DescriptorWrite {
                    status: GattStatus::SUCCESS,
                    descriptor: descriptor.clone(),
                    value: value.to_vec(),
                })
            },
            |status| {
                Some(GattCallback::DescriptorWrite {
                    status,
                    descriptor: descriptor.clone(),
                    value: value.to_vec(),
                })
            },
        )
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::SetNotification {
                address: self.address.clone(),
                characteristic: characteristic.id(),
                enable,
            },
            MockRequest::SetNotification,
            |_| None,
            |_| None,
        )
    }

    fn read_remote_rssi(&self) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::ReadRssi {
                address: self.address.clone(),
            },
            MockRequest::ReadRssi,
            |peripheral| {
                Some(GattCallback::RemoteRssiRead {
                    status: GattStatus::SUCCESS,
                    rssi: peripheral.rssi,
                })
            },
            |status| Some(GattCallback::RemoteRssiRead { status, rssi: 0 }),
        )
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::RequestMtu {
                address: self.address.clone(),
                mtu,
            },
            MockRequest::RequestMtu,
            |peripheral| {
                Some(GattCallback::MtuChanged {
                    status: GattStatus::SUCCESS,
                    mtu: mtu.min(peripheral.max_mtu),
                })
            },
            |status| {
                Some(GattCallback::MtuChanged {
                    status,
                    mtu: GATT_MTU_MINIMUM,
                })
            },
        )
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::RequestConnectionPriority {
                address: self.address.clone(),
                priority,
            },
            MockRequest::ConnectionPriority,
            |_| None,
            |_| None,
        )
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        self.respond(
            PlatformCall::Disconnect {
                address: self.address.clone(),
            },
            MockRequest::Disconnect,
            |_| {
                self.disconnected.store(true, Ordering::Release);
                Some(GattCallback::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    state: LinkState::Disconnected,
                })
            },
            |status| {
                self.disconnected.store(true, Ordering::Release);
                Some(GattCallback::ConnectionStateChanged {
                    status,
                    state: LinkState::Disconnected,
                })
            },
        )
    }

    fn close(&self) {
        if let Some(platform) = self.platform.upgrade() {
            lock(&platform.state).calls.push(PlatformCall::Close {
                address: self.address.clone(),
            });
        }
        self.closed.store(true, Ordering::Release);
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}
