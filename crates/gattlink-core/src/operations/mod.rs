//! Queued GATT operations

mod connect;
mod custom;
mod disconnect;
mod priority;
mod single;

pub use connect::ConnectOperation;
pub use custom::CustomOperation;
pub(crate) use custom::CustomAdapter;
pub use disconnect::DisconnectOperation;
pub use priority::ConnectionPriorityOperation;
pub use single::{
    CharacteristicRead, CharacteristicWrite, DescriptorRead, DescriptorWrite, GattRequest, MtuRequest,
    ReadRssi, ServiceDiscovery, SingleResponse,
};

use crate::platform::GattLink;
use crate::relay::lock;
use std::sync::{Arc, Mutex};

/// Link handle shared between the connect and disconnect operations
#[derive(Clone, Default)]
pub struct LinkSlot(Arc<Mutex<Option<Arc<dyn GattLink>>>>);

impl LinkSlot {
    pub fn set(&self, link: Arc<dyn GattLink>) {
        *lock(&self.0) = Some(link);
    }

    pub fn get(&self) -> Option<Arc<dyn GattLink>> {
        lock(&self.0).clone()
    }

    pub fn take(&self) -> Option<Arc<dyn GattLink>> {
        lock(&self.0).take()
    }
}

impl core::fmt::Debug for LinkSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let address = self.get().map(|link| link.address().to_string());
        f.debug_tuple("LinkSlot").field(&address).finish()
    }
}
