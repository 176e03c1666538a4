//! Platform entry point

use crate::error::{BtleError, Result};
use crate::link::BtleLink;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use core::fmt;
use core::time::Duration;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use gattlink_core::{AdapterState, ConnectMode, GattCallbackSink, GattLink, GattPlatform, PlatformError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedPeripheral {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl fmt::Display for ScannedPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(rssi) = self.rssi {
            write!(f, " {rssi:>4} dBm")?;
        }
        if let Some(name) = &self.name {
            write!(f, "  {name}")?;
        }
        Ok(())
    }
}

/// [`GattPlatform`] backed by one btleplug adapter
///
/// btleplug does not report adapter power changes, so the adapter is
/// always considered usable.
#[derive(Clone)]
pub struct BtlePlatform {
    adapter: Adapter,
    runtime: Handle,
}

impl BtlePlatform {
    /// Use the first adapter of the system
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BtleError::AdapterNotAvailable)?;
        info!(adapter = ?adapter.adapter_info().await.ok(), "BLE adapter initialized");
        Ok(Self::with_adapter(adapter))
    }

    /// Must be called from within a Tokio runtime
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            runtime: Handle::current(),
        }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration` and list every peripheral seen, strongest first
    pub async fn scan(&self, duration: Duration) -> Result<Vec<ScannedPeripheral>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let properties = peripheral.properties().await?;
            found.push(ScannedPeripheral {
                address: peripheral.address().to_string(),
                name: properties.as_ref().and_then(|p| p.local_name.clone()),
                rssi: properties.as_ref().and_then(|p| p.rssi),
            });
        }
        if let Err(err) = self.adapter.stop_scan().await {
            debug!(%err, "Failed to stop scan");
        }

        found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        Ok(found)
    }
}

impl fmt::Debug for BtlePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtlePlatform").finish_non_exhaustive()
    }
}

impl GattPlatform for BtlePlatform {
    fn open(
        &self,
        address: &str,
        mode: ConnectMode,
        sink: GattCallbackSink,
    ) -> core::result::Result<Arc<dyn GattLink>, PlatformError> {
        let link = BtleLink::open(self.adapter.clone(), self.runtime.clone(), address, mode, sink);
        Ok(link)
    }

    fn adapter_state(&self) -> AdapterState {
        AdapterState::On
    }

    fn adapter_states(&self) -> BoxStream<'static, AdapterState> {
        stream::pending().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanned_peripheral_display() {
        let named = ScannedPeripheral {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("Thermometer".into()),
            rssi: Some(-61),
        };
        assert_eq!(named.to_string(), "AA:BB:CC:DD:EE:FF  -61 dBm  Thermometer");

        let anonymous = ScannedPeripheral {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: None,
            rssi: None,
        };
        assert_eq!(anonymous.to_string(), "AA:BB:CC:DD:EE:FF");
    }
}
