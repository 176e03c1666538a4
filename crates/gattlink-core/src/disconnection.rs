//! Disconnection Router
//!
//! Folds adapter and link failures into a single terminal error per link.
//! The first error wins and is replayed to every later subscriber; nothing
//! after it can change the latched value.

use crate::error::{GattError, GattStatus};
use crate::platform::AdapterState;
use crate::relay::lock;
use crate::Result;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct DisconnectionRouter {
    address: String,
    latch: watch::Sender<Option<GattError>>,
    adapter_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl DisconnectionRouter {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        let (latch, _) = watch::channel(None);
        Arc::new(Self {
            address: address.into(),
            latch,
            adapter_monitor: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Latch a disconnection as soon as the adapter stops being usable
    pub fn monitor_adapter(
        self: &Arc<Self>,
        currently_usable: bool,
        mut states: BoxStream<'static, AdapterState>,
    ) {
        if !currently_usable {
            self.on_adapter_unusable(AdapterState::Off);
            return;
        }

        let router = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(state) = states.next().await {
                if state.is_usable() {
                    continue;
                }
                if let Some(router) = router.upgrade() {
                    router.on_adapter_unusable(state);
                }
                break;
            }
        });

        let mut monitor = lock(&self.adapter_monitor);
        if self.is_latched() {
            handle.abort();
        } else {
            *monitor = Some(handle);
        }
    }

    /// Expected or peer-initiated disconnection
    pub fn on_disconnected(&self, status: GattStatus) {
        self.latch(GattError::Disconnected {
            address: self.address.clone(),
            status,
        });
    }

    /// Abnormal connection state reported by the platform
    pub fn on_link_state_error(&self, error: GattError) {
        self.latch(error);
    }

    fn on_adapter_unusable(&self, state: AdapterState) {
        debug!(address = %self.address, ?state, "Adapter not usable");
        self.latch(GattError::Disconnected {
            address: self.address.clone(),
            status: GattStatus::UNKNOWN,
        });
    }

    fn latch(&self, error: GattError) -> bool {
        let latched = self.latch.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(error.clone());
            true
        });

        if latched {
            info!(address = %self.address, %error, "Link broken");
            if let Some(monitor) = lock(&self.adapter_monitor).take() {
                monitor.abort();
            }
        }
        latched
    }

    pub fn is_latched(&self) -> bool {
        self.latch.borrow().is_some()
    }

    /// The latched error, if the link already broke
    pub fn current(&self) -> Option<GattError> {
        self.latch.borrow().clone()
    }

    /// Resolves with the latched error, immediately if already latched
    pub fn wait(&self) -> BoxFuture<'static, GattError> {
        let mut latch = self.latch.subscribe();
        async move {
            loop {
                let latched = latch.borrow_and_update().clone();
                if let Some(error) = latched {
                    return error;
                }
                if latch.changed().await.is_err() {
                    // Router dropped without ever latching.
                    return future::pending().await;
                }
            }
        }
        .boxed()
    }

    /// Stream that yields the latched error once and then ends
    pub fn error_stream<T: Send + 'static>(&self) -> BoxStream<'static, Result<T>> {
        stream::once(self.wait()).map(Err).boxed()
    }
}

impl Drop for DisconnectionRouter {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.adapter_monitor).take() {
            monitor.abort();
        }
    }
}

impl core::fmt::Debug for DisconnectionRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DisconnectionRouter")
            .field("address", &self.address)
            .field("latched", &self.current())
            .finish()
    }
}
