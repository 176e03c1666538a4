//! Link establishment

use super::LinkSlot;
use crate::config::{ConnectMode, ConnectionSetup};
use crate::error::{GattError, GattOperationType, GattStatus};
use crate::platform::{GattCallbackSink, GattLink, GattPlatform};
use crate::queue::{Operation, OperationEmitter, QueueRelease};
use crate::router::{EventStream, GattEventRouter};
use crate::state::{ConnectionEvent, LinkState};
use crate::Result;
use async_trait::async_trait;
use core::fmt;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Opens a link and waits for it to reach CONNECTED
///
/// Direct connections hold the client queue until connected or until the
/// connect timeout fires. Auto connections release the queue right after
/// the platform accepted the request and then wait without a deadline.
pub struct ConnectOperation {
    platform: Arc<dyn GattPlatform>,
    setup: ConnectionSetup,
    router: Arc<GattEventRouter>,
    slot: LinkSlot,
}

impl ConnectOperation {
    pub fn new(
        platform: Arc<dyn GattPlatform>,
        setup: ConnectionSetup,
        router: Arc<GattEventRouter>,
        slot: LinkSlot,
    ) -> Self {
        Self {
            platform,
            setup,
            router,
            slot,
        }
    }

    fn address(&self) -> String {
        self.router.address().to_string()
    }
}

impl fmt::Debug for ConnectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOperation")
            .field("address", &self.router.address())
            .field("mode", &self.setup.mode)
            .finish()
    }
}

async fn wait_connected(states: &mut EventStream<LinkState>, address: &str) -> Result<()> {
    while let Some(state) = states.next().await {
        if state? == LinkState::Connected {
            return Ok(());
        }
    }
    Err(GattError::Disconnected {
        address: address.to_string(),
        status: GattStatus::UNKNOWN,
    })
}

#[async_trait]
impl Operation for ConnectOperation {
    type Output = Arc<dyn GattLink>;

    async fn run(self: Box<Self>, emitter: OperationEmitter<Arc<dyn GattLink>>, release: QueueRelease) {
        if emitter.is_cancelled() {
            return;
        }
        let address = self.address();
        let state = self.router.state().clone();
        if let Some(err) = self.router.disconnection().current() {
            release.release();
            emitter.fail(err);
            return;
        }

        // Subscribe first: the platform may report CONNECTED from inside `open`.
        let mut states = self.router.observe_link_state();
        let _ = state.apply(ConnectionEvent::ConnectRequested);

        info!(%address, mode = ?self.setup.mode, "Connecting");
        let sink = GattCallbackSink::new(self.router.clone());
        let link = match self.platform.open(&address, self.setup.mode, sink) {
            Ok(link) => link,
            Err(err) => {
                let _ = state.apply(ConnectionEvent::LinkClosed);
                release.release();
                emitter.fail(GattError::CannotStart {
                    address,
                    operation: GattOperationType::ConnectionState,
                    reason: err.0,
                });
                return;
            }
        };
        self.slot.set(link.clone());

        let outcome = match self.setup.mode {
            ConnectMode::Auto => {
                release.release();
                tokio::select! {
                    result = wait_connected(&mut states, &address) => result,
                    _ = emitter.cancelled() => {
                        debug!(%address, "Auto connect cancelled");
                        return;
                    }
                }
            }
            ConnectMode::Direct => {
                let timeout = self.setup.connect_timeout;
                let outcome = tokio::select! {
                    result = tokio::time::timeout(timeout, wait_connected(&mut states, &address)) => {
                        result.unwrap_or_else(|_| Err(GattError::Timeout {
                            address: address.clone(),
                            operation: GattOperationType::ConnectionState,
                            timeout,
                        }))
                    }
                    _ = emitter.cancelled() => {
                        debug!(%address, "Direct connect cancelled");
                        return;
                    }
                };
                release.release();
                outcome
            }
        };

        match outcome {
            Ok(()) => {
                info!(%address, "Connected");
                emitter.emit(link);
            }
            Err(err) => {
                debug!(%address, %err, "Connect failed");
                emitter.fail(err);
            }
        }
    }
}
