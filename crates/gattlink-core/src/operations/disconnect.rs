//! Link teardown

use super::LinkSlot;
use crate::platform::GattLink;
use crate::queue::{Operation, OperationEmitter, QueueRelease};
use crate::router::GattEventRouter;
use crate::state::{ConnectionEvent, LinkState};
use async_trait::async_trait;
use core::fmt;
use core::time::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Disconnects and closes the link held in the slot
///
/// Completes immediately when there is no link or the link is already
/// disconnected. Otherwise waits for the platform's DISCONNECTED report up to
/// the disconnect timeout. The link is closed on every path.
pub struct DisconnectOperation {
    router: Arc<GattEventRouter>,
    slot: LinkSlot,
    timeout: Duration,
}

impl DisconnectOperation {
    pub fn new(router: Arc<GattEventRouter>, slot: LinkSlot, timeout: Duration) -> Self {
        Self { router, slot, timeout }
    }
}

impl fmt::Debug for DisconnectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectOperation")
            .field("address", &self.router.address())
            .finish()
    }
}

/// Closes the link when dropped
struct CloseOnDrop(Arc<dyn GattLink>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl DisconnectOperation {
    async fn disconnect(&self, link: &Arc<dyn GattLink>) {
        if link.is_disconnected() {
            debug!(address = %link.address(), "Link already disconnected");
            return;
        }

        let mut states = self.router.on_connection_state_change();
        if let Err(err) = link.disconnect() {
            warn!(address = %link.address(), %err, "Platform refused to disconnect");
            return;
        }

        let confirmed = tokio::time::timeout(self.timeout, async {
            while let Some(state) = states.next().await {
                if state == LinkState::Disconnected {
                    return true;
                }
            }
            false
        })
        .await;

        if !matches!(confirmed, Ok(true)) {
            warn!(address = %link.address(), timeout = ?self.timeout, "Disconnect not confirmed, closing anyway");
        }
    }
}

#[async_trait]
impl Operation for DisconnectOperation {
    type Output = ();

    async fn run(self: Box<Self>, emitter: OperationEmitter<()>, release: QueueRelease) {
        let state = self.router.state().clone();
        let _ = state.apply(ConnectionEvent::DisconnectRequested);

        match self.slot.take() {
            Some(link) => {
                let _close = CloseOnDrop(link.clone());
                self.disconnect(&link).await;
            }
            None => debug!(address = %self.router.address(), "No link to disconnect"),
        }

        let _ = state.apply(ConnectionEvent::LinkClosed);
        info!(address = %self.router.address(), "Disconnected");
        release.release();
        emitter.emit(());
    }
}
