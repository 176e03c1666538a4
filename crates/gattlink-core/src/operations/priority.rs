//! Connection priority request

use crate::error::{GattError, GattOperationType};
use crate::platform::GattLink;
use crate::queue::{Operation, OperationEmitter, QueueRelease};
use crate::types::ConnectionPriority;
use async_trait::async_trait;
use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use tracing::debug;

/// Requests a link budget and holds the queue while the link settles
///
/// The platform gives no completion callback, so the operation waits a
/// caller-chosen delay before letting the next operation through.
pub struct ConnectionPriorityOperation {
    link: Arc<dyn GattLink>,
    priority: ConnectionPriority,
    settle_delay: Duration,
}

impl ConnectionPriorityOperation {
    pub fn new(link: Arc<dyn GattLink>, priority: ConnectionPriority, settle_delay: Duration) -> Self {
        Self {
            link,
            priority,
            settle_delay,
        }
    }
}

impl fmt::Debug for ConnectionPriorityOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPriorityOperation")
            .field("priority", &self.priority)
            .field("settle_delay", &self.settle_delay)
            .finish()
    }
}

#[async_trait]
impl Operation for ConnectionPriorityOperation {
    type Output = ();

    async fn run(self: Box<Self>, emitter: OperationEmitter<()>, release: QueueRelease) {
        if let Err(err) = self.link.request_connection_priority(self.priority) {
            release.release();
            emitter.fail(GattError::CannotStart {
                address: self.link.address().to_string(),
                operation: GattOperationType::ConnectionPriorityChange,
                reason: err.0,
            });
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.settle_delay) => {}
            _ = emitter.cancelled() => {
                debug!(address = %self.link.address(), "Priority settle wait cancelled");
            }
        }
        release.release();
        emitter.emit(());
    }
}
