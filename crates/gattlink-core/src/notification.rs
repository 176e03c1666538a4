//! Notification and Indication Manager
//!
//! Shares one hardware subscription per characteristic instance between any
//! number of listeners. The first listener arms the subscription (local
//! enable, then the client characteristic configuration write); the last one
//! to leave disarms it on a best-effort basis. A characteristic instance is
//! either notified or indicated, never both at once.

use crate::config::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::error::GattError;
use crate::operations::{DescriptorWrite, SingleResponse};
use crate::platform::GattLink;
use crate::queue::OperationQueue;
use crate::relay::lock;
use crate::router::{matching, until_first_error, EventStream, GattEventRouter};
use crate::types::{Characteristic, CharacteristicId, Descriptor};
use crate::Result;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use futures::future::{self, BoxFuture, Shared};
use futures::stream::{self, Stream};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Subscription Types
// ----------------------------------------------------------------------------

/// Server-initiated delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Unacknowledged updates
    Notification,
    /// Updates acknowledged by the client stack
    Indication,
}

impl NotificationKind {
    /// Value written to the client characteristic configuration descriptor
    pub fn enable_value(self) -> [u8; 2] {
        match self {
            NotificationKind::Notification => ENABLE_NOTIFICATION_VALUE,
            NotificationKind::Indication => ENABLE_INDICATION_VALUE,
        }
    }
}

/// How the subscription is armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSetupMode {
    /// Write the descriptor, then hand out the value stream
    #[default]
    Default,
    /// Hand out the value stream while the descriptor write is in flight
    ///
    /// Values sent by the peripheral before its descriptor is written are
    /// not delivered, and a failed write surfaces as an error item on the
    /// stream instead of failing the setup call.
    QuickSetup,
    /// Only enable delivery locally; the peripheral or platform manages the
    /// descriptor
    Compat,
}

type ArmedFuture = Shared<BoxFuture<'static, Result<()>>>;

struct ActiveSubscription {
    kind: NotificationKind,
    mode: NotificationSetupMode,
    characteristic: Characteristic,
    listeners: usize,
    generation: u64,
    armed: ArmedFuture,
}

fn ccc_descriptor(characteristic: &Characteristic) -> Result<Descriptor> {
    characteristic
        .descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID)
        .cloned()
        .ok_or_else(|| GattError::CannotSetNotification {
            characteristic: characteristic.uuid,
            reason: "client characteristic configuration descriptor not found".into(),
        })
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct NotificationManager {
    link: Arc<dyn GattLink>,
    router: Arc<GattEventRouter>,
    queue: OperationQueue,
    operation_timeout: Duration,
    active: Mutex<HashMap<CharacteristicId, ActiveSubscription>>,
    next_generation: AtomicU64,
}

impl NotificationManager {
    pub fn new(
        link: Arc<dyn GattLink>,
        router: Arc<GattEventRouter>,
        queue: OperationQueue,
        operation_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            router,
            queue,
            operation_timeout,
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Subscribe to value changes of `characteristic`
    ///
    /// Resolves once the subscription is armed (immediately for quick setup).
    /// Fails right away with a conflict when the characteristic instance is
    /// already armed with the other kind.
    pub async fn setup(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        kind: NotificationKind,
        mode: NotificationSetupMode,
    ) -> Result<Notifications> {
        let id = characteristic.id();
        let values = self.values(id);
        let (armed, guard) = self.acquire(characteristic, kind, mode)?;

        let values = match mode {
            NotificationSetupMode::QuickSetup => {
                let setup_failure = armed
                    .into_stream()
                    .filter_map(|armed| future::ready(armed.err().map(Err::<Vec<u8>, GattError>)));
                until_first_error(stream::select(values, setup_failure))
            }
            NotificationSetupMode::Default | NotificationSetupMode::Compat => {
                armed.await?;
                values
            }
        };

        Ok(Notifications {
            characteristic: id,
            values,
            _guard: guard,
        })
    }

    /// Number of armed characteristic instances
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Listeners sharing the subscription of `id`
    pub fn listener_count(&self, id: CharacteristicId) -> usize {
        lock(&self.active).get(&id).map_or(0, |active| active.listeners)
    }

    /// Forget every subscription without disarming; used once the link is gone
    pub(crate) fn abandon_all(&self) {
        let abandoned = core::mem::take(&mut *lock(&self.active));
        if !abandoned.is_empty() {
            debug!(address = %self.router.address(), count = abandoned.len(), "Abandoning subscriptions");
        }
    }

    fn values(&self, id: CharacteristicId) -> EventStream<Vec<u8>> {
        matching(self.router.on_characteristic_changed(), move |event| {
            (event.characteristic == id).then_some(event.value)
        })
    }

    /// Join the existing subscription or create and arm a new one
    fn acquire(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        kind: NotificationKind,
        mode: NotificationSetupMode,
    ) -> Result<(ArmedFuture, ListenerGuard)> {
        let id = characteristic.id();
        let mut active = lock(&self.active);

        if let Some(existing) = active.get_mut(&id) {
            if existing.kind != kind {
                return Err(GattError::ConflictingNotification {
                    characteristic: characteristic.uuid,
                    already_indication: existing.kind == NotificationKind::Indication,
                });
            }
            existing.listeners += 1;
            debug!(characteristic = %id, listeners = existing.listeners, "Sharing subscription");
            let guard = ListenerGuard {
                manager: Arc::downgrade(self),
                id,
                generation: existing.generation,
            };
            return Ok((existing.armed.clone(), guard));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let armed = self.arm(characteristic, kind, mode, generation)?;
        active.insert(
            id,
            ActiveSubscription {
                kind,
                mode,
                characteristic: characteristic.clone(),
                listeners: 1,
                generation,
                armed: armed.clone(),
            },
        );
        debug!(characteristic = %id, ?kind, ?mode, "Arming subscription");

        let guard = ListenerGuard {
            manager: Arc::downgrade(self),
            id,
            generation,
        };
        Ok((armed, guard))
    }

    /// Enable local delivery and queue the descriptor write
    ///
    /// Both happen before returning, so a disarm issued by any later release
    /// is queued behind the enable. Every listener awaits the same outcome.
    fn arm(
        self: &Arc<Self>,
        characteristic: &Characteristic,
        kind: NotificationKind,
        mode: NotificationSetupMode,
        generation: u64,
    ) -> Result<ArmedFuture> {
        let descriptor = match mode {
            NotificationSetupMode::Compat => None,
            _ => Some(ccc_descriptor(characteristic)?),
        };
        self.link
            .set_characteristic_notification(characteristic, true)
            .map_err(|err| GattError::CannotSetNotification {
                characteristic: characteristic.uuid,
                reason: err.0,
            })?;

        let Some(descriptor) = descriptor else {
            return Ok(future::ready(Ok(())).boxed().shared());
        };

        let write = DescriptorWrite::new(descriptor, kind.enable_value().to_vec());
        let written = self.queue.enqueue(SingleResponse::new(
            write,
            self.link.clone(),
            self.router.clone(),
            self.operation_timeout,
        ));

        let manager = Arc::downgrade(self);
        let id = characteristic.id();
        let uuid = characteristic.uuid;
        let armed = async move {
            let outcome = match written.single().await {
                Ok(_) => Ok(()),
                Err(err) if err.is_disconnection() => Err(err),
                Err(err) => Err(GattError::CannotSetNotification {
                    characteristic: uuid,
                    reason: err.to_string(),
                }),
            };
            if let (Err(err), Some(manager)) = (&outcome, manager.upgrade()) {
                manager.discard_failed(id, generation, err);
            }
            outcome
        }
        .boxed()
        .shared();

        // Settle the outcome even if every listener leaves first.
        tokio::spawn(armed.clone().map(drop));
        Ok(armed)
    }

    /// Forget a subscription whose arming failed so the next listener arms again
    fn discard_failed(&self, id: CharacteristicId, generation: u64, error: &GattError) {
        let removed = {
            let mut active = lock(&self.active);
            match active.get(&id) {
                Some(existing) if existing.generation == generation => active.remove(&id),
                _ => None,
            }
        };

        if let Some(subscription) = removed {
            debug!(characteristic = %id, %error, "Subscription failed to arm");
            if !error.is_disconnection() {
                self.disarm(subscription);
            }
        }
    }

    fn release_listener(&self, id: CharacteristicId, generation: u64) {
        let removed = {
            let mut active = lock(&self.active);
            match active.get_mut(&id) {
                Some(existing) if existing.generation == generation => {
                    existing.listeners -= 1;
                    if existing.listeners == 0 {
                        active.remove(&id)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(subscription) = removed {
            self.disarm(subscription);
        }
    }

    /// Best-effort teardown; failures are logged and otherwise ignored
    fn disarm(&self, subscription: ActiveSubscription) {
        let characteristic = subscription.characteristic;
        debug!(characteristic = %characteristic.id(), "Disarming subscription");

        if let Err(err) = self.link.set_characteristic_notification(&characteristic, false) {
            warn!(characteristic = %characteristic.id(), %err, "Failed to disable local delivery");
        }
        if subscription.mode == NotificationSetupMode::Compat {
            return;
        }
        let Ok(descriptor) = ccc_descriptor(&characteristic) else {
            return;
        };

        let write = DescriptorWrite::new(descriptor, DISABLE_NOTIFICATION_VALUE.to_vec());
        let result = self.queue.enqueue(SingleResponse::new(
            write,
            self.link.clone(),
            self.router.clone(),
            self.operation_timeout,
        ));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let id = characteristic.id();
                handle.spawn(async move {
                    if let Err(err) = result.single().await {
                        debug!(characteristic = %id, %err, "Disarm write failed");
                    }
                });
            }
            Err(_) => debug!(characteristic = %characteristic.id(), "No runtime, skipping disarm write"),
        }
    }
}

impl fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationManager")
            .field("address", &self.router.address())
            .field("active", &self.active_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Listener Handles
// ----------------------------------------------------------------------------

/// Counts one listener of an active subscription
struct ListenerGuard {
    manager: Weak<NotificationManager>,
    id: CharacteristicId,
    generation: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release_listener(self.id, self.generation);
        }
    }
}

/// Value changes of one characteristic instance
///
/// Ends with an error when the link breaks. Dropping the stream detaches
/// the listener; the last listener to detach disarms the subscription.
pub struct Notifications {
    characteristic: CharacteristicId,
    values: EventStream<Vec<u8>>,
    _guard: ListenerGuard,
}

impl Notifications {
    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }
}

impl Stream for Notifications {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.values.poll_next_unpin(cx)
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("characteristic", &self.characteristic)
            .finish()
    }
}
