//! Connection State Machine
//!
//! A link moves CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED.
//! Platform reports move the machine directly to the reported state because
//! the platform does not order "link handle obtained" against "state changed".
//! Once the link is closed the machine is finished; a new connection attempt
//! uses a fresh machine.

use crate::relay::lock;
use core::fmt;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transitions kept for inspection
const HISTORY_LIMIT: usize = 32;

// ----------------------------------------------------------------------------
// Link State Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl LinkState {
    /// Only a connected link accepts operations
    pub fn is_usable(self) -> bool {
        matches!(self, LinkState::Connected)
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::Disconnecting => "DISCONNECTING",
            LinkState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The application asked for a connection
    ConnectRequested,
    /// The platform reported a state change
    PlatformReported(LinkState),
    /// The application asked for the link to be torn down
    DisconnectRequested,
    /// The link handle was closed and freed
    LinkClosed,
}

/// Record of a performed transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub from: LinkState,
    pub to: LinkState,
    pub event: ConnectionEvent,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from} on {event:?}")]
    InvalidTransition { from: LinkState, event: ConnectionEvent },

    #[error("Connection already closed, ignoring {event:?}")]
    Finished { event: ConnectionEvent },
}

impl LinkState {
    /// Compute the state reached by applying `event`
    pub fn transition(self, event: ConnectionEvent) -> Result<LinkState, StateTransitionError> {
        use ConnectionEvent::*;
        use LinkState::*;

        match (self, event) {
            (Disconnected, ConnectRequested) => Ok(Connecting),
            (_, PlatformReported(reported)) => Ok(reported),
            (Connecting | Connected, DisconnectRequested) => Ok(Disconnecting),
            (Disconnecting | Disconnected, DisconnectRequested) => Ok(self),
            (_, LinkClosed) => Ok(Disconnected),
            (from, event) => Err(StateTransitionError::InvalidTransition { from, event }),
        }
    }
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Observable link state of one connection attempt
pub struct ConnectionStateMachine {
    address: String,
    state: watch::Sender<LinkState>,
    finished: AtomicBool,
    history: Mutex<VecDeque<StateTransition>>,
}

impl ConnectionStateMachine {
    pub fn new(address: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            address: address.into(),
            state,
            finished: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Apply an event and publish the resulting state
    pub fn apply(&self, event: ConnectionEvent) -> Result<LinkState, StateTransitionError> {
        let mut outcome = Err(StateTransitionError::Finished { event });
        self.state.send_if_modified(|state| {
            if self.finished.load(Ordering::Acquire) && event != ConnectionEvent::LinkClosed {
                return false;
            }
            match state.transition(event) {
                Ok(next) => {
                    let from = *state;
                    *state = next;
                    outcome = Ok((from, next));
                    from != next
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });

        let (from, to) = match outcome {
            Ok(change) => change,
            Err(err) => {
                warn!(address = %self.address, %err, "Rejected connection state event");
                return Err(err);
            }
        };

        if event == ConnectionEvent::LinkClosed {
            self.finished.store(true, Ordering::Release);
        }
        if from != to {
            debug!(address = %self.address, %from, %to, "Connection state changed");
        }

        let mut history = lock(&self.history);
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(StateTransition {
            from,
            to,
            event,
            at: Instant::now(),
        });
        Ok(to)
    }

    /// Current state followed by every later change
    pub fn observe(&self) -> BoxStream<'static, LinkState> {
        let receiver = self.state.subscribe();
        stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first && receiver.changed().await.is_err() {
                return None;
            }
            let state = *receiver.borrow_and_update();
            Some((state, (receiver, false)))
        })
        .boxed()
    }

    pub fn history(&self) -> Vec<StateTransition> {
        lock(&self.history).iter().cloned().collect()
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("address", &self.address)
            .field("state", &self.current())
            .field("finished", &self.is_finished())
            .finish()
    }
}
