//! Session lifecycle state and the channel-backed router handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::router::{SessionEvent, SessionHandler};

/// Lifecycle of a session.
///
/// A session starts `Open` when registered and becomes `Closed` when it is
/// unregistered or the connection ends. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

impl SessionState {
    pub fn is_open(self) -> bool {
        self == SessionState::Open
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Shared closed flag, set exactly once.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClosedFlag(Arc<AtomicBool>);

impl ClosedFlag {
    /// Marks closed; returns true only for the first caller.
    pub(crate) fn close(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }
}

/// Queues router events onto an unbounded channel so dispatch never waits
/// on the session's consumer.
///
/// The sender is dropped together with the `Closed` event, under the same
/// lock every delivery takes, so nothing can be queued behind `Closed`.
pub(crate) struct ChannelHandler {
    tx: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    closed: ClosedFlag,
}

impl ChannelHandler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>, closed: ClosedFlag) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            closed,
        }
    }
}

impl SessionHandler for ChannelHandler {
    fn on_event(&self, session_id: &str, event: SessionEvent) -> Result<(), SessionEvent> {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);

        if event == SessionEvent::Closed {
            self.closed.close();
            if let Some(tx) = tx.take() {
                if tx.send(event).is_err() {
                    trace!(session_id = %session_id, "Session receiver gone before close");
                }
            }
            return Ok(());
        }

        let Some(sender) = tx.as_ref() else {
            trace!(session_id = %session_id, "Rejecting event for closed session");
            return Err(event);
        };
        sender.send(event).map_err(|rejected| {
            trace!(session_id = %session_id, "Session receiver gone, event rejected");
            rejected.0
        })
    }
}
