//! Application-side session handles.
//!
//! A [`Session`] is one logical terminal multiplexed over a connection. It
//! registers itself with a [`SessionRouter`], receives its inbound traffic in
//! arrival order through [`Session::recv`], and sends through the router's
//! serialized writer.
//!
//! Sessions have no open/close message on the wire. Opening is local
//! registration; a peer's first reference to an unknown id can be turned
//! into a session by the [`SessionAcceptor`].

mod history;
mod state;

pub use history::OutputHistory;
pub use state::SessionState;

use std::sync::Arc;

use ptymux_protocol::{Envelope, InputPayload, OutputPayload, ResizeGeometry, ResizePayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::router::{ConnectionHandler, RouterError, SessionEvent, SessionId, SessionRouter};
use state::{ChannelHandler, ClosedFlag};

/// Handle to one open session on a connection.
///
/// Dropping an open session unregisters it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    router: Arc<SessionRouter>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    closed: ClosedFlag,
    size: Option<ResizeGeometry>,
    history: OutputHistory,
}

impl Session {
    /// Registers a new session under `id`.
    pub fn open(router: &Arc<SessionRouter>, id: impl Into<SessionId>) -> Result<Self, RouterError> {
        let id = id.into();
        let (tx, events) = mpsc::unbounded_channel();
        let closed = ClosedFlag::default();
        router.register(id.clone(), Arc::new(ChannelHandler::new(tx, closed.clone())))?;

        debug!(session_id = %id, "Session opened");
        Ok(Self {
            history: OutputHistory::new(router.options().history_bytes),
            id,
            router: Arc::clone(router),
            events,
            closed,
            size: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.closed.state()
    }

    /// Last geometry received or sent, if any.
    pub fn size(&self) -> Option<ResizeGeometry> {
        self.size
    }

    /// Scrollback of the `OUTPUT` bytes received so far.
    pub fn history(&self) -> &OutputHistory {
        &self.history
    }

    /// Waits for the next inbound event.
    ///
    /// Yields [`SessionEvent::Closed`] once, then `None`.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let event = self.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Output(bytes) => {
                self.history.push(bytes);
            }
            SessionEvent::Resize(geometry) => self.size = Some(*geometry),
            SessionEvent::Input(_) | SessionEvent::Closed => {}
        }
    }

    fn ensure_open(&self) -> Result<(), RouterError> {
        if self.closed.is_closed() {
            return Err(RouterError::SessionClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Sends process output to the peer.
    pub async fn send_output(&self, bytes: impl Into<Vec<u8>>) -> Result<(), RouterError> {
        self.ensure_open()?;
        let payload = OutputPayload {
            session_id: self.id.clone(),
            bytes: bytes.into(),
        };
        self.router.send(&self.id, payload).await
    }

    /// Sends keystrokes to the peer.
    pub async fn send_input(&self, bytes: impl Into<Vec<u8>>) -> Result<(), RouterError> {
        self.ensure_open()?;
        let payload = InputPayload {
            session_id: self.id.clone(),
            bytes: bytes.into(),
        };
        self.router.send(&self.id, payload).await
    }

    /// Announces a new terminal geometry to the peer.
    pub async fn resize(&mut self, columns: u32, rows: u32) -> Result<(), RouterError> {
        self.ensure_open()?;
        let payload = ResizePayload {
            session_id: self.id.clone(),
            columns,
            rows,
        };
        self.router.send(&self.id, payload).await?;
        self.size = Some(ResizeGeometry { columns, rows });
        Ok(())
    }

    /// Moves the session to `Closed` and unregisters it. Idempotent.
    ///
    /// Already-queued events remain readable through [`Session::recv`].
    pub fn close(&mut self) {
        if self.closed.is_closed() {
            return;
        }
        match self.router.unregister(&self.id) {
            Ok(()) => debug!(session_id = %self.id, "Session closed"),
            Err(e) => debug!(session_id = %self.id, error = %e, "Session already gone"),
        }
        self.closed.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connection handler that opens a [`Session`] the first time the peer
/// references an unknown session id.
///
/// The triggering envelope is delivered to the new session, and the session
/// is handed out through [`IncomingSessions::accept`].
#[derive(Debug)]
pub struct SessionAcceptor {
    tx: mpsc::UnboundedSender<Session>,
}

/// Receiving end of a [`SessionAcceptor`].
#[derive(Debug)]
pub struct IncomingSessions {
    rx: mpsc::UnboundedReceiver<Session>,
}

impl SessionAcceptor {
    pub fn new() -> (Arc<Self>, IncomingSessions) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), IncomingSessions { rx })
    }
}

impl IncomingSessions {
    /// Waits for the next late-bound session. `None` once the acceptor is gone.
    pub async fn accept(&mut self) -> Option<Session> {
        self.rx.recv().await
    }
}

impl ConnectionHandler for SessionAcceptor {
    fn on_unrouted(&self, router: &Arc<SessionRouter>, session_id: &str, envelope: Envelope) {
        let session = match Session::open(router, session_id) {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Cannot accept session");
                return;
            }
        };
        router.dispatch(envelope);
        if self.tx.send(session).is_err() {
            debug!(session_id = %session_id, "No acceptor listening, session dropped");
        }
    }
}
