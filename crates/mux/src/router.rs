//! Session router: demultiplexes inbound envelopes to per-session handlers and
//! serializes outbound envelopes from many sessions onto one stream.
//!
//! Inbound, [`SessionRouter::dispatch`] looks up the handler registered for
//! the envelope's session id. `ERROR` and `UNKNOWN` envelopes carry no session
//! id and go to the [`ConnectionHandler`], as do envelopes for ids with no
//! registered handler ("unrouted").
//!
//! Outbound, every envelope is encoded into one contiguous frame before the
//! writer lock is taken, and the frame is written to completion while the
//! lock is held. That lock is the only one guarding the stream; concurrent
//! `send` calls therefore never interleave partial frames.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ptymux_protocol::{
    Envelope, FrameCodec, InputPayload, MessageKind, OutputPayload, Payload, ProtocolError,
    ResizeGeometry, ResizePayload,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::Config;

/// Opaque session identifier, routed by value.
pub type SessionId = String;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that can occur during routing or sending.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// A handler is already registered under this id.
    #[error("session already registered: {0}")]
    DuplicateSession(SessionId),

    /// No handler is registered under this id.
    #[error("session not registered: {0}")]
    NotRegistered(SessionId),

    /// Session ids must be non-empty.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(SessionId),

    /// The payload names a different session than the one it is sent for.
    #[error("payload addressed to {found:?}, expected {expected:?}")]
    SessionMismatch {
        /// Id the caller sent for.
        expected: SessionId,
        /// Id inside the payload.
        found: SessionId,
    },

    /// The session has reached its terminal state.
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    /// Registration would exceed the configured session limit.
    #[error("too many sessions: limit is {0}")]
    TooManySessions(usize),

    /// The connection was torn down or a previous write failed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Encoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Writing to the transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Traffic delivered to a session handler, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes from an `OUTPUT` envelope.
    Output(Vec<u8>),
    /// Bytes from an `INPUT` envelope.
    Input(Vec<u8>),
    /// Geometry from a `RESIZE` envelope.
    Resize(ResizeGeometry),
    /// The session was unregistered or the connection went away. Always last.
    Closed,
}

impl From<Payload> for SessionEvent {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Output(p) => SessionEvent::Output(p.bytes),
            Payload::Input(p) => SessionEvent::Input(p.bytes),
            Payload::Resize(p) => SessionEvent::Resize(p.geometry()),
        }
    }
}

impl SessionEvent {
    /// Rebuilds the payload this event was decoded from. `None` for `Closed`.
    pub fn into_payload(self, session_id: &str) -> Option<Payload> {
        let session_id = session_id.to_string();
        let payload = match self {
            SessionEvent::Output(bytes) => Payload::Output(OutputPayload { session_id, bytes }),
            SessionEvent::Input(bytes) => Payload::Input(InputPayload { session_id, bytes }),
            SessionEvent::Resize(geometry) => Payload::Resize(ResizePayload {
                session_id,
                columns: geometry.columns,
                rows: geometry.rows,
            }),
            SessionEvent::Closed => return None,
        };
        Some(payload)
    }
}

/// Receives the traffic of one registered session.
///
/// Called from the dispatch loop; implementations must not block. Queue the
/// event and return.
pub trait SessionHandler: Send + Sync {
    /// Handles one event for `session_id`.
    ///
    /// A handler that can no longer take traffic (its session closed after
    /// the router looked it up) hands the event back; the router then reports
    /// the frame as unrouted. The result for `Closed` is ignored.
    fn on_event(&self, session_id: &str, event: SessionEvent) -> Result<(), SessionEvent>;
}

/// Receives connection-scoped traffic and routing misses.
///
/// Every method has a logging default, so `impl ConnectionHandler for X {}`
/// gives the "drop with a diagnostic" policy.
pub trait ConnectionHandler: Send + Sync {
    /// A peer reported a failure with a `kind = ERROR` envelope.
    fn on_error(&self, text: &str) {
        warn!(error_text = %text, "Received error from peer");
    }

    /// An `UNKNOWN` envelope, or a session kind with no payload.
    fn on_unknown(&self, envelope: &Envelope) {
        debug!(kind = ?envelope.kind, "Ignoring envelope with no routable payload");
    }

    /// An envelope for a session id with no registered handler, or one whose
    /// session closed while it was being delivered.
    ///
    /// The handler may register a session here; the router holds no lock
    /// while calling it.
    fn on_unrouted(&self, _router: &Arc<SessionRouter>, session_id: &str, envelope: Envelope) {
        warn!(
            session_id = %session_id,
            kind = ?envelope.kind,
            "Dropping message for unregistered session"
        );
    }
}

/// The default connection handler: logs and drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl ConnectionHandler for LoggingHandler {}

/// Where [`SessionRouter::dispatch`] sent an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to a registered session handler.
    Delivered,
    /// Reported to [`ConnectionHandler::on_unrouted`].
    Unrouted,
    /// Delivered to the connection handler as a connection-level event.
    Connection,
}

/// Tunables for a router.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Frame codec used for outbound envelopes.
    pub codec: FrameCodec,
    /// Maximum number of concurrently registered sessions.
    pub max_sessions: usize,
    /// Scrollback kept by each [`crate::session::Session`], in bytes.
    pub history_bytes: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            codec: FrameCodec::new(),
            max_sessions: 64,
            history_bytes: 1024 * 1024,
        }
    }
}

impl RouterOptions {
    /// Options derived from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            codec: FrameCodec::with_max_frame_size(config.connection.max_frame_size),
            max_sessions: config.session.max_sessions,
            history_bytes: config.session.history_bytes,
        }
    }
}

/// Snapshot of router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Envelopes handed to a session handler.
    pub frames_delivered: u64,
    /// Envelopes reported as unrouted.
    pub frames_unrouted: u64,
    /// `ERROR`/`UNKNOWN` envelopes handed to the connection handler.
    pub connection_events: u64,
    /// Frames written to the transport.
    pub frames_sent: u64,
    /// Bytes written to the transport.
    pub bytes_sent: u64,
    /// Currently registered sessions.
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    unrouted: AtomicU64,
    connection_events: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Marks the writer unusable if a frame write does not run to completion,
/// e.g. because the `send` future was dropped halfway.
struct PoisonOnDrop<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl Drop for PoisonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Routes envelopes between one connection and many sessions.
pub struct SessionRouter {
    /// Map of session ID to its handler.
    sessions: DashMap<SessionId, Arc<dyn SessionHandler>>,
    /// Registered plus in-flight registrations, for the session limit.
    reserved: AtomicUsize,
    /// The single outgoing stream.
    writer: Mutex<BoxedWriter>,
    /// Connection-level events and routing misses.
    connection_handler: Arc<dyn ConnectionHandler>,
    options: RouterOptions,
    /// Set on teardown or after a failed write.
    closed: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("sessions", &self.sessions.len())
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionRouter {
    /// Creates a router with default options that logs unrouted traffic.
    pub fn new<W>(writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_handler(writer, RouterOptions::default(), Arc::new(LoggingHandler))
    }

    /// Creates a router with explicit options and connection handler.
    pub fn with_handler<W>(
        writer: W,
        options: RouterOptions,
        connection_handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            writer: Mutex::new(Box::new(writer)),
            connection_handler,
            options,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// The options this router was built with.
    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Associates `handler` with `session_id`.
    pub fn register(
        &self,
        session_id: impl Into<SessionId>,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<(), RouterError> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(RouterError::InvalidSessionId(session_id));
        }
        if self.is_closed() {
            return Err(RouterError::ConnectionClosed);
        }

        let max = self.options.max_sessions;
        if self.reserved.fetch_add(1, Ordering::SeqCst) >= max {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            warn!(session_id = %session_id, max, "Session limit reached");
            return Err(RouterError::TooManySessions(max));
        }

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(entry) => {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                return Err(RouterError::DuplicateSession(entry.key().clone()));
            }
            Entry::Vacant(entry) => {
                debug!(session_id = %entry.key(), "Registered session");
                entry.insert(Arc::clone(&handler));
            }
        }

        // `close_all` may have snapshotted the map between the check above
        // and the insert; back out so no session outlives the connection.
        if self.is_closed() {
            let ours = self
                .sessions
                .remove_if(&session_id, |_, registered| Arc::ptr_eq(registered, &handler));
            if ours.is_some() {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(session_id = %session_id, "Registration raced teardown");
            return Err(RouterError::ConnectionClosed);
        }
        Ok(())
    }

    /// Removes the handler for `session_id` and tells it the session closed.
    ///
    /// Frames for this id that arrive afterwards are reported as unrouted.
    pub fn unregister(&self, session_id: &str) -> Result<(), RouterError> {
        let (session_id, handler) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RouterError::NotRegistered(session_id.to_string()))?;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        debug!(session_id = %session_id, "Unregistered session");
        let _ = handler.on_event(&session_id, SessionEvent::Closed);
        Ok(())
    }

    /// Whether a handler is registered for `session_id`.
    pub fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of all registered sessions.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Connection teardown: closes every session and refuses further
    /// registrations and writes.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for session_id in self.session_ids() {
            if let Some((session_id, handler)) = self.sessions.remove(&session_id) {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                debug!(session_id = %session_id, "Closing session on teardown");
                let _ = handler.on_event(&session_id, SessionEvent::Closed);
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Routes one decoded envelope.
    pub fn dispatch(self: &Arc<Self>, mut envelope: Envelope) -> Dispatch {
        if !envelope.kind.is_session_scoped() || envelope.payload().is_none() {
            self.counters
                .connection_events
                .fetch_add(1, Ordering::Relaxed);
            match envelope.kind {
                MessageKind::Error => self.connection_handler.on_error(&envelope.error_text),
                _ => self.connection_handler.on_unknown(&envelope),
            }
            return Dispatch::Connection;
        }

        let Some(payload) = envelope.take_payload() else {
            return Dispatch::Connection;
        };
        if payload.kind() != envelope.kind {
            debug!(
                kind = ?envelope.kind,
                payload = ?payload.kind(),
                "Envelope kind disagrees with payload; routing by payload"
            );
        }

        let session_id = payload.session_id().to_string();
        // Clone out of the map so no shard lock is held while handlers run.
        let handler = self
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            envelope.set_payload(payload);
            return self.report_unrouted(&session_id, envelope);
        };

        trace!(session_id = %session_id, kind = ?payload.kind(), "Dispatching");
        match handler.on_event(&session_id, payload.into()) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Dispatch::Delivered
            }
            Err(rejected) => {
                // The session closed after the lookup.
                debug!(session_id = %session_id, "Session closed during delivery");
                if let Some(payload) = rejected.into_payload(&session_id) {
                    envelope.set_payload(payload);
                }
                self.report_unrouted(&session_id, envelope)
            }
        }
    }

    fn report_unrouted(self: &Arc<Self>, session_id: &str, envelope: Envelope) -> Dispatch {
        self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
        self.connection_handler
            .on_unrouted(self, session_id, envelope);
        Dispatch::Unrouted
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Encodes `payload` for `session_id` and writes it as one frame.
    ///
    /// May wait for the writer lock and for transport backpressure. Do not
    /// call while holding anything the dispatch loop needs.
    pub async fn send(
        &self,
        session_id: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), RouterError> {
        let payload = payload.into();
        if session_id.is_empty() {
            return Err(RouterError::InvalidSessionId(String::new()));
        }
        if payload.session_id() != session_id {
            return Err(RouterError::SessionMismatch {
                expected: session_id.to_string(),
                found: payload.session_id().to_string(),
            });
        }
        self.send_envelope(&Envelope::with_payload(payload)).await
    }

    /// Writes a connection-level `ERROR` envelope.
    pub async fn send_error(&self, text: impl Into<String>) -> Result<(), RouterError> {
        self.send_envelope(&Envelope::error(text)).await
    }

    /// Writes an arbitrary envelope as one frame.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RouterError> {
        if self.is_closed() {
            return Err(RouterError::ConnectionClosed);
        }

        // Encode fully before touching the stream.
        let frame = self.options.codec.encode(envelope)?;

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(RouterError::ConnectionClosed);
        }

        let mut guard = PoisonOnDrop {
            flag: &self.closed,
            armed: true,
        };
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                guard.armed = false;
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                trace!(kind = ?envelope.kind, bytes = frame.len(), "Frame written");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Write failed; connection unusable");
                Err(e.into())
            }
        }
    }

    /// Flushes and shuts down the write half of the transport.
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        let mut writer = self.writer.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        writer.shutdown().await?;
        Ok(())
    }

    /// Returns a snapshot of the router counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            connection_events: self.counters.connection_events.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.len(),
        }
    }
}
