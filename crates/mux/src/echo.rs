//! Loopback peer used by `ptymux serve`.
//!
//! Sessions are bound on first reference and every `INPUT` chunk is written
//! back as `OUTPUT` on the same session, which makes it a convenient target
//! for exercising clients.

use ptymux_protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::router::{RouterError, RouterOptions, SessionEvent};
use crate::session::{Session, SessionAcceptor};
use crate::transport::{serve_connection, split_connection};

/// Echoes one session's input until it closes.
pub async fn echo_session(mut session: Session) -> Result<(), RouterError> {
    info!(session_id = %session.id(), "Echo session started");
    while let Some(event) = session.recv().await {
        match event {
            SessionEvent::Input(bytes) => session.send_output(bytes).await?,
            SessionEvent::Resize(geometry) => {
                debug!(
                    session_id = %session.id(),
                    columns = geometry.columns,
                    rows = geometry.rows,
                    "Resize"
                );
            }
            SessionEvent::Output(_) => {}
            SessionEvent::Closed => break,
        }
    }
    debug!(session_id = %session.id(), "Echo session finished");
    Ok(())
}

/// Serves one connection as an echo peer until the stream ends.
pub async fn serve_echo<S>(
    io: S,
    options: RouterOptions,
    read_buffer_size: usize,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (acceptor, mut incoming) = SessionAcceptor::new();
    let (router, stream) = split_connection(io, options, read_buffer_size, acceptor);

    tokio::spawn(async move {
        while let Some(session) = incoming.accept().await {
            tokio::spawn(async move {
                let id = session.id().to_string();
                if let Err(e) = echo_session(session).await {
                    debug!(session_id = %id, error = %e, "Echo session ended with error");
                }
            });
        }
    });

    serve_connection(stream, router).await
}
