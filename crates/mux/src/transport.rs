//! Async glue between a byte stream and the sans-IO protocol layer.
//!
//! [`EnvelopeStream`] turns any [`AsyncRead`] into a stream of decoded
//! envelopes, however the transport chunks its bytes. [`serve_connection`]
//! is the inbound loop: it feeds every envelope to a [`SessionRouter`] and
//! tears all sessions down when the stream ends.

use std::sync::Arc;

use ptymux_protocol::{Envelope, FrameCodec, FrameReader, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tracing::{debug, warn};

use crate::router::{ConnectionHandler, RouterOptions, SessionRouter};

/// Default size of a single transport read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Decodes envelopes from an async byte stream.
#[derive(Debug)]
pub struct EnvelopeStream<R> {
    reader: R,
    frames: FrameReader,
    read_buffer_size: usize,
    eof: bool,
}

impl<R> EnvelopeStream<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            frames: FrameReader::new(codec),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            eof: false,
        }
    }

    /// Sets how many bytes are requested per read. Clamped to at least 1.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Envelopes decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames.frames_decoded()
    }

    /// Reads until one full envelope is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends inside
    /// a frame yields [`ptymux_protocol::DecodeError::Truncated`]; a reset or
    /// aborted transport yields [`ProtocolError::ConnectionClosed`].
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        loop {
            let next = self.frames.next_envelope();
            self.log_notes();
            if let Some(envelope) = next? {
                return Ok(Some(envelope));
            }

            if self.eof {
                self.frames.finish()?;
                return Ok(None);
            }

            let buf = self.frames.buffer_mut();
            buf.reserve(self.read_buffer_size);
            let n = self.reader.read_buf(buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    fn log_notes(&mut self) {
        for note in self.frames.take_notes() {
            debug!(note = %note, "Decode note");
        }
    }
}

/// Splits a duplex transport into a router owning the write half and an
/// envelope stream over the read half.
pub fn split_connection<S>(
    io: S,
    options: RouterOptions,
    read_buffer_size: usize,
    handler: Arc<dyn ConnectionHandler>,
) -> (Arc<SessionRouter>, EnvelopeStream<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let stream = EnvelopeStream::new(read_half, options.codec)
        .with_read_buffer_size(read_buffer_size);
    let router = SessionRouter::with_handler(write_half, options, handler);
    (router, stream)
}

/// Runs the inbound loop until the stream ends.
///
/// Every session is closed on the way out. The result is `Ok(())` for a
/// clean end of stream and the first decode or I/O error otherwise.
pub async fn serve_connection<R>(
    mut stream: EnvelopeStream<R>,
    router: Arc<SessionRouter>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let result = loop {
        match stream.next_envelope().await {
            Ok(Some(envelope)) => {
                router.dispatch(envelope);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let sessions = router.session_count();
    router.close_all();
    match &result {
        Ok(()) => debug!(
            frames = stream.frames_decoded(),
            sessions,
            "Connection ended"
        ),
        Err(e) => warn!(error = %e, sessions, "Connection failed"),
    }
    result
}
