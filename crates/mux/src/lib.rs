//! # ptymux
//!
//! Multiplexes many interactive terminal sessions over one ordered byte
//! stream, using the envelope protocol from [`ptymux_protocol`].
//!
//! ## Overview
//!
//! - **Session Router**: demultiplexes inbound envelopes by session id and
//!   serializes outbound envelopes so frames never interleave
//! - **Sessions**: per-terminal handles with ordered inbound queues, last
//!   known geometry and output scrollback
//! - **Transport**: decodes envelopes from any `AsyncRead` and drives the
//!   router until the stream ends
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Session A   │   │  Session B   │   │  Session C   │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │     recv / send  │                  │
//! ┌──────┴──────────────────┴──────────────────┴───────┐
//! │                   Session Router                   │
//! │   dispatch (by session id)   send (one frame, one  │
//! │                              lock, no interleave)  │
//! ├────────────────────────────────────────────────────┤
//! │          EnvelopeStream  /  write half             │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ptymux::{serve_connection, split_connection, LoggingHandler, RouterOptions, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:7681").await?;
//!     let (router, stream) =
//!         split_connection(socket, RouterOptions::default(), 8192, Arc::new(LoggingHandler));
//!     tokio::spawn(serve_connection(stream, Arc::clone(&router)));
//!
//!     let mut session = Session::open(&router, "term1")?;
//!     session.resize(80, 24).await?;
//!     session.send_input(b"ls\n".to_vec()).await?;
//!     while let Some(event) = session.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`router`]: Session registry, dispatch and serialized sends
//! - [`session`]: Session handles and late binding
//! - [`transport`]: Async frame stream and the inbound loop
//! - [`config`]: Configuration loading and defaults
//! - [`echo`]: Loopback peer
//! - [`inspect`]: Offline decoding of captured streams

pub mod config;
pub mod echo;
pub mod inspect;
pub mod router;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use ptymux_protocol as protocol;

pub use config::{Config, ConfigError};
pub use router::{
    ConnectionHandler, Dispatch, LoggingHandler, RouterError, RouterOptions, RouterStats,
    SessionEvent, SessionHandler, SessionId, SessionRouter,
};
pub use session::{IncomingSessions, OutputHistory, Session, SessionAcceptor, SessionState};
pub use transport::{serve_connection, split_connection, EnvelopeStream};
