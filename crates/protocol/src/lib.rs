//! # ptymux Protocol Library
//!
//! Wire definitions for driving many interactive terminal sessions over one
//! ordered byte stream.
//!
//! ## Overview
//!
//! The protocol crate is the sans-IO half of ptymux. It provides:
//!
//! - **Message Definitions**: the [`Envelope`] and its mutually exclusive payloads
//! - **Wire Primitives**: varints, field tags and unknown-field skipping
//! - **Envelope Codec**: byte-exact tag-length-value encoding of envelopes
//! - **Frame Codec**: varint length-prefixed framing and a push-based reader
//!   that reassembles frames from arbitrarily chunked input
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Envelope                   │  kind + error_text + payload
//! ├─────────────────────────────────────────┤
//! │          Tag-length-value fields        │  field number / wire type
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  varint length prefix
//! ├─────────────────────────────────────────┤
//! │   Transport (socket, WebSocket, pipe)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use ptymux_protocol::{Envelope, FrameCodec, FrameReader, MessageKind};
//!
//! let envelope = Envelope::output("term1", b"hi".to_vec());
//!
//! let codec = FrameCodec::new();
//! let wire = codec.encode(&envelope).unwrap();
//!
//! let mut reader = FrameReader::new(codec);
//! reader.push(&wire);
//! let decoded = reader.next_envelope().unwrap().unwrap();
//! assert_eq!(decoded.kind, MessageKind::Output);
//! assert_eq!(decoded.session_id(), Some("term1"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope and payload definitions
//! - [`wire`]: Low-level varint and tag primitives
//! - [`codec`]: Envelope encode/decode
//! - [`framing`]: Outer frame codec and accumulation reader
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod framing;
pub mod messages;
pub mod wire;

pub use codec::{decode_with_notes, WireMessage};
pub use error::{DecodeError, ProtocolError, Result};
pub use framing::{FrameCodec, FrameReader, DEFAULT_MAX_FRAME_SIZE, MAX_PENDING_NOTES};
pub use messages::{
    Envelope, InputPayload, MessageKind, OutputPayload, Payload, ResizeGeometry, ResizePayload,
};
