//! Error types for the protocol crate.

use thiserror::Error;

/// Failure modes of the envelope and frame decoders.
///
/// Every variant except [`DecodeError::UnknownFieldSkipped`] aborts decoding
/// of the current frame. `UnknownFieldSkipped` is only ever delivered through
/// the note sink of [`crate::codec::decode_with_notes`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A declared length runs past the end of the available input.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the current item.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A variable-length integer is longer than ten bytes or overflows 64 bits.
    #[error("malformed varint")]
    BadVarint,

    /// The `kind` discriminant is not one of the known values.
    #[error("invalid message kind: {0}")]
    InvalidEnum(u64),

    /// More than one of the `output`, `input`, `resize` fields was present.
    #[error("envelope sets more than one payload")]
    MultiplePayloads,

    /// A field tag encodes field number zero or one past the 29-bit limit.
    #[error("invalid field tag: {0}")]
    InvalidTag(u64),

    /// A field tag carries a wire type this protocol cannot skip.
    #[error("unsupported wire type: {0}")]
    InvalidWireType(u8),

    /// A string field is not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    /// The outer length prefix exceeds the configured maximum.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A field with an unrecognised number was consumed and discarded.
    #[error("skipped unknown field {field} (wire type {wire_type})")]
    UnknownFieldSkipped {
        /// The unrecognised field number.
        field: u32,
        /// Its wire type.
        wire_type: u8,
    },
}

impl DecodeError {
    /// Shorthand used by the readers when a length check fails.
    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        DecodeError::Truncated { needed, available }
    }
}

/// Protocol error type covering codec and transport failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Wire bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// An envelope is too large to be framed.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer reset or aborted the connection, or the pipe broke.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Underlying transport failure.
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err),
        }
    }
}

impl ProtocolError {
    /// Returns the decode error behind this failure, if any.
    pub fn as_decode(&self) -> Option<&DecodeError> {
        match self {
            ProtocolError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
