//! Protocol message definitions for ptymux.
//!
//! An [`Envelope`] is the only top-level message. It carries a [`MessageKind`],
//! an optional diagnostic string and at most one [`Payload`]. Field numbers
//! and kind values are fixed protocol constants; see [`crate::codec`] for the
//! wire layout.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Discriminant of an envelope.
///
/// Values are intentionally sparse: control kinds sit at the bottom of the
/// range, byte-stream kinds start at 101.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum MessageKind {
    /// Unset or unrecognised by the sender.
    #[default]
    Unknown = 0,
    /// Application-level failure report; see [`Envelope::error_text`].
    Error = 1,
    /// Output produced by the remote process.
    Output = 101,
    /// Keystrokes destined for the remote process.
    Input = 102,
    /// Terminal geometry change.
    Resize = 103,
}

impl MessageKind {
    /// Wire value of this kind.
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Whether envelopes of this kind are addressed to a session.
    pub fn is_session_scoped(self) -> bool {
        matches!(
            self,
            MessageKind::Output | MessageKind::Input | MessageKind::Resize
        )
    }
}

impl TryFrom<u64> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u64) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(MessageKind::Unknown),
            1 => Ok(MessageKind::Error),
            101 => Ok(MessageKind::Output),
            102 => Ok(MessageKind::Input),
            103 => Ok(MessageKind::Resize),
            other => Err(DecodeError::InvalidEnum(other)),
        }
    }
}

/// A chunk of the remote process's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputPayload {
    /// Target session.
    pub session_id: String,
    /// Raw output bytes, possibly empty.
    pub bytes: Vec<u8>,
}

/// Input bytes to deliver to the remote process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputPayload {
    /// Target session.
    pub session_id: String,
    /// Raw input bytes, possibly empty.
    pub bytes: Vec<u8>,
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResizeGeometry {
    /// Terminal width in character cells.
    pub columns: u32,
    /// Terminal height in character cells.
    pub rows: u32,
}

/// Request to resize the remote pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResizePayload {
    /// Target session.
    pub session_id: String,
    /// Terminal width in character cells.
    pub columns: u32,
    /// Terminal height in character cells.
    pub rows: u32,
}

impl ResizePayload {
    /// The requested geometry.
    pub fn geometry(&self) -> ResizeGeometry {
        ResizeGeometry {
            columns: self.columns,
            rows: self.rows,
        }
    }
}

/// The mutually exclusive payload of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Remote process output.
    Output(OutputPayload),
    /// Input for the remote process.
    Input(InputPayload),
    /// Terminal resize request.
    Resize(ResizePayload),
}

impl Payload {
    /// The session this payload is addressed to.
    pub fn session_id(&self) -> &str {
        match self {
            Payload::Output(p) => &p.session_id,
            Payload::Input(p) => &p.session_id,
            Payload::Resize(p) => &p.session_id,
        }
    }

    /// The envelope kind matching this payload variant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Output(_) => MessageKind::Output,
            Payload::Input(_) => MessageKind::Input,
            Payload::Resize(_) => MessageKind::Resize,
        }
    }
}

impl From<OutputPayload> for Payload {
    fn from(p: OutputPayload) -> Self {
        Payload::Output(p)
    }
}

impl From<InputPayload> for Payload {
    fn from(p: InputPayload) -> Self {
        Payload::Input(p)
    }
}

impl From<ResizePayload> for Payload {
    fn from(p: ResizePayload) -> Self {
        Payload::Resize(p)
    }
}

/// The top-level message exchanged over a connection.
///
/// `kind` and the payload are independent on the wire, so a peer can send a
/// `kind` without the matching payload. The constructors below always keep
/// them consistent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminant.
    pub kind: MessageKind,
    /// Diagnostic text, meaningful when `kind` is [`MessageKind::Error`].
    pub error_text: String,
    payload: Option<Payload>,
}

impl Envelope {
    /// Creates an envelope of the given kind with no payload.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Creates an envelope whose kind matches `payload`.
    pub fn with_payload(payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            kind: payload.kind(),
            error_text: String::new(),
            payload: Some(payload),
        }
    }

    /// `OUTPUT` envelope for `session_id`.
    pub fn output(session_id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(OutputPayload {
            session_id: session_id.into(),
            bytes: bytes.into(),
        })
    }

    /// `INPUT` envelope for `session_id`.
    pub fn input(session_id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(InputPayload {
            session_id: session_id.into(),
            bytes: bytes.into(),
        })
    }

    /// `RESIZE` envelope for `session_id`.
    pub fn resize(session_id: impl Into<String>, columns: u32, rows: u32) -> Self {
        Self::with_payload(ResizePayload {
            session_id: session_id.into(),
            columns,
            rows,
        })
    }

    /// Connection-level `ERROR` envelope.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            error_text: text.into(),
            payload: None,
        }
    }

    /// The payload, if one is set.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Removes and returns the payload.
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// Replaces any previously set payload variant.
    ///
    /// `kind` is left untouched; use [`Envelope::with_payload`] to keep both
    /// in step.
    pub fn set_payload(&mut self, payload: impl Into<Payload>) {
        self.payload = Some(payload.into());
    }

    /// Clears the payload.
    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    /// Session id carried by whichever payload variant is set.
    pub fn session_id(&self) -> Option<&str> {
        self.payload.as_ref().map(Payload::session_id)
    }

    /// Returns the output payload if that variant is set.
    pub fn as_output(&self) -> Option<&OutputPayload> {
        match &self.payload {
            Some(Payload::Output(p)) => Some(p),
            _ => None,
        }
    }

    /// Returns the input payload if that variant is set.
    pub fn as_input(&self) -> Option<&InputPayload> {
        match &self.payload {
            Some(Payload::Input(p)) => Some(p),
            _ => None,
        }
    }

    /// Returns the resize payload if that variant is set.
    pub fn as_resize(&self) -> Option<&ResizePayload> {
        match &self.payload {
            Some(Payload::Resize(p)) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_values() {
        assert_eq!(MessageKind::Unknown.as_u64(), 0);
        assert_eq!(MessageKind::Error.as_u64(), 1);
        assert_eq!(MessageKind::Output.as_u64(), 101);
        assert_eq!(MessageKind::Input.as_u64(), 102);
        assert_eq!(MessageKind::Resize.as_u64(), 103);
    }

    #[test]
    fn test_kind_try_from_rejects_gaps() {
        assert_eq!(MessageKind::try_from(103).unwrap(), MessageKind::Resize);
        assert_eq!(MessageKind::try_from(2), Err(DecodeError::InvalidEnum(2)));
        assert_eq!(
            MessageKind::try_from(100),
            Err(DecodeError::InvalidEnum(100))
        );
    }

    #[test]
    fn test_default_envelope_is_zero_valued() {
        let env = Envelope::default();
        assert_eq!(env.kind, MessageKind::Unknown);
        assert!(env.error_text.is_empty());
        assert!(env.payload().is_none());
        assert!(env.session_id().is_none());
    }

    #[test]
    fn test_constructors_keep_kind_in_step() {
        let env = Envelope::output("a", b"x".to_vec());
        assert_eq!(env.kind, MessageKind::Output);
        assert_eq!(env.session_id(), Some("a"));

        let env = Envelope::resize("b", 80, 24);
        assert_eq!(env.kind, MessageKind::Resize);
        assert_eq!(
            env.as_resize().unwrap().geometry(),
            ResizeGeometry {
                columns: 80,
                rows: 24
            }
        );

        let env = Envelope::error("boom");
        assert_eq!(env.kind, MessageKind::Error);
        assert_eq!(env.error_text, "boom");
        assert!(env.session_id().is_none());
    }

    #[test]
    fn test_set_payload_replaces_previous_variant() {
        let mut env = Envelope::output("a", b"x".to_vec());
        env.set_payload(InputPayload {
            session_id: "a".to_string(),
            bytes: b"y".to_vec(),
        });
        assert!(env.as_output().is_none());
        assert_eq!(env.as_input().unwrap().bytes, b"y");
        // kind is independent of the payload slot
        assert_eq!(env.kind, MessageKind::Output);

        env.clear_payload();
        assert!(env.payload().is_none());
    }

    #[test]
    fn test_take_payload() {
        let mut env = Envelope::input("s", b"ls\n".to_vec());
        let payload = env.take_payload().unwrap();
        assert_eq!(payload.kind(), MessageKind::Input);
        assert_eq!(payload.session_id(), "s");
        assert!(env.payload().is_none());
    }

    #[test]
    fn test_session_scoped_kinds() {
        assert!(MessageKind::Output.is_session_scoped());
        assert!(MessageKind::Resize.is_session_scoped());
        assert!(!MessageKind::Error.is_session_scoped());
        assert!(!MessageKind::Unknown.is_session_scoped());
    }

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::resize("term1", 80, 24);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "RESIZE");
        assert_eq!(json["payload"]["type"], "resize");
        assert_eq!(json["payload"]["data"]["columns"], 80);
    }
}
