//! Offline decoding of captured frame streams, used by `ptymux dump`.

use ptymux_protocol::{DecodeError, Envelope, FrameCodec, FrameReader, MessageKind, Payload};

/// Everything recovered from a captured stream.
#[derive(Debug, Default)]
pub struct Capture {
    /// Envelopes decoded before the first error, in order.
    pub envelopes: Vec<Envelope>,
    /// Skipped unknown fields and other non-fatal notes.
    pub notes: Vec<DecodeError>,
    /// The error that stopped decoding, if any.
    pub error: Option<DecodeError>,
}

/// Decodes every frame in `data`.
pub fn decode_capture(data: &[u8], codec: FrameCodec) -> Capture {
    let mut reader = FrameReader::new(codec);
    reader.push(data);

    let mut capture = Capture::default();
    loop {
        match reader.next_envelope() {
            Ok(Some(envelope)) => capture.envelopes.push(envelope),
            Ok(None) => {
                capture.error = reader.finish().err();
                break;
            }
            Err(e) => {
                capture.error = Some(e);
                break;
            }
        }
    }
    capture.notes = reader.take_notes();
    capture
}

/// One-line human-readable rendering of an envelope.
pub fn describe(envelope: &Envelope) -> String {
    let mut line = format!("{:?}", envelope.kind).to_uppercase();
    if envelope.kind == MessageKind::Error || !envelope.error_text.is_empty() {
        line.push_str(&format!(" error={:?}", envelope.error_text));
    }
    match envelope.payload() {
        Some(Payload::Output(p)) => line.push_str(&format!(
            " session={:?} output={}",
            p.session_id,
            escape(&p.bytes)
        )),
        Some(Payload::Input(p)) => line.push_str(&format!(
            " session={:?} input={}",
            p.session_id,
            escape(&p.bytes)
        )),
        Some(Payload::Resize(p)) => line.push_str(&format!(
            " session={:?} resize={}x{}",
            p.session_id, p.columns, p.rows
        )),
        None => {}
    }
    line
}

fn escape(bytes: &[u8]) -> String {
    let escaped: String = bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect();
    format!("\"{}\"", escaped)
}
