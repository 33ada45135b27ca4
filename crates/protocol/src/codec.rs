//! Envelope codec.
//!
//! # Wire Layout
//!
//! `Envelope`:
//! - 1: `kind` (varint)
//! - 2: `error_text` (length-delimited UTF-8)
//! - 3: `output` (length-delimited `OutputPayload`)
//! - 4: `input` (length-delimited `InputPayload`)
//! - 5: `resize` (length-delimited `ResizePayload`)
//!
//! `OutputPayload` / `InputPayload`:
//! - 1: `session_id` (length-delimited UTF-8)
//! - 2: `bytes` (length-delimited)
//!
//! `ResizePayload`:
//! - 1: `session_id` (length-delimited UTF-8)
//! - 2: `columns` (varint)
//! - 3: `rows` (varint)
//!
//! Fields are written in ascending field-number order. Scalar fields holding
//! their default value are omitted; a set payload is always written, even
//! when its body is empty, so the variant survives a round trip.
//!
//! Decoding accepts any field order. A scalar that appears twice keeps the
//! last value; a payload field that appears twice is merged into the first
//! occurrence. Two *different* payload fields fail with
//! [`DecodeError::MultiplePayloads`]. Unknown fields, and known fields sent
//! with an unexpected wire type, are skipped.

use bytes::BufMut;

use crate::error::DecodeError;
use crate::messages::{Envelope, InputPayload, MessageKind, OutputPayload, Payload, ResizePayload};
use crate::wire::{
    bytes_field_len, put_bytes_field, put_varint_field, varint_field_len, WireReader, WireType,
};

/// Field numbers of [`Envelope`].
pub mod envelope_fields {
    /// `kind`
    pub const KIND: u32 = 1;
    /// `error_text`
    pub const ERROR_TEXT: u32 = 2;
    /// `output`
    pub const OUTPUT: u32 = 3;
    /// `input`
    pub const INPUT: u32 = 4;
    /// `resize`
    pub const RESIZE: u32 = 5;
}

/// Field numbers shared by the payload messages.
pub mod payload_fields {
    /// `session_id`
    pub const SESSION_ID: u32 = 1;
    /// `bytes` for output and input payloads.
    pub const BYTES: u32 = 2;
    /// `columns` for resize payloads.
    pub const COLUMNS: u32 = 2;
    /// `rows` for resize payloads.
    pub const ROWS: u32 = 3;
}

/// Sink for non-fatal decode observations.
pub type NoteSink<'a> = dyn FnMut(DecodeError) + 'a;

/// A message with a tag-length-value encoding.
pub trait WireMessage: Default + Sized {
    /// Exact number of bytes [`WireMessage::encode_raw`] will write.
    fn encoded_len(&self) -> usize;

    /// Writes every non-default field in ascending field order.
    fn encode_raw<B: BufMut>(&self, buf: &mut B);

    /// Applies one field read from the wire.
    fn merge_field(
        &mut self,
        field: u32,
        wire_type: WireType,
        reader: &mut WireReader<'_>,
        notes: &mut NoteSink<'_>,
    ) -> Result<(), DecodeError>;

    /// Merges every field in `buf` into `self`.
    fn merge(&mut self, buf: &[u8], notes: &mut NoteSink<'_>) -> Result<(), DecodeError> {
        let mut reader = WireReader::new(buf);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            self.merge_field(field, wire_type, &mut reader, notes)?;
        }
        Ok(())
    }

    /// Encodes into a freshly allocated buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_raw(&mut buf);
        buf
    }

    /// Decodes a complete message body, ignoring unknown fields silently.
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode_with_notes(buf, &mut |_| {})
    }
}

/// Decodes a complete message body, reporting skipped fields to `notes`.
pub fn decode_with_notes<M: WireMessage>(
    buf: &[u8],
    notes: &mut NoteSink<'_>,
) -> Result<M, DecodeError> {
    let mut message = M::default();
    message.merge(buf, notes)?;
    Ok(message)
}

fn skip_unknown(
    field: u32,
    wire_type: WireType,
    reader: &mut WireReader<'_>,
    notes: &mut NoteSink<'_>,
) -> Result<(), DecodeError> {
    reader.skip(wire_type)?;
    notes(DecodeError::UnknownFieldSkipped {
        field,
        wire_type: wire_type as u8,
    });
    Ok(())
}

fn string_field_len(field: u32, value: &str) -> usize {
    if value.is_empty() {
        0
    } else {
        bytes_field_len(field, value.len())
    }
}

fn bytes_len_if_set(field: u32, value: &[u8]) -> usize {
    if value.is_empty() {
        0
    } else {
        bytes_field_len(field, value.len())
    }
}

fn put_bytes_if_set<B: BufMut>(buf: &mut B, field: u32, value: &[u8]) {
    if !value.is_empty() {
        put_bytes_field(buf, field, value);
    }
}

fn put_message_field<B: BufMut, M: WireMessage>(buf: &mut B, field: u32, message: &M) {
    crate::wire::put_tag(buf, field, WireType::LengthDelimited);
    crate::wire::put_varint(buf, message.encoded_len() as u64);
    message.encode_raw(buf);
}

fn message_field_len<M: WireMessage>(field: u32, message: &M) -> usize {
    bytes_field_len(field, message.encoded_len())
}

/// Byte-stream payloads share a layout; this keeps the two impls identical.
macro_rules! impl_stream_payload {
    ($ty:ty) => {
        impl WireMessage for $ty {
            fn encoded_len(&self) -> usize {
                string_field_len(payload_fields::SESSION_ID, &self.session_id)
                    + bytes_len_if_set(payload_fields::BYTES, &self.bytes)
            }

            fn encode_raw<B: BufMut>(&self, buf: &mut B) {
                put_bytes_if_set(buf, payload_fields::SESSION_ID, self.session_id.as_bytes());
                put_bytes_if_set(buf, payload_fields::BYTES, &self.bytes);
            }

            fn merge_field(
                &mut self,
                field: u32,
                wire_type: WireType,
                reader: &mut WireReader<'_>,
                notes: &mut NoteSink<'_>,
            ) -> Result<(), DecodeError> {
                match (field, wire_type) {
                    (payload_fields::SESSION_ID, WireType::LengthDelimited) => {
                        self.session_id = reader.read_string()?;
                    }
                    (payload_fields::BYTES, WireType::LengthDelimited) => {
                        self.bytes = reader.read_length_delimited()?.to_vec();
                    }
                    _ => skip_unknown(field, wire_type, reader, notes)?,
                }
                Ok(())
            }
        }
    };
}

impl_stream_payload!(OutputPayload);
impl_stream_payload!(InputPayload);

impl WireMessage for ResizePayload {
    fn encoded_len(&self) -> usize {
        let mut len = string_field_len(payload_fields::SESSION_ID, &self.session_id);
        if self.columns != 0 {
            len += varint_field_len(payload_fields::COLUMNS, u64::from(self.columns));
        }
        if self.rows != 0 {
            len += varint_field_len(payload_fields::ROWS, u64::from(self.rows));
        }
        len
    }

    fn encode_raw<B: BufMut>(&self, buf: &mut B) {
        put_bytes_if_set(buf, payload_fields::SESSION_ID, self.session_id.as_bytes());
        if self.columns != 0 {
            put_varint_field(buf, payload_fields::COLUMNS, u64::from(self.columns));
        }
        if self.rows != 0 {
            put_varint_field(buf, payload_fields::ROWS, u64::from(self.rows));
        }
    }

    fn merge_field(
        &mut self,
        field: u32,
        wire_type: WireType,
        reader: &mut WireReader<'_>,
        notes: &mut NoteSink<'_>,
    ) -> Result<(), DecodeError> {
        match (field, wire_type) {
            (payload_fields::SESSION_ID, WireType::LengthDelimited) => {
                self.session_id = reader.read_string()?;
            }
            // uint32 on the wire: wider values are truncated, as other decoders do
            (payload_fields::COLUMNS, WireType::Varint) => {
                self.columns = reader.read_varint()? as u32;
            }
            (payload_fields::ROWS, WireType::Varint) => {
                self.rows = reader.read_varint()? as u32;
            }
            _ => skip_unknown(field, wire_type, reader, notes)?,
        }
        Ok(())
    }
}

impl WireMessage for Envelope {
    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.kind != MessageKind::Unknown {
            len += varint_field_len(envelope_fields::KIND, self.kind.as_u64());
        }
        len += string_field_len(envelope_fields::ERROR_TEXT, &self.error_text);
        len += match self.payload() {
            None => 0,
            Some(Payload::Output(p)) => message_field_len(envelope_fields::OUTPUT, p),
            Some(Payload::Input(p)) => message_field_len(envelope_fields::INPUT, p),
            Some(Payload::Resize(p)) => message_field_len(envelope_fields::RESIZE, p),
        };
        len
    }

    fn encode_raw<B: BufMut>(&self, buf: &mut B) {
        if self.kind != MessageKind::Unknown {
            put_varint_field(buf, envelope_fields::KIND, self.kind.as_u64());
        }
        put_bytes_if_set(buf, envelope_fields::ERROR_TEXT, self.error_text.as_bytes());
        match self.payload() {
            None => {}
            Some(Payload::Output(p)) => put_message_field(buf, envelope_fields::OUTPUT, p),
            Some(Payload::Input(p)) => put_message_field(buf, envelope_fields::INPUT, p),
            Some(Payload::Resize(p)) => put_message_field(buf, envelope_fields::RESIZE, p),
        }
    }

    fn merge_field(
        &mut self,
        field: u32,
        wire_type: WireType,
        reader: &mut WireReader<'_>,
        notes: &mut NoteSink<'_>,
    ) -> Result<(), DecodeError> {
        match (field, wire_type) {
            (envelope_fields::KIND, WireType::Varint) => {
                self.kind = MessageKind::try_from(reader.read_varint()?)?;
            }
            (envelope_fields::ERROR_TEXT, WireType::LengthDelimited) => {
                self.error_text = reader.read_string()?;
            }
            (
                envelope_fields::OUTPUT | envelope_fields::INPUT | envelope_fields::RESIZE,
                WireType::LengthDelimited,
            ) => {
                let body = reader.read_length_delimited()?;
                let mut payload = match (self.take_payload(), field) {
                    (None, envelope_fields::OUTPUT) => Payload::Output(OutputPayload::default()),
                    (None, envelope_fields::INPUT) => Payload::Input(InputPayload::default()),
                    (None, _) => Payload::Resize(ResizePayload::default()),
                    (Some(existing), _) => existing,
                };
                match (&mut payload, field) {
                    (Payload::Output(p), envelope_fields::OUTPUT) => p.merge(body, notes)?,
                    (Payload::Input(p), envelope_fields::INPUT) => p.merge(body, notes)?,
                    (Payload::Resize(p), envelope_fields::RESIZE) => p.merge(body, notes)?,
                    _ => return Err(DecodeError::MultiplePayloads),
                }
                self.set_payload(payload);
            }
            _ => skip_unknown(field, wire_type, reader, notes)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{put_tag, put_varint};

    fn roundtrip(env: &Envelope) -> Envelope {
        Envelope::decode(&env.encode_to_vec()).unwrap()
    }

    #[test]
    fn test_zero_envelope_encodes_to_nothing() {
        let env = Envelope::default();
        assert!(env.encode_to_vec().is_empty());
        assert_eq!(Envelope::decode(&[]).unwrap(), Envelope::default());
    }

    #[test]
    fn test_output_exact_bytes() {
        let env = Envelope::output("term1", vec![0x68, 0x69]);
        let expected: Vec<u8> = vec![
            0x08, 0x65, // kind = 101
            0x1A, 0x0B, // field 3, len 11
            0x0A, 0x05, b't', b'e', b'r', b'm', b'1', // session_id
            0x12, 0x02, 0x68, 0x69, // bytes
        ];
        assert_eq!(env.encode_to_vec(), expected);
        assert_eq!(env.encoded_len(), expected.len());
    }

    #[test]
    fn test_resize_exact_bytes() {
        let env = Envelope::resize("t", 80, 24);
        let expected: Vec<u8> = vec![
            0x08, 0x67, // kind = 103
            0x2A, 0x07, // field 5, len 7
            0x0A, 0x01, b't', // session_id
            0x10, 0x50, // columns = 80
            0x18, 0x18, // rows = 24
        ];
        assert_eq!(env.encode_to_vec(), expected);
    }

    #[test]
    fn test_roundtrip_each_variant() {
        let cases = vec![
            Envelope::output("a", b"hello".to_vec()),
            Envelope::input("b", vec![0x1B, b'[', b'A']),
            Envelope::resize("c", 200, 50),
            Envelope::error("remote process exited"),
            Envelope::new(MessageKind::Output),
            Envelope::output("", Vec::new()),
            Envelope::resize("zero", 0, 0),
        ];
        for env in cases {
            assert_eq!(roundtrip(&env), env);
        }
    }

    fn random_text(rng: &mut impl rand::Rng, max_chars: usize) -> String {
        const CHARS: &[char] = &['a', 'Z', '0', ' ', '-', '\n', '\u{e9}', '\u{2211}', '\u{1F600}'];
        let len = rng.gen_range(0..=max_chars);
        (0..len)
            .map(|_| CHARS[rng.gen_range(0..CHARS.len())])
            .collect()
    }

    fn random_bytes(rng: &mut impl rand::Rng, max_len: usize) -> Vec<u8> {
        let len = rng.gen_range(0..=max_len);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn random_envelope(rng: &mut impl rand::Rng) -> Envelope {
        const KINDS: [MessageKind; 5] = [
            MessageKind::Unknown,
            MessageKind::Error,
            MessageKind::Output,
            MessageKind::Input,
            MessageKind::Resize,
        ];
        let mut env = Envelope::new(KINDS[rng.gen_range(0..KINDS.len())]);
        if rng.gen_bool(0.3) {
            env.error_text = random_text(rng, 40);
        }
        let session_id = random_text(rng, 12);
        match rng.gen_range(0..4) {
            0 => {}
            1 => env.set_payload(OutputPayload {
                session_id,
                bytes: random_bytes(rng, 300),
            }),
            2 => env.set_payload(InputPayload {
                session_id,
                bytes: random_bytes(rng, 300),
            }),
            _ => env.set_payload(ResizePayload {
                session_id,
                // Mix small and full-width dimensions.
                columns: if rng.gen_bool(0.5) { rng.gen_range(0..500) } else { rng.gen() },
                rows: if rng.gen_bool(0.5) { rng.gen_range(0..200) } else { rng.gen() },
            }),
        }
        env
    }

    #[test]
    fn test_roundtrip_random_envelopes() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let env = random_envelope(&mut rng);
            let encoded = env.encode_to_vec();
            assert_eq!(encoded.len(), env.encoded_len(), "{:?}", env);
            assert_eq!(Envelope::decode(&encoded), Ok(env.clone()), "{:?}", env);
        }
    }

    #[test]
    fn test_empty_payload_variant_survives() {
        let env = Envelope::input("", Vec::new());
        let encoded = env.encode_to_vec();
        // kind + empty sub-message
        assert_eq!(encoded, vec![0x08, 0x66, 0x22, 0x00]);
        assert_eq!(Envelope::decode(&encoded).unwrap().as_input(), Some(&InputPayload::default()));
    }

    #[test]
    fn test_large_bytes_roundtrip() {
        let data: Vec<u8> = (0..70_000).map(|i| (i % 251) as u8).collect();
        let env = Envelope::output("big", data.clone());
        let decoded = roundtrip(&env);
        assert_eq!(decoded.as_output().unwrap().bytes, data);
    }

    #[test]
    fn test_multiple_payloads_rejected() {
        let mut buf = Vec::new();
        put_message_field(&mut buf, envelope_fields::OUTPUT, &OutputPayload::default());
        put_message_field(&mut buf, envelope_fields::INPUT, &InputPayload::default());
        assert_eq!(Envelope::decode(&buf), Err(DecodeError::MultiplePayloads));
    }

    #[test]
    fn test_repeated_payload_field_merges() {
        let mut buf = Vec::new();
        put_message_field(
            &mut buf,
            envelope_fields::OUTPUT,
            &OutputPayload {
                session_id: "s".to_string(),
                bytes: Vec::new(),
            },
        );
        put_message_field(
            &mut buf,
            envelope_fields::OUTPUT,
            &OutputPayload {
                session_id: String::new(),
                bytes: b"z".to_vec(),
            },
        );
        let env = Envelope::decode(&buf).unwrap();
        let out = env.as_output().unwrap();
        assert_eq!(out.session_id, "s");
        assert_eq!(out.bytes, b"z");
    }

    #[test]
    fn test_field_order_independent() {
        let mut buf = Vec::new();
        put_message_field(
            &mut buf,
            envelope_fields::RESIZE,
            &ResizePayload {
                session_id: "x".to_string(),
                columns: 1,
                rows: 2,
            },
        );
        put_varint_field(&mut buf, envelope_fields::KIND, 103);
        assert_eq!(Envelope::decode(&buf).unwrap(), Envelope::resize("x", 1, 2));
    }

    #[test]
    fn test_invalid_kind_rejected() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, envelope_fields::KIND, 42);
        assert_eq!(Envelope::decode(&buf), Err(DecodeError::InvalidEnum(42)));
    }

    #[test]
    fn test_unknown_fields_skipped_with_notes() {
        let mut buf = Envelope::input("k", b"q".to_vec()).encode_to_vec();
        put_varint_field(&mut buf, 9, 12345);
        put_bytes_field(&mut buf, 15, b"future");
        put_tag(&mut buf, 20, WireType::Fixed32);
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let mut notes = Vec::new();
        let env: Envelope = decode_with_notes(&buf, &mut |n| notes.push(n)).unwrap();
        assert_eq!(env, Envelope::input("k", b"q".to_vec()));
        assert_eq!(
            notes,
            vec![
                DecodeError::UnknownFieldSkipped {
                    field: 9,
                    wire_type: 0
                },
                DecodeError::UnknownFieldSkipped {
                    field: 15,
                    wire_type: 2
                },
                DecodeError::UnknownFieldSkipped {
                    field: 20,
                    wire_type: 5
                },
            ]
        );
    }

    #[test]
    fn test_unknown_field_inside_payload_skipped() {
        let mut body = Vec::new();
        put_bytes_field(&mut body, 1, b"s");
        put_varint_field(&mut body, 7, 1);
        put_bytes_field(&mut body, 2, b"data");
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 1, 101);
        put_bytes_field(&mut buf, 3, &body);

        let env = Envelope::decode(&buf).unwrap();
        assert_eq!(env, Envelope::output("s", b"data".to_vec()));
    }

    #[test]
    fn test_known_field_with_wrong_wire_type_skipped() {
        let mut buf = Vec::new();
        // kind sent as length-delimited
        put_bytes_field(&mut buf, envelope_fields::KIND, b"\x65");
        let env = Envelope::decode(&buf).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_truncated_length_rejected() {
        let mut buf = Vec::new();
        put_tag(&mut buf, envelope_fields::ERROR_TEXT, WireType::LengthDelimited);
        put_varint(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        assert_eq!(
            Envelope::decode(&buf),
            Err(DecodeError::Truncated {
                needed: 10,
                available: 3
            })
        );
    }

    #[test]
    fn test_bad_varint_rejected() {
        let mut buf = vec![0x08];
        buf.extend_from_slice(&[0xFF; 10]);
        assert_eq!(Envelope::decode(&buf), Err(DecodeError::BadVarint));
    }

    #[test]
    fn test_resize_dimension_truncated_to_u32() {
        let mut body = Vec::new();
        put_varint_field(&mut body, payload_fields::COLUMNS, (1u64 << 32) + 7);
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, envelope_fields::RESIZE, &body);
        let env = Envelope::decode(&buf).unwrap();
        assert_eq!(env.as_resize().unwrap().columns, 7);
    }
}
