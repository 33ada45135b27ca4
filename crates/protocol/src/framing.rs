//! Frame codec for varint length-prefixed envelopes.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - varint: length of the encoded envelope in bytes
//! - N bytes: the envelope (see [`crate::codec`])
//!
//! The outer prefix is independent of the tag-length-value fields inside the
//! envelope. A byte-stream transport has no message boundaries of its own, so
//! the prefix is what lets [`FrameReader`] split an arbitrarily chunked
//! stream back into envelopes.

use bytes::{Buf, BytesMut};

use crate::codec::{decode_with_notes, WireMessage};
use crate::error::{DecodeError, ProtocolError, Result};
use crate::messages::Envelope;
use crate::wire::{peek_varint, put_varint, varint_len, VarintStatus};

/// Default maximum envelope size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Decode notes a [`FrameReader`] holds until [`FrameReader::take_notes`];
/// later ones are only counted.
pub const MAX_PENDING_NOTES: usize = 64;

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    /// Largest envelope body accepted in either direction.
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a frame codec with an explicit size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The configured size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode an envelope into one contiguous frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let body_len = envelope.encoded_len();
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }

        let mut output = Vec::with_capacity(varint_len(body_len as u64) + body_len);
        put_varint(&mut output, body_len as u64);
        envelope.encode_raw(&mut output);
        debug_assert_eq!(output.len(), varint_len(body_len as u64) + body_len);
        Ok(output)
    }

    /// Decode a frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a complete frame, and
    /// otherwise the envelope plus the number of bytes it consumed. Skipped
    /// unknown fields are reported to `notes`.
    pub fn try_decode_with_notes(
        &self,
        data: &[u8],
        notes: &mut dyn FnMut(DecodeError),
    ) -> std::result::Result<Option<(Envelope, usize)>, DecodeError> {
        let (body_len, prefix_len) = match peek_varint(data)? {
            VarintStatus::Complete(len, used) => (len, used),
            VarintStatus::Incomplete => return Ok(None),
        };

        // Reject before buffering the body.
        let body_len = usize::try_from(body_len)
            .ok()
            .filter(|len| *len <= self.max_frame_size)
            .ok_or(DecodeError::FrameTooLarge {
                size: usize::try_from(body_len).unwrap_or(usize::MAX),
                max: self.max_frame_size,
            })?;

        let total = prefix_len + body_len;
        if data.len() < total {
            return Ok(None);
        }

        let envelope = decode_with_notes(&data[prefix_len..total], notes)?;
        Ok(Some((envelope, total)))
    }

    /// Decode a frame from the front of `data`, ignoring decode notes.
    pub fn try_decode(
        &self,
        data: &[u8],
    ) -> std::result::Result<Option<(Envelope, usize)>, DecodeError> {
        self.try_decode_with_notes(data, &mut |_| {})
    }

    /// Total size of the frame at the front of `data`, once its prefix is known.
    fn declared_frame_len(data: &[u8]) -> Option<usize> {
        match peek_varint(data) {
            Ok(VarintStatus::Complete(len, used)) => {
                usize::try_from(len).ok().map(|len| len.saturating_add(used))
            }
            _ => None,
        }
    }
}

/// Reassembles envelopes from arbitrarily chunked input.
///
/// Bytes are appended with [`FrameReader::push`] (or read straight into
/// [`FrameReader::buffer_mut`]); complete envelopes are taken with
/// [`FrameReader::next_envelope`]. A partial frame stays buffered until the
/// rest arrives. Once a decode error occurs the reader is poisoned and keeps
/// returning that error, since framing can no longer be trusted.
#[derive(Debug)]
pub struct FrameReader {
    codec: FrameCodec,
    buf: BytesMut,
    notes: Vec<DecodeError>,
    notes_dropped: u64,
    failed: Option<DecodeError>,
    frames: u64,
}

impl FrameReader {
    /// Create a reader using `codec` for size limits.
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: BytesMut::new(),
            notes: Vec::new(),
            notes_dropped: 0,
            failed: None,
            frames: 0,
        }
    }

    /// Append a chunk delivered by the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Direct access to the accumulation buffer, for `read_buf`-style I/O.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes currently buffered and not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Number of envelopes emitted so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }

    /// Drains the non-fatal notes collected while decoding.
    ///
    /// At most [`MAX_PENDING_NOTES`] are kept between calls.
    pub fn take_notes(&mut self) -> Vec<DecodeError> {
        std::mem::take(&mut self.notes)
    }

    /// Notes discarded because the pending list was full.
    pub fn notes_dropped(&self) -> u64 {
        self.notes_dropped
    }

    /// Decode the next complete envelope from the buffer head.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_envelope(&mut self) -> std::result::Result<Option<Envelope>, DecodeError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let notes = &mut self.notes;
        let dropped = &mut self.notes_dropped;
        let decoded = self.codec.try_decode_with_notes(&self.buf, &mut |note| {
            if notes.len() < MAX_PENDING_NOTES {
                notes.push(note);
            } else {
                *dropped += 1;
            }
        });
        match decoded {
            Ok(Some((envelope, consumed))) => {
                self.buf.advance(consumed);
                self.frames += 1;
                Ok(Some(envelope))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Signal end-of-stream.
    ///
    /// Succeeds only if nothing is left over; undrained partial bytes are a
    /// [`DecodeError::Truncated`].
    pub fn finish(&mut self) -> std::result::Result<(), DecodeError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.buf.is_empty() {
            return Ok(());
        }

        let needed = FrameCodec::declared_frame_len(&self.buf).unwrap_or(self.buf.len() + 1);
        let err = DecodeError::Truncated {
            needed,
            available: self.buf.len(),
        };
        self.failed = Some(err.clone());
        Err(err)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(FrameCodec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageKind;
    use rand::Rng;

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::output("term1", b"hello world".to_vec()),
            Envelope::input("term1", b"ls -la\r".to_vec()),
            Envelope::resize("term2", 132, 43),
            Envelope::error("remote process exited"),
            Envelope::default(),
            Envelope::output("term2", (0..600u32).map(|i| i as u8).collect::<Vec<_>>()),
        ]
    }

    fn encode_all(codec: &FrameCodec, envelopes: &[Envelope]) -> Vec<u8> {
        envelopes
            .iter()
            .flat_map(|e| codec.encode(e).unwrap())
            .collect()
    }

    fn drain(reader: &mut FrameReader) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(env) = reader.next_envelope().unwrap() {
            out.push(env);
        }
        out
    }

    #[test]
    fn test_frame_header_format() {
        let codec = FrameCodec::new();
        let envelope = Envelope::output("term1", vec![0x68, 0x69]);
        let encoded = codec.encode(&envelope).unwrap();

        assert_eq!(encoded[0] as usize, encoded.len() - 1);
        assert_eq!(&encoded[1..], &envelope.encode_to_vec()[..]);
    }

    #[test]
    fn test_zero_envelope_frame_is_single_byte() {
        let codec = FrameCodec::new();
        assert_eq!(codec.encode(&Envelope::default()).unwrap(), vec![0x00]);

        let mut reader = FrameReader::default();
        reader.push(&[0x00]);
        assert_eq!(reader.next_envelope().unwrap(), Some(Envelope::default()));
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_multi_byte_length_prefix() {
        let codec = FrameCodec::new();
        let envelope = Envelope::output("s", vec![7u8; 300]);
        let encoded = codec.encode(&envelope).unwrap();
        assert!(encoded[0] & 0x80 != 0, "length prefix should span two bytes");

        let (decoded, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_try_decode_partial_data() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Envelope::resize("a", 80, 24)).unwrap();

        for i in 0..encoded.len() {
            assert!(
                codec.try_decode(&encoded[..i]).unwrap().is_none(),
                "should return None for partial data (len={})",
                i
            );
        }
        assert!(codec.try_decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_encode_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(16);
        let result = codec.encode(&Envelope::output("s", vec![0u8; 64]));
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_decode_oversized_length_rejected_early() {
        let codec = FrameCodec::with_max_frame_size(1024);
        let mut header = Vec::new();
        put_varint(&mut header, 4096);

        // Only the prefix is present; the limit is enforced without the body.
        assert_eq!(
            codec.try_decode(&header),
            Err(DecodeError::FrameTooLarge {
                size: 4096,
                max: 1024
            })
        );
    }

    #[test]
    fn test_reader_whole_buffer() {
        let codec = FrameCodec::new();
        let envelopes = sample_envelopes();
        let mut reader = FrameReader::new(codec);
        reader.push(&encode_all(&codec, &envelopes));

        assert_eq!(drain(&mut reader), envelopes);
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.frames_decoded(), envelopes.len() as u64);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_one_byte_at_a_time() {
        let codec = FrameCodec::new();
        let envelopes = sample_envelopes();
        let wire = encode_all(&codec, &envelopes);

        let mut reader = FrameReader::new(codec);
        let mut out = Vec::new();
        for byte in &wire {
            reader.push(std::slice::from_ref(byte));
            out.extend(drain(&mut reader));
        }
        assert_eq!(out, envelopes);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_random_chunks_match_whole() {
        let codec = FrameCodec::new();
        let envelopes = sample_envelopes();
        let wire = encode_all(&codec, &envelopes);
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let mut reader = FrameReader::new(codec);
            let mut out = Vec::new();
            let mut offset = 0;
            while offset < wire.len() {
                let len = rng.gen_range(1..=64).min(wire.len() - offset);
                reader.push(&wire[offset..offset + len]);
                offset += len;
                out.extend(drain(&mut reader));
            }
            assert_eq!(out, envelopes);
            assert!(reader.finish().is_ok());
        }
    }

    #[test]
    fn test_finish_with_partial_frame_is_truncated() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Envelope::input("a", b"abc".to_vec())).unwrap();

        let mut reader = FrameReader::new(codec);
        reader.push(&encoded[..encoded.len() - 1]);
        assert!(reader.next_envelope().unwrap().is_none());
        assert_eq!(
            reader.finish(),
            Err(DecodeError::Truncated {
                needed: encoded.len(),
                available: encoded.len() - 1
            })
        );
    }

    #[test]
    fn test_finish_with_partial_prefix_is_truncated() {
        let mut reader = FrameReader::default();
        reader.push(&[0x80]);
        assert!(reader.next_envelope().unwrap().is_none());
        assert!(matches!(
            reader.finish(),
            Err(DecodeError::Truncated { available: 1, .. })
        ));
    }

    #[test]
    fn test_reader_poisoned_after_error() {
        let mut reader = FrameReader::default();
        // frame of 2 bytes: kind = 42
        reader.push(&[0x02, 0x08, 0x2A]);
        reader.push(&FrameCodec::new().encode(&Envelope::error("x")).unwrap());

        assert_eq!(reader.next_envelope(), Err(DecodeError::InvalidEnum(42)));
        assert_eq!(reader.next_envelope(), Err(DecodeError::InvalidEnum(42)));
        assert_eq!(reader.finish(), Err(DecodeError::InvalidEnum(42)));
    }

    #[test]
    fn test_reader_collects_notes() {
        let mut body = Envelope::new(MessageKind::Error).encode_to_vec();
        crate::wire::put_varint_field(&mut body, 77, 1);
        let mut frame = Vec::new();
        put_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);

        let mut reader = FrameReader::default();
        reader.push(&frame);
        assert_eq!(
            reader.next_envelope().unwrap().unwrap().kind,
            MessageKind::Error
        );
        assert_eq!(
            reader.take_notes(),
            vec![DecodeError::UnknownFieldSkipped {
                field: 77,
                wire_type: 0
            }]
        );
        assert!(reader.take_notes().is_empty());
    }

    #[test]
    fn test_reader_caps_pending_notes() {
        let mut body = Envelope::input("s", b"k".to_vec()).encode_to_vec();
        crate::wire::put_varint_field(&mut body, 77, 1);
        let mut frame = Vec::new();
        put_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);

        let total = MAX_PENDING_NOTES + 36;
        let mut reader = FrameReader::default();
        for _ in 0..total {
            reader.push(&frame);
        }
        let mut decoded = 0;
        while reader.next_envelope().unwrap().is_some() {
            decoded += 1;
        }

        assert_eq!(decoded, total);
        assert_eq!(reader.take_notes().len(), MAX_PENDING_NOTES);
        assert_eq!(reader.notes_dropped(), 36);

        // Draining makes room again.
        reader.push(&frame);
        reader.next_envelope().unwrap().unwrap();
        assert_eq!(reader.take_notes().len(), 1);
        assert_eq!(reader.notes_dropped(), 36);
    }
}
