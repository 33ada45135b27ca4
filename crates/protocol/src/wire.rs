//! Low-level tag-length-value primitives.
//!
//! # Field Format
//!
//! Each field on the wire is:
//! - a varint tag: `(field_number << 3) | wire_type`
//! - the value, whose shape depends on the wire type
//!
//! Varints are little-endian base-128: seven payload bits per byte, the high
//! bit set on every byte except the last. A `u64` needs at most ten bytes.
//!
//! Only [`WireType::Varint`] and [`WireType::LengthDelimited`] are produced by
//! this crate; the fixed-width types are recognised so that fields added by a
//! newer peer can be skipped.

use bytes::BufMut;

use crate::error::DecodeError;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Largest field number representable in a tag.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Wire type carried in the low three bits of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// Variable-length integer.
    Varint = 0,
    /// Eight little-endian bytes.
    Fixed64 = 1,
    /// Varint length followed by that many bytes.
    LengthDelimited = 2,
    /// Four little-endian bytes.
    Fixed32 = 5,
}

impl WireType {
    /// Maps the low three tag bits to a wire type.
    ///
    /// The deprecated group markers (3 and 4) and the unassigned values are
    /// rejected.
    pub fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(DecodeError::InvalidWireType(other)),
        }
    }
}

/// Number of bytes `value` occupies as a varint.
#[inline]
pub fn varint_len(value: u64) -> usize {
    // ceil(significant_bits / 7), with zero still taking one byte
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Appends `value` as a varint.
#[inline]
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Appends a field tag.
#[inline]
pub fn put_tag(buf: &mut impl BufMut, field: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(field) << 3) | wire_type as u64);
}

/// Encoded size of a field tag.
#[inline]
pub fn tag_len(field: u32) -> usize {
    varint_len(u64::from(field) << 3)
}

/// Appends a length-delimited field (tag, length, bytes).
pub fn put_bytes_field(buf: &mut impl BufMut, field: u32, value: &[u8]) {
    put_tag(buf, field, WireType::LengthDelimited);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Appends a varint field (tag, value).
pub fn put_varint_field(buf: &mut impl BufMut, field: u32, value: u64) {
    put_tag(buf, field, WireType::Varint);
    put_varint(buf, value);
}

/// Encoded size of a length-delimited field whose body is `len` bytes.
#[inline]
pub fn bytes_field_len(field: u32, len: usize) -> usize {
    tag_len(field) + varint_len(len as u64) + len
}

/// Encoded size of a varint field.
#[inline]
pub fn varint_field_len(field: u32, value: u64) -> usize {
    tag_len(field) + varint_len(value)
}

/// Outcome of reading a varint from a buffer that may still be filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintStatus {
    /// The varint value and the number of bytes it occupied.
    Complete(u64, usize),
    /// The buffer ends before the terminating byte.
    Incomplete,
}

/// Reads a varint from the front of `data` without consuming it.
///
/// Distinguishes "not enough bytes yet" from malformed input, which is what
/// a streaming reader needs to decide between waiting and failing.
pub fn peek_varint(data: &[u8]) -> Result<VarintStatus, DecodeError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(DecodeError::BadVarint);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(VarintStatus::Complete(value, i + 1));
        }
    }
    Ok(VarintStatus::Incomplete)
}

/// Cursor over one fully buffered message body.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Creates a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Reads one varint.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        match peek_varint(self.buf)? {
            VarintStatus::Complete(value, used) => {
                self.buf = &self.buf[used..];
                Ok(value)
            }
            VarintStatus::Incomplete => Err(DecodeError::truncated(
                self.buf.len() + 1,
                self.buf.len(),
            )),
        }
    }

    /// Reads a field tag, returning the field number and wire type.
    pub fn read_tag(&mut self) -> Result<(u32, WireType), DecodeError> {
        let raw = self.read_varint()?;
        let field = raw >> 3;
        if field == 0 || field > u64::from(MAX_FIELD_NUMBER) {
            return Err(DecodeError::InvalidTag(raw));
        }
        let wire_type = WireType::from_bits((raw & 0x07) as u8)?;
        Ok((field as u32, wire_type))
    }

    /// Reads a length prefix and returns the body it covers.
    pub fn read_length_delimited(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len)
            .map_err(|_| DecodeError::truncated(usize::MAX, self.buf.len()))?;
        self.take(len)
    }

    /// Reads a length-delimited UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let raw = self.read_length_delimited()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Consumes and discards a field value of the given wire type.
    pub fn skip(&mut self, wire_type: WireType) -> Result<(), DecodeError> {
        match wire_type {
            WireType::Varint => self.read_varint().map(drop),
            WireType::Fixed64 => self.take(8).map(drop),
            WireType::Fixed32 => self.take(4).map(drop),
            WireType::LengthDelimited => self.read_length_delimited().map(drop),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.buf.len() {
            return Err(DecodeError::truncated(len, self.buf.len()));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}
