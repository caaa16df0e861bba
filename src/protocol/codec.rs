//! Protocol codec for encoding/decoding messages
//!
//! Handles framing and field serialization. Decoding is incremental: a caller
//! holding a partial frame gets [`DecodeResult::Incomplete`] and retries once
//! more bytes have arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    ArrayValue, Crc32, FieldType, FieldValue, Message, ReadMessage, ScalarType,
    DEFAULT_MAX_FRAME_SIZE, MAGIC_BYTES,
};

/// Header size: magic(2) + instruction(1) + body length(4) = 7 bytes
pub const HEADER_SIZE: usize = 7;

/// Trailer size: CRC-32
pub const TRAILER_SIZE: usize = 4;

/// Errors raised while encoding a message that cannot be represented on the wire
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Field name too long: {0} bytes (max: 65535)")]
    NameTooLong(usize),

    #[error("Value of field '{0}' exceeds 4 GiB")]
    ValueTooLong(String),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

/// Why a frame was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Checksum mismatch: trailer {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unknown type tag {tag:#04x} on field '{name}'")]
    UnknownType { name: String, tag: u8 },

    #[error("Field name is not valid UTF-8")]
    InvalidName,

    #[error("Text in field '{0}' is not valid UTF-8")]
    InvalidText(String),

    #[error("Field record overruns the declared body length")]
    TruncatedRecord,

    #[error("Duplicate field '{0}'")]
    DuplicateField(String),

    #[error("Stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),
}

/// Outcome of one decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult {
    /// More bytes are needed; nothing was consumed
    Incomplete,
    /// The frame cannot be trusted; the stream must be abandoned
    Malformed(MalformedReason),
    /// A complete message and the number of bytes it occupied
    Ok(Message, usize),
}

/// Encodes and decodes frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom ceiling on the body length
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into a standalone frame
    pub fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the frame for a message to a buffer
    pub fn encode_into(&self, message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        for (name, value) in message.fields() {
            put_field(&mut body, name, value)?;
        }

        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(body.len(), self.max_frame_size));
        }

        dst.reserve(HEADER_SIZE + body.len() + TRAILER_SIZE);
        let start = dst.len();

        // Write header
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(message.instruction());
        dst.put_u32_le(body.len() as u32);

        // Write body
        dst.put_slice(&body);

        // Checksum covers everything after the magic
        let crc = Crc32::compute(&dst[start + MAGIC_BYTES.len()..]);
        dst.put_u32_le(crc);

        Ok(())
    }

    /// Attempt to decode one frame from the start of `buf`
    pub fn decode(&self, buf: &[u8]) -> DecodeResult {
        // Reject a bad marker as soon as its first byte is visible
        let magic_len = buf.len().min(MAGIC_BYTES.len());
        if buf[..magic_len] != MAGIC_BYTES[..magic_len] {
            return DecodeResult::Malformed(MalformedReason::InvalidMagic);
        }

        if buf.len() < HEADER_SIZE {
            return DecodeResult::Incomplete;
        }

        let instruction = buf[2];
        let length = (&buf[3..HEADER_SIZE]).get_u32_le() as usize;

        if length > self.max_frame_size {
            return DecodeResult::Malformed(MalformedReason::FrameTooLarge(
                length,
                self.max_frame_size,
            ));
        }

        let body_end = HEADER_SIZE + length;
        let total = body_end + TRAILER_SIZE;
        if buf.len() < total {
            return DecodeResult::Incomplete;
        }

        let expected = (&buf[body_end..total]).get_u32_le();
        let actual = Crc32::compute(&buf[MAGIC_BYTES.len()..body_end]);
        if expected != actual {
            return DecodeResult::Malformed(MalformedReason::ChecksumMismatch { expected, actual });
        }

        match decode_body(instruction, &buf[HEADER_SIZE..body_end]) {
            Ok(message) => DecodeResult::Ok(message, total),
            Err(reason) => DecodeResult::Malformed(reason),
        }
    }

    /// Decode at `cursor`, advancing it only when a message is produced
    pub fn decode_at(&self, buf: &[u8], cursor: &mut usize) -> DecodeResult {
        let result = self.decode(buf.get(*cursor..).unwrap_or(&[]));
        if let DecodeResult::Ok(_, consumed) = &result {
            *cursor += consumed;
        }
        result
    }

    /// Check the leftover bytes once the stream has ended
    pub fn finish(&self, remaining: &[u8]) -> Result<(), MalformedReason> {
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(MalformedReason::Truncated(remaining.len()))
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates stream bytes and yields decoded messages
pub struct FrameReader {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(codec: FrameCodec) -> Self {
        Self::with_capacity(codec, 4096)
    }

    pub fn with_capacity(codec: FrameCodec, capacity: usize) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append newly received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access to the buffer, for reading from a socket into it
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Decode the next buffered message, consuming its bytes on success
    pub fn next_message(&mut self) -> DecodeResult {
        let result = self.codec.decode(&self.buffer);
        if let DecodeResult::Ok(_, consumed) = &result {
            self.buffer.advance(*consumed);
        }
        result
    }

    /// Number of bytes held but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Check the leftover bytes once the stream has ended
    pub fn finish(&self) -> Result<(), MalformedReason> {
        self.codec.finish(&self.buffer)
    }
}

fn put_len(dst: &mut BytesMut, name: &str, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::ValueTooLong(name.to_string()))?;
    dst.put_u32_le(len);
    Ok(())
}

fn put_bytes(dst: &mut BytesMut, name: &str, data: &[u8]) -> Result<(), CodecError> {
    put_len(dst, name, data.len())?;
    dst.put_slice(data);
    Ok(())
}

fn put_field(dst: &mut BytesMut, name: &str, value: &FieldValue) -> Result<(), CodecError> {
    let name_len = u16::try_from(name.len()).map_err(|_| CodecError::NameTooLong(name.len()))?;
    dst.put_u16_le(name_len);
    dst.put_slice(name.as_bytes());
    dst.put_u8(value.field_type().tag());

    match value {
        FieldValue::I32(v) => dst.put_i32_le(*v),
        FieldValue::U32(v) => dst.put_u32_le(*v),
        FieldValue::I64(v) => dst.put_i64_le(*v),
        FieldValue::U64(v) => dst.put_u64_le(*v),
        FieldValue::F64(v) => dst.put_f64_le(*v),
        FieldValue::Text(v) => put_bytes(dst, name, v.as_bytes())?,
        FieldValue::Blob(v) => put_bytes(dst, name, v)?,
        FieldValue::Array(arr) => put_array(dst, name, arr)?,
    }
    Ok(())
}

fn put_array(dst: &mut BytesMut, name: &str, arr: &ArrayValue) -> Result<(), CodecError> {
    put_len(dst, name, arr.len())?;
    match arr {
        ArrayValue::I32(items) => items.iter().for_each(|v| dst.put_i32_le(*v)),
        ArrayValue::U32(items) => items.iter().for_each(|v| dst.put_u32_le(*v)),
        ArrayValue::I64(items) => items.iter().for_each(|v| dst.put_i64_le(*v)),
        ArrayValue::U64(items) => items.iter().for_each(|v| dst.put_u64_le(*v)),
        ArrayValue::F64(items) => items.iter().for_each(|v| dst.put_f64_le(*v)),
        ArrayValue::Text(items) => {
            for item in items {
                put_bytes(dst, name, item.as_bytes())?;
            }
        }
        ArrayValue::Blob(items) => {
            for item in items {
                put_bytes(dst, name, item)?;
            }
        }
    }
    Ok(())
}

type DecodeStep<T> = Result<T, MalformedReason>;

fn need(buf: &[u8], n: usize) -> DecodeStep<()> {
    if buf.remaining() < n {
        Err(MalformedReason::TruncatedRecord)
    } else {
        Ok(())
    }
}

fn take_bytes<'a>(buf: &mut &'a [u8], n: usize) -> DecodeStep<&'a [u8]> {
    need(buf, n)?;
    let slice: &'a [u8] = *buf;
    let (head, rest) = slice.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> DecodeStep<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> DecodeStep<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_i32(buf: &mut &[u8]) -> DecodeStep<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn take_u32(buf: &mut &[u8]) -> DecodeStep<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_i64(buf: &mut &[u8]) -> DecodeStep<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn take_u64(buf: &mut &[u8]) -> DecodeStep<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_f64(buf: &mut &[u8]) -> DecodeStep<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64_le())
}

fn take_blob(buf: &mut &[u8]) -> DecodeStep<Vec<u8>> {
    let len = take_u32(buf)? as usize;
    Ok(take_bytes(buf, len)?.to_vec())
}

fn take_text(buf: &mut &[u8], name: &str) -> DecodeStep<String> {
    let len = take_u32(buf)? as usize;
    let raw = take_bytes(buf, len)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| MalformedReason::InvalidText(name.to_string()))
}

fn take_many<'a, T>(
    buf: &mut &'a [u8],
    mut take: impl FnMut(&mut &'a [u8]) -> DecodeStep<T>,
) -> DecodeStep<Vec<T>> {
    let count = take_u32(buf)? as usize;
    // Never trust the count for preallocation beyond what the body can hold
    let mut items = Vec::with_capacity(count.min(buf.len()));
    for _ in 0..count {
        items.push(take(buf)?);
    }
    Ok(items)
}

fn take_value(buf: &mut &[u8], name: &str, ty: FieldType) -> DecodeStep<FieldValue> {
    let value = match ty {
        FieldType::I32 => FieldValue::I32(take_i32(buf)?),
        FieldType::U32 => FieldValue::U32(take_u32(buf)?),
        FieldType::I64 => FieldValue::I64(take_i64(buf)?),
        FieldType::U64 => FieldValue::U64(take_u64(buf)?),
        FieldType::F64 => FieldValue::F64(take_f64(buf)?),
        FieldType::Text => FieldValue::Text(take_text(buf, name)?),
        FieldType::Blob => FieldValue::Blob(take_blob(buf)?),
        FieldType::Array(elem) => FieldValue::Array(match elem {
            ScalarType::I32 => ArrayValue::I32(take_many(buf, take_i32)?),
            ScalarType::U32 => ArrayValue::U32(take_many(buf, take_u32)?),
            ScalarType::I64 => ArrayValue::I64(take_many(buf, take_i64)?),
            ScalarType::U64 => ArrayValue::U64(take_many(buf, take_u64)?),
            ScalarType::F64 => ArrayValue::F64(take_many(buf, take_f64)?),
            ScalarType::Text => ArrayValue::Text(take_many(buf, |b| take_text(b, name))?),
            ScalarType::Blob => ArrayValue::Blob(take_many(buf, take_blob)?),
        }),
    };
    Ok(value)
}

fn decode_body(instruction: u8, mut body: &[u8]) -> DecodeStep<Message> {
    let mut message = Message::new(instruction);

    while body.has_remaining() {
        let name_len = take_u16(&mut body)? as usize;
        let name = std::str::from_utf8(take_bytes(&mut body, name_len)?)
            .map_err(|_| MalformedReason::InvalidName)?
            .to_string();

        let tag = take_u8(&mut body)?;
        let ty = FieldType::from_tag(tag).ok_or_else(|| MalformedReason::UnknownType {
            name: name.clone(),
            tag,
        })?;

        let value = take_value(&mut body, &name, ty)?;
        if message.contains(&name) {
            return Err(MalformedReason::DuplicateField(name));
        }
        message.insert(name, value);
    }

    Ok(message)
}
