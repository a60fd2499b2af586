//! Binary codec for message frames.
//!
//! Layout (big endian): a one byte frame type followed by the frame fields.
//! Strings and byte fields are length-prefixed with a `u32`; property maps are
//! a `u32` count followed by `(key, tag, value)` triples.

use crate::messaging::message::{MessageHeader, Properties, PropertyValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const FRAME_INLINE: u8 = 0x01;
const FRAME_LARGE_INIT: u8 = 0x02;
const FRAME_LARGE_CHUNK: u8 = 0x03;

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),
    #[error("unknown property tag {0}")]
    UnknownProperty(u8),
    #[error("invalid utf-8 in frame")]
    InvalidUtf8,
    #[error("unexpected frame: {0}")]
    Unexpected(&'static str),
}

/// A whole message small enough to travel in one frame. `compressed` is set
/// when a large body was deflated down under the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFrame {
    pub header: MessageHeader,
    pub payload: Bytes,
    pub compressed: bool,
}

/// Opens a chunk stream for one large message.
#[derive(Debug, Clone, PartialEq)]
pub struct LargeInit {
    pub header: MessageHeader,
    /// Body size before compression; -1 when the producer did not know it.
    pub declared_size: i64,
    pub compressed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LargeChunk {
    pub message_id: u64,
    pub seq: u32,
    pub payload: Bytes,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Inline(InlineFrame),
    LargeInit(LargeInit),
    LargeChunk(LargeChunk),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Inline(_) => "inline",
            Frame::LargeInit(_) => "large_init",
            Frame::LargeChunk(_) => "large_chunk",
        }
    }

    pub fn message_id(&self) -> u64 {
        match self {
            Frame::Inline(f) => f.header.id,
            Frame::LargeInit(f) => f.header.id,
            Frame::LargeChunk(f) => f.message_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Inline(frame) => {
                buf.put_u8(FRAME_INLINE);
                put_header(&mut buf, &frame.header);
                put_bool(&mut buf, frame.compressed);
                put_bytes(&mut buf, &frame.payload);
            }
            Frame::LargeInit(frame) => {
                buf.put_u8(FRAME_LARGE_INIT);
                put_header(&mut buf, &frame.header);
                buf.put_i64(frame.declared_size);
                put_bool(&mut buf, frame.compressed);
            }
            Frame::LargeChunk(frame) => {
                buf.reserve(frame.payload.len() + 18);
                buf.put_u8(FRAME_LARGE_CHUNK);
                buf.put_u64(frame.message_id);
                buf.put_u32(frame.seq);
                put_bool(&mut buf, frame.is_last);
                put_bytes(&mut buf, &frame.payload);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Frame, FrameError> {
        match get_u8(&mut buf)? {
            FRAME_INLINE => {
                let header = get_header(&mut buf)?;
                let compressed = get_bool(&mut buf)?;
                let payload = get_bytes(&mut buf)?;
                Ok(Frame::Inline(InlineFrame {
                    header,
                    payload,
                    compressed,
                }))
            }
            FRAME_LARGE_INIT => {
                let header = get_header(&mut buf)?;
                ensure(&buf, 9)?;
                let declared_size = buf.get_i64();
                let compressed = get_bool(&mut buf)?;
                Ok(Frame::LargeInit(LargeInit {
                    header,
                    declared_size,
                    compressed,
                }))
            }
            FRAME_LARGE_CHUNK => {
                ensure(&buf, 13)?;
                let message_id = buf.get_u64();
                let seq = buf.get_u32();
                let is_last = get_bool(&mut buf)?;
                let payload = get_bytes(&mut buf)?;
                Ok(Frame::LargeChunk(LargeChunk {
                    message_id,
                    seq,
                    payload,
                    is_last,
                }))
            }
            other => Err(FrameError::UnknownFrame(other)),
        }
    }

    pub fn into_large_chunk(self) -> Result<LargeChunk, FrameError> {
        match self {
            Frame::LargeChunk(chunk) => Ok(chunk),
            _ => Err(FrameError::Unexpected("expected a large-message chunk")),
        }
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), FrameError> {
    if buf.remaining() < n {
        Err(FrameError::Truncated)
    } else {
        Ok(())
    }
}

fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(u8::from(v));
}

fn put_bytes(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u32(v.len() as u32);
    buf.put_slice(v);
}

fn put_string(buf: &mut BytesMut, v: &str) {
    put_bytes(buf, v.as_bytes());
}

fn put_header(buf: &mut BytesMut, header: &MessageHeader) {
    buf.put_u64(header.id);
    put_string(buf, &header.address);
    put_bool(buf, header.durable);
    buf.put_u64(header.expiration);
    buf.put_u64(header.timestamp);
    put_properties(buf, &header.properties);
}

fn put_properties(buf: &mut BytesMut, properties: &Properties) {
    buf.put_u32(properties.len() as u32);
    for (key, value) in properties {
        put_string(buf, key);
        match value {
            PropertyValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                put_bool(buf, *v);
            }
            PropertyValue::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*v);
            }
            PropertyValue::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*v);
            }
            PropertyValue::String(v) => {
                buf.put_u8(TAG_STRING);
                put_string(buf, v);
            }
            PropertyValue::Bytes(v) => {
                buf.put_u8(TAG_BYTES);
                put_bytes(buf, v);
            }
        }
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_bool(buf: &mut Bytes) -> Result<bool, FrameError> {
    Ok(get_u8(buf)? != 0)
}

fn get_u64(buf: &mut Bytes) -> Result<u64, FrameError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, FrameError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

fn get_header(buf: &mut Bytes) -> Result<MessageHeader, FrameError> {
    let id = get_u64(buf)?;
    let address = get_string(buf)?;
    let durable = get_bool(buf)?;
    let expiration = get_u64(buf)?;
    let timestamp = get_u64(buf)?;
    let properties = get_properties(buf)?;
    Ok(MessageHeader {
        id,
        address,
        durable,
        expiration,
        timestamp,
        properties,
    })
}

fn get_properties(buf: &mut Bytes) -> Result<Properties, FrameError> {
    ensure(buf, 4)?;
    let count = buf.get_u32();
    let mut properties = Properties::new();
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = match get_u8(buf)? {
            TAG_BOOL => PropertyValue::Bool(get_bool(buf)?),
            TAG_INT => PropertyValue::Int(get_u64(buf)? as i64),
            TAG_FLOAT => PropertyValue::Float(f64::from_bits(get_u64(buf)?)),
            TAG_STRING => PropertyValue::String(get_string(buf)?),
            TAG_BYTES => PropertyValue::Bytes(get_bytes(buf)?),
            other => return Err(FrameError::UnknownProperty(other)),
        };
        properties.insert(key, value);
    }
    Ok(properties)
}
