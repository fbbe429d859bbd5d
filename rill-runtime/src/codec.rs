//! Packed value codec for the host boundary.
//!
//! Payloads that do not fit a scalar value kind cross the host boundary as a
//! compact self-describing byte string. Every value starts with a one byte
//! type tag; integers and lengths are little-endian and fixed width.
//!
//! ```text
//! 0x00 unit
//! 0x01 false            0x02 true
//! 0x03 i32 (4 bytes)    0x04 i64 (8 bytes)
//! 0x05 f32 (4 bytes)    0x06 f64 (8 bytes)
//! 0x07 string  u32 len, UTF-8 bytes
//! 0x08 bytes   u32 len, raw bytes
//! 0x09 array   u32 count, values
//! 0x0a map     u32 count, (key, value) pairs
//! ```
//!
//! Host and guest share this module, so the encoding is byte-for-byte
//! identical on both sides without exchanging type metadata.
//!
//! The arguments of a packed host call always travel as one array, even
//! when there are none or exactly one. A lone array argument therefore
//! arrives as a single argument and is never spread.

use thiserror::Error;

use crate::config::CodecConfig;
use crate::value::Value;

const TAG_UNIT: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_I32: u8 = 0x03;
const TAG_I64: u8 = 0x04;
const TAG_F32: u8 = 0x05;
const TAG_F64: u8 = 0x06;
const TAG_STR: u8 = 0x07;
const TAG_BYTES: u8 = 0x08;
const TAG_ARRAY: u8 = 0x09;
const TAG_MAP: u8 = 0x0a;

/// Errors produced by the packed codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of packed value at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unknown type tag 0x{tag:02x} at byte {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid UTF-8 string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("packed value nests deeper than {max_depth} levels")]
    TooDeep { max_depth: usize },

    #[error("{count} trailing bytes after packed value")]
    TrailingBytes { count: usize },

    #[error("length {len} does not fit the u32 length prefix")]
    LengthOverflow { len: usize },

    #[error("call arguments must be an array, got {found}")]
    NotArguments { found: &'static str },
}

/// Encode a value into a fresh buffer.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Append the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Unit => buf.push(TAG_UNIT),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::I32(v) => {
            buf.push(TAG_I32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::I64(v) => {
            buf.push(TAG_I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::F32(v) => {
            buf.push(TAG_F32);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::F64(v) => {
            buf.push(TAG_F64);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(TAG_STR);
            write_len(buf, s.len())?;
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_len(buf, b.len())?;
            buf.extend_from_slice(b);
        }
        Value::Array(items) => {
            buf.push(TAG_ARRAY);
            write_len(buf, items.len())?;
            for item in items {
                encode_into(item, buf)?;
            }
        }
        Value::Map(entries) => {
            buf.push(TAG_MAP);
            write_len(buf, entries.len())?;
            for (key, value) in entries {
                encode_into(key, buf)?;
                encode_into(value, buf)?;
            }
        }
    }
    Ok(())
}

/// Encode the arguments of a packed host call.
pub fn encode_args(args: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![TAG_ARRAY];
    write_len(&mut buf, args.len())?;
    for arg in args {
        encode_into(arg, &mut buf)?;
    }
    Ok(buf)
}

/// Decode the arguments of a packed host call.
pub fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    match decode_value(bytes)? {
        Value::Array(items) => Ok(items),
        other => Err(CodecError::NotArguments {
            found: other.kind_name(),
        }),
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let len32 = u32::try_from(len).map_err(|_| CodecError::LengthOverflow { len })?;
    buf.extend_from_slice(&len32.to_le_bytes());
    Ok(())
}

/// Decode a value using the default configuration.
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    decode_with(bytes, &CodecConfig::default())
}

/// Decode exactly one value; trailing bytes are an error.
pub fn decode_with(bytes: &[u8], config: &CodecConfig) -> Result<Value, CodecError> {
    let mut dec = Decoder {
        bytes,
        pos: 0,
        max_depth: config.max_depth,
    };
    let value = dec.read_value(0)?;
    let remaining = bytes.len() - dec.pos;
    if remaining != 0 {
        return Err(CodecError::TrailingBytes { count: remaining });
    }
    Ok(value)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_exact(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?) as usize)
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > self.max_depth {
            return Err(CodecError::TooDeep {
                max_depth: self.max_depth,
            });
        }
        let offset = self.pos;
        let tag = self.read_exact(1)?[0];
        let value = match tag {
            TAG_UNIT => Value::Unit,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_I32 => Value::I32(i32::from_le_bytes(self.read_array::<4>()?)),
            TAG_I64 => Value::I64(i64::from_le_bytes(self.read_array::<8>()?)),
            TAG_F32 => Value::F32(f32::from_bits(u32::from_le_bytes(self.read_array::<4>()?))),
            TAG_F64 => Value::F64(f64::from_bits(u64::from_le_bytes(self.read_array::<8>()?))),
            TAG_STR => {
                let len = self.read_len()?;
                let start = self.pos;
                let raw = self.read_exact(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8 { offset: start })?;
                Value::Str(s.to_string())
            }
            TAG_BYTES => {
                let len = self.read_len()?;
                Value::Bytes(self.read_exact(len)?.to_vec())
            }
            TAG_ARRAY => {
                let count = self.read_len()?;
                // Every element takes at least one byte; cap the reservation.
                let mut items = Vec::with_capacity(count.min(self.bytes.len() - self.pos));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Value::Array(items)
            }
            TAG_MAP => {
                let count = self.read_len()?;
                let mut entries = Vec::with_capacity(count.min(self.bytes.len() - self.pos));
                for _ in 0..count {
                    let key = self.read_value(depth + 1)?;
                    let value = self.read_value(depth + 1)?;
                    entries.push((key, value));
                }
                Value::Map(entries)
            }
            other => return Err(CodecError::UnknownTag { tag: other, offset }),
        };
        Ok(value)
    }
}
