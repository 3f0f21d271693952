// Binary encoding shared by hashing, persistence and the wire protocol

use std::io::{self, Cursor, Read};
use thiserror::Error;

/// Upper bound for any single length-prefixed field
pub const MAX_VAR_BYTES: u64 = 16 * 1024 * 1024;

/// Decoding failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("length prefix {0} exceeds limit")]
    LengthTooLarge(u64),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl From<io::Error> for CodecError {
    fn from(_: io::Error) -> Self {
        // Readers are in-memory cursors; the only failure is running out of bytes.
        CodecError::Truncated
    }
}

/// Trait for types with a canonical binary form
pub trait Serializable: Sized {
    /// Append the encoding of `self` to `buf`
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decode one value from a stream, leaving the rest unread
    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Decode a value that must span the whole input
    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        let value = Self::read_from(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != data.len() {
            return Err(CodecError::TrailingBytes(data.len() - consumed));
        }
        Ok(value)
    }
}

/// Write a variable-length integer (VarInt)
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffffffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read a variable-length integer (VarInt)
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64, CodecError> {
    let mut first_byte = [0u8; 1];
    reader.read_exact(&mut first_byte)?;

    match first_byte[0] {
        0..=0xfc => Ok(first_byte[0] as u64),
        0xfd => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes)?;
            Ok(u16::from_le_bytes(bytes) as u64)
        }
        0xfe => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            Ok(u32::from_le_bytes(bytes) as u64)
        }
        0xff => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read bytes with length prefix
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let len = read_varint(reader)?;
    if len > MAX_VAR_BYTES {
        return Err(CodecError::LengthTooLarge(len));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

pub fn write_var_str(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub fn read_var_str<R: Read + ?Sized>(reader: &mut R) -> Result<String, CodecError> {
    let bytes = read_var_bytes(reader)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64, CodecError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn read_i64<R: Read + ?Sized>(reader: &mut R) -> Result<i64, CodecError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

/// Write a count-prefixed sequence
pub fn write_list<T: Serializable>(buf: &mut Vec<u8>, items: &[T]) {
    write_varint(buf, items.len() as u64);
    for item in items {
        item.write_to(buf);
    }
}

/// Read a count-prefixed sequence
pub fn read_list<T: Serializable, R: Read + ?Sized>(reader: &mut R) -> Result<Vec<T>, CodecError> {
    let count = read_varint(reader)?;
    if count > MAX_VAR_BYTES {
        return Err(CodecError::LengthTooLarge(count));
    }
    // The count is untrusted; let the vector grow as items actually decode.
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(T::read_from(reader)?);
    }
    Ok(items)
}
