//! Typed encoding of values into page bytes.
//!
//! A [`Serializer`] is a strategy object that writes a value into a
//! [`SerOutput`] and reads it back from a [`SerInput`]. Serializers report
//! the maximum number of bytes they produce so that page capacities (and the
//! B-tree branch factor) can be derived before anything is written.
//!
//! All integers are little-endian. Fixed-width serializers pad their output
//! so that every value of a type takes the same number of bytes.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

/// A cursor over encoded bytes.
#[derive(Debug)]
pub struct SerInput<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> SerInput<'b> {
    #[must_use]
    pub const fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'b [u8], SerializeError> {
        if self.remaining() < len {
            return Err(SerializeError::ShortRead {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, SerializeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, SerializeError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Skip `len` padding bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), SerializeError> {
        self.read_bytes(len).map(|_| ())
    }
}

/// A growable buffer that serializers write into.
#[derive(Debug, Default)]
pub struct SerOutput {
    bytes: Vec<u8>,
}

impl SerOutput {
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append `len` zero bytes.
    pub fn pad(&mut self, len: usize) {
        self.bytes.resize(self.bytes.len() + len, 0);
    }
}

/// Encodes and decodes values of type `T`.
///
/// Implementations must never substitute a default value for bytes they
/// cannot decode; corruption always surfaces as a [`SerializeError`].
pub trait Serializer<T>: Send + Sync {
    /// Decode one value, advancing the input.
    fn read(&self, input: &mut SerInput<'_>) -> Result<T, SerializeError>;

    /// Encode one value.
    fn write(&self, output: &mut SerOutput, value: &T) -> Result<(), SerializeError>;

    /// Maximum number of bytes a single value occupies.
    fn size(&self) -> usize;
}

impl<T, S: Serializer<T> + ?Sized> Serializer<T> for Arc<S> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<T, SerializeError> {
        (**self).read(input)
    }

    fn write(&self, output: &mut SerOutput, value: &T) -> Result<(), SerializeError> {
        (**self).write(output, value)
    }

    fn size(&self) -> usize {
        (**self).size()
    }
}

/// Encode a value into a fresh byte vector.
pub fn encode<T, S: Serializer<T> + ?Sized>(
    serializer: &S,
    value: &T,
) -> Result<Vec<u8>, SerializeError> {
    let mut output = SerOutput::new();
    serializer.write(&mut output, value)?;
    Ok(output.into_bytes())
}

/// Decode a value from the start of `bytes`.
pub fn decode<T, S: Serializer<T> + ?Sized>(
    serializer: &S,
    bytes: &[u8],
) -> Result<T, SerializeError> {
    serializer.read(&mut SerInput::new(bytes))
}

/// 32-bit signed integers.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntSerializer;

impl Serializer<i32> for IntSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<i32, SerializeError> {
        input.read_i32()
    }

    fn write(&self, output: &mut SerOutput, value: &i32) -> Result<(), SerializeError> {
        output.write_i32(*value);
        Ok(())
    }

    fn size(&self) -> usize {
        4
    }
}

/// Page pointers and other unsigned 32-bit values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointerSerializer;

impl Serializer<u32> for PointerSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<u32, SerializeError> {
        input.read_u32()
    }

    fn write(&self, output: &mut SerOutput, value: &u32) -> Result<(), SerializeError> {
        output.write_u32(*value);
        Ok(())
    }

    fn size(&self) -> usize {
        4
    }
}

/// Byte strings of exactly `len` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FixedBytesSerializer {
    pub len: usize,
}

impl Serializer<Vec<u8>> for FixedBytesSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Vec<u8>, SerializeError> {
        Ok(input.read_bytes(self.len)?.to_vec())
    }

    fn write(&self, output: &mut SerOutput, value: &Vec<u8>) -> Result<(), SerializeError> {
        if value.len() != self.len {
            return Err(SerializeError::LengthMismatch {
                expected: self.len,
                actual: value.len(),
            });
        }
        output.write_bytes(value);
        Ok(())
    }

    fn size(&self) -> usize {
        self.len
    }
}

/// Length-prefixed byte strings of at most `max` bytes, padded to `max`.
#[derive(Debug, Clone, Copy)]
pub struct BytesSerializer {
    pub max: usize,
}

impl BytesSerializer {
    fn read_slice<'b>(&self, input: &mut SerInput<'b>) -> Result<&'b [u8], SerializeError> {
        let len = input.read_u32()? as usize;
        if len > self.max {
            return Err(SerializeError::TooLong { len, max: self.max });
        }
        let bytes = input.read_bytes(len)?;
        input.skip(self.max - len)?;
        Ok(bytes)
    }

    fn write_slice(&self, output: &mut SerOutput, bytes: &[u8]) -> Result<(), SerializeError> {
        if bytes.len() > self.max {
            return Err(SerializeError::TooLong {
                len: bytes.len(),
                max: self.max,
            });
        }
        output.write_u32(bytes.len() as u32);
        output.write_bytes(bytes);
        output.pad(self.max - bytes.len());
        Ok(())
    }
}

impl Serializer<Vec<u8>> for BytesSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Vec<u8>, SerializeError> {
        Ok(self.read_slice(input)?.to_vec())
    }

    fn write(&self, output: &mut SerOutput, value: &Vec<u8>) -> Result<(), SerializeError> {
        self.write_slice(output, value)
    }

    fn size(&self) -> usize {
        4 + self.max
    }
}

/// UTF-8 strings of at most `max` bytes, stored like [`BytesSerializer`].
#[derive(Debug, Clone, Copy)]
pub struct StringSerializer {
    pub max: usize,
}

impl Serializer<String> for StringSerializer {
    fn read(&self, input: &mut SerInput<'_>) -> Result<String, SerializeError> {
        let bytes = BytesSerializer { max: self.max }.read_slice(input)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SerializeError::Malformed(format!("invalid UTF-8 string: {e}")))
    }

    fn write(&self, output: &mut SerOutput, value: &String) -> Result<(), SerializeError> {
        BytesSerializer { max: self.max }.write_slice(output, value.as_bytes())
    }

    fn size(&self) -> usize {
        4 + self.max
    }
}

/// Optional values, prefixed by a presence byte.
#[derive(Debug, Clone, Copy)]
pub struct NullableSerializer<S>(pub S);

impl<T, S: Serializer<T>> Serializer<Option<T>> for NullableSerializer<S> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Option<T>, SerializeError> {
        match input.read_u8()? {
            0 => Ok(None),
            1 => self.0.read(input).map(Some),
            tag => Err(SerializeError::InvalidTag(tag)),
        }
    }

    fn write(&self, output: &mut SerOutput, value: &Option<T>) -> Result<(), SerializeError> {
        match value {
            None => {
                output.write_u8(0);
                Ok(())
            }
            Some(v) => {
                output.write_u8(1);
                self.0.write(output, v)
            }
        }
    }

    fn size(&self) -> usize {
        1 + self.0.size()
    }
}

/// Two values written back to back.
#[derive(Debug, Clone, Copy)]
pub struct PairSerializer<A, B>(pub A, pub B);

impl<T, U, A: Serializer<T>, B: Serializer<U>> Serializer<(T, U)> for PairSerializer<A, B> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<(T, U), SerializeError> {
        let t = self.0.read(input)?;
        let u = self.1.read(input)?;
        Ok((t, u))
    }

    fn write(&self, output: &mut SerOutput, value: &(T, U)) -> Result<(), SerializeError> {
        self.0.write(output, &value.0)?;
        self.1.write(output, &value.1)
    }

    fn size(&self) -> usize {
        self.0.size() + self.1.size()
    }
}

/// Count-prefixed lists of at most `max_len` items.
#[derive(Debug, Clone, Copy)]
pub struct ListSerializer<S> {
    pub item: S,
    pub max_len: usize,
}

impl<T, S: Serializer<T>> Serializer<Vec<T>> for ListSerializer<S> {
    fn read(&self, input: &mut SerInput<'_>) -> Result<Vec<T>, SerializeError> {
        let len = input.read_u32()? as usize;
        if len > self.max_len {
            return Err(SerializeError::TooLong {
                len,
                max: self.max_len,
            });
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.item.read(input)?);
        }
        Ok(items)
    }

    fn write(&self, output: &mut SerOutput, value: &Vec<T>) -> Result<(), SerializeError> {
        if value.len() > self.max_len {
            return Err(SerializeError::TooLong {
                len: value.len(),
                max: self.max_len,
            });
        }
        output.write_u32(value.len() as u32);
        for item in value {
            self.item.write(output, item)?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        4 + self.max_len * self.item.size()
    }
}

/// Errors raised while encoding or decoding values.
#[derive(Debug)]
pub enum SerializeError {
    /// Input ended before the value was complete.
    ShortRead { needed: usize, remaining: usize },
    /// A length exceeds the serializer's bound.
    TooLong { len: usize, max: usize },
    /// A fixed-width value has the wrong length.
    LengthMismatch { expected: usize, actual: usize },
    /// Unknown discriminant byte.
    InvalidTag(u8),
    /// Bytes do not form a valid value.
    Malformed(String),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortRead { needed, remaining } => {
                write!(f, "short read: needed {needed} bytes, {remaining} remaining")
            }
            Self::TooLong { len, max } => write!(f, "length {len} exceeds maximum {max}"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "expected exactly {expected} bytes, got {actual}")
            }
            Self::InvalidTag(tag) => write!(f, "invalid tag byte: 0x{tag:02x}"),
            Self::Malformed(message) => write!(f, "malformed value: {message}"),
        }
    }
}

impl std::error::Error for SerializeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        for value in [0, 1, -1, i32::MIN, i32::MAX] {
            let bytes = encode(&IntSerializer, &value).expect("encode");
            assert_eq!(bytes.len(), 4);
            assert_eq!(decode(&IntSerializer, &bytes).expect("decode"), value);
        }
    }

    #[test]
    fn test_string_is_padded_to_fixed_width() {
        let serializer = StringSerializer { max: 16 };
        let short = encode(&serializer, &"7".to_string()).expect("encode");
        let long = encode(&serializer, &"1023".to_string()).expect("encode");
        assert_eq!(short.len(), serializer.size());
        assert_eq!(long.len(), serializer.size());
        assert_eq!(decode(&serializer, &long).expect("decode"), "1023");
    }

    #[test]
    fn test_string_too_long() {
        let serializer = StringSerializer { max: 4 };
        let result = encode(&serializer, &"hello".to_string());
        assert!(matches!(result, Err(SerializeError::TooLong { len: 5, max: 4 })));
    }

    #[test]
    fn test_corrupt_length_is_rejected() {
        let serializer = BytesSerializer { max: 8 };
        let mut bytes = encode(&serializer, &b"abc".to_vec()).expect("encode");
        bytes[0] = 200;
        assert!(matches!(
            decode(&serializer, &bytes),
            Err(SerializeError::TooLong { len: 200, max: 8 })
        ));
    }

    #[test]
    fn test_short_read() {
        let result = decode(&IntSerializer, &[1, 2]);
        assert!(matches!(
            result,
            Err(SerializeError::ShortRead {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_fixed_bytes_length_mismatch() {
        let serializer = FixedBytesSerializer { len: 3 };
        assert!(encode(&serializer, &vec![1, 2]).is_err());
        let bytes = encode(&serializer, &vec![1, 2, 3]).expect("encode");
        assert_eq!(decode(&serializer, &bytes).expect("decode"), vec![1, 2, 3]);
    }

    #[test]
    fn test_composite_serializers() {
        let serializer = ListSerializer {
            item: PairSerializer(
                NullableSerializer(IntSerializer),
                NullableSerializer(PointerSerializer),
            ),
            max_len: 4,
        };
        let value = vec![(None, Some(7u32)), (Some(-3), None), (Some(9), Some(11))];
        let bytes = encode(&serializer, &value).expect("encode");
        assert_eq!(decode(&serializer, &bytes).expect("decode"), value);
    }

    #[test]
    fn test_nullable_rejects_unknown_tag() {
        let result = decode(&NullableSerializer(IntSerializer), &[7, 0, 0, 0, 0]);
        assert!(matches!(result, Err(SerializeError::InvalidTag(7))));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = encode(&BytesSerializer { max: 4 }, &vec![0xFF, 0xFE]).expect("encode");
        let result = decode(&StringSerializer { max: 4 }, &bytes);
        assert!(matches!(result, Err(SerializeError::Malformed(_))));
    }
}
