//! The self-describing tagged binary codec used for structured
//! sub-payloads (TCP connect pairs, HTTP metadata records).
//!
//! Wire format, one tag octet per value:
//!
//! ```text
//! 0x00 False        0x01 True         0x02 Null        0x03 Undefined
//! 0x04 Integer      ZigZag-ULEB128
//! 0x05 Float        f64 little-endian
//! 0x06 String       ULEB128 length + UTF-8
//! 0x07 Binary       ULEB128 length + bytes
//! 0x08 Array        ULEB128 count + values
//! 0x09 Object       ULEB128 count + (ULEB128 key length + key + value)*
//! 0x0A PosInfinity  0x0B NegInfinity  0x0C NaN         0x0D Unknown
//! ```
//!
//! `Undefined` appears only inside arrays; object entries holding it are
//! elided at encode time. A top-level decode rejects trailing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::DecodeError;

const TAG_FALSE: u8 = 0x00;
const TAG_TRUE: u8 = 0x01;
const TAG_NULL: u8 = 0x02;
const TAG_UNDEFINED: u8 = 0x03;
const TAG_INTEGER: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_BINARY: u8 = 0x07;
const TAG_ARRAY: u8 = 0x08;
const TAG_OBJECT: u8 = 0x09;
const TAG_POS_INFINITY: u8 = 0x0A;
const TAG_NEG_INFINITY: u8 = 0x0B;
const TAG_NAN: u8 = 0x0C;
const TAG_UNKNOWN: u8 = 0x0D;

/// One decoded value. Objects keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Null,
    Undefined,
    Integer(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    Unknown,
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(s.as_ref().to_owned())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Looks a key up in an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries
                .iter()
                .find_map(|(k, v)| (k == key).then_some(v)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.write(&mut dst);
        dst.freeze()
    }

    fn write(&self, dst: &mut BytesMut) {
        match self {
            Value::Bool(false) => dst.put_u8(TAG_FALSE),
            Value::Bool(true) => dst.put_u8(TAG_TRUE),
            Value::Null => dst.put_u8(TAG_NULL),
            Value::Undefined => dst.put_u8(TAG_UNDEFINED),
            Value::Integer(n) => {
                dst.put_u8(TAG_INTEGER);
                put_uleb128(dst, zigzag_encode(*n));
            }
            Value::Float(f) if f.is_nan() => dst.put_u8(TAG_NAN),
            Value::Float(f) if *f == f64::INFINITY => dst.put_u8(TAG_POS_INFINITY),
            Value::Float(f) if *f == f64::NEG_INFINITY => dst.put_u8(TAG_NEG_INFINITY),
            Value::Float(f) => {
                dst.put_u8(TAG_FLOAT);
                dst.put_f64_le(*f);
            }
            Value::String(s) => {
                dst.put_u8(TAG_STRING);
                put_uleb128(dst, s.len() as u64);
                dst.put_slice(s.as_bytes());
            }
            Value::Binary(b) => {
                dst.put_u8(TAG_BINARY);
                put_uleb128(dst, b.len() as u64);
                dst.put_slice(b);
            }
            Value::Array(items) => {
                dst.put_u8(TAG_ARRAY);
                put_uleb128(dst, items.len() as u64);
                for item in items {
                    item.write(dst);
                }
            }
            Value::Object(entries) => {
                dst.put_u8(TAG_OBJECT);
                let kept: Vec<_> = entries
                    .iter()
                    .filter(|(_, v)| !matches!(v, Value::Undefined))
                    .collect();
                put_uleb128(dst, kept.len() as u64);
                for (key, value) in kept {
                    put_uleb128(dst, key.len() as u64);
                    dst.put_slice(key.as_bytes());
                    value.write(dst);
                }
            }
            Value::Unknown => dst.put_u8(TAG_UNKNOWN),
        }
    }

    /// Decodes one top-level value, rejecting trailing bytes.
    pub fn decode(src: &[u8]) -> Result<Value, DecodeError> {
        let mut buf = src;
        let value = Value::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }

    fn read(buf: &mut &[u8]) -> Result<Value, DecodeError> {
        if !buf.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        let value = match buf.get_u8() {
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_NULL => Value::Null,
            TAG_UNDEFINED => Value::Undefined,
            TAG_INTEGER => Value::Integer(zigzag_decode(get_uleb128(buf)?)),
            TAG_FLOAT => {
                if buf.remaining() < 8 {
                    return Err(DecodeError::Truncated);
                }
                Value::Float(buf.get_f64_le())
            }
            TAG_STRING => Value::String(get_string(buf)?),
            TAG_BINARY => {
                let len = get_len(buf)?;
                let bytes = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                Value::Binary(bytes)
            }
            TAG_ARRAY => {
                let count = get_uleb128(buf)?;
                let mut items = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    items.push(Value::read(buf)?);
                }
                Value::Array(items)
            }
            TAG_OBJECT => {
                let count = get_uleb128(buf)?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let key = get_string(buf)?;
                    let value = Value::read(buf)?;
                    entries.push((key, value));
                }
                Value::Object(entries)
            }
            TAG_POS_INFINITY => Value::Float(f64::INFINITY),
            TAG_NEG_INFINITY => Value::Float(f64::NEG_INFINITY),
            TAG_NAN => Value::Float(f64::NAN),
            TAG_UNKNOWN => Value::Unknown,
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(value)
    }
}

fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn zigzag_decode(z: u64) -> i64 {
    ((z >> 1) as i64) ^ -((z & 1) as i64)
}

fn put_uleb128(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

fn get_uleb128(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::VarintOverflow);
        }
    }
}

fn get_len(buf: &mut &[u8]) -> Result<usize, DecodeError> {
    let len = get_uleb128(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    Ok(len)
}

fn get_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = get_len(buf)?;
    let raw = &buf[..len];
    let s = std::str::from_utf8(raw)
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        assert_eq!(Value::decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::Bool(false));
        round_trip(Value::Bool(true));
        round_trip(Value::Null);
        round_trip(Value::Unknown);
        round_trip(Value::Float(1.5));
        round_trip(Value::Float(f64::INFINITY));
        round_trip(Value::Float(f64::NEG_INFINITY));
        round_trip(Value::String("résumé".into()));
        round_trip(Value::Binary(Bytes::from_static(b"\x00\x01\xFF")));
    }

    #[test]
    fn nan_decodes_to_nan() {
        match Value::decode(&Value::Float(f64::NAN).encode()).unwrap() {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn integers_round_trip_across_range() {
        for n in [0i64, 1, -1, 63, 64, -64, -65, 300, i64::MAX, i64::MIN] {
            round_trip(Value::Integer(n));
        }
    }

    #[test]
    fn zigzag_matches_reference_values() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
    }

    #[test]
    fn containers_round_trip() {
        round_trip(Value::Array(vec![
            Value::Integer(7),
            Value::Undefined,
            Value::String("x".into()),
            Value::Array(vec![]),
        ]));
        round_trip(Value::Object(vec![
            ("host".into(), Value::string("example.com")),
            ("port".into(), Value::Integer(443)),
            ("nested".into(), Value::Object(vec![])),
        ]));
    }

    #[test]
    fn undefined_is_elided_from_objects() {
        let value = Value::Object(vec![
            ("keep".into(), Value::Integer(1)),
            ("drop".into(), Value::Undefined),
        ]);
        let decoded = Value::decode(&value.encode()).unwrap();
        assert_eq!(
            decoded,
            Value::Object(vec![("keep".into(), Value::Integer(1))])
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Value::Null.encode().to_vec();
        bytes.push(0x00);
        assert_eq!(Value::decode(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn truncated_and_bogus_tags_are_rejected() {
        assert_eq!(Value::decode(&[]), Err(DecodeError::Truncated));
        assert_eq!(
            Value::decode(&[TAG_STRING, 0x05, b'a']),
            Err(DecodeError::Truncated)
        );
        assert_eq!(Value::decode(&[0x7F]), Err(DecodeError::UnknownTag(0x7F)));
    }

    #[test]
    fn varint_overflow_is_rejected() {
        let bytes = [TAG_INTEGER, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert_eq!(Value::decode(&bytes), Err(DecodeError::VarintOverflow));
    }
}
