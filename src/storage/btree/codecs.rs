//! Serialization of keys and values into record payloads.

use crate::types::{Result, StoreError};

/// Converts a key or value to and from its stored byte form.
pub trait Codec: Sized + Clone + Send + Sync + 'static {
    /// Appends the encoded form of `value` to `out`.
    fn encode(value: &Self, out: &mut Vec<u8>);
    /// Decodes a value from its stored bytes.
    fn decode(src: &[u8]) -> Result<Self>;
}

fn fixed<const N: usize>(src: &[u8], what: &str) -> Result<[u8; N]> {
    src.try_into()
        .map_err(|_| StoreError::Codec(format!("{what} length {} != {N}", src.len())))
}

impl Codec for u64 {
    fn encode(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed(src, "u64")?))
    }
}

impl Codec for i64 {
    fn encode(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(i64::from_be_bytes(fixed(src, "i64")?))
    }
}

impl Codec for u32 {
    fn encode(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(u32::from_be_bytes(fixed(src, "u32")?))
    }
}

impl Codec for Vec<u8> {
    fn encode(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl Codec for String {
    fn encode(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        String::from_utf8(src.to_vec()).map_err(|err| StoreError::Codec(err.to_string()))
    }
}

impl Codec for () {
    fn encode(_value: &Self, _out: &mut Vec<u8>) {}

    fn decode(src: &[u8]) -> Result<Self> {
        if !src.is_empty() {
            return Err(StoreError::Codec(format!("unit value with {} bytes", src.len())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut out = Vec::new();
        u64::encode(&0x0102, &mut out);
        assert_eq!(out, [0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(u64::decode(&out).unwrap(), 0x0102);
        assert!(matches!(u64::decode(&out[..4]), Err(StoreError::Codec(_))));
    }

    #[test]
    fn strings_reject_invalid_utf8() {
        assert!(String::decode(&[0xff, 0xfe]).is_err());
        assert_eq!(String::decode(b"key").unwrap(), "key");
        assert!(<()>::decode(b"x").is_err());
    }
}
