//! Byte encodings for keys and values.
//!
//! A codec with a `FIXED_WIDTH` can live inline in a slot record; anything
//! else is stored in the value log and referenced by offset. Two keys (or
//! values) are equal exactly when their encodings are equal.

use crate::error::{Error, Result};

pub trait Codec: Sized {
    /// Encoded width when every value encodes to the same number of bytes.
    const FIXED_WIDTH: Option<usize>;

    fn encode_into(&self, out: &mut Vec<u8>);

    fn decode(bytes: &[u8]) -> Result<Self>;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_WIDTH.unwrap_or(16));
        self.encode_into(&mut out);
        out
    }
}

fn width_error(type_name: &str, expected: usize, found: usize) -> Error {
    Error::Codec(format!(
        "{type_name} needs {expected} bytes, found {found}"
    ))
}

macro_rules! impl_fixed_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Codec for $ty {
                const FIXED_WIDTH: Option<usize> = Some(std::mem::size_of::<$ty>());

                #[inline]
                fn encode_into(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Result<Self> {
                    let raw = bytes.try_into().map_err(|_| {
                        width_error(stringify!($ty), std::mem::size_of::<$ty>(), bytes.len())
                    })?;
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_fixed_codec!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Codec for bool {
    const FIXED_WIDTH: Option<usize> = Some(1);

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            [b] => Err(Error::Codec(format!("invalid bool byte {b:#04x}"))),
            _ => Err(width_error("bool", 1, bytes.len())),
        }
    }
}

impl Codec for char {
    const FIXED_WIDTH: Option<usize> = Some(4);

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(*self as u32).to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let code = u32::decode(bytes)?;
        char::from_u32(code).ok_or_else(|| Error::Codec(format!("invalid char {code:#x}")))
    }
}

impl<const N: usize> Codec for [u8; N] {
    const FIXED_WIDTH: Option<usize> = Some(N);

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bytes
            .try_into()
            .map_err(|_| width_error("byte array", N, bytes.len()))
    }
}

impl Codec for Vec<u8> {
    const FIXED_WIDTH: Option<usize> = None;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Codec for String {
    const FIXED_WIDTH: Option<usize> = None;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_widths() {
        assert_eq!(u64::FIXED_WIDTH, Some(8));
        assert_eq!(i16::FIXED_WIDTH, Some(2));
        assert_eq!(<[u8; 20]>::FIXED_WIDTH, Some(20));
        assert_eq!(String::FIXED_WIDTH, None);
        assert_eq!(Vec::<u8>::FIXED_WIDTH, None);
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(0x0102_0304u32.encode(), vec![4, 3, 2, 1]);
        assert_eq!(u32::decode(&[4, 3, 2, 1]).unwrap(), 0x0102_0304);
        assert_eq!(i64::decode(&(-5i64).encode()).unwrap(), -5);
        assert_eq!(f64::decode(&1.5f64.encode()).unwrap(), 1.5);
    }

    #[test]
    fn wrong_width_is_an_error() {
        assert!(matches!(u64::decode(&[1, 2, 3]), Err(Error::Codec(_))));
        assert!(<[u8; 4]>::decode(&[1, 2]).is_err());
        assert!(bool::decode(&[]).is_err());
    }

    #[test]
    fn rejects_invalid_encodings() {
        assert!(bool::decode(&[2]).is_err());
        assert!(char::decode(&0xD800u32.to_le_bytes()).is_err());
        assert!(String::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn variable_payloads() {
        assert_eq!(String::decode(&"héllo".to_string().encode()).unwrap(), "héllo");
        assert_eq!(Vec::<u8>::decode(b"").unwrap(), Vec::<u8>::new());
        assert_eq!(char::decode(&'λ'.encode()).unwrap(), 'λ');
    }
}
