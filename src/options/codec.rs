//! Binary codec for option value buffers.
//!
//! Backends exchange option values as raw buffers of a declared size. A
//! `SANE_Word` is a native-endian 32-bit integer; booleans are a word holding
//! 0 or 1; fixed-point numbers are 16.16 words; strings are NUL-terminated
//! byte arrays. Options with a size larger than one word are arrays, of which
//! this crate only reads and writes the first element.

use crate::error::{Result, SaneError};

/// Byte width of a `SANE_Word`.
pub const WORD_SIZE: usize = 4;

const FIXED_SCALE: f64 = (1 << 16) as f64;

/// `SANE_UNFIX`
pub fn fixed_to_f64(word: i32) -> f64 {
    f64::from(word) / FIXED_SCALE
}

/// `SANE_FIX`
pub fn f64_to_fixed(value: f64) -> i32 {
    (value * FIXED_SCALE) as i32
}

/// A value with an explicit encoding into an option buffer.
pub trait WireValue: Sized {
    /// Encode into exactly `size` bytes.
    fn encode(&self, size: usize) -> Result<Vec<u8>>;

    /// Decode from a buffer previously filled by the backend.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

fn encode_word(word: i32, size: usize) -> Result<Vec<u8>> {
    if size < WORD_SIZE {
        return Err(SaneError::InvalidValue(format!(
            "option size {} is smaller than a word",
            size
        )));
    }
    let mut buf = vec![0u8; size];
    buf[..WORD_SIZE].copy_from_slice(&word.to_ne_bytes());
    Ok(buf)
}

fn decode_word(bytes: &[u8]) -> Result<i32> {
    let word: [u8; WORD_SIZE] = bytes
        .get(..WORD_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            SaneError::InvalidValue(format!("value buffer of {} bytes", bytes.len()))
        })?;
    Ok(i32::from_ne_bytes(word))
}

impl WireValue for bool {
    fn encode(&self, size: usize) -> Result<Vec<u8>> {
        encode_word(i32::from(*self), size)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_word(bytes).map(|w| w != 0)
    }
}

impl WireValue for i32 {
    fn encode(&self, size: usize) -> Result<Vec<u8>> {
        encode_word(*self, size)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_word(bytes)
    }
}

impl WireValue for f64 {
    fn encode(&self, size: usize) -> Result<Vec<u8>> {
        if !self.is_finite() {
            return Err(SaneError::InvalidValue(format!("{} is not finite", self)));
        }
        encode_word(f64_to_fixed(*self), size)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode_word(bytes).map(fixed_to_f64)
    }
}

impl WireValue for String {
    /// Truncates to `size - 1` bytes so the terminator always fits.
    fn encode(&self, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(SaneError::InvalidValue(
                "string option has no room for a terminator".to_string(),
            ));
        }
        let mut buf = vec![0u8; size];
        let bytes = self.as_bytes();
        let len = bytes.len().min(size - 1);
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_conversion() {
        assert_eq!(f64_to_fixed(1.0), 65536);
        assert_eq!(fixed_to_f64(65536 * 215 + 32768), 215.5);
        assert_eq!(f64_to_fixed(-2.5), -163840);
    }

    #[test]
    fn test_word_encoding_pads_to_declared_size() {
        let buf = 300i32.encode(8).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[..4], &300i32.to_ne_bytes());
        assert_eq!(&buf[4..], &[0, 0, 0, 0]);
        assert!(matches!(1i32.encode(2), Err(SaneError::InvalidValue(_))));
    }

    #[test]
    fn test_string_truncated_with_terminator() {
        let buf = "Color".to_string().encode(4).unwrap();
        assert_eq!(buf, b"Col\0".to_vec());
        assert_eq!(String::decode(b"Gray\0\0\0\0").unwrap(), "Gray");
        assert_eq!(String::decode(b"Lineart").unwrap(), "Lineart");
    }

    #[test]
    fn test_bool_decodes_any_non_zero_word() {
        assert!(bool::decode(&7i32.to_ne_bytes()).unwrap());
        assert!(!bool::decode(&0i32.to_ne_bytes()).unwrap());
        assert!(bool::decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_fixed_rejects_nan() {
        assert!(f64::NAN.encode(4).is_err());
    }
}
