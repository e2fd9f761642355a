use faster_hex::{hex_decode, hex_string};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Base16Error {
    #[error("odd number of hexadecimal digits ({0})")]
    OddLength(usize),
    #[error("invalid hexadecimal digit at offset {0}")]
    InvalidDigit(usize),
}

/// Encode bytes as lowercase hexadecimal.
pub fn encode(data: &[u8]) -> String {
    hex_string(data)
}

pub fn decode(text: &str) -> Result<Vec<u8>, Base16Error> {
    if text.len() % 2 != 0 {
        return Err(Base16Error::OddLength(text.len()));
    }
    let mut out = vec![0u8; text.len() / 2];
    match hex_decode(text.as_bytes(), &mut out) {
        Ok(()) => Ok(out),
        Err(_) => {
            let pos = text
                .bytes()
                .position(|b| !b.is_ascii_hexdigit())
                .unwrap_or_default();
            Err(Base16Error::InvalidDigit(pos))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for data in [&b""[..], &b"\x00"[..], &b"\xff\x00\x12\x34"[..]] {
            assert_eq!(decode(&encode(data)).unwrap(), data);
        }
        assert_eq!(encode(b"\xde\xad\xbe\xef"), "deadbeef");
        assert_eq!(decode("DEADBEEF").unwrap(), b"\xde\xad\xbe\xef");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode("abc"), Err(Base16Error::OddLength(3)));
        assert_eq!(decode("zz"), Err(Base16Error::InvalidDigit(0)));
        assert_eq!(decode("00g0"), Err(Base16Error::InvalidDigit(2)));
    }
}
