//! Digest algorithms and checksum descriptors shared by the file cache,
//! the downloader and the repository driver.

use std::fmt;

use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

use crate::base16;
use crate::stream::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

impl HashKind {
    /// Parse a repository checksum type. `sha` is the historical alias
    /// for SHA-1 used by older createrepo versions.
    pub fn from_type(name: &str) -> Result<HashKind, ChecksumError> {
        match name {
            "md5" => Ok(HashKind::Md5),
            "sha" | "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err(ChecksumError::UnsupportedHash(name.to_string())),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        })
    }
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHash(String),
    #[error("malformed digest: {0}")]
    Malformed(#[from] base16::Base16Error),
    #[error("digest length {got} does not match {kind} ({want})")]
    DigestLength { kind: HashKind, got: usize, want: usize },
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

/// A sink computing a digest over everything written to it.
pub struct HashSink {
    state: HasherState,
    length: u64,
}

impl HashSink {
    pub fn new(kind: HashKind) -> HashSink {
        let state = match kind {
            HashKind::Md5 => HasherState::Md5(Md5::new()),
            HashKind::Sha1 => HasherState::Sha1(Sha1::new()),
            HashKind::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        HashSink { state, length: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.state {
            HasherState::Md5(h) => h.finalize().to_vec(),
            HasherState::Sha1(h) => h.finalize().to_vec(),
            HasherState::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

impl Sink for HashSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
        self.length += data.len() as u64;
        Ok(())
    }
}

/// One-shot digest helper.
pub fn hash(kind: HashKind, data: &[u8]) -> Vec<u8> {
    let mut sink = HashSink::new(kind);
    // Hashing into memory cannot fail.
    let _ = sink.write(data);
    sink.finalize()
}

/// An expected digest, as advertised by a repository index: algorithm,
/// optional payload length and digest bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: HashKind,
    pub length: Option<u64>,
    pub value: Vec<u8>,
}

impl Checksum {
    pub fn from_hex(
        kind_name: &str,
        length: Option<u64>,
        hex: &str,
    ) -> Result<Checksum, ChecksumError> {
        let kind = HashKind::from_type(kind_name)?;
        let value = base16::decode(hex.trim())?;
        if value.len() != kind.digest_len() {
            return Err(ChecksumError::DigestLength {
                kind,
                got: value.len(),
                want: kind.digest_len(),
            });
        }
        Ok(Checksum { kind, length, value })
    }

    pub fn hex_value(&self) -> String {
        base16::encode(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot() {
        assert_eq!(
            base16::encode(&hash(HashKind::Sha256, b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            base16::encode(&hash(HashKind::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            base16::encode(&hash(HashKind::Md5, b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_chunked_equivalence() {
        let data = b"the quick brown fox jumps over the lazy dog";
        for kind in [HashKind::Md5, HashKind::Sha1, HashKind::Sha256] {
            let whole = hash(kind, data);
            for chunk in [1usize, 3, 7, 16] {
                let mut sink = HashSink::new(kind);
                for part in data.chunks(chunk) {
                    sink.write(part).unwrap();
                }
                assert_eq!(sink.finalize(), whole);
            }
        }
    }

    #[test]
    fn test_checksum_parse() {
        let c = Checksum::from_hex(
            "sha",
            Some(42),
            "a9993e364706816aba3e25717850c26c9cd0d89d",
        )
        .unwrap();
        assert_eq!(c.kind, HashKind::Sha1);
        assert_eq!(c.length, Some(42));
        assert!(Checksum::from_hex("crc32", None, "00").is_err());
        assert!(Checksum::from_hex("sha256", None, "0011").is_err());
    }
}
