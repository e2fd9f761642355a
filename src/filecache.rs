//! Content-addressed package cache: a flat directory of files named by
//! their lowercase hex digest. Insertion is verified against the
//! expected checksum and goes through a temporary name, so readers only
//! ever observe complete files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use walkdir::WalkDir;

use crate::base16;
use crate::checksum::{Checksum, HashKind, HashSink};
use crate::stream::Sink;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHash(String),
    #[error("checksum mismatch: {kind}")]
    ChecksumMismatch { kind: &'static str },
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn supported(kind: HashKind) -> bool {
    matches!(kind, HashKind::Sha1 | HashKind::Sha256)
}

pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileCache> {
        fs::create_dir_all(path.as_ref())?;
        Ok(FileCache {
            root: path.as_ref().to_path_buf(),
        })
    }

    /// Path of a cached blob, if it exists and its size matches the
    /// expected length (when one is known).
    pub fn lookup_path(&self, csum: &Checksum) -> Option<PathBuf> {
        if !supported(csum.kind) {
            return None;
        }
        let path = self.root.join(csum.hex_value());
        let meta = fs::symlink_metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        match csum.length {
            Some(length) if length != meta.len() => None,
            _ => Some(path),
        }
    }

    /// Open a verifying sink for the given checksum. The data lands in
    /// a temporary file next to its final name; `finish` verifies and
    /// publishes it.
    pub fn add_sink(&self, csum: &Checksum) -> Result<AddSink, CacheError> {
        if !supported(csum.kind) {
            return Err(CacheError::UnsupportedHash(csum.kind.to_string()));
        }
        let temp = tempfile::Builder::new()
            .prefix(".insert-")
            .tempfile_in(&self.root)?;
        Ok(AddSink {
            temp,
            hash: HashSink::new(csum.kind),
            csum: csum.clone(),
            final_path: self.root.join(csum.hex_value()),
        })
    }

    pub fn add(&self, csum: &Checksum, data: &[u8]) -> Result<PathBuf, CacheError> {
        let mut sink = self.add_sink(csum)?;
        sink.write(data)?;
        sink.finish()
    }

    /// All digests currently present, for garbage collection.
    pub fn digests(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(digest) = base16::decode(name) {
                    out.push(digest);
                }
            }
        }
        Ok(out)
    }
}

/// The temporary file is removed on drop, so an abandoned or failed
/// insertion leaves no trace in the cache directory.
pub struct AddSink {
    temp: NamedTempFile,
    hash: HashSink,
    csum: Checksum,
    final_path: PathBuf,
}

impl Sink for AddSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.temp.write_all(data)?;
        self.hash.write(data)
    }
}

impl AddSink {
    /// Verify length and digest, sync and publish the file, returning
    /// its final path. On a length mismatch a concurrently inserted
    /// correct file is left untouched; any other failure removes the
    /// temporary file.
    pub fn finish(self) -> Result<PathBuf, CacheError> {
        let AddSink {
            temp,
            hash,
            csum,
            final_path,
        } = self;
        if let Some(expected) = csum.length {
            if expected != hash.length() {
                return Err(CacheError::ChecksumMismatch { kind: "length" });
            }
        }
        if hash.finalize() != csum.value {
            return Err(CacheError::ChecksumMismatch { kind: "digest" });
        }
        temp.as_file().sync_all()?;
        temp.persist(&final_path).map_err(|e| e.error)?;
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash;

    fn checksum_for(data: &[u8], length: Option<u64>) -> Checksum {
        Checksum {
            kind: HashKind::Sha256,
            length,
            value: hash(HashKind::Sha256, data),
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let csum = checksum_for(b"content", Some(7));
        assert!(cache.lookup_path(&csum).is_none());
        let path = cache.add(&csum, b"content").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"content");
        assert_eq!(cache.lookup_path(&csum), Some(path));
        // Without a length the lookup still succeeds.
        let no_len = checksum_for(b"content", None);
        assert!(cache.lookup_path(&no_len).is_some());
        assert_eq!(cache.digests().unwrap(), vec![csum.value.clone()]);
    }

    #[test]
    fn test_wrong_digest_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let mut csum = checksum_for(b"content", Some(5));
        csum.value[0] ^= 0xff;
        let err = cache.add(&csum, b"wrong").unwrap_err();
        assert!(matches!(
            err,
            CacheError::ChecksumMismatch { kind: "digest" }
        ));
        assert!(cache.digests().unwrap().is_empty());
    }

    #[test]
    fn test_wrong_length_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let good = checksum_for(b"content", Some(7));
        cache.add(&good, b"content").unwrap();
        // A second producer with the right digest but a wrong length
        // must not clobber the good file.
        let bad = Checksum {
            length: Some(3),
            ..good.clone()
        };
        let err = cache.add(&bad, b"content").unwrap_err();
        assert!(matches!(
            err,
            CacheError::ChecksumMismatch { kind: "length" }
        ));
        assert_eq!(
            fs::read(cache.lookup_path(&good).unwrap()).unwrap(),
            b"content"
        );
    }

    #[test]
    fn test_unsupported_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let csum = Checksum {
            kind: HashKind::Md5,
            length: None,
            value: hash(HashKind::Md5, b"x"),
        };
        assert!(matches!(
            cache.add_sink(&csum),
            Err(CacheError::UnsupportedHash(_))
        ));
    }

    #[test]
    fn test_abandoned_sink_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let csum = checksum_for(b"content", None);
        {
            let mut sink = cache.add_sink(&csum).unwrap();
            sink.write(b"con").unwrap();
            // Dropped without finish.
        }
        assert!(cache.digests().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
