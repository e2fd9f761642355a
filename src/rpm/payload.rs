//! Payload decompressor selection based on the compressor recorded in
//! the package header.

use std::io::Read;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use super::RpmError;

pub fn decompressor<'a, R: Read + Send + 'a>(
    name: &str,
    reader: R,
) -> Result<Box<dyn Read + Send + 'a>, RpmError> {
    match name {
        "gzip" => Ok(Box::new(GzDecoder::new(reader))),
        "xz" | "lzma" => Ok(Box::new(XzDecoder::new(reader))),
        "bzip2" => Ok(Box::new(BzDecoder::new(reader))),
        "zstd" => Ok(Box::new(zstd::stream::read::Decoder::new(reader)?)),
        other => Err(RpmError::UnsupportedPayload(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_gzip_round_trip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();
        let mut out = Vec::new();
        decompressor("gzip", &compressed[..])
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_unknown_compressor() {
        assert!(matches!(
            decompressor("lz4", &b""[..]),
            Err(RpmError::UnsupportedPayload(_))
        ));
    }
}
