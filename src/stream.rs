//! Byte stream capabilities: a source produces up to N bytes per call,
//! a sink accepts exactly the bytes handed to it. Filters compose by
//! wrapping other sources or sinks.

use std::io::{self, Read};

use flate2::read::MultiGzDecoder;

pub trait Source {
    /// Read up to `buf.len()` bytes. Zero means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub trait Sink {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Any `std::io::Read` acts as a source.
pub struct ReadSource<R>(pub R);

impl<R: Read> Source for ReadSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// In-memory source over a byte slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> SliceSource<'a> {
        SliceSource { data }
    }
}

impl Source for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.len().min(buf.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

/// Sink collecting everything into a vector.
#[derive(Default)]
pub struct VecSink {
    pub data: Vec<u8>,
}

impl Sink for VecSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }
}

/// Writes to two sinks, first then second.
pub struct TeeSink<'a> {
    pub first: &'a mut dyn Sink,
    pub second: &'a mut dyn Sink,
}

impl<'a> TeeSink<'a> {
    pub fn new(first: &'a mut dyn Sink, second: &'a mut dyn Sink) -> TeeSink<'a> {
        TeeSink { first, second }
    }
}

impl Sink for TeeSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.first.write(data)?;
        self.second.write(data)
    }
}

/// Sink writing through to a `std::io::Write`, retrying short writes.
pub struct WriteSink<W>(pub W);

impl<W: io::Write> Sink for WriteSink<W> {
    fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.0.write(data)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ));
            }
            data = &data[n..];
        }
        Ok(())
    }
}

struct SourceReader<'a>(&'a mut dyn Source);

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Decompressing filter source. Handles single-member and concatenated
/// gzip streams; a stream truncated mid-member surfaces as an
/// `UnexpectedEof` error.
pub struct GunzipSource<'a> {
    inner: MultiGzDecoder<SourceReader<'a>>,
}

impl<'a> GunzipSource<'a> {
    pub fn new(upstream: &'a mut dyn Source) -> GunzipSource<'a> {
        GunzipSource {
            inner: MultiGzDecoder::new(SourceReader(upstream)),
        }
    }
}

impl Source for GunzipSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Copy a source to a sink until end of stream, returning the number of
/// bytes moved.
pub fn copy(source: &mut dyn Source, sink: &mut dyn Sink) -> io::Result<u64> {
    let mut buf = [0u8; 65536];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        sink.write(&buf[..n])?;
        total += n as u64;
    }
}

/// Fill `buf` completely or fail with `UnexpectedEof`.
pub fn read_exactly(source: &mut dyn Source, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes", filled, buf.len()),
            ));
        }
        filled += n;
    }
    Ok(())
}

pub fn read_all(source: &mut dyn Source) -> io::Result<Vec<u8>> {
    let mut out = VecSink::default();
    copy(source, &mut out)?;
    Ok(out.data)
}
