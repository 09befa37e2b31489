//! `BufferStream`: a `Read`/`Write` adapter over a `Buffer`
//! §6). It never seeks -- position is just the buffer's reader/writer
//! indices -- and dropping it releases the one reference it holds.
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::buffer::Buffer;
use crate::error::BufError;

pub struct BufferStream {
    buf: Buffer,
}

impl BufferStream {
    /// Takes ownership of one reference to `buf`. Callers that want to
    /// keep using `buf` after the stream is dropped must `retain()`
    /// first.
    pub fn new(buf: Buffer) -> Self {
        BufferStream { buf }
    }

    pub fn get_ref(&self) -> &Buffer {
        &self.buf
    }

    /// Forwards to `Buffer::set_capacity` (no independent notion of
    /// stream length beyond the buffer's own capacity).
    pub fn set_length(&self, length: usize) -> crate::error::Result<()> {
        self.buf.set_capacity(length)
    }
}

impl Read for BufferStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.buf.readable_bytes();
        let n = available.min(out.len());
        if n == 0 {
            return Ok(0);
        }
        self.buf.read_bytes(&mut out[..n]).map_err(io::Error::from)?;
        Ok(n)
    }
}

impl Write for BufferStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.write_bytes(data).map_err(io::Error::from)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Position in this stream is just the buffer's own reader/writer
/// indices; there is no independent cursor to seek. Every call fails
/// with `NotSupported`, mirroring the external interface's "stream
/// adapter does not support seeking" rule.
impl Seek for BufferStream {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(BufError::unsupported("BufferStream does not support seeking").into())
    }
}

impl Drop for BufferStream {
    fn drop(&mut self) {
        let _ = self.buf.release(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_through_stream() {
        let buf = crate::unpooled::new(4, 64).unwrap();
        let mut s = BufferStream::new(buf);
        s.write_all(b"hello world").unwrap();

        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn set_length_forwards_to_set_capacity() {
        let buf = crate::unpooled::new(4, 64).unwrap();
        let s = BufferStream::new(buf);
        s.set_length(32).unwrap();
        assert_eq!(s.get_ref().capacity(), 32);
    }

    #[test]
    fn drop_releases_one_reference() {
        let buf = crate::unpooled::new(4, 64).unwrap();
        buf.retain(1).unwrap();
        assert_eq!(buf.ref_count(), 2);
        {
            let _s = BufferStream::new(buf.clone());
        }
        assert_eq!(buf.ref_count(), 1);
        buf.release(1).unwrap();
    }

    #[test]
    fn seeking_is_not_supported() {
        let buf = crate::unpooled::new(4, 64).unwrap();
        let mut s = BufferStream::new(buf);
        assert_eq!(s.seek(SeekFrom::Start(0)).unwrap_err().kind(), io::ErrorKind::Unsupported);
    }
}
