//! Byte sources consumed by cache writes.
//!
//! A write enters the cache with an explicit length and a producer of that
//! many bytes: either a raw buffer, or a seekable stream (e.g. a temporary
//! file holding a downloaded object part). The producer must be able to
//! report how many bytes it can still yield so the cache can reject a write
//! whose declared length exceeds what the source holds.

use std::io::{Read, Seek, SeekFrom};

/// A producer of bytes with a known remaining length.
///
/// `read_into` fills the whole buffer and advances the source; callers pull
/// the declared write length in bounded chunks, so implementations never
/// need to materialize the full payload.
pub trait ByteSource {
    /// Bytes this source can still produce.
    fn remaining(&mut self) -> std::io::Result<u64>;

    /// Fill `buf` completely from the source, advancing past the read bytes.
    fn read_into(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
}

impl ByteSource for &[u8] {
    fn remaining(&mut self) -> std::io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        if buf.len() > self.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "byte slice exhausted",
            ));
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

/// A [`ByteSource`] over any seekable reader.
///
/// `remaining` is measured by seeking to the end and back, the way the
/// stream's total size is probed once per write.
pub struct StreamSource<R> {
    inner: R,
}

impl<R: Read + Seek> StreamSource<R> {
    /// Wrap a seekable reader, consuming it from its current position.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Seek> ByteSource for StreamSource<R> {
    fn remaining(&mut self) -> std::io::Result<u64> {
        let pos = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(end.saturating_sub(pos))
    }

    fn read_into(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf)
    }
}
