//! Chunked writer used to stream decoder output into a cache file.
//!
//! Decoders write in whatever granularity suits them; the cache file lock is
//! taken once per flushed chunk, so readers of earlier extents of the same
//! file are never blocked for a whole decode.

use std::io::{self, Write};

/// Buffered writer with a fixed flush threshold.
///
/// Unlike `std::io::BufWriter` it tracks `bytes_written`, which the cache
/// uses to record the new extent.
pub struct WriteBuffer<W: Write> {
    inner:    W,
    buf:      Vec<u8>,
    capacity: usize,
    pub bytes_written: u64,
}

impl<W: Write> WriteBuffer<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            bytes_written: 0,
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<W: Write> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buf.len() + buf.len() > self.capacity {
            self.drain()?;
        }
        if buf.len() >= self.capacity {
            self.inner.write_all(buf)?;
        } else {
            self.buf.extend_from_slice(buf);
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<usize>,
        data:   Vec<u8>,
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.push(buf.len());
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    #[test]
    fn small_writes_are_batched() {
        let mut rec = Recorder::default();
        {
            let mut wb = WriteBuffer::new(&mut rec, 8);
            wb.write_all(b"hello").unwrap();
            wb.write_all(b" world!").unwrap();
            wb.flush().unwrap();
            assert_eq!(wb.bytes_written, 12);
        }
        assert_eq!(rec.data, b"hello world!");
        assert_eq!(rec.writes, vec![5, 7]);
    }

    #[test]
    fn oversized_writes_go_straight_through() {
        let mut rec = Recorder::default();
        {
            let mut wb = WriteBuffer::new(&mut rec, 4);
            wb.write_all(b"ab").unwrap();
            wb.write_all(b"0123456789").unwrap();
            wb.flush().unwrap();
        }
        assert_eq!(rec.data, b"ab0123456789");
        assert_eq!(rec.writes, vec![2, 10]);
    }
}
