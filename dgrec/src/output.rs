//! Buffered trace output.

use std::io::{self, Write};

const OUT_BUF_SIZE: usize = 4096;

/// Accumulates encoded bytes and forwards them to the sink in
/// [OUT_BUF_SIZE] units.
///
/// An append that no longer fits flushes the buffer first; an append larger
/// than the buffer itself flushes and then writes through. Nothing is held
/// back once [OutputBuffer::flush] returns, so flushing at termination
/// guarantees a complete trace on disk.
pub struct OutputBuffer<W: Write> {
    sink: W,
    buf: Box<[u8; OUT_BUF_SIZE]>,
    used: usize,
}

impl<W: Write> OutputBuffer<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            buf: Box::new([0; OUT_BUF_SIZE]),
            used: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > OUT_BUF_SIZE - self.used {
            self.flush_buf()?;
        }
        if bytes.len() > OUT_BUF_SIZE {
            self.sink.write_all(bytes)
        } else {
            self.buf[self.used..self.used + bytes.len()].copy_from_slice(bytes);
            self.used += bytes.len();
            Ok(())
        }
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if self.used > 0 {
            self.sink.write_all(&self.buf[..self.used])?;
            self.used = 0;
        }
        Ok(())
    }

    /// Flushes and hands the sink back.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush_buf()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for OutputBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::{OutputBuffer, OUT_BUF_SIZE};
    use std::io::Write;

    #[test]
    fn small_appends_accumulate() {
        let mut ob = OutputBuffer::new(Vec::new());
        ob.append(&[1, 2, 3]).unwrap();
        ob.append(&[4]).unwrap();
        // Nothing reaches the sink until a flush.
        assert!(ob.sink.is_empty());
        ob.flush().unwrap();
        assert_eq!(ob.sink, vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_flushes_first() {
        let mut ob = OutputBuffer::new(Vec::new());
        ob.append(&[0xaa; 100]).unwrap();
        ob.append(&vec![0xbb; OUT_BUF_SIZE - 50]).unwrap();
        // The first append was pushed out to make room; the second is still
        // buffered.
        assert_eq!(ob.sink.len(), 100);
        ob.flush().unwrap();
        assert_eq!(ob.sink.len(), 100 + OUT_BUF_SIZE - 50);
    }

    #[test]
    fn oversize_append_writes_through() {
        let mut ob = OutputBuffer::new(Vec::new());
        ob.append(&[1]).unwrap();
        let big = vec![0xcc; OUT_BUF_SIZE + 17];
        ob.append(&big).unwrap();
        assert_eq!(ob.sink.len(), 1 + big.len());
        assert_eq!(ob.sink[0], 1);
    }

    #[test]
    fn into_inner_flushes() {
        let mut ob = OutputBuffer::new(Vec::new());
        ob.append(b"tail").unwrap();
        assert_eq!(ob.into_inner().unwrap(), b"tail");
    }
}
