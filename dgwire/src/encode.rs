//! The record encoder.

use crate::{HWord, Record, RecordKind, FILENAME_MAX, FORMAT_VERSION, LABEL_MAX, MAGIC, WORD_SIZE};
use byteorder::{NativeEndian, WriteBytesExt};
use std::io::{self, Write};

/// Serialises records one at a time into a byte sink.
///
/// [Encoder::new] writes the header record before anything else, so a sink
/// an encoder has touched is always a well-formed (if possibly empty) trace.
/// A record is written atomically: either the whole frame reaches the sink
/// or the first failing write aborts it.
pub struct Encoder<W: Write> {
    sink: W,
    // Scratch buffer the next record's body is assembled in; the frame's
    // length prefix requires the body size before any body byte is written.
    body: Vec<u8>,
}

impl<W: Write> Encoder<W> {
    /// Creates an encoder and writes the header record describing the
    /// running process.
    pub fn new(sink: W) -> io::Result<Self> {
        let mut enc = Self::resume(sink);
        enc.body.extend_from_slice(&MAGIC);
        enc.body.push(FORMAT_VERSION);
        enc.body.push(cfg!(target_endian = "big") as u8);
        enc.body.push(WORD_SIZE as u8);
        enc.write_frame(RecordKind::Header as u8)?;
        Ok(enc)
    }

    /// Creates an encoder that continues a stream whose header was already
    /// written.
    pub fn resume(sink: W) -> Self {
        Self {
            sink,
            body: Vec::new(),
        }
    }

    /// Serialises one record.
    pub fn serialise(&mut self, rec: &Record) -> io::Result<()> {
        self.body.clear();
        match rec {
            Record::Access { size, addr, .. } => {
                self.body.push(*size);
                self.put_word(*addr);
            }
            Record::TrackRange {
                addr,
                size,
                rtype,
                label,
            } => {
                self.put_word(*addr);
                self.put_word(*size);
                self.put_str(rtype, LABEL_MAX);
                self.put_str(label, LABEL_MAX);
            }
            Record::UntrackRange { addr, size } => {
                self.put_word(*addr);
                self.put_word(*size);
            }
            Record::StartEvent { label } | Record::EndEvent { label } => {
                self.put_str(label, LABEL_MAX);
            }
            Record::TextAvma {
                text_avma,
                filename,
            } => {
                self.put_word(*text_avma);
                self.put_str(filename, FILENAME_MAX);
            }
            Record::BbDef(bbd) => {
                debug_assert!(!bbd.instrs.is_empty() && bbd.instrs.len() <= 255);
                self.body.push(bbd.instrs.len() as u8);
                self.put_word(bbd.accesses.len());
                for instr in &bbd.instrs {
                    self.put_word(instr.addr);
                    self.body.push(instr.size);
                }
                for acc in &bbd.accesses {
                    debug_assert!(usize::from(acc.iseq) < bbd.instrs.len());
                    self.body.push(acc.dir as u8);
                    self.body.push(acc.size);
                    self.body.push(acc.iseq);
                }
            }
            Record::Context(ctx) => {
                debug_assert!(!ctx.stack.is_empty() && ctx.stack.len() <= 255);
                self.put_word(ctx.bbdef_index);
                self.body.push(ctx.stack.len() as u8);
                for ip in &ctx.stack {
                    self.put_word(*ip);
                }
            }
            Record::BbRun(run) => {
                self.put_word(run.context_index);
                self.body.push(run.n_instrs);
                for addr in &run.addrs {
                    self.put_word(*addr);
                }
            }
            Record::MallocBlock { addr, size, ips } => {
                self.put_word(*addr);
                self.put_word(*size);
                self.put_word(ips.len());
                for ip in ips {
                    self.put_word(*ip);
                }
            }
            Record::FreeBlock { addr } => {
                self.put_word(*addr);
            }
        }
        self.write_frame(rec.kind() as u8)
    }

    /// Flushes the underlying sink.
    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    fn write_frame(&mut self, tag: u8) -> io::Result<()> {
        self.sink.write_u8(tag)?;
        if self.body.len() < 255 {
            self.sink.write_u8(self.body.len() as u8)?;
        } else {
            self.sink.write_u8(0xff)?;
            self.sink.write_u64::<NativeEndian>(self.body.len() as u64)?;
        }
        self.sink.write_all(&self.body)
    }

    fn put_word(&mut self, word: HWord) {
        self.body.extend_from_slice(&word.to_ne_bytes());
    }

    // Strings use C semantics on the wire: cut at the first NUL, truncated
    // to `cap` bytes, NUL terminated.
    fn put_str(&mut self, s: &str, cap: usize) {
        let bytes = s.as_bytes();
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len())
            .min(cap);
        self.body.extend_from_slice(&bytes[..end]);
        self.body.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::Encoder;
    use crate::{Record, RecordKind, LABEL_MAX, MAGIC, WORD_SIZE};

    #[test]
    fn header_layout() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).unwrap();
        assert_eq!(buf[0], RecordKind::Header as u8);
        assert_eq!(buf[1], 14); // 11 magic + version + endian + wordsize.
        assert_eq!(&buf[2..13], &MAGIC);
        assert_eq!(buf[13], 1);
        assert_eq!(buf[15], WORD_SIZE as u8);
    }

    // Tag byte, one-byte length, then the 14-byte header body.
    const HEADER_FRAME: usize = 16;

    #[test]
    fn labels_truncated() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf).unwrap();
        enc.serialise(&Record::StartEvent {
            label: "x".repeat(200),
        })
        .unwrap();
        // Tag, length, 64 label bytes, NUL.
        assert_eq!(buf.len() - HEADER_FRAME, 2 + LABEL_MAX + 1);
    }

    #[test]
    fn interior_nul_cut() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf).unwrap();
        enc.serialise(&Record::StartEvent {
            label: "ab\0cd".into(),
        })
        .unwrap();
        assert_eq!(
            &buf[HEADER_FRAME..],
            &[RecordKind::StartEvent as u8, 3, b'a', b'b', 0]
        );
    }
}
