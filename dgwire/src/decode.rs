//! The record decoder.

use crate::{
    body::RecordBody,
    errors::{ContentError, WireError},
    AccessDir, BbDef, BbDefAccess, BbDefInstr, BbRun, Context, Header, Record, RecordKind,
    FILENAME_MAX, FORMAT_VERSION, LABEL_MAX, MAGIC, WORD_SIZE,
};
use byteorder::{NativeEndian, ReadBytesExt};
use fallible_iterator::FallibleIterator;
use log::warn;
use std::io::{self, Read};

/// A streaming pull-decoder for trace records.
///
/// [Decoder::new] consumes and validates the header record. Thereafter the
/// decoder is a [FallibleIterator]: `Ok(Some(_))` is the next record,
/// `Ok(None)` the end of the trace. An `Err` whose
/// [is_content](WireError::is_content) is true reports a record that was
/// discarded whole; the iterator remains aligned on the following record and
/// may keep being pulled. Any other `Err` is fatal.
#[derive(Debug)]
pub struct Decoder<R: Read> {
    inner: R,
    header: Header,
    // Scratch buffer holding the current frame's body.
    body: Vec<u8>,
}

impl<R: Read> Decoder<R> {
    pub fn new(inner: R) -> Result<Self, WireError> {
        let mut dec = Self {
            inner,
            header: Header {
                version: 0,
                big_endian: false,
                wordsize: 0,
            },
            body: Vec::new(),
        };
        match dec.read_frame()? {
            Some(tag) if tag == RecordKind::Header as u8 => (),
            _ => return Err(WireError::MissingHeader),
        }
        dec.header = parse_header(&dec.body)?;
        Ok(dec)
    }

    /// The trace's header, as recorded.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Reads one frame into the scratch buffer, returning its tag, or
    /// `None` at a clean end of stream.
    fn read_frame(&mut self) -> Result<Option<u8>, WireError> {
        let mut tag = [0u8; 1];
        match self.inner.read_exact(&mut tag) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        // From here on EOF is mid-frame and therefore fatal.
        let small = self.inner.read_u8().map_err(eof_is_fatal)?;
        let len = if small < 0xff {
            u64::from(small)
        } else {
            self.inner
                .read_u64::<NativeEndian>()
                .map_err(eof_is_fatal)?
        };

        self.body.clear();
        let got = (&mut self.inner)
            .take(len)
            .read_to_end(&mut self.body)
            .map_err(WireError::Io)?;
        if (got as u64) < len {
            return Err(WireError::UnexpectedEof);
        }
        Ok(Some(tag[0]))
    }
}

impl<R: Read> FallibleIterator for Decoder<R> {
    type Item = Record;
    type Error = WireError;

    fn next(&mut self) -> Result<Option<Record>, WireError> {
        let Some(tag) = self.read_frame()? else {
            return Ok(None);
        };
        let kind = RecordKind::from_repr(tag).ok_or(ContentError::UnknownKind(tag))?;
        if kind == RecordKind::Header {
            return Err(ContentError::StrayHeader.into());
        }
        Ok(Some(decode_record(kind, &self.body)?))
    }
}

fn eof_is_fatal(e: io::Error) -> WireError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WireError::UnexpectedEof
    } else {
        WireError::Io(e)
    }
}

fn parse_header(body: &[u8]) -> Result<Header, WireError> {
    if body.len() < MAGIC.len() + 3 || body[..MAGIC.len()] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = body[MAGIC.len()];
    let endian = body[MAGIC.len() + 1];
    let wordsize = body[MAGIC.len() + 2];
    if usize::from(wordsize) != WORD_SIZE {
        return Err(WireError::WordSize {
            expected: WORD_SIZE as u8,
            got: wordsize,
        });
    }
    if version != FORMAT_VERSION {
        warn!("version mismatch (expected {FORMAT_VERSION}, got {version})");
    }
    if endian != cfg!(target_endian = "big") as u8 {
        warn!("endianness mismatch; words are not byte-swapped");
    }
    Ok(Header {
        version,
        big_endian: endian != 0,
        wordsize,
    })
}

// Strings longer than their emit-side cap decode fine but are worth flagging:
// no conforming recorder produces them.
fn capped_string(rb: &mut RecordBody, cap: usize) -> Result<String, ContentError> {
    let s = rb.string()?;
    if s.len() > cap {
        warn!("string of {} bytes exceeds the {cap}-byte cap", s.len());
    }
    Ok(s)
}

fn decode_record(kind: RecordKind, body: &[u8]) -> Result<Record, ContentError> {
    let mut rb = RecordBody::new(body);
    let rec = match kind {
        // The caller rejects stray headers before dispatching here.
        RecordKind::Header => unreachable!(),

        RecordKind::Read | RecordKind::Write | RecordKind::Instr => {
            let size = rb.byte()?;
            let addr = rb.word()?;
            let dir = match kind {
                RecordKind::Read => AccessDir::Read,
                RecordKind::Write => AccessDir::Write,
                _ => AccessDir::Exec,
            };
            Record::Access { dir, size, addr }
        }
        RecordKind::TrackRange => {
            let addr = rb.word()?;
            let size = rb.word()?;
            let rtype = capped_string(&mut rb, LABEL_MAX)?;
            let label = capped_string(&mut rb, LABEL_MAX)?;
            Record::TrackRange {
                addr,
                size,
                rtype,
                label,
            }
        }
        RecordKind::UntrackRange => {
            let addr = rb.word()?;
            let size = rb.word()?;
            Record::UntrackRange { addr, size }
        }
        RecordKind::StartEvent => Record::StartEvent {
            label: capped_string(&mut rb, LABEL_MAX)?,
        },
        RecordKind::EndEvent => Record::EndEvent {
            label: capped_string(&mut rb, LABEL_MAX)?,
        },
        RecordKind::TextAvma => {
            let text_avma = rb.word()?;
            let filename = capped_string(&mut rb, FILENAME_MAX)?;
            Record::TextAvma {
                text_avma,
                filename,
            }
        }
        RecordKind::BbDef => {
            let n_instrs = rb.byte()?;
            if n_instrs == 0 {
                return Err(ContentError::EmptyBlock);
            }
            let n_accesses = rb.word()?;
            let mut instrs = Vec::with_capacity(usize::from(n_instrs));
            for _ in 0..n_instrs {
                let addr = rb.word()?;
                let size = rb.byte()?;
                instrs.push(BbDefInstr { addr, size });
            }
            // Don't trust n_accesses for the allocation; a corrupt count
            // fails on the first short read instead.
            let mut accesses = Vec::with_capacity(n_accesses.min(rb.remain() / 3));
            for _ in 0..n_accesses {
                let raw_dir = rb.byte()?;
                let dir = AccessDir::from_repr(raw_dir).ok_or(ContentError::BadDir(raw_dir))?;
                let size = rb.byte()?;
                let iseq = rb.byte()?;
                if iseq >= n_instrs {
                    return Err(ContentError::AccessOutOfBlock { iseq, n_instrs });
                }
                accesses.push(BbDefAccess { dir, size, iseq });
            }
            Record::BbDef(BbDef { instrs, accesses })
        }
        RecordKind::Context => {
            let bbdef_index = rb.word()?;
            let n_stack = rb.byte()?;
            if n_stack == 0 {
                return Err(ContentError::EmptyStack);
            }
            let mut stack = Vec::with_capacity(usize::from(n_stack));
            for _ in 0..n_stack {
                stack.push(rb.word()?);
            }
            Record::Context(Context { bbdef_index, stack })
        }
        RecordKind::BbRun => {
            let context_index = rb.word()?;
            let n_instrs = rb.byte()?;
            // The record carries no access count; whatever words remain are
            // the effective addresses.
            if rb.remain() % WORD_SIZE != 0 {
                return Err(ContentError::RaggedWords((rb.remain() % WORD_SIZE) as u64));
            }
            let mut addrs = Vec::with_capacity(rb.remain() / WORD_SIZE);
            while rb.remain() > 0 {
                addrs.push(rb.word()?);
            }
            Record::BbRun(BbRun {
                context_index,
                n_instrs,
                addrs,
            })
        }
        RecordKind::MallocBlock => {
            let addr = rb.word()?;
            let size = rb.word()?;
            let n_ips = rb.word()?;
            if n_ips > rb.remain() / WORD_SIZE {
                return Err(ContentError::TooShort);
            }
            let mut ips = Vec::with_capacity(n_ips);
            for _ in 0..n_ips {
                ips.push(rb.word()?);
            }
            Record::MallocBlock { addr, size, ips }
        }
        RecordKind::FreeBlock => Record::FreeBlock { addr: rb.word()? },
    };
    rb.finish()?;
    Ok(rec)
}
