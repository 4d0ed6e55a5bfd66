//! dgwire -- serialiser and deserialiser for the datagrind trace format.
//!
//! A trace is a flat stream of framed records:
//!
//!  -----------
//!  header             -- magic, version, endianness, word size.
//!  record_0:          \
//!  ...                 - Records.
//!  record_n           /
//!  -----------
//!
//! Each frame is a one-byte tag, a length prefix (one byte for lengths below
//! 255, otherwise the escape byte 0xFF followed by a native-endian `u64`) and
//! a `length`-byte body. Words in record bodies are native-endian and sized
//! to the recording process's pointer width; the header carries that width so
//! that a reader on a mismatched platform can fail early. The stream is
//! strictly append-only and is read front to back until EOF.
//!
//! The encoder and decoder API is structured so that each record can be
//! streamed to/from the serialised format one item at a time. The header is
//! written and checked automatically by the [Encoder] and [Decoder]
//! respectively.

mod body;
mod decode;
mod encode;
mod errors;

pub use body::RecordBody;
pub use decode::Decoder;
pub use encode::Encoder;
pub use errors::{ContentError, WireError};

use std::fmt;
use strum::{EnumCount, FromRepr};

/// An unsigned integer wide enough to hold a guest pointer.
///
/// Cross-word-size decoding is unsupported, so the guest width is always the
/// host width.
pub type HWord = usize;

/// The size in bytes of an [HWord], both in memory and on disk.
pub const WORD_SIZE: usize = std::mem::size_of::<HWord>();

/// The signature every trace begins with (including the trailing NUL).
pub const MAGIC: [u8; 11] = *b"DATAGRIND1\0";

/// The version of the trace format.
pub const FORMAT_VERSION: u8 = 1;

/// Range types, range labels and event labels are truncated to this many
/// bytes when emitted.
pub const LABEL_MAX: usize = 64;

/// Object filenames in `TEXT_AVMA` records are truncated to this many bytes
/// when emitted.
pub const FILENAME_MAX: usize = 128;

/// A basic block definition holds at most this many instructions; longer
/// superblocks are split.
pub const MAX_BB_INSTRS: usize = 255;

/// The one-byte record tags.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumCount, FromRepr)]
pub enum RecordKind {
    Header = 0,
    Read = 1,
    Write = 2,
    TrackRange = 3,
    UntrackRange = 4,
    StartEvent = 5,
    EndEvent = 6,
    Instr = 7,
    TextAvma = 8,
    BbDef = 9,
    Context = 10,
    BbRun = 11,
    MallocBlock = 12,
    FreeBlock = 13,
}

/// The direction of a memory access.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumCount, FromRepr)]
pub enum AccessDir {
    Read = 0,
    Write = 1,
    /// An instruction fetch.
    Exec = 2,
}

impl fmt::Display for AccessDir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exec => "instr",
        };
        write!(f, "{s}")
    }
}

/// The decoded trace header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: u8,
    pub big_endian: bool,
    pub wordsize: u8,
}

impl Header {
    /// A header describing the running process.
    pub fn for_host() -> Self {
        Self {
            version: FORMAT_VERSION,
            big_endian: cfg!(target_endian = "big"),
            wordsize: WORD_SIZE as u8,
        }
    }
}

/// One instruction of a basic block definition: its program counter and its
/// length in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BbDefInstr {
    pub addr: HWord,
    pub size: u8,
}

/// One memory access of a basic block definition. `iseq` indexes the
/// instruction (within the same definition) that issues the access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BbDefAccess {
    pub dir: AccessDir,
    pub size: u8,
    pub iseq: u8,
}

/// A basic block definition: the static instruction and access layout of one
/// instrumented block. Written once, then referenced by many [Record::BbRun]s
/// via its position in the stream of definitions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BbDef {
    pub instrs: Vec<BbDefInstr>,
    pub accesses: Vec<BbDefAccess>,
}

/// A deduplicated `(block, call stack)` pair. `stack[0]` is the address of
/// the block's first instruction; the remaining entries are caller return
/// sites, outermost last.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Context {
    pub bbdef_index: HWord,
    pub stack: Vec<HWord>,
}

/// One dynamic execution of a basic block definition. `n_instrs` may be
/// smaller than the definition's instruction count if the block was exited
/// through a mid-block branch, and `addrs` holds the effective address of
/// each access that actually executed, in definition order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BbRun {
    pub context_index: HWord,
    pub n_instrs: u8,
    pub addrs: Vec<HWord>,
}

/// A decoded trace record.
///
/// The header is not represented here: the [Encoder] writes it implicitly
/// and the [Decoder] consumes it before yielding the first record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    /// A legacy uncompressed access record (tags 1, 2 and 7). Current
    /// recorders emit accesses via [Record::BbDef] / [Record::BbRun]
    /// instead.
    Access {
        dir: AccessDir,
        size: u8,
        addr: HWord,
    },
    TrackRange {
        addr: HWord,
        size: HWord,
        /// The DWARF type name of the object occupying the range.
        rtype: String,
        label: String,
    },
    UntrackRange {
        addr: HWord,
        size: HWord,
    },
    StartEvent {
        label: String,
    },
    EndEvent {
        label: String,
    },
    TextAvma {
        text_avma: HWord,
        filename: String,
    },
    BbDef(BbDef),
    Context(Context),
    BbRun(BbRun),
    MallocBlock {
        addr: HWord,
        size: HWord,
        ips: Vec<HWord>,
    },
    FreeBlock {
        addr: HWord,
    },
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Access {
                dir: AccessDir::Read,
                ..
            } => RecordKind::Read,
            Self::Access {
                dir: AccessDir::Write,
                ..
            } => RecordKind::Write,
            Self::Access {
                dir: AccessDir::Exec,
                ..
            } => RecordKind::Instr,
            Self::TrackRange { .. } => RecordKind::TrackRange,
            Self::UntrackRange { .. } => RecordKind::UntrackRange,
            Self::StartEvent { .. } => RecordKind::StartEvent,
            Self::EndEvent { .. } => RecordKind::EndEvent,
            Self::TextAvma { .. } => RecordKind::TextAvma,
            Self::BbDef(..) => RecordKind::BbDef,
            Self::Context(..) => RecordKind::Context,
            Self::BbRun(..) => RecordKind::BbRun,
            Self::MallocBlock { .. } => RecordKind::MallocBlock,
            Self::FreeBlock { .. } => RecordKind::FreeBlock,
        }
    }
}
