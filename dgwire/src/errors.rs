use std::io;
use thiserror::Error;

/// An error raised while encoding or decoding a trace.
///
/// Only [WireError::Content] is recoverable: the decoder has already
/// consumed the offending record's frame, so the caller may log the error
/// and pull the next record. Every other variant means the stream itself is
/// broken (or was never a trace) and decoding must stop.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("error reading file: {0}")]
    Io(#[from] io::Error),
    /// EOF in the middle of a frame. EOF at a frame boundary is the normal
    /// end of the stream and is not an error.
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("did not find header")]
    MissingHeader,
    #[error("header magic does not match")]
    BadMagic,
    #[error("pointer size mismatch (expected {expected}, got {got})")]
    WordSize { expected: u8, got: u8 },
    #[error("{0}")]
    Content(#[from] ContentError),
}

impl WireError {
    /// True if the stream is still usable after this error.
    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content(_))
    }
}

/// A malformed record. The rest of the stream is unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("unknown record type {0:#x}")]
    UnknownKind(u8),
    #[error("found header after first record")]
    StrayHeader,
    #[error("record is too short")]
    TooShort,
    #[error("record is too large (expected {expected} but got {got})")]
    TooLong { expected: u64, got: u64 },
    #[error("string was not terminated")]
    UnterminatedString,
    #[error("invalid access direction {0}")]
    BadDir(u8),
    #[error("basic block has no instructions")]
    EmptyBlock,
    #[error("access belongs to instruction {iseq} but the block has {n_instrs}")]
    AccessOutOfBlock { iseq: u8, n_instrs: u8 },
    #[error("context has an empty call stack")]
    EmptyStack,
    #[error("trailing {0} bytes are not a whole number of words")]
    RaggedWords(u64),
}
