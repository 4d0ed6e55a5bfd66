//! Call-stack contexts and the open-run state.

use crate::output::OutputBuffer;
use dgwire::{Context, Encoder, HWord, Record};
use std::{collections::HashMap, io, io::Write};

/// Recorder-side metadata for one emitted basic block definition.
///
/// Lives until the host discards the owning superblock; the definition
/// record already written stays valid regardless.
pub(crate) struct BbDefMeta {
    pub entry_addr: HWord,
    pub n_instrs: u8,
    pub n_accesses: usize,
    /// This definition's private context table: exact captured stack to
    /// global context index.
    pub contexts: HashMap<Vec<HWord>, HWord>,
}

/// Hands out global context indices, emitting a `CONTEXT` record the first
/// time a `(definition, stack)` pair is seen.
pub(crate) struct ContextTable {
    next_index: HWord,
}

impl ContextTable {
    pub fn new() -> Self {
        Self { next_index: 0 }
    }

    pub fn intern<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        bbdef_index: HWord,
        meta: &mut BbDefMeta,
        stack: Vec<HWord>,
    ) -> io::Result<HWord> {
        if let Some(&index) = meta.contexts.get(&stack) {
            return Ok(index);
        }
        let index = self.next_index;
        self.next_index += 1;
        enc.serialise(&Record::Context(Context {
            bbdef_index,
            stack: stack.clone(),
        }))?;
        meta.contexts.insert(stack, index);
        Ok(index)
    }
}

/// The run currently accumulating effective addresses.
///
/// Exactly one run is open at a time; it is flushed on the next block entry
/// and at recorder teardown.
pub(crate) struct OpenRun {
    pub context_index: HWord,
    /// How many of the definition's instructions this run executed. Starts
    /// at the full count and is lowered by mid-block branch exits.
    pub n_instrs: u8,
    pub n_accesses: usize,
    pub addrs: Vec<HWord>,
}
