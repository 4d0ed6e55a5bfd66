//! The in-memory form of a loaded trace.
//!
//! Definitions, contexts and runs are dense vectors keyed by the order the
//! records arrived in, which is exactly the index space the wire format
//! references them by. Every link between them is an integer index, never a
//! pointer, so the tables can grow independently. Per-access data is not
//! stored at all: an access is materialised on demand from its run and its
//! position within the run.

use crate::pool::Pool;
use dgwire::{AccessDir, BbDef, HWord};
use index_vec::IndexVec;
use std::ptr::NonNull;

index_vec::define_index_type! {
    pub struct BbDefIdx = u32;
}

index_vec::define_index_type! {
    pub struct CtxIdx = u32;
}

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

/// Sentinel in a run's block vector: this access hit no live heap block.
pub(crate) const NO_BLOCK: u32 = u32::MAX;

/// A loaded `(definition, call stack)` pair.
pub struct Ctx {
    pub bbdef: BbDefIdx,
    pub stack: Vec<HWord>,
}

/// A heap block's metadata.
///
/// Blocks are kept here even after they are freed: runs recorded while a
/// block was live keep referring to it by index.
#[derive(Debug)]
pub struct MemBlock {
    pub addr: HWord,
    pub size: HWord,
    pub stack: Vec<HWord>,
}

/// One loaded run. `addrs`/`blocks` point into the owning
/// [AccessIndex]'s pools; `addrs[j] == 0` marks an access filtered out at
/// load time.
pub(crate) struct RunRec {
    pub ctx: CtxIdx,
    pub iseq_start: u64,
    pub dseq_start: u64,
    pub n_instrs: u8,
    pub n_addrs: u32,
    pub addrs: NonNull<HWord>,
    pub blocks: NonNull<u32>,
}

/// One reconstructed access.
#[derive(Debug)]
pub struct Access<'a> {
    pub addr: HWord,
    pub dir: AccessDir,
    pub size: u8,
    /// Address of the instruction that issued the access.
    pub iaddr: HWord,
    /// Trace-global instruction sequence number.
    pub iseq: u64,
    /// Trace-global data access sequence number.
    pub dseq: u64,
    /// The heap block the access landed in, if it was live at the time.
    pub block: Option<&'a MemBlock>,
    /// Call stack at the access: the issuing instruction, then the caller
    /// return sites of the surrounding context.
    pub stack: Vec<HWord>,
}

/// Everything reconstructable from a trace: the definition, context and
/// run tables plus the pools the runs' vectors live in.
pub struct AccessIndex {
    pub(crate) bbdefs: IndexVec<BbDefIdx, BbDef>,
    pub(crate) contexts: IndexVec<CtxIdx, Ctx>,
    pub(crate) runs: Vec<RunRec>,
    pub(crate) addr_pool: Pool<HWord>,
    pub(crate) block_pool: Pool<u32>,
    pub(crate) block_storage: IndexVec<BlockIdx, MemBlock>,
    pub(crate) kept: u64,
}

impl AccessIndex {
    pub(crate) fn new() -> Self {
        Self {
            bbdefs: IndexVec::new(),
            contexts: IndexVec::new(),
            runs: Vec::new(),
            addr_pool: Pool::new(),
            block_pool: Pool::new(),
            block_storage: IndexVec::new(),
            kept: 0,
        }
    }

    /// Number of accesses that survived filtering.
    pub fn n_kept(&self) -> u64 {
        self.kept
    }

    pub fn is_empty(&self) -> bool {
        self.kept == 0
    }

    pub fn n_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn n_bbdefs(&self) -> usize {
        self.bbdefs.len()
    }

    pub fn n_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn n_blocks(&self) -> usize {
        self.block_storage.len()
    }

    pub(crate) fn run_addrs(&self, run: &RunRec) -> &[HWord] {
        // SAFETY: `run.addrs` points at `run.n_addrs` elements interned in
        // `self.addr_pool`, whose chunks are neither freed nor moved while
        // `self` is alive.
        unsafe { std::slice::from_raw_parts(run.addrs.as_ptr(), run.n_addrs as usize) }
    }

    pub(crate) fn run_blocks(&self, run: &RunRec) -> &[u32] {
        // SAFETY: as for `run_addrs`, with `self.block_pool`.
        unsafe { std::slice::from_raw_parts(run.blocks.as_ptr(), run.n_addrs as usize) }
    }

    /// Materialises access `j` of run `run_idx`, or `None` if that slot
    /// was filtered out at load time.
    pub fn access(&self, run_idx: usize, j: usize) -> Option<Access<'_>> {
        let run = &self.runs[run_idx];
        let addr = self.run_addrs(run)[j];
        if addr == 0 {
            return None;
        }
        let ctx = &self.contexts[run.ctx];
        let bbd = &self.bbdefs[ctx.bbdef];
        let bbda = bbd.accesses[j];
        let iaddr = bbd.instrs[usize::from(bbda.iseq)].addr;
        let block = match self.run_blocks(run)[j] {
            NO_BLOCK => None,
            b => Some(&self.block_storage[BlockIdx::from_raw(b)]),
        };
        let mut stack = ctx.stack.clone();
        stack[0] = iaddr;
        Some(Access {
            addr,
            dir: bbda.dir,
            size: bbda.size,
            iaddr,
            iseq: run.iseq_start + u64::from(bbda.iseq),
            dseq: run.dseq_start + j as u64,
            block,
            stack,
        })
    }

    /// All kept accesses, in trace order.
    pub fn accesses(&self) -> impl Iterator<Item = Access<'_>> + '_ {
        self.runs.iter().enumerate().flat_map(move |(i, run)| {
            (0..run.n_addrs as usize).filter_map(move |j| self.access(i, j))
        })
    }
}
