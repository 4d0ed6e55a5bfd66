//! dgview -- the datagrind trace analyzer.
//!
//! Loading a trace is one forward pass: records stream out of the
//! [dgwire::Decoder], heap and annotation records update the load-time
//! shadow state (live heap blocks, active ranges, open events), and run
//! records are filtered against that state and packed into the
//! [AccessIndex]. Afterwards the touched pages are remapped onto dense
//! display coordinates and the index answers reconstruction and
//! nearest-access queries for the viewer.
//!
//! A malformed record is reported, discarded whole and skipped; only I/O
//! failures and a broken header abort a load.

#![allow(clippy::new_without_default)]

mod index;
mod nearest;
mod pool;
mod range;
mod remap;
mod symbolize;

pub use index::{Access, AccessIndex, BbDefIdx, BlockIdx, Ctx, CtxIdx, MemBlock};
pub use pool::Pool;
pub use range::{RangeError, RangeMap};
pub use remap::{page_round_down, PageRemap, PAGE_SIZE};
pub use symbolize::SymbolTable;

use fallible_iterator::FallibleIterator;
use index::{RunRec, NO_BLOCK};
use log::error;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::File,
    io,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;

use dgwire::{Decoder, HWord, Record, WireError};

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("could not open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What the user asked to keep, from the command line.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Keep only accesses intersecting a currently tracked range with one
    /// of these labels. Empty means no range filtering.
    pub ranges: HashSet<String>,
    /// Keep only accesses made while one of these events is open. Empty
    /// means no event filtering.
    pub events: HashSet<String>,
    /// Keep only accesses inside a live heap block.
    pub malloc_only: bool,
}

/// Load-time shadow state, discarded once the trace is read.
struct LoadState {
    /// Open chosen events: label to unmatched START_EVENT count.
    active_events: HashMap<String, usize>,
    /// Tracked chosen ranges: `(addr, size)` to occurrence count.
    active_ranges: BTreeMap<(HWord, HWord), usize>,
    /// Heap blocks currently live, mapping to `block_storage` indices.
    live: RangeMap<HWord, u32>,
    iseq: u64,
    dseq: u64,
    block_scratch: Vec<u32>,
    warned_legacy: bool,
}

impl LoadState {
    fn new() -> Self {
        Self {
            active_events: HashMap::new(),
            active_ranges: BTreeMap::new(),
            live: RangeMap::new(),
            iseq: 0,
            dseq: 0,
            block_scratch: Vec::new(),
            warned_legacy: false,
        }
    }
}

/// One loaded trace, ready for querying.
pub struct Analyzer {
    pub index: AccessIndex,
    pub remap: PageRemap,
    pub symbols: SymbolTable,
    /// Malformed records skipped during the load.
    pub content_errors: u64,
    /// Legacy uncompressed access records skipped during the load.
    pub legacy_skipped: u64,
}

impl Analyzer {
    pub fn load_path(path: &Path, filter: &Filter) -> Result<Self, ViewError> {
        let file = File::open(path).map_err(|source| ViewError::Open {
            path: path.to_owned(),
            source,
        })?;
        Self::load(BufReader::new(file), filter)
    }

    /// Reads a whole trace front to back.
    pub fn load(reader: impl Read, filter: &Filter) -> Result<Self, ViewError> {
        let mut dec = Decoder::new(reader)?;
        let mut analyzer = Self {
            index: AccessIndex::new(),
            remap: PageRemap::new(),
            symbols: SymbolTable::new(),
            content_errors: 0,
            legacy_skipped: 0,
        };
        let mut st = LoadState::new();
        loop {
            match dec.next() {
                Ok(Some(rec)) => analyzer.ingest(rec, filter, &mut st),
                Ok(None) => break,
                Err(e) if e.is_content() => {
                    error!("{e}");
                    analyzer.content_errors += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        analyzer.index.runs.shrink_to_fit();
        analyzer.remap.finalise();
        Ok(analyzer)
    }

    fn ingest(&mut self, rec: Record, filter: &Filter, st: &mut LoadState) {
        match rec {
            Record::BbDef(bbd) => {
                self.index.bbdefs.push(bbd);
            }
            Record::Context(ctx) => {
                if ctx.bbdef_index >= self.index.bbdefs.len() {
                    error!(
                        "context names basic block definition {} of {}",
                        ctx.bbdef_index,
                        self.index.bbdefs.len()
                    );
                    self.content_errors += 1;
                    return;
                }
                self.index.contexts.push(Ctx {
                    bbdef: BbDefIdx::from_usize(ctx.bbdef_index),
                    stack: ctx.stack,
                });
            }
            Record::BbRun(run) => self.ingest_run(run, filter, st),
            Record::Access { .. } => {
                if !st.warned_legacy {
                    log::warn!(
                        "trace contains legacy uncompressed access records; they are not indexed"
                    );
                    st.warned_legacy = true;
                }
                self.legacy_skipped += 1;
            }
            Record::TrackRange {
                addr, size, label, ..
            } => {
                if filter.ranges.contains(&label) {
                    *st.active_ranges.entry((addr, size)).or_insert(0) += 1;
                }
            }
            Record::UntrackRange { addr, size } => {
                if let Some(n) = st.active_ranges.get_mut(&(addr, size)) {
                    *n -= 1;
                    if *n == 0 {
                        st.active_ranges.remove(&(addr, size));
                    }
                }
            }
            Record::StartEvent { label } => {
                if filter.events.contains(&label) {
                    *st.active_events.entry(label).or_insert(0) += 1;
                }
            }
            Record::EndEvent { label } => {
                // A stray end with no matching start is ignored.
                if let Some(n) = st.active_events.get_mut(&label) {
                    *n -= 1;
                    if *n == 0 {
                        st.active_events.remove(&label);
                    }
                }
            }
            Record::MallocBlock { addr, size, ips } => {
                let Some(end) = addr.checked_add(size) else {
                    error!("heap block {addr:#x} wraps the address space");
                    self.content_errors += 1;
                    return;
                };
                let idx = self.index.block_storage.len() as u32;
                match st.live.insert(addr, end, idx) {
                    Ok(()) => {
                        self.index.block_storage.push(MemBlock {
                            addr,
                            size,
                            stack: ips,
                        });
                    }
                    Err(e) => {
                        error!("heap block {addr:#x}: {e}");
                        self.content_errors += 1;
                    }
                }
            }
            Record::FreeBlock { addr } => {
                // The block itself stays in storage: runs recorded while it
                // was live keep referring to it.
                st.live.erase(addr);
            }
            Record::TextAvma {
                text_avma,
                filename,
            } => {
                self.symbols.register(&filename, text_avma);
            }
        }
    }

    fn ingest_run(&mut self, run: dgwire::BbRun, filter: &Filter, st: &mut LoadState) {
        if run.context_index >= self.index.contexts.len() {
            error!(
                "run names context {} of {}",
                run.context_index,
                self.index.contexts.len()
            );
            self.content_errors += 1;
            return;
        }
        let ctx_idx = CtxIdx::from_usize(run.context_index);
        let bbd = &self.index.bbdefs[self.index.contexts[ctx_idx].bbdef];
        if usize::from(run.n_instrs) > bbd.instrs.len() {
            error!(
                "run executed {} instructions of a {}-instruction block",
                run.n_instrs,
                bbd.instrs.len()
            );
            self.content_errors += 1;
            return;
        }
        if run.addrs.len() > bbd.accesses.len() {
            error!(
                "run carries {} addresses for {} accesses",
                run.addrs.len(),
                bbd.accesses.len()
            );
            self.content_errors += 1;
            return;
        }

        let iseq_start = st.iseq;
        let dseq_start = st.dseq;
        // Sequence numbers come from execution order alone; they advance
        // whether or not the run survives filtering.
        st.iseq += u64::from(run.n_instrs);
        st.dseq += run.addrs.len() as u64;

        let mut addrs = run.addrs;
        st.block_scratch.clear();
        let mut kept_here = 0u64;
        for (j, slot) in addrs.iter_mut().enumerate() {
            let addr = *slot;
            let size = HWord::from(bbd.accesses[j].size);
            let keep = if !filter.events.is_empty() && st.active_events.is_empty() {
                false
            } else if !filter.ranges.is_empty() {
                st.active_ranges
                    .keys()
                    .any(|&(a, s)| addr.wrapping_add(size) > a && addr < a.wrapping_add(s))
            } else if filter.malloc_only {
                st.live.find(addr).is_some()
            } else {
                true
            };

            if keep {
                kept_here += 1;
                st.block_scratch
                    .push(st.live.find(addr).map_or(NO_BLOCK, |(_, _, &b)| b));
                self.remap.touch(addr);
            } else {
                // 0 is the filtered-out sentinel.
                *slot = 0;
                st.block_scratch.push(NO_BLOCK);
            }
        }

        if kept_here == 0 {
            return;
        }
        let n_addrs = addrs.len() as u32;
        let addrs = self.index.addr_pool.intern(&addrs);
        let blocks = self.index.block_pool.intern(&st.block_scratch);
        self.index.runs.push(RunRec {
            ctx: ctx_idx,
            iseq_start,
            dseq_start,
            n_instrs: run.n_instrs,
            n_addrs,
            addrs,
            blocks,
        });
        self.index.kept += kept_here;
    }
}
