//! dgrec -- the datagrind recorder core.
//!
//! The recorder lives inside a DBI host. At instrumentation time the host
//! feeds each superblock through a [BbDefBuilder], which emits basic block
//! definitions to the trace and hands back a plan of helper calls to weave
//! into the rewritten IR. At execution time those helpers land in
//! [Recorder::enter_block], [Recorder::record_access] and
//! [Recorder::set_instr_count], which together compress the access stream
//! into context and run records. Heap traffic, client annotations and
//! debug-info mappings are reported through the remaining methods.
//!
//! There is exactly one recorder per traced process, created at tool init
//! and torn down (via [Recorder::finish]) at exit. It is deliberately not
//! thread-safe: the host serialises all helper calls, and only one run is
//! ever open at a time.

mod context;
mod debuginfo;
mod heap;
pub mod host;
mod output;
mod sblock;

pub use host::{ClientAllocator, ObjectInfo, StackUnwinder};
pub use output::OutputBuffer;
pub use sblock::{BbDefBuilder, InstrPoint, InstrumentedSblock, MemEffect};

use context::{BbDefMeta, ContextTable, OpenRun};
use debuginfo::DebugInfoTracker;
use dgwire::{BbRun, Encoder, HWord, Record};
use heap::HeapTracker;
use log::warn;
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    io::Write,
    os::unix::fs::OpenOptionsExt,
};

/// How many frames of the guest call stack are captured per context and
/// per heap allocation.
pub const STACK_DEPTH: usize = 8;

/// The default `--datagrind-out-file` template.
pub const DEFAULT_OUT_FILE: &str = "datagrind.out.%p";

/// Expands `%p` in an out-file template to the current process id.
pub fn expand_out_file(template: &str) -> String {
    template.replace("%p", &unsafe { libc::getpid() }.to_string())
}

/// Creates (or truncates) the trace file named by `template`, readable by
/// its owner only.
pub fn create_out_file(template: &str) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(expand_out_file(template))
}

/// The recorder: owns the output stream and all per-process tracking state.
pub struct Recorder<W: Write> {
    pub(crate) enc: Encoder<OutputBuffer<W>>,
    pub(crate) bbdefs: HashMap<HWord, BbDefMeta>,
    pub(crate) next_bbdef: HWord,
    contexts: ContextTable,
    heap: HeapTracker,
    debuginfo: DebugInfoTracker,
    run: Option<OpenRun>,
}

impl<W: Write> Recorder<W> {
    /// Creates a recorder writing to `sink`; the trace header goes out
    /// immediately.
    pub fn new(sink: W) -> io::Result<Self> {
        Ok(Self {
            enc: Encoder::new(OutputBuffer::new(sink))?,
            bbdefs: HashMap::new(),
            next_bbdef: 0,
            contexts: ContextTable::new(),
            heap: HeapTracker::new(),
            debuginfo: DebugInfoTracker::new(),
            run: None,
        })
    }

    /// Starts instrumenting one superblock.
    pub fn instrument_superblock(&mut self) -> BbDefBuilder<'_, W> {
        BbDefBuilder::new(self)
    }

    /// Evicts recorder-side state for definitions whose superblock the host
    /// has discarded. Their records in the trace stay valid.
    pub fn discard_bbdefs(&mut self, indices: impl IntoIterator<Item = HWord>) {
        for index in indices {
            self.bbdefs.remove(&index);
        }
    }

    /// Runtime helper: a run of definition `bbdef` is starting on thread
    /// `tid`. Flushes the previous run, interns the current call stack and
    /// opens a fresh run.
    pub fn enter_block(
        &mut self,
        unw: &dyn StackUnwinder,
        tid: u32,
        bbdef: HWord,
    ) -> io::Result<()> {
        self.flush_run()?;
        let Some(meta) = self.bbdefs.get_mut(&bbdef) else {
            warn!("run of unknown basic block definition {bbdef}");
            return Ok(());
        };

        let mut stack = unw.stack_trace(tid, STACK_DEPTH, 0);
        stack.truncate(STACK_DEPTH);
        // The leaf must be the block's own entry point, whatever PC the
        // unwinder saw.
        if stack.is_empty() {
            stack.push(meta.entry_addr);
        } else {
            stack[0] = meta.entry_addr;
        }

        let context_index = self.contexts.intern(&mut self.enc, bbdef, meta, stack)?;
        self.run = Some(OpenRun {
            context_index,
            n_instrs: meta.n_instrs,
            n_accesses: meta.n_accesses,
            addrs: Vec::new(),
        });
        Ok(())
    }

    /// Runtime helper: the open run performed an access at `addr`.
    pub fn record_access(&mut self, addr: HWord) {
        if let Some(run) = &mut self.run {
            debug_assert!(run.addrs.len() < run.n_accesses);
            run.addrs.push(addr);
        }
    }

    /// Runtime helper: the open run is leaving its block early, having
    /// executed `n_instrs` instructions.
    pub fn set_instr_count(&mut self, n_instrs: u8) {
        if let Some(run) = &mut self.run {
            run.n_instrs = n_instrs;
        }
    }

    fn flush_run(&mut self) -> io::Result<()> {
        if let Some(run) = self.run.take() {
            self.enc.serialise(&Record::BbRun(BbRun {
                context_index: run.context_index,
                n_instrs: run.n_instrs,
                addrs: run.addrs,
            }))?;
        }
        Ok(())
    }

    // Client requests.

    pub fn track_range(
        &mut self,
        addr: HWord,
        size: HWord,
        rtype: &str,
        label: &str,
    ) -> io::Result<()> {
        self.enc.serialise(&Record::TrackRange {
            addr,
            size,
            rtype: rtype.to_owned(),
            label: label.to_owned(),
        })
    }

    pub fn untrack_range(&mut self, addr: HWord, size: HWord) -> io::Result<()> {
        self.enc.serialise(&Record::UntrackRange { addr, size })
    }

    pub fn start_event(&mut self, label: &str) -> io::Result<()> {
        self.enc.serialise(&Record::StartEvent {
            label: label.to_owned(),
        })
    }

    pub fn end_event(&mut self, label: &str) -> io::Result<()> {
        self.enc.serialise(&Record::EndEvent {
            label: label.to_owned(),
        })
    }

    /// Client request: the guest manages `addr` itself but wants it treated
    /// as a heap block.
    pub fn malloclike_block(
        &mut self,
        unw: &dyn StackUnwinder,
        tid: u32,
        addr: HWord,
        size: HWord,
    ) -> io::Result<()> {
        self.heap.add_custom(&mut self.enc, unw, tid, addr, size)
    }

    pub fn freelike_block(&mut self, addr: HWord) -> io::Result<bool> {
        self.heap.remove_custom(&mut self.enc, addr)
    }

    // Malloc replacement.

    pub fn malloc(
        &mut self,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        self.heap.malloc(&mut self.enc, alloc, unw, tid, size)
    }

    pub fn calloc(
        &mut self,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        nmemb: HWord,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        self.heap.calloc(&mut self.enc, alloc, unw, tid, nmemb, size)
    }

    pub fn memalign(
        &mut self,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        align: usize,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        self.heap
            .memalign(&mut self.enc, alloc, unw, tid, align, size)
    }

    pub fn realloc(
        &mut self,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        addr: HWord,
        new_size: HWord,
    ) -> io::Result<Option<HWord>> {
        self.heap
            .realloc(&mut self.enc, alloc, unw, tid, addr, new_size)
    }

    pub fn free(&mut self, alloc: &mut dyn ClientAllocator, addr: HWord) -> io::Result<bool> {
        self.heap.free(&mut self.enc, alloc, addr)
    }

    pub fn usable_size(&self, addr: HWord) -> HWord {
        self.heap.usable_size(addr)
    }

    // Debug info.

    /// The host mapped new executable memory; the object list needs
    /// re-examining before the next superblock.
    pub fn note_exec_mapping(&mut self) {
        self.debuginfo.mark_dirty();
    }

    /// Reports any not-yet-seen object files. The host calls this with its
    /// current object list when instrumenting, cheaply: it is a no-op
    /// unless an executable mapping appeared since the last sweep.
    pub fn refresh_debuginfo(
        &mut self,
        objects: impl IntoIterator<Item = ObjectInfo>,
    ) -> io::Result<()> {
        self.debuginfo.sweep(&mut self.enc, objects)
    }

    /// Flushes the open run and all buffered output, returning the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_run()?;
        self.enc.flush()?;
        self.enc.into_inner().into_inner()
    }
}
