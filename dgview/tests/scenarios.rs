//! End-to-end scenarios: a recorder writes a trace file, the analyzer
//! loads it back.

use dgrec::{host::StackUnwinder, InstrPoint, Recorder};
use dgview::{Analyzer, Filter};
use dgwire::{AccessDir, HWord};
use std::io::Write;
use tempfile::NamedTempFile;

struct FixedStack(Vec<HWord>);

impl StackUnwinder for FixedStack {
    fn stack_trace(&self, _tid: u32, max_frames: usize, _ip_delta: isize) -> Vec<HWord> {
        self.0.iter().copied().take(max_frames).collect()
    }
}

/// Runs `build` against a fresh recorder, writes the trace to disk and
/// loads it back through `filter`.
fn record_and_load(
    filter: &Filter,
    build: impl FnOnce(&mut Recorder<Vec<u8>>),
) -> Analyzer {
    let mut rec = Recorder::new(Vec::new()).unwrap();
    build(&mut rec);
    let bytes = rec.finish().unwrap();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    Analyzer::load_path(file.path(), filter).unwrap()
}

// A header-only trace is a valid, empty trace.
#[test]
fn empty_trace() {
    let a = record_and_load(&Filter::default(), |_| {});
    assert!(a.index.is_empty());
    assert_eq!(a.remap.n_pages(), 0);
}

#[test]
fn single_load() {
    let a = record_and_load(&Filter::default(), |rec| {
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.load(4);
        b.finish().unwrap();

        rec.enter_block(&FixedStack(vec![0x1000]), 1, 0).unwrap();
        rec.record_access(0x2000);
    });

    assert_eq!(a.index.n_kept(), 1);
    let acc = a.index.access(0, 0).unwrap();
    assert_eq!(acc.addr, 0x2000);
    assert_eq!(acc.dir, AccessDir::Read);
    assert_eq!(acc.size, 4);
    assert_eq!(acc.iaddr, 0x1000);
    assert_eq!(acc.iseq, 0);

    let near = a.index.nearest(0x2000, 0, 1.0).unwrap();
    assert_eq!((near.addr, near.iseq), (0x2000, 0));
}

// Choosing a range label nothing was tracked under leaves no accesses.
#[test]
fn filtered_out_access() {
    let filter = Filter {
        ranges: ["foo".to_owned()].into(),
        ..Filter::default()
    };
    let a = record_and_load(&filter, |rec| {
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.load(4);
        b.finish().unwrap();

        rec.enter_block(&FixedStack(vec![0x1000]), 1, 0).unwrap();
        rec.record_access(0x2000);
    });
    assert!(a.index.is_empty());
}

#[test]
fn heap_block_resolution() {
    let a = record_and_load(&Filter::default(), |rec| {
        rec.malloclike_block(&FixedStack(vec![0xa, 0xb]), 1, 0x5000, 64)
            .unwrap();

        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.load(4);
        b.finish().unwrap();

        rec.enter_block(&FixedStack(vec![0x1000]), 1, 0).unwrap();
        rec.record_access(0x5010);

        // The code performing the free runs in its own block, whose entry
        // flushes the run above before the FREE_BLOCK record goes out.
        rec.enter_block(&FixedStack(vec![0x1000]), 1, 0).unwrap();
        rec.freelike_block(0x5000).unwrap();
    });

    let acc = a.index.access(0, 0).unwrap();
    let block = acc.block.unwrap();
    assert_eq!(block.addr, 0x5000);
    assert_eq!(block.size, 64);
    assert_eq!(block.stack, vec![0xa, 0xb]);
    // Freed by the end of the trace, yet still materialised.
    assert_eq!(a.index.n_blocks(), 1);
}

// 300 instructions split into definitions of 255 and 45, and a full
// execution of both reconstructs with continuous sequence numbers.
#[test]
fn split_superblock_roundtrip() {
    let a = record_and_load(&Filter::default(), |rec| {
        let mut b = rec.instrument_superblock();
        for i in 0..300usize {
            b.instr(0x1000 + i * 4, 4).unwrap();
            b.load(4);
        }
        let plan = b.finish().unwrap();
        assert_eq!(plan.bbdefs.len(), 2);

        // Execute the plan once, reading ascending addresses.
        let unw = FixedStack(vec![0]);
        let mut next_addr = 0x100000usize;
        for point in &plan.points {
            match point {
                InstrPoint::BlockEntry { bbdef } => {
                    rec.enter_block(&unw, 1, *bbdef).unwrap();
                }
                InstrPoint::Access { .. } => {
                    rec.record_access(next_addr);
                    next_addr += 4;
                }
                InstrPoint::BranchExit { .. } => unreachable!(),
            }
        }
    });

    assert_eq!(a.index.n_bbdefs(), 2);
    assert_eq!(a.index.n_runs(), 2);
    assert_eq!(a.index.n_kept(), 300);

    let all = a.index.accesses().collect::<Vec<_>>();
    // Sequence numbers run continuously across the split...
    assert_eq!(all[254].iseq, 254);
    assert_eq!(all[255].iseq, 255);
    assert_eq!(all[255].iaddr, 0x1000 + 255 * 4);
    // ...and the second definition's run starts back at its own entry.
    assert_eq!(all[255].stack[0], all[255].iaddr);
    assert_eq!(all[299].addr, 0x100000 + 299 * 4);
}

#[test]
fn nearest_tie_first_seen() {
    let a = record_and_load(&Filter::default(), |rec| {
        let mut b = rec.instrument_superblock();
        for i in 0..10usize {
            b.instr(0x1000 + i * 4, 4).unwrap();
        }
        b.finish().unwrap();
        let mut b = rec.instrument_superblock();
        b.instr(0x2000, 4).unwrap();
        b.load(4);
        b.load(4);
        b.finish().unwrap();

        let unw = FixedStack(vec![0]);
        rec.enter_block(&unw, 1, 0).unwrap(); // Advances iseq to 10.
        rec.enter_block(&unw, 1, 1).unwrap();
        rec.record_access(0x100);
        rec.record_access(0x108);
    });

    let got = a.index.nearest(0x104, 10, 1.0).unwrap();
    assert_eq!(got.addr, 0x100);
    assert_eq!(got.iseq, 10);
}

// Events chosen on the command line gate accesses recorded between the
// client's start/end annotations.
#[test]
fn event_window() {
    let filter = Filter {
        events: ["hot".to_owned()].into(),
        ..Filter::default()
    };
    let a = record_and_load(&filter, |rec| {
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.store(8);
        b.finish().unwrap();
        // The block containing the client-request code; entering it
        // flushes the preceding run before the event record goes out.
        let mut b = rec.instrument_superblock();
        b.instr(0x2000, 4).unwrap();
        b.finish().unwrap();

        let unw = FixedStack(vec![0x1000]);
        rec.enter_block(&unw, 1, 0).unwrap();
        rec.record_access(0x2000);

        rec.enter_block(&unw, 1, 1).unwrap();
        rec.start_event("hot").unwrap();
        rec.enter_block(&unw, 1, 0).unwrap();
        rec.record_access(0x3000);

        rec.enter_block(&unw, 1, 1).unwrap();
        rec.end_event("hot").unwrap();
        rec.enter_block(&unw, 1, 0).unwrap();
        rec.record_access(0x4000);
    });

    assert_eq!(
        a.index.accesses().map(|x| x.addr).collect::<Vec<_>>(),
        vec![0x3000]
    );
}

// A mid-block exit shortens the run without disturbing later sequence
// numbers.
#[test]
fn early_exit_sequences() {
    let a = record_and_load(&Filter::default(), |rec| {
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.load(4);
        b.instr(0x1004, 4).unwrap();
        b.branch_exit();
        b.instr(0x1008, 4).unwrap();
        b.load(4);
        b.finish().unwrap();

        let unw = FixedStack(vec![0x1000]);
        // First run leaves at the branch: one access, two instructions.
        rec.enter_block(&unw, 1, 0).unwrap();
        rec.record_access(0x2000);
        rec.set_instr_count(2);
        // Second run goes the distance.
        rec.enter_block(&unw, 1, 0).unwrap();
        rec.record_access(0x2100);
        rec.record_access(0x2200);
    });

    let all = a.index.accesses().collect::<Vec<_>>();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].iseq, 0);
    // The second run starts after the two executed instructions.
    assert_eq!(all[1].iseq, 2);
    assert_eq!(all[2].iseq, 2 + 2);
    assert_eq!(all[2].iaddr, 0x1008);
}
