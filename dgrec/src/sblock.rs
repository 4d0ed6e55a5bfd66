//! Turning superblocks into basic block definitions.

use crate::{context::BbDefMeta, Recorder};
use dgwire::{AccessDir, BbDef, BbDefAccess, BbDefInstr, HWord, Record, MAX_BB_INSTRS};
use std::{collections::HashMap, io, io::Write, mem};

/// The memory effect of a dirty helper call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemEffect {
    Read,
    Write,
    /// Read-modify-write of the same location.
    Modify,
}

/// One position in the instrumented superblock at which the host must
/// insert a helper call. Points are produced in program order; the host
/// interleaves them with the guest IR it is rewriting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstrPoint {
    /// Call [Recorder::enter_block] with this definition index. Placed
    /// before the first instruction of each (possibly split) definition.
    BlockEntry { bbdef: HWord },
    /// Call [Recorder::record_access] with the access's effective address.
    /// For a guarded access the host attaches the guard predicate to the
    /// call, so that a false guard produces no address at all.
    Access { guarded: bool },
    /// If the branch at this position is taken, call
    /// [Recorder::set_instr_count] with this count before leaving the
    /// block.
    BranchExit { n_instrs: u8 },
}

/// The result of instrumenting one superblock.
#[derive(Debug)]
pub struct InstrumentedSblock {
    /// Indices of the definitions emitted for this superblock, in program
    /// order. The host needs these to evict recorder state when it discards
    /// the superblock (see [Recorder::discard_bbdefs]).
    pub bbdefs: Vec<HWord>,
    pub points: Vec<InstrPoint>,
}

/// Collects one superblock's instruction marks and memory operations into
/// basic block definitions.
///
/// Definitions are capped at [MAX_BB_INSTRS] instructions; a longer
/// superblock is split and each part gets its own entry point in the plan.
/// Every definition is emitted to the trace exactly once, here; executions
/// reference it by index forever after.
pub struct BbDefBuilder<'r, W: Write> {
    rec: &'r mut Recorder<W>,
    instrs: Vec<BbDefInstr>,
    accesses: Vec<BbDefAccess>,
    points: Vec<InstrPoint>,
    emitted: Vec<HWord>,
    // Position in `points` of the BlockEntry for the definition being
    // built; patched with the real index when the definition is emitted.
    entry_point: Option<usize>,
}

impl<'r, W: Write> BbDefBuilder<'r, W> {
    pub(crate) fn new(rec: &'r mut Recorder<W>) -> Self {
        Self {
            rec,
            instrs: Vec::new(),
            accesses: Vec::new(),
            points: Vec::new(),
            emitted: Vec::new(),
            entry_point: None,
        }
    }

    /// Marks the start of a guest instruction of `size` bytes at `addr`.
    pub fn instr(&mut self, addr: HWord, size: u8) -> io::Result<()> {
        if self.instrs.len() == MAX_BB_INSTRS {
            self.emit_current()?;
        }
        if self.instrs.is_empty() {
            self.entry_point = Some(self.points.len());
            self.points.push(InstrPoint::BlockEntry { bbdef: 0 });
        }
        self.instrs.push(BbDefInstr { addr, size });
        Ok(())
    }

    pub fn load(&mut self, size: u8) {
        self.access(AccessDir::Read, size, false);
    }

    pub fn store(&mut self, size: u8) {
        self.access(AccessDir::Write, size, false);
    }

    pub fn guarded_load(&mut self, size: u8) {
        self.access(AccessDir::Read, size, true);
    }

    pub fn guarded_store(&mut self, size: u8) {
        self.access(AccessDir::Write, size, true);
    }

    /// A compare-and-swap: a read then a write of the same address. A
    /// double-lane CAS covers twice the data size.
    pub fn cas(&mut self, size: u8, double_lane: bool) {
        let size = if double_lane { size * 2 } else { size };
        self.access(AccessDir::Read, size, false);
        self.access(AccessDir::Write, size, false);
    }

    /// A dirty helper with a declared memory effect.
    pub fn dirty(&mut self, effect: MemEffect, size: u8) {
        if matches!(effect, MemEffect::Read | MemEffect::Modify) {
            self.access(AccessDir::Read, size, false);
        }
        if matches!(effect, MemEffect::Write | MemEffect::Modify) {
            self.access(AccessDir::Write, size, false);
        }
    }

    /// A conditional exit out of the superblock. A run leaving through it
    /// has executed only the instructions seen so far.
    pub fn branch_exit(&mut self) {
        debug_assert!(!self.instrs.is_empty());
        if !self.instrs.is_empty() {
            self.points.push(InstrPoint::BranchExit {
                n_instrs: self.instrs.len() as u8,
            });
        }
    }

    /// Finalises the superblock, emitting the trailing definition if any.
    pub fn finish(mut self) -> io::Result<InstrumentedSblock> {
        self.emit_current()?;
        Ok(InstrumentedSblock {
            bbdefs: mem::take(&mut self.emitted),
            points: mem::take(&mut self.points),
        })
    }

    fn access(&mut self, dir: AccessDir, size: u8, guarded: bool) {
        // Memory operations before the first instruction mark belong to the
        // host's preamble and are not the guest's.
        debug_assert!(!self.instrs.is_empty());
        if self.instrs.is_empty() {
            return;
        }
        self.accesses.push(BbDefAccess {
            dir,
            size,
            iseq: (self.instrs.len() - 1) as u8,
        });
        self.points.push(InstrPoint::Access { guarded });
    }

    fn emit_current(&mut self) -> io::Result<()> {
        if self.instrs.is_empty() {
            return Ok(());
        }
        let index = self.rec.next_bbdef;
        self.rec.next_bbdef += 1;

        let meta = BbDefMeta {
            entry_addr: self.instrs[0].addr,
            n_instrs: self.instrs.len() as u8,
            n_accesses: self.accesses.len(),
            contexts: HashMap::new(),
        };
        let bbd = BbDef {
            instrs: mem::take(&mut self.instrs),
            accesses: mem::take(&mut self.accesses),
        };
        self.rec.enc.serialise(&Record::BbDef(bbd))?;
        self.rec.bbdefs.insert(index, meta);

        let entry = self.entry_point.take().unwrap();
        self.points[entry] = InstrPoint::BlockEntry { bbdef: index };
        self.emitted.push(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InstrPoint, MemEffect};
    use crate::Recorder;
    use dgwire::{AccessDir, Decoder, Record};
    use fallible_iterator::FallibleIterator;

    fn decode_all(buf: &[u8]) -> Vec<Record> {
        Decoder::new(buf).unwrap().collect().unwrap()
    }

    // A superblock longer than 255 instructions splits, with access iseq
    // values restarting at the second definition.
    #[test]
    fn split_at_255() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let mut b = rec.instrument_superblock();
        for i in 0..300usize {
            b.instr(0x1000 + i * 4, 4).unwrap();
            b.load(4);
        }
        let plan = b.finish().unwrap();
        assert_eq!(plan.bbdefs, vec![0, 1]);

        let recs = decode_all(&rec.finish().unwrap());
        let defs = recs
            .iter()
            .filter_map(|r| match r {
                Record::BbDef(d) => Some(d),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].instrs.len(), 255);
        assert_eq!(defs[1].instrs.len(), 45);
        assert_eq!(defs[0].accesses.len(), 255);
        assert_eq!(defs[1].accesses.len(), 45);
        // iseq resets to 0 in the second definition.
        assert_eq!(defs[1].accesses[0].iseq, 0);
        assert_eq!(defs[1].instrs[0].addr, 0x1000 + 255 * 4);

        // The plan has an entry point per definition, in order.
        let entries = plan
            .points
            .iter()
            .filter_map(|p| match p {
                InstrPoint::BlockEntry { bbdef } => Some(*bbdef),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![0, 1]);
    }

    #[test]
    fn cas_is_read_then_write() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.cas(4, true);
        b.finish().unwrap();

        let recs = decode_all(&rec.finish().unwrap());
        let Record::BbDef(def) = &recs[0] else {
            panic!("{recs:?}");
        };
        assert_eq!(def.accesses.len(), 2);
        assert_eq!(def.accesses[0].dir, AccessDir::Read);
        assert_eq!(def.accesses[1].dir, AccessDir::Write);
        // Double-lane CAS covers both lanes.
        assert_eq!(def.accesses[0].size, 8);
        assert_eq!(def.accesses[0].iseq, def.accesses[1].iseq);
    }

    #[test]
    fn dirty_modify_reads_and_writes() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.dirty(MemEffect::Modify, 16);
        let plan = b.finish().unwrap();

        let recs = decode_all(&rec.finish().unwrap());
        let Record::BbDef(def) = &recs[0] else {
            panic!("{recs:?}");
        };
        assert_eq!(
            def.accesses.iter().map(|a| a.dir).collect::<Vec<_>>(),
            vec![AccessDir::Read, AccessDir::Write]
        );
        // Two runtime helper insertions besides the block entry.
        assert_eq!(plan.points.len(), 3);
    }

    #[test]
    fn guarded_access_flagged_in_plan() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.guarded_load(8);
        b.guarded_store(8);
        b.load(4);
        let plan = b.finish().unwrap();
        let guards = plan
            .points
            .iter()
            .filter_map(|p| match p {
                InstrPoint::Access { guarded } => Some(*guarded),
                _ => None,
            })
            .collect::<Vec<_>>();
        // The guard lives in the helper call, not the definition: all
        // three accesses appear there unconditionally.
        assert_eq!(guards, vec![true, true, false]);
        let recs = decode_all(&rec.finish().unwrap());
        let Record::BbDef(def) = &recs[0] else {
            panic!("{recs:?}");
        };
        assert_eq!(def.accesses.len(), 3);
    }

    #[test]
    fn branch_exit_counts_executed_instrs() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let mut b = rec.instrument_superblock();
        b.instr(0x1000, 4).unwrap();
        b.instr(0x1004, 4).unwrap();
        b.branch_exit();
        b.instr(0x1008, 4).unwrap();
        let plan = b.finish().unwrap();
        assert!(plan
            .points
            .contains(&InstrPoint::BranchExit { n_instrs: 2 }));
    }

    #[test]
    fn empty_superblock_emits_nothing() {
        let mut rec = Recorder::new(Vec::new()).unwrap();
        let b = rec.instrument_superblock();
        let plan = b.finish().unwrap();
        assert!(plan.bbdefs.is_empty());
        assert!(plan.points.is_empty());
        // Only the header is in the stream.
        assert!(decode_all(&rec.finish().unwrap()).is_empty());
    }
}
