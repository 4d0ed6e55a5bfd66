//! Nearest-access queries over the loaded run stream.

use crate::index::{Access, AccessIndex};
use dgwire::HWord;

impl AccessIndex {
    /// Returns the kept access minimising
    /// `hypot((access.addr - addr) * ratio, access.iseq - iseq)`, or `None`
    /// if nothing was kept. `ratio` converts between address units and
    /// sequence units (it reflects the viewer's pixel density) and must be
    /// positive; ties go to the first candidate seen.
    ///
    /// Runs are ordered by `iseq_start` and an access's sequence number
    /// never precedes its run's start, so from a binary-searched split
    /// point the walk can stop in each direction as soon as a run's start
    /// is further away in sequence alone than the best distance so far.
    pub fn nearest(&self, addr: HWord, iseq: u64, ratio: f64) -> Option<Access<'_>> {
        let split = self.runs.partition_point(|r| r.iseq_start < iseq);
        let mut best: Option<(f64, usize, usize)> = None;

        // Accesses in the run at `idx` (and any later one) are at least
        // `iseq_start - iseq` away, so check before scanning.
        for idx in split..self.runs.len() {
            if let Some((score, ..)) = best {
                if (self.runs[idx].iseq_start - iseq) as f64 > score {
                    break;
                }
            }
            self.scan_run(idx, addr, iseq, ratio, &mut best);
        }

        // Going backwards the current run can still hold accesses closer
        // than its own start, so scan first; but every run before it tops
        // out at this run's start, which bounds the rest of the walk.
        for idx in (0..split).rev() {
            self.scan_run(idx, addr, iseq, ratio, &mut best);
            if let Some((score, ..)) = best {
                if (iseq - self.runs[idx].iseq_start) as f64 >= score {
                    break;
                }
            }
        }

        best.and_then(|(_, idx, j)| self.access(idx, j))
    }

    fn scan_run(
        &self,
        idx: usize,
        addr: HWord,
        iseq: u64,
        ratio: f64,
        best: &mut Option<(f64, usize, usize)>,
    ) {
        let run = &self.runs[idx];
        let ctx = &self.contexts[run.ctx];
        let bbd = &self.bbdefs[ctx.bbdef];
        for (j, &a) in self.run_addrs(run).iter().enumerate() {
            if a == 0 {
                continue;
            }
            let a_iseq = run.iseq_start + u64::from(bbd.accesses[j].iseq);
            let dx = (a as f64 - addr as f64) * ratio;
            let dy = a_iseq as f64 - iseq as f64;
            let dist = dx.hypot(dy);
            if best.map_or(true, |(score, ..)| dist < score) {
                *best = Some((dist, idx, j));
            }
        }
    }
}
