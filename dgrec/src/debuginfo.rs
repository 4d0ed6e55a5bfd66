//! Reporting of loaded object files.

use crate::{host::ObjectInfo, output::OutputBuffer};
use dgwire::{Encoder, Record};
use std::{collections::HashSet, io, io::Write};

/// Emits a `TEXT_AVMA` record once for each object file the host has
/// loaded.
///
/// A dirty flag, raised whenever the host maps new executable memory,
/// keeps the sweep over the host's object list off the common path.
pub(crate) struct DebugInfoTracker {
    seen: HashSet<u64>,
    dirty: bool,
}

impl DebugInfoTracker {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            // Objects mapped before the tool started still need reporting.
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn sweep<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        objects: impl IntoIterator<Item = ObjectInfo>,
    ) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        for obj in objects {
            if self.seen.insert(obj.handle) {
                enc.serialise(&Record::TextAvma {
                    text_avma: obj.text_avma,
                    filename: obj.filename,
                })?;
            }
        }
        self.dirty = false;
        Ok(())
    }
}
