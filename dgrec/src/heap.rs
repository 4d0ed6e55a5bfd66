//! Tracking of live guest heap blocks.

use crate::{
    host::{ClientAllocator, StackUnwinder},
    output::OutputBuffer,
    STACK_DEPTH,
};
use dgwire::{Encoder, HWord, Record};
use std::{collections::HashMap, io, io::Write};

struct HeapBlock {
    size: HWord,
    /// What the allocator really handed out; at least `size`, and exactly
    /// `size` for client-annotated custom blocks.
    actual_size: HWord,
    ips: Vec<HWord>,
}

/// Maps live heap base addresses to their size and allocation stack,
/// mirroring every change into `MALLOC_BLOCK`/`FREE_BLOCK` records.
///
/// The storage itself belongs to the host's client allocator; the tracker
/// only keeps the book.
pub(crate) struct HeapTracker {
    blocks: HashMap<HWord, HeapBlock>,
}

impl HeapTracker {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    pub fn malloc<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        let Some(addr) = alloc.alloc(alloc.default_align(), size) else {
            return Ok(None);
        };
        let actual = alloc.usable_size(addr);
        self.add_block(enc, addr, size, actual, unw.stack_trace(tid, STACK_DEPTH, 0))?;
        Ok(Some(addr))
    }

    pub fn calloc<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        nmemb: HWord,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        if size != 0 && nmemb > HWord::MAX / size {
            return Ok(None);
        }
        let total = nmemb * size;
        let Some(addr) = alloc.alloc_zeroed(alloc.default_align(), total) else {
            return Ok(None);
        };
        let actual = alloc.usable_size(addr);
        self.add_block(enc, addr, total, actual, unw.stack_trace(tid, STACK_DEPTH, 0))?;
        Ok(Some(addr))
    }

    pub fn memalign<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        align: usize,
        size: HWord,
    ) -> io::Result<Option<HWord>> {
        let Some(addr) = alloc.alloc(align, size) else {
            return Ok(None);
        };
        let actual = alloc.usable_size(addr);
        self.add_block(enc, addr, size, actual, unw.stack_trace(tid, STACK_DEPTH, 0))?;
        Ok(Some(addr))
    }

    pub fn free<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        alloc: &mut dyn ClientAllocator,
        addr: HWord,
    ) -> io::Result<bool> {
        if self.remove_block(enc, addr)? {
            alloc.free(addr);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reallocates `addr` to `new_size`.
    ///
    /// A shrink that still fits in the block's usable size keeps the block
    /// where it is, but the record stream observes a free and a fresh
    /// allocation at the same address so the size change is visible. The
    /// allocation stack is re-captured at realloc time either way.
    pub fn realloc<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        alloc: &mut dyn ClientAllocator,
        unw: &dyn StackUnwinder,
        tid: u32,
        addr: HWord,
        new_size: HWord,
    ) -> io::Result<Option<HWord>> {
        let Some(block) = self.blocks.get(&addr) else {
            // Bogus realloc; the host's wrapper handles the corner cases.
            return Ok(None);
        };

        if new_size <= block.actual_size {
            self.log_remove(enc, addr)?;
            let block = self.blocks.get_mut(&addr).unwrap();
            block.size = new_size;
            block.ips = unw.stack_trace(tid, STACK_DEPTH, 0);
            let rec = Record::MallocBlock {
                addr,
                size: new_size,
                ips: block.ips.clone(),
            };
            enc.serialise(&rec)?;
            Ok(Some(addr))
        } else {
            let old_size = block.size;
            let Some(new_addr) = alloc.alloc(alloc.default_align(), new_size) else {
                return Ok(None);
            };
            alloc.copy(addr, new_addr, old_size);
            self.remove_block(enc, addr)?;
            alloc.free(addr);
            let actual = alloc.usable_size(new_addr);
            self.add_block(
                enc,
                new_addr,
                new_size,
                actual,
                unw.stack_trace(tid, STACK_DEPTH, 0),
            )?;
            Ok(Some(new_addr))
        }
    }

    pub fn usable_size(&self, addr: HWord) -> HWord {
        self.blocks.get(&addr).map_or(0, |b| b.actual_size)
    }

    /// Tracks a client-annotated block; the storage came from the guest
    /// itself, so `actual_size == size` and nothing is allocated here.
    pub fn add_custom<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        unw: &dyn StackUnwinder,
        tid: u32,
        addr: HWord,
        size: HWord,
    ) -> io::Result<()> {
        self.add_block(enc, addr, size, size, unw.stack_trace(tid, STACK_DEPTH, 0))
    }

    pub fn remove_custom<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        addr: HWord,
    ) -> io::Result<bool> {
        self.remove_block(enc, addr)
    }

    fn add_block<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        addr: HWord,
        size: HWord,
        actual_size: HWord,
        ips: Vec<HWord>,
    ) -> io::Result<()> {
        enc.serialise(&Record::MallocBlock {
            addr,
            size,
            ips: ips.clone(),
        })?;
        self.blocks.insert(
            addr,
            HeapBlock {
                size,
                actual_size,
                ips,
            },
        );
        Ok(())
    }

    fn remove_block<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        addr: HWord,
    ) -> io::Result<bool> {
        if self.blocks.remove(&addr).is_none() {
            return Ok(false);
        }
        self.log_remove(enc, addr)?;
        Ok(true)
    }

    fn log_remove<W: Write>(
        &mut self,
        enc: &mut Encoder<OutputBuffer<W>>,
        addr: HWord,
    ) -> io::Result<()> {
        enc.serialise(&Record::FreeBlock { addr })
    }
}
