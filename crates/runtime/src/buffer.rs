use std::collections::BTreeMap;

use grapple_address::{Address, Span};

use crate::memory::{MemoryError, ProcessMemory};

const ALLOCATION_ALIGNMENT: usize = 0x10;

/// Address space kept in local buffers. Used to stage patches offline and to check them
/// byte for byte before they go anywhere near a live process.
#[derive(Debug, Default)]
pub struct BufferedMemory {
    regions: Vec<Region>,
    arena: Option<Arena>,
    denied_writes: Vec<Span>,
}

#[derive(Debug)]
struct Region {
    base: Address,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct Arena {
    span: Span,
    cursor: usize,
    allocations: BTreeMap<Address, usize>,
}

impl BufferedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, base: Address, bytes: Vec<u8>) -> &mut Self {
        self.regions.push(Region { base, bytes });
        self
    }

    /// Maps `size` bytes at `base` and hands them out through `allocate_executable`.
    pub fn with_arena(&mut self, base: Address, size: usize) -> &mut Self {
        self.map(base, vec![0xCC; size]);
        self.arena = Some(Arena {
            span: Span::new(base, size),
            cursor: 0,
            allocations: BTreeMap::new(),
        });
        self
    }

    /// Makes every write touching `span` fail.
    pub fn deny_writes(&mut self, span: Span) -> &mut Self {
        self.denied_writes.push(span);
        self
    }

    pub fn allow_writes(&mut self) -> &mut Self {
        self.denied_writes.clear();
        self
    }

    pub fn live_allocations(&self) -> usize {
        self.arena.as_ref().map_or(0, |a| a.allocations.len())
    }

    pub fn region(&self, base: Address) -> Option<&[u8]> {
        self.regions.iter()
            .find(|r| r.base == base)
            .map(|r| r.bytes.as_slice())
    }

    fn locate(&self, address: Address, length: usize) -> Option<(usize, usize)> {
        self.regions.iter()
            .enumerate()
            .find(|(_, r)| {
                let span = Span::new(r.base, r.bytes.len());
                address >= span.start && address.add(length) <= span.end()
            })
            .map(|(i, r)| (i, address.as_usize() - r.base.as_usize()))
    }
}

impl ProcessMemory for BufferedMemory {
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, MemoryError> {
        let (index, offset) = self.locate(address, length)
            .ok_or(MemoryError::ReadFailed { address, length })?;

        Ok(self.regions[index].bytes[offset..offset + length].to_vec())
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        let length = bytes.len();
        let span = Span::new(address, length);
        if self.denied_writes.iter().any(|d| d.overlaps(&span)) {
            return Err(MemoryError::WriteFailed { address, length });
        }

        let (index, offset) = self.locate(address, length)
            .ok_or(MemoryError::WriteFailed { address, length })?;

        self.regions[index].bytes[offset..offset + length].copy_from_slice(bytes);
        Ok(())
    }

    fn allocate_executable(&mut self, size: usize, _near: Option<Address>) -> Result<Address, MemoryError> {
        let arena = self.arena.as_mut()
            .ok_or(MemoryError::AllocationFailed { size })?;

        let start = (arena.cursor + ALLOCATION_ALIGNMENT - 1) & !(ALLOCATION_ALIGNMENT - 1);
        if size == 0 || start + size > arena.span.length {
            return Err(MemoryError::AllocationFailed { size });
        }

        let address = arena.span.start.add(start);
        arena.cursor = start + size;
        arena.allocations.insert(address, size);

        Ok(address)
    }

    fn free(&mut self, address: Address) -> Result<(), MemoryError> {
        let size = self.arena.as_mut()
            .and_then(|a| a.allocations.remove(&address))
            .ok_or(MemoryError::FreeFailed { address })?;

        // Anything still running through freed code traps instead of wandering off.
        let (index, offset) = self.locate(address, size)
            .ok_or(MemoryError::FreeFailed { address })?;
        self.regions[index].bytes[offset..offset + size].fill(0xCC);

        Ok(())
    }
}
