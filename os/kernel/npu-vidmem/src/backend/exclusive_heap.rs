use super::{AllocRequest, AllocatorBackend, BackendEnv, require_fresh};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::heap::{HeapStats, HeapSubAllocator};
use crate::segment::PhysicalSegmentTable;

/// A fixed carve-out owned by the driver, sub-allocated through a
/// [`HeapSubAllocator`]. No OS allocation is ever made.
pub struct ExclusiveHeap {
    heap: HeapSubAllocator,
}

impl ExclusiveHeap {
    #[must_use]
    pub const fn new(heap: HeapSubAllocator) -> Self {
        Self { heap }
    }

    #[must_use]
    pub const fn heap(&self) -> &HeapSubAllocator {
        &self.heap
    }
}

impl AllocatorBackend for ExclusiveHeap {
    fn allocate(&self, _env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        require_fresh(request)?;
        let block = self.heap.allocate(request.size, request.align)?;
        Ok(BackendAllocation {
            table: PhysicalSegmentTable::single(self.heap.block_address(&block), block.size()),
            rounded_size: block.size(),
            private: BackendPrivate::HeapBlock(block),
        })
    }

    fn free(&self, _env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::HeapBlock(block) = &backing.private else {
            return Err(VidMemError::InvalidArgument("not a heap allocation"));
        };
        self.heap.free(block)?;
        Ok(())
    }

    fn uninit(&self, _env: &BackendEnv<'_>) -> usize {
        self.heap.report_leaks()
    }

    fn heap_stats(&self) -> Option<HeapStats> {
        Some(self.heap.stats())
    }
}
