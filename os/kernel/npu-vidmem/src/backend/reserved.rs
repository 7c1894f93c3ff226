//! Physically contiguous memory from the OS contiguous allocator.
//!
//! Every live region is tracked. A region the OS hands out is checked
//! against all of them before it is accepted, so a misbehaving or shared
//! carve-out can never back two handles at once.

use super::{AllocRequest, AllocatorBackend, BackendEnv, require_fresh};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::lock::TicketLock;
use crate::segment::PhysicalSegmentTable;
use alloc::collections::BTreeMap;
use log::{debug, warn};
use npu_memory_addresses::{PAGE_SIZE, align_up};

#[derive(Default)]
pub struct ContiguousReserved {
    /// Live regions: CPU base → size.
    live: TicketLock<BTreeMap<u64, u64>>,
}

impl ContiguousReserved {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.live.with_lock(|l| l.len())
    }

    /// Record `[base, base + size)` unless it overlaps a live region.
    fn track(&self, base: u64, size: u64) -> bool {
        let end = base + size;
        self.live.with_lock(|live| {
            let overlaps = live
                .range(..end)
                .next_back()
                .is_some_and(|(&b, &s)| b + s > base);
            if !overlaps {
                live.insert(base, size);
            }
            !overlaps
        })
    }
}

impl AllocatorBackend for ContiguousReserved {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        require_fresh(request)?;
        let size = align_up(request.size, PAGE_SIZE)
            .ok_or(VidMemError::InvalidArgument("size overflows"))?;
        let pa = env
            .os
            .alloc_contiguous(size, request.align, env.wants_dma32(request.flags))?;

        if !self.track(pa.as_u64(), size) {
            warn!(
                "{}: {pa:?}+{size:#x} overlaps a live region, rejecting",
                env.name
            );
            env.os.free_contiguous(pa, size);
            return Err(VidMemError::OutOfMemory("region overlaps a live allocation"));
        }
        debug!("{}: {pa:?}+{size:#x}", env.name);

        Ok(BackendAllocation {
            table: PhysicalSegmentTable::single(env.to_device(pa), size),
            rounded_size: size,
            private: BackendPrivate::Reserved { base: pa, size },
        })
    }

    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::Reserved { base, size } = backing.private else {
            return Err(VidMemError::InvalidArgument("not a reserved allocation"));
        };
        let removed = self.live.with_lock(|l| l.remove(&base.as_u64()));
        if removed != Some(size) {
            return Err(VidMemError::InvalidArgument("region is not tracked"));
        }
        env.os.free_contiguous(base, size);
        Ok(())
    }

    fn uninit(&self, env: &BackendEnv<'_>) -> usize {
        let live = self.live_regions();
        if live > 0 {
            warn!("{}: {live} region(s) still allocated at shutdown", env.name);
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_detected_on_both_sides() {
        let r = ContiguousReserved::new();
        assert!(r.track(0x1_0000, 0x4000));
        assert!(!r.track(0x1_0000, 0x1000));
        assert!(!r.track(0xF000, 0x2000));
        assert!(!r.track(0x1_3000, 0x1000));
        assert!(r.track(0x1_4000, 0x1000));
        assert!(r.track(0xF000, 0x1000));
        assert_eq!(r.live_regions(), 3);
    }
}
