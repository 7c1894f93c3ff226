use super::{AllocRequest, AllocatorBackend, BackendEnv, MemorySource};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::segment::SegmentTableBuilder;
use alloc::vec::Vec;
use log::debug;

/// A physical range list supplied by the caller. Nothing is allocated or
/// pinned; the caller guarantees the memory outlives the handle.
#[derive(Debug, Default)]
pub struct ImportedUserPhysical;

impl ImportedUserPhysical {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AllocatorBackend for ImportedUserPhysical {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        let MemorySource::UserPhysical(ranges) = &request.source else {
            return Err(VidMemError::InvalidArgument("physical import needs a range list"));
        };
        let device: Vec<_> = ranges
            .iter()
            .map(|&(pa, len)| (env.to_device(pa), len))
            .collect();
        let table = SegmentTableBuilder::from_ranges(&device)?;
        if table.total_len() < request.size {
            return Err(VidMemError::InvalidArgument("ranges are smaller than the request"));
        }
        debug!(
            "{}: imported {} range(s) as {} segment(s)",
            env.name,
            ranges.len(),
            table.segment_count()
        );

        Ok(BackendAllocation {
            rounded_size: table.total_len(),
            table,
            private: BackendPrivate::None,
        })
    }

    fn free(&self, _env: &BackendEnv<'_>, _backing: &mut BackendAllocation) -> Result<()> {
        Ok(())
    }
}
