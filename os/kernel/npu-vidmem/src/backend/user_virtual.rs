use super::{AllocRequest, AllocatorBackend, BackendEnv, MemorySource};
use crate::error::{OsError, Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::segment::SegmentTableBuilder;
use alloc::vec::Vec;
use log::debug;
use npu_memory_addresses::{Size4K, pages_for};

/// A buffer of the calling process, pinned for the lifetime of the handle.
/// Contiguity is whatever the pinned pages turn out to have.
#[derive(Debug, Default)]
pub struct ImportedUserVirtual;

impl ImportedUserVirtual {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AllocatorBackend for ImportedUserVirtual {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        let MemorySource::UserVirtual(va) = request.source else {
            return Err(VidMemError::InvalidArgument("user import needs an address"));
        };
        let offset = va.page_offset::<Size4K>();
        let count = offset
            .checked_add(request.size)
            .and_then(pages_for)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(VidMemError::InvalidArgument("user range overflows"))?;

        let pid = env.os.current_pid();
        let pages = env
            .os
            .pin_user_pages(pid, va.align_down::<Size4K>(), count)?;
        if pages.len() != count {
            env.os.unpin_user_pages(&pages);
            return Err(OsError::Fault.into());
        }

        let device: Vec<_> = pages.iter().map(|&pa| env.to_device(pa)).collect();
        let table = match SegmentTableBuilder::from_pages(&device, offset, request.size) {
            Ok(t) => t,
            Err(e) => {
                env.os.unpin_user_pages(&pages);
                return Err(e);
            }
        };
        debug!(
            "{}: pinned {count} page(s) of {pid:?} at {va:?}, {} segment(s)",
            env.name,
            table.segment_count()
        );

        Ok(BackendAllocation {
            table,
            rounded_size: request.size,
            private: BackendPrivate::Pinned(pages),
        })
    }

    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::Pinned(pages) = &mut backing.private else {
            return Err(VidMemError::InvalidArgument("not a user import"));
        };
        env.os.unpin_user_pages(pages);
        pages.clear();
        Ok(())
    }
}
