use super::{AllocRequest, AllocatorBackend, BackendEnv, require_fresh};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::segment::SegmentTableBuilder;
use alloc::vec::Vec;
use log::{debug, warn};
use npu_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, pages_for};

/// One OS page at a time; the table is as contiguous as the OS happens to
/// make it.
#[derive(Debug, Default)]
pub struct DynamicPages;

impl DynamicPages {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AllocatorBackend for DynamicPages {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        require_fresh(request)?;
        if request.align > PAGE_SIZE {
            return Err(VidMemError::NotSupported(
                "page backend cannot align beyond a page",
            ));
        }
        let count = pages_for(request.size)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(VidMemError::InvalidArgument("size overflows"))?;
        let dma32 = env.wants_dma32(request.flags);

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| VidMemError::OutOfMemory("page list"))?;
        for _ in 0..count {
            match env.os.alloc_page(dma32) {
                Ok(pa) => pages.push(pa),
                Err(e) => {
                    warn!(
                        "{}: page {} of {count} failed ({e}), releasing the rest",
                        env.name,
                        pages.len()
                    );
                    for pa in pages.drain(..) {
                        env.os.free_page(pa);
                    }
                    return Err(e.into());
                }
            }
        }

        let device: Vec<_> = pages.iter().map(|&pa| env.to_device(pa)).collect();
        let size = (count as u64) << PAGE_SHIFT;
        let table = match SegmentTableBuilder::from_pages(&device, 0, size) {
            Ok(t) => t,
            Err(e) => {
                for pa in pages.drain(..) {
                    env.os.free_page(pa);
                }
                return Err(e);
            }
        };
        debug!(
            "{}: {count} page(s) in {} segment(s)",
            env.name,
            table.segment_count()
        );

        Ok(BackendAllocation {
            table,
            rounded_size: size,
            private: BackendPrivate::Pages(pages),
        })
    }

    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::Pages(pages) = &mut backing.private else {
            return Err(VidMemError::InvalidArgument("not a page allocation"));
        };
        for pa in pages.drain(..) {
            env.os.free_page(pa);
        }
        Ok(())
    }
}
