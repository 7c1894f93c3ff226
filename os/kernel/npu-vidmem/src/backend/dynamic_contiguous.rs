use super::{AllocRequest, AllocatorBackend, BackendEnv, require_fresh};
use crate::error::{Result, VidMemError};
use crate::handle::{BackendAllocation, BackendPrivate};
use crate::segment::PhysicalSegmentTable;
use log::debug;
use npu_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, pages_for};

/// Naturally aligned `2^order`-page blocks from the OS buddy allocator.
pub struct DynamicContiguous {
    max_order: u32,
}

impl DynamicContiguous {
    #[must_use]
    pub const fn new(max_order: u32) -> Self {
        Self { max_order }
    }

    #[must_use]
    pub const fn max_order(&self) -> u32 {
        self.max_order
    }

    #[must_use]
    pub const fn max_size(&self) -> u64 {
        PAGE_SIZE << self.max_order
    }
}

/// Smallest order whose block holds `pages` pages and whose natural alignment
/// satisfies `align`.
pub(crate) fn order_for(pages: u64, align: u64) -> u32 {
    let by_size = pages.next_power_of_two().trailing_zeros();
    let by_align = (align >> PAGE_SHIFT).max(1).trailing_zeros();
    by_size.max(by_align)
}

impl AllocatorBackend for DynamicContiguous {
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation> {
        require_fresh(request)?;
        let pages = pages_for(request.size)
            .ok_or(VidMemError::InvalidArgument("size overflows"))?;
        if pages > 1 << self.max_order {
            return Err(VidMemError::InvalidArgument("request exceeds the maximum order"));
        }
        let order = order_for(pages, request.align);
        if order > self.max_order {
            return Err(VidMemError::InvalidArgument("alignment exceeds the maximum order"));
        }

        let pa = env
            .os
            .alloc_pages_order(order, env.wants_dma32(request.flags))?;
        let size = pages << PAGE_SHIFT;
        debug!(
            "{}: order {order} block at {pa:?} for {size:#x} bytes",
            env.name
        );

        Ok(BackendAllocation {
            table: PhysicalSegmentTable::single(env.to_device(pa), size),
            rounded_size: size,
            private: BackendPrivate::Order { base: pa, order },
        })
    }

    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()> {
        let BackendPrivate::Order { base, order } = backing.private else {
            return Err(VidMemError::InvalidArgument("not an order allocation"));
        };
        env.os.free_pages_order(base, order);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_covers_size_and_alignment() {
        assert_eq!(order_for(1, PAGE_SIZE), 0);
        assert_eq!(order_for(2, PAGE_SIZE), 1);
        assert_eq!(order_for(3, PAGE_SIZE), 2);
        assert_eq!(order_for(1, 16 * PAGE_SIZE), 4);
        assert_eq!(order_for(1024, PAGE_SIZE), 10);
        assert_eq!(DynamicContiguous::new(10).max_size(), 4 * 1024 * 1024);
    }
}
