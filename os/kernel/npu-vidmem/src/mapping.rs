//! Kernel and user mappings over a segment table.
//!
//! A one-segment table is remapped directly as a single physical run; any
//! other table is expanded into its page list first. The OS maps whole
//! pages, so the in-page offset of the buffer's first byte is added back to
//! the address handed to the caller.

use crate::backend::BackendEnv;
use crate::error::{Result, VidMemError};
use crate::os::Pid;
use crate::segment::PhysicalSegmentTable;
use log::{debug, error};
use npu_memory_addresses::{Size4K, VirtualAddress};

/// A live mapping: the page-aligned range the OS created and the address of
/// the buffer's first byte inside it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedRange {
    pub base: VirtualAddress,
    pub address: VirtualAddress,
    pub len: u64,
}

impl MappedRange {
    fn new(base: VirtualAddress, table: &PhysicalSegmentTable) -> Self {
        Self {
            base,
            address: base + table.first_page_offset(),
            len: table.mapped_len(),
        }
    }
}

pub fn map_kernel(env: &BackendEnv<'_>, table: &PhysicalSegmentTable) -> Result<MappedRange> {
    let cache = env.capabilities.cache_mode();
    let base = match table.segments() {
        [] => return Err(VidMemError::InvalidArgument("nothing to map")),
        [only] => {
            let pa = env.translation.to_cpu(only.address.align_down::<Size4K>());
            env.os.map_kernel_contiguous(pa, table.mapped_len(), cache)
        }
        _ => env.os.map_kernel(&table.cpu_pages(env.translation), cache),
    }
    .inspect_err(|e| error!("{}: kernel map failed: {e}", env.name))?;

    let range = MappedRange::new(base, table);
    debug!(
        "{}: kernel map {:?} (+{:#x} bytes, {} segment(s))",
        env.name,
        range.address,
        range.len,
        table.segment_count()
    );
    Ok(range)
}

pub fn unmap_kernel(env: &BackendEnv<'_>, range: &MappedRange) {
    debug!("{}: kernel unmap {:?}", env.name, range.address);
    env.os.unmap_kernel(range.base, range.len);
}

pub fn map_user(
    env: &BackendEnv<'_>,
    table: &PhysicalSegmentTable,
    pid: Pid,
    read_only: bool,
) -> Result<MappedRange> {
    let cache = env.capabilities.cache_mode();
    let base = match table.segments() {
        [] => return Err(VidMemError::InvalidArgument("nothing to map")),
        [only] => {
            let pa = env.translation.to_cpu(only.address.align_down::<Size4K>());
            env.os
                .map_user_contiguous(pid, pa, table.mapped_len(), cache, read_only)
        }
        _ => env
            .os
            .map_user(pid, &table.cpu_pages(env.translation), cache, read_only),
    }
    .inspect_err(|e| error!("{}: user map for {pid:?} failed: {e}", env.name))?;

    let range = MappedRange::new(base, table);
    debug!("{}: user map {:?} for {pid:?}", env.name, range.address);
    Ok(range)
}

pub fn unmap_user(env: &BackendEnv<'_>, pid: Pid, range: &MappedRange) {
    debug!("{}: user unmap {:?} for {pid:?}", env.name, range.address);
    env.os.unmap_user(pid, range.base, range.len);
}
