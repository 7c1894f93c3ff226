//! # In-memory model of the OS memory services
//!
//! [`SimulatedOs`] implements [`OsMemory`] over a pool of page frames tracked
//! by a bitmap. It allocates nothing real: addresses are bookkeeping only.
//! Besides the trait, it exposes knobs for tests:
//!
//! - page-by-page allocation lowest-first (adjacent frames) or
//!   highest-first (never adjacent in ascending order),
//! - fault injection for single-page allocation, mapping and scatter lists,
//! - a forced return value for the next contiguous allocation,
//! - registries for dma-bufs and user buffers,
//! - a settable current process id,
//! - counters in [`SimStats`].
//!
//! The `dma32` hint is ignored on purpose: placing the pool above 4 GiB
//! exercises the verification done by the backends.

use crate::cache::CacheOp;
use crate::error::OsError;
use crate::flags::CacheMode;
use crate::lock::TicketLock;
use crate::os::{DmaBufAttachment, OsMemory, Pid, SgTableId};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use npu_memory_addresses::{
    PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress, pages_for,
};

const KERNEL_VA_BASE: u64 = 0xFFFF_C900_0000_0000;
const USER_VA_BASE: u64 = 0x0000_7F00_0000_0000;

/// Snapshot of the simulator's counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SimStats {
    pub free_frames: usize,
    pub live_kernel_mappings: usize,
    pub kernel_maps_total: u64,
    pub live_user_mappings: usize,
    pub live_sg_tables: usize,
    pub sg_syncs: u64,
    pub live_dma_buf_attachments: usize,
    pub pinned_pages: u64,
    pub cleared_bytes: u64,
}

struct UserBuffer {
    pid: Pid,
    va: u64,
    pages: Vec<PhysicalAddress>,
}

struct SimState {
    pool_base: u64,
    used: Vec<bool>,
    scatter: bool,
    fail_pages_after: Option<usize>,
    fail_next_map: bool,
    fail_next_sg: bool,
    forced_contiguous: Option<PhysicalAddress>,
    forced: BTreeMap<u64, u64>,
    next_kernel_va: u64,
    kernel_maps: BTreeMap<u64, u64>,
    kernel_maps_total: u64,
    next_user_va: u64,
    user_maps: BTreeMap<(Pid, u64), u64>,
    next_sg: u64,
    sg_tables: BTreeMap<u64, usize>,
    sg_syncs: u64,
    next_fd: i32,
    dma_bufs: BTreeMap<i32, Vec<(PhysicalAddress, u64)>>,
    next_attachment: u64,
    attachments: BTreeMap<u64, i32>,
    user_buffers: Vec<UserBuffer>,
    pinned: u64,
    current_pid: Pid,
    cleared_bytes: u64,
}

impl SimState {
    fn frame_index(&self, pa: PhysicalAddress) -> Option<usize> {
        let off = pa.as_u64().checked_sub(self.pool_base)?;
        let idx = usize::try_from(off >> PAGE_SHIFT).ok()?;
        (idx < self.used.len()).then_some(idx)
    }

    fn address_of(&self, idx: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.pool_base + ((idx as u64) << PAGE_SHIFT))
    }

    /// First free run of `count` frames whose absolute frame number is a
    /// multiple of `align`.
    fn find_run(&self, count: usize, align: usize) -> Option<usize> {
        let base_frame = usize::try_from(self.pool_base >> PAGE_SHIFT).ok()?;
        let mut idx = (align - base_frame % align) % align;
        while idx + count <= self.used.len() {
            if self.used[idx..idx + count].iter().all(|u| !u) {
                return Some(idx);
            }
            idx += align;
        }
        None
    }

    fn mark(&mut self, idx: usize, count: usize, used: bool) {
        let end = (idx + count).min(self.used.len());
        for u in &mut self.used[idx..end] {
            *u = used;
        }
    }

    fn release(&mut self, pa: PhysicalAddress, count: usize) {
        if let Some(idx) = self.frame_index(pa) {
            self.mark(idx, count, false);
        }
    }

    fn map(&mut self, len: u64) -> Result<VirtualAddress, OsError> {
        if core::mem::take(&mut self.fail_next_map) {
            return Err(OsError::Fault);
        }
        let va = self.next_kernel_va;
        self.next_kernel_va += len + PAGE_SIZE;
        self.kernel_maps.insert(va, len);
        self.kernel_maps_total += 1;
        Ok(VirtualAddress::new(va))
    }

    fn map_user(&mut self, pid: Pid, len: u64) -> Result<VirtualAddress, OsError> {
        if core::mem::take(&mut self.fail_next_map) {
            return Err(OsError::Fault);
        }
        let va = self.next_user_va;
        self.next_user_va += len + PAGE_SIZE;
        self.user_maps.insert((pid, va), len);
        Ok(VirtualAddress::new(va))
    }
}

pub struct SimulatedOs {
    state: TicketLock<SimState>,
}

impl SimulatedOs {
    /// A pool of `frames` page frames starting at `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        Self {
            state: TicketLock::new(SimState {
                pool_base: base.align_down::<Size4K>().as_u64(),
                used: alloc::vec![false; frames],
                scatter: false,
                fail_pages_after: None,
                fail_next_map: false,
                fail_next_sg: false,
                forced_contiguous: None,
                forced: BTreeMap::new(),
                next_kernel_va: KERNEL_VA_BASE,
                kernel_maps: BTreeMap::new(),
                kernel_maps_total: 0,
                next_user_va: USER_VA_BASE,
                user_maps: BTreeMap::new(),
                next_sg: 1,
                sg_tables: BTreeMap::new(),
                sg_syncs: 0,
                next_fd: 3,
                dma_bufs: BTreeMap::new(),
                next_attachment: 1,
                attachments: BTreeMap::new(),
                user_buffers: Vec::new(),
                pinned: 0,
                current_pid: Pid(1),
                cleared_bytes: 0,
            }),
        }
    }

    /// Hand out single pages highest-first so no two are ascending-adjacent.
    pub fn scatter_pages(&self, scatter: bool) {
        self.state.with_lock(|s| s.scatter = scatter);
    }

    /// Let `n` more single-page allocations succeed, then fail all of them.
    pub fn fail_page_allocs_after(&self, n: Option<usize>) {
        self.state.with_lock(|s| s.fail_pages_after = n);
    }

    /// Fail the next kernel or user mapping call.
    pub fn fail_next_map(&self) {
        self.state.with_lock(|s| s.fail_next_map = true);
    }

    /// Fail the next scatter list creation.
    pub fn fail_next_sg(&self) {
        self.state.with_lock(|s| s.fail_next_sg = true);
    }

    /// Return `pa` from the next contiguous allocation, whether or not it is
    /// in use.
    pub fn force_next_contiguous(&self, pa: PhysicalAddress) {
        self.state.with_lock(|s| s.forced_contiguous = Some(pa));
    }

    /// Make a dma-buf over `ranges` importable; returns its descriptor.
    #[must_use]
    pub fn register_dma_buf(&self, ranges: Vec<(PhysicalAddress, u64)>) -> i32 {
        self.state.with_lock(|s| {
            let fd = s.next_fd;
            s.next_fd += 1;
            s.dma_bufs.insert(fd, ranges);
            fd
        })
    }

    /// Declare that `pages` back the user buffer of `pid` at `va`.
    pub fn register_user_buffer(
        &self,
        pid: Pid,
        va: VirtualAddress,
        pages: Vec<PhysicalAddress>,
    ) {
        self.state.with_lock(|s| {
            s.user_buffers.push(UserBuffer {
                pid,
                va: va.as_u64(),
                pages,
            });
        });
    }

    pub fn set_current_pid(&self, pid: Pid) {
        self.state.with_lock(|s| s.current_pid = pid);
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.state.with_lock(|s| SimStats {
            free_frames: s.used.iter().filter(|u| !**u).count(),
            live_kernel_mappings: s.kernel_maps.len(),
            kernel_maps_total: s.kernel_maps_total,
            live_user_mappings: s.user_maps.len(),
            live_sg_tables: s.sg_tables.len(),
            sg_syncs: s.sg_syncs,
            live_dma_buf_attachments: s.attachments.len(),
            pinned_pages: s.pinned,
            cleared_bytes: s.cleared_bytes,
        })
    }
}

fn frames_for(size: u64) -> Result<usize, OsError> {
    pages_for(size)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
        .ok_or(OsError::NoMemory)
}

impl OsMemory for SimulatedOs {
    fn alloc_page(&self, _dma32: bool) -> Result<PhysicalAddress, OsError> {
        self.state.with_lock(|s| {
            match s.fail_pages_after {
                Some(0) => return Err(OsError::NoMemory),
                Some(n) => s.fail_pages_after = Some(n - 1),
                None => {}
            }
            let idx = if s.scatter {
                s.used.iter().rposition(|u| !u)
            } else {
                s.used.iter().position(|u| !u)
            }
            .ok_or(OsError::NoMemory)?;
            s.mark(idx, 1, true);
            Ok(s.address_of(idx))
        })
    }

    fn free_page(&self, page: PhysicalAddress) {
        self.state.with_lock(|s| s.release(page, 1));
    }

    fn alloc_pages_order(&self, order: u32, _dma32: bool) -> Result<PhysicalAddress, OsError> {
        let count = 1_usize.checked_shl(order).ok_or(OsError::NoMemory)?;
        self.state.with_lock(|s| {
            let idx = s.find_run(count, count).ok_or(OsError::NoMemory)?;
            s.mark(idx, count, true);
            Ok(s.address_of(idx))
        })
    }

    fn free_pages_order(&self, base: PhysicalAddress, order: u32) {
        self.state.with_lock(|s| s.release(base, 1 << order));
    }

    fn alloc_contiguous(
        &self,
        size: u64,
        align: u64,
        _dma32: bool,
    ) -> Result<PhysicalAddress, OsError> {
        let count = frames_for(size)?;
        let align = usize::try_from((align >> PAGE_SHIFT).max(1))
            .map_err(|_| OsError::NoMemory)?;
        self.state.with_lock(|s| {
            if let Some(pa) = s.forced_contiguous.take() {
                s.forced.insert(pa.as_u64(), size);
                return Ok(pa);
            }
            let idx = s.find_run(count, align).ok_or(OsError::NoMemory)?;
            s.mark(idx, count, true);
            Ok(s.address_of(idx))
        })
    }

    fn free_contiguous(&self, base: PhysicalAddress, size: u64) {
        self.state.with_lock(|s| {
            if s.forced.remove(&base.as_u64()).is_none()
                && let Ok(count) = frames_for(size)
            {
                s.release(base, count);
            }
        });
    }

    fn clear_physical(&self, _base: PhysicalAddress, len: u64) -> Result<(), OsError> {
        self.state.with_lock(|s| s.cleared_bytes += len);
        Ok(())
    }

    fn map_kernel(
        &self,
        pages: &[PhysicalAddress],
        _cache: CacheMode,
    ) -> Result<VirtualAddress, OsError> {
        self.state.with_lock(|s| s.map((pages.len() as u64) << PAGE_SHIFT))
    }

    fn map_kernel_contiguous(
        &self,
        _base: PhysicalAddress,
        len: u64,
        _cache: CacheMode,
    ) -> Result<VirtualAddress, OsError> {
        self.state.with_lock(|s| s.map(len))
    }

    fn unmap_kernel(&self, va: VirtualAddress, _len: u64) {
        self.state.with_lock(|s| s.kernel_maps.remove(&va.as_u64()));
    }

    fn map_user(
        &self,
        pid: Pid,
        pages: &[PhysicalAddress],
        _cache: CacheMode,
        _read_only: bool,
    ) -> Result<VirtualAddress, OsError> {
        self.state
            .with_lock(|s| s.map_user(pid, (pages.len() as u64) << PAGE_SHIFT))
    }

    fn map_user_contiguous(
        &self,
        pid: Pid,
        _base: PhysicalAddress,
        len: u64,
        _cache: CacheMode,
        _read_only: bool,
    ) -> Result<VirtualAddress, OsError> {
        self.state.with_lock(|s| s.map_user(pid, len))
    }

    fn unmap_user(&self, pid: Pid, va: VirtualAddress, _len: u64) {
        self.state
            .with_lock(|s| s.user_maps.remove(&(pid, va.as_u64())));
    }

    fn sg_create(&self, ranges: &[(PhysicalAddress, u64)]) -> Result<SgTableId, OsError> {
        self.state.with_lock(|s| {
            if core::mem::take(&mut s.fail_next_sg) {
                return Err(OsError::NoMemory);
            }
            let id = s.next_sg;
            s.next_sg += 1;
            s.sg_tables.insert(id, ranges.len());
            Ok(SgTableId(id))
        })
    }

    fn sg_sync(&self, sg: SgTableId, _op: CacheOp) -> Result<(), OsError> {
        self.state.with_lock(|s| {
            if !s.sg_tables.contains_key(&sg.0) {
                return Err(OsError::Fault);
            }
            s.sg_syncs += 1;
            Ok(())
        })
    }

    fn sg_release(&self, sg: SgTableId) {
        self.state.with_lock(|s| s.sg_tables.remove(&sg.0));
    }

    fn dma_buf_attach(&self, fd: i32) -> Result<DmaBufAttachment, OsError> {
        self.state.with_lock(|s| {
            let ranges = s.dma_bufs.get(&fd).ok_or(OsError::BadDescriptor)?.clone();
            let id = s.next_attachment;
            s.next_attachment += 1;
            s.attachments.insert(id, fd);
            Ok(DmaBufAttachment { id, ranges })
        })
    }

    fn dma_buf_detach(&self, attachment: u64) {
        self.state.with_lock(|s| s.attachments.remove(&attachment));
    }

    fn pin_user_pages(
        &self,
        pid: Pid,
        va: VirtualAddress,
        count: usize,
    ) -> Result<Vec<PhysicalAddress>, OsError> {
        self.state.with_lock(|s| {
            let va = va.as_u64();
            let pages = s
                .user_buffers
                .iter()
                .filter(|b| b.pid == pid && b.va <= va)
                .find_map(|b| {
                    let first = usize::try_from((va - b.va) >> PAGE_SHIFT).ok()?;
                    b.pages.get(first..first.checked_add(count)?)
                })
                .ok_or(OsError::Fault)?
                .to_vec();
            s.pinned += pages.len() as u64;
            Ok(pages)
        })
    }

    fn unpin_user_pages(&self, pages: &[PhysicalAddress]) {
        self.state
            .with_lock(|s| s.pinned = s.pinned.saturating_sub(pages.len() as u64));
    }

    fn current_pid(&self) -> Pid {
        self.state.with_lock(|s| s.current_pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_blocks_are_naturally_aligned() {
        let os = SimulatedOs::new(PhysicalAddress::new(0x10_0000 + PAGE_SIZE), 64);
        let pa = os.alloc_pages_order(3, false).unwrap();
        assert_eq!(pa.as_u64() % (8 * PAGE_SIZE), 0);
        assert_eq!(os.stats().free_frames, 56);
        os.free_pages_order(pa, 3);
        assert_eq!(os.stats().free_frames, 64);
    }

    #[test]
    fn scatter_mode_hands_out_descending_pages() {
        let os = SimulatedOs::new(PhysicalAddress::new(0x10_0000), 8);
        os.scatter_pages(true);
        let a = os.alloc_page(false).unwrap();
        let b = os.alloc_page(false).unwrap();
        assert_eq!(a.as_u64() - b.as_u64(), PAGE_SIZE);
    }

    #[test]
    fn page_fault_injection_counts_down() {
        let os = SimulatedOs::new(PhysicalAddress::new(0x10_0000), 8);
        os.fail_page_allocs_after(Some(1));
        assert!(os.alloc_page(false).is_ok());
        assert_eq!(os.alloc_page(false), Err(OsError::NoMemory));
        os.fail_page_allocs_after(None);
        assert!(os.alloc_page(false).is_ok());
    }

    #[test]
    fn forced_contiguous_does_not_touch_the_pool() {
        let os = SimulatedOs::new(PhysicalAddress::new(0x10_0000), 8);
        let first = os
            .alloc_contiguous(2 * PAGE_SIZE, PAGE_SIZE, false)
            .unwrap();
        os.force_next_contiguous(first);
        assert_eq!(os.alloc_contiguous(PAGE_SIZE, PAGE_SIZE, false), Ok(first));
        os.free_contiguous(first, PAGE_SIZE);
        assert_eq!(os.stats().free_frames, 6);
    }

    #[test]
    fn pinning_needs_a_registered_buffer() {
        let os = SimulatedOs::new(PhysicalAddress::new(0x10_0000), 8);
        let pages = vec![PhysicalAddress::new(0x5000), PhysicalAddress::new(0x9000)];
        os.register_user_buffer(Pid(7), VirtualAddress::new(0x40_0000), pages.clone());
        assert_eq!(
            os.pin_user_pages(Pid(7), VirtualAddress::new(0x40_0000), 2),
            Ok(pages)
        );
        assert_eq!(
            os.pin_user_pages(Pid(8), VirtualAddress::new(0x40_0000), 1),
            Err(OsError::Fault)
        );
        assert_eq!(
            os.pin_user_pages(Pid(7), VirtualAddress::new(0x40_1000), 2),
            Err(OsError::Fault)
        );
        assert_eq!(os.stats().pinned_pages, 2);
    }
}
