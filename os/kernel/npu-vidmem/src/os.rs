//! The seam to the host kernel's memory services.
//!
//! Everything the subsystem needs from the OS goes through [`OsMemory`]:
//! page allocation at three granularities, kernel and user page-table
//! mapping, DMA scatter lists, dma-buf attachment, user page pinning and the
//! process-id query. Implementations must be internally synchronised; every
//! method takes `&self` and may be called from any thread.
//!
//! All physical addresses crossing this trait are in the CPU domain. The
//! backends translate to device addresses themselves.

use crate::cache::CacheOp;
use crate::error::OsError;
use crate::flags::CacheMode;
use alloc::vec::Vec;
use core::fmt;
use npu_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Process identifier as reported by the OS.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Pid(pub u32);

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Opaque handle of an OS scatter-gather table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SgTableId(pub u64);

/// A successful dma-buf attachment: the reference to drop on detach and the
/// CPU-physical ranges of the exporter's scatter list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DmaBufAttachment {
    pub id: u64,
    pub ranges: Vec<(PhysicalAddress, u64)>,
}

/// OS memory services consumed by the backends, the mapping manager and the
/// cache controller.
///
/// Returned frames and mapping addresses are page aligned. A `dma32` hint asks
/// for memory below 4 GiB; callers verify the result and must not rely on the
/// hint being honoured.
pub trait OsMemory: Send + Sync {
    /// Allocate one base page.
    ///
    /// # Errors
    /// [`OsError::NoMemory`] when no page is available.
    fn alloc_page(&self, dma32: bool) -> Result<PhysicalAddress, OsError>;
    fn free_page(&self, page: PhysicalAddress);

    /// Allocate `2^order` naturally aligned, physically adjacent pages.
    ///
    /// # Errors
    /// [`OsError::NoMemory`] when no free block of that order exists.
    fn alloc_pages_order(&self, order: u32, dma32: bool) -> Result<PhysicalAddress, OsError>;
    fn free_pages_order(&self, base: PhysicalAddress, order: u32);

    /// Allocate `size` bytes of physically contiguous memory aligned to `align`.
    ///
    /// # Errors
    /// [`OsError::NoMemory`] when no run of that size and alignment is free.
    fn alloc_contiguous(
        &self,
        size: u64,
        align: u64,
        dma32: bool,
    ) -> Result<PhysicalAddress, OsError>;
    fn free_contiguous(&self, base: PhysicalAddress, size: u64);

    /// Fill `[base, base + len)` with zeroes.
    ///
    /// # Errors
    /// [`OsError::Fault`] if the range cannot be mapped for clearing.
    fn clear_physical(&self, base: PhysicalAddress, len: u64) -> Result<(), OsError>;

    /// Map a list of pages into one virtually contiguous kernel range.
    ///
    /// # Errors
    /// [`OsError::NoMemory`] or [`OsError::Fault`] when the kernel address
    /// space cannot take the mapping.
    fn map_kernel(
        &self,
        pages: &[PhysicalAddress],
        cache: CacheMode,
    ) -> Result<VirtualAddress, OsError>;

    /// Remap a physically contiguous run into kernel space.
    ///
    /// # Errors
    /// As [`map_kernel`](Self::map_kernel).
    fn map_kernel_contiguous(
        &self,
        base: PhysicalAddress,
        len: u64,
        cache: CacheMode,
    ) -> Result<VirtualAddress, OsError>;

    fn unmap_kernel(&self, va: VirtualAddress, len: u64);

    /// Map a list of pages into the address space of `pid`.
    ///
    /// # Errors
    /// [`OsError::Fault`] if the process has no room for the mapping or no
    /// longer exists.
    fn map_user(
        &self,
        pid: Pid,
        pages: &[PhysicalAddress],
        cache: CacheMode,
        read_only: bool,
    ) -> Result<VirtualAddress, OsError>;

    /// # Errors
    /// As [`map_user`](Self::map_user).
    fn map_user_contiguous(
        &self,
        pid: Pid,
        base: PhysicalAddress,
        len: u64,
        cache: CacheMode,
        read_only: bool,
    ) -> Result<VirtualAddress, OsError>;

    fn unmap_user(&self, pid: Pid, va: VirtualAddress, len: u64);

    /// Build a scatter list over CPU-physical ranges for cache maintenance.
    ///
    /// # Errors
    /// [`OsError::NoMemory`] if the list cannot be allocated.
    fn sg_create(&self, ranges: &[(PhysicalAddress, u64)]) -> Result<SgTableId, OsError>;

    /// # Errors
    /// [`OsError::Fault`] for a released or unknown scatter list.
    fn sg_sync(&self, sg: SgTableId, op: CacheOp) -> Result<(), OsError>;
    fn sg_release(&self, sg: SgTableId);

    /// Take a reference on the dma-buf behind `fd`.
    ///
    /// # Errors
    /// [`OsError::BadDescriptor`] if `fd` is not a dma-buf.
    fn dma_buf_attach(&self, fd: i32) -> Result<DmaBufAttachment, OsError>;
    fn dma_buf_detach(&self, attachment: u64);

    /// Pin `count` pages of `pid` starting at the page-aligned `va`.
    ///
    /// # Errors
    /// [`OsError::Fault`] if any page in the range is not mapped.
    fn pin_user_pages(
        &self,
        pid: Pid,
        va: VirtualAddress,
        count: usize,
    ) -> Result<Vec<PhysicalAddress>, OsError>;
    fn unpin_user_pages(&self, pages: &[PhysicalAddress]);

    /// Process on whose behalf the current thread is running.
    fn current_pid(&self) -> Pid;
}
