//! # Allocator backends
//!
//! Every source of video memory implements [`AllocatorBackend`]. The layer
//! above never branches on the backend kind: it talks to an
//! [`AllocatorDescriptor`], which wraps one backend with its name,
//! capabilities and address translation and applies the rules shared by all
//! of them (contiguity and DMA32 verification, zero-fill, rollback,
//! statistics).
//!
//! | Backend | Source | Segments |
//! |---|---|---|
//! | [`ContiguousReserved`] | OS contiguous allocator | 1 |
//! | [`DynamicContiguous`] | OS order-N allocator | 1 |
//! | [`DynamicPages`] | OS single pages | 1..N |
//! | [`ExclusiveHeap`] | fixed carve-out, sub-allocated | 1 |
//! | [`ImportedDmaBuf`] | caller dma-buf fd | 1..N |
//! | [`ImportedUserVirtual`] | pinned user pages | 1..N |
//! | [`ImportedUserPhysical`] | caller range list | 1..N |

mod dma_buf;
mod dynamic_contiguous;
mod dynamic_pages;
mod exclusive_heap;
mod reserved;
mod user_physical;
mod user_virtual;

pub use dma_buf::ImportedDmaBuf;
pub use dynamic_contiguous::DynamicContiguous;
pub use dynamic_pages::DynamicPages;
pub use exclusive_heap::ExclusiveHeap;
pub use reserved::ContiguousReserved;
pub use user_physical::ImportedUserPhysical;
pub use user_virtual::ImportedUserVirtual;

use crate::cache::{CacheOp, CacheSync};
use crate::error::{Result, VidMemError};
use crate::flags::{AllocFlags, Capabilities};
use crate::handle::BackendAllocation;
use crate::heap::HeapStats;
use crate::mapping::{self, MappedRange};
use crate::os::{OsMemory, Pid};
use crate::segment::PhysicalSegmentTable;
use crate::translate::AddressTranslation;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, error, warn};
use npu_memory_addresses::{DeviceAddress, PhysicalAddress, VirtualAddress};

/// Registry name of the OS-contiguous backend.
pub const RESERVED: &str = "reserved";
pub const DYNAMIC_CONTIGUOUS: &str = "dynamic-contiguous";
pub const DYNAMIC_PAGES: &str = "dynamic-pages";
pub const DMA_BUF: &str = "dma-buf";
pub const USER_VIRTUAL: &str = "user-virtual";
pub const USER_PHYSICAL: &str = "user-physical";

/// Where the memory of an allocation comes from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum MemorySource {
    /// Allocated by the backend.
    #[default]
    Fresh,
    /// Imported from a dma-buf file descriptor.
    DmaBuf(i32),
    /// `size` bytes of the calling process starting at this address.
    UserVirtual(VirtualAddress),
    /// Caller-provided CPU-physical ranges.
    UserPhysical(Vec<(PhysicalAddress, u64)>),
}

/// An allocation request.
///
/// ```rust
/// # use npu_vidmem::{AllocFlags, AllocRequest};
/// let req = AllocRequest::new(64 * 1024)
///     .with_align(16 * 1024)
///     .with_flags(AllocFlags::new().with_contiguous(true));
/// assert!(req.flags.contiguous());
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocRequest {
    pub size: u64,
    /// Power of two; `0` selects page alignment.
    pub align: u64,
    pub flags: AllocFlags,
    pub source: MemorySource,
}

impl AllocRequest {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }
}

/// Everything a backend may touch while serving one call.
#[derive(Copy, Clone)]
pub struct BackendEnv<'a> {
    pub os: &'a dyn OsMemory,
    pub translation: &'a AddressTranslation,
    pub capabilities: Capabilities,
    pub name: &'a str,
}

impl BackendEnv<'_> {
    /// DMA32 is requested by the caller or promised by the backend.
    #[must_use]
    pub const fn wants_dma32(&self, flags: AllocFlags) -> bool {
        flags.dma32() || self.capabilities.dma32_only()
    }

    #[must_use]
    pub fn to_device(&self, pa: PhysicalAddress) -> DeviceAddress {
        self.translation.to_device(pa)
    }

    #[must_use]
    pub fn to_cpu(&self, da: DeviceAddress) -> PhysicalAddress {
        self.translation.to_cpu(da)
    }
}

/// One source of video memory.
///
/// `allocate` must leave nothing behind when it fails. `free` is only called
/// with a non-empty table produced by the same backend.
pub trait AllocatorBackend: Send + Sync {
    /// # Errors
    /// - [`VidMemError::OutOfMemory`] when the source is exhausted.
    /// - [`VidMemError::InvalidArgument`] for a request the backend cannot serve.
    fn allocate(&self, env: &BackendEnv<'_>, request: &AllocRequest) -> Result<BackendAllocation>;

    /// # Errors
    /// Backend-specific; the allocation stays owned by the caller on failure.
    fn free(&self, env: &BackendEnv<'_>, backing: &mut BackendAllocation) -> Result<()>;

    /// # Errors
    /// Propagates mapping failures from the OS.
    fn map_kernel(
        &self,
        env: &BackendEnv<'_>,
        table: &PhysicalSegmentTable,
    ) -> Result<MappedRange> {
        mapping::map_kernel(env, table)
    }

    fn unmap_kernel(&self, env: &BackendEnv<'_>, range: &MappedRange) {
        mapping::unmap_kernel(env, range);
    }

    /// # Errors
    /// Propagates mapping failures from the OS.
    fn map_user(
        &self,
        env: &BackendEnv<'_>,
        table: &PhysicalSegmentTable,
        pid: Pid,
        read_only: bool,
    ) -> Result<MappedRange> {
        mapping::map_user(env, table, pid, read_only)
    }

    fn unmap_user(&self, env: &BackendEnv<'_>, pid: Pid, range: &MappedRange) {
        mapping::unmap_user(env, pid, range);
    }

    /// # Errors
    /// Propagates scatter list sync failures from the OS.
    fn flush_cache(&self, env: &BackendEnv<'_>, sync: &CacheSync, op: CacheOp) -> Result<()> {
        sync.sync(env.os, op)
    }

    /// Tear down at shutdown; returns the number of allocations still
    /// outstanding inside the backend.
    fn uninit(&self, _env: &BackendEnv<'_>) -> usize {
        0
    }

    fn heap_stats(&self) -> Option<HeapStats> {
        None
    }
}

/// Counters kept per registered backend.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BackendStats {
    pub live_allocations: u64,
    pub live_bytes: u64,
    pub total_allocations: u64,
    pub failed_allocations: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    live_allocations: AtomicU64,
    live_bytes: AtomicU64,
    total_allocations: AtomicU64,
    failed_allocations: AtomicU64,
}

/// A registered backend. Immutable after registration.
pub struct AllocatorDescriptor {
    name: String,
    capabilities: Capabilities,
    translation: AddressTranslation,
    backend: Box<dyn AllocatorBackend>,
    stats: StatCounters,
}

impl AllocatorDescriptor {
    pub fn new(
        name: impl Into<String>,
        capabilities: Capabilities,
        translation: AddressTranslation,
        backend: Box<dyn AllocatorBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            translation,
            backend,
            stats: StatCounters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[must_use]
    pub const fn translation(&self) -> &AddressTranslation {
        &self.translation
    }

    #[must_use]
    pub fn cpu_to_device(&self, pa: PhysicalAddress) -> DeviceAddress {
        self.translation.to_device(pa)
    }

    #[must_use]
    pub fn device_to_cpu(&self, da: DeviceAddress) -> PhysicalAddress {
        self.translation.to_cpu(da)
    }

    pub(crate) fn backend(&self) -> &dyn AllocatorBackend {
        &*self.backend
    }

    pub(crate) fn env<'a>(&'a self, os: &'a dyn OsMemory) -> BackendEnv<'a> {
        BackendEnv {
            os,
            translation: &self.translation,
            capabilities: self.capabilities,
            name: &self.name,
        }
    }

    #[must_use]
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            live_allocations: self.stats.live_allocations.load(Ordering::Relaxed),
            live_bytes: self.stats.live_bytes.load(Ordering::Relaxed),
            total_allocations: self.stats.total_allocations.load(Ordering::Relaxed),
            failed_allocations: self.stats.failed_allocations.load(Ordering::Relaxed),
        }
    }

    /// Allocate through the backend, enforce the request's flags and set up
    /// cache maintenance.
    ///
    /// On any failure after the backend succeeded, the allocation is handed
    /// back to the backend before the error is returned.
    pub(crate) fn allocate(
        &self,
        os: &dyn OsMemory,
        request: &AllocRequest,
    ) -> Result<(BackendAllocation, Option<CacheSync>)> {
        let res = self.allocate_checked(os, request);
        match &res {
            Ok((backing, _)) => {
                self.stats.total_allocations.fetch_add(1, Ordering::Relaxed);
                self.stats.live_allocations.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .live_bytes
                    .fetch_add(backing.rounded_size, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.failed_allocations.fetch_add(1, Ordering::Relaxed);
            }
        }
        res
    }

    fn allocate_checked(
        &self,
        os: &dyn OsMemory,
        request: &AllocRequest,
    ) -> Result<(BackendAllocation, Option<CacheSync>)> {
        let env = self.env(os);
        let imports = self.capabilities.imports();
        if request.flags.zeroed() && imports {
            return Err(VidMemError::NotSupported("imported memory cannot be zero-filled"));
        }

        let mut backing = self.backend.allocate(&env, request)?;
        debug_assert!(backing.table.total_len() >= request.size);

        let verdict = if request.flags.contiguous() && !backing.table.is_contiguous() {
            Err(VidMemError::NotSupported("backend cannot provide contiguous memory"))
        } else if env.wants_dma32(request.flags) && !backing.table.fits_dma32() {
            Err(if imports {
                VidMemError::InvalidArgument("imported memory lies above 4 GiB")
            } else {
                VidMemError::OutOfMemory("no memory below 4 GiB")
            })
        } else if request.flags.zeroed() {
            backing
                .table
                .segments()
                .iter()
                .try_for_each(|s| os.clear_physical(env.to_cpu(s.address), s.len))
                .map_err(VidMemError::from)
        } else {
            Ok(())
        };

        match verdict.and_then(|()| CacheSync::setup(&env, &backing.table)) {
            Ok(cache) => Ok((backing, cache)),
            Err(e) => {
                warn!(
                    "{}: rolling back allocation of {:#x} bytes: {e}",
                    self.name, request.size
                );
                if let Err(free_err) = self.backend.free(&env, &mut backing) {
                    error!("{}: rollback failed: {free_err}", self.name);
                }
                Err(e)
            }
        }
    }

    /// Return memory to the backend. A no-op once the table is empty.
    pub(crate) fn free(&self, os: &dyn OsMemory, backing: &mut BackendAllocation) -> Result<()> {
        if backing.table.is_empty() {
            return Ok(());
        }
        let env = self.env(os);
        self.backend.free(&env, backing)?;
        self.stats.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .live_bytes
            .fetch_sub(backing.rounded_size, Ordering::Relaxed);
        debug!("{}: freed {:#x} bytes", self.name, backing.rounded_size);
        backing.table.clear();
        backing.private = crate::handle::BackendPrivate::None;
        Ok(())
    }
}

impl core::fmt::Debug for AllocatorDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AllocatorDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("translation", &self.translation)
            .finish_non_exhaustive()
    }
}

/// Shared by the backends that only hand out fresh memory.
pub(crate) fn require_fresh(request: &AllocRequest) -> Result<()> {
    if request.source == MemorySource::Fresh {
        Ok(())
    } else {
        Err(VidMemError::InvalidArgument(
            "backend does not import memory",
        ))
    }
}
