//! The subsystem context: OS seam plus backend registry.
//!
//! There are no globals. Each [`VidMem`] owns its registry, so independent
//! instances (one per device, or one per test) can coexist. The registry is
//! filled in [`VidMem::new`] and read-only afterwards.

use crate::backend::{
    AllocRequest, AllocatorBackend, AllocatorDescriptor, BackendStats, ContiguousReserved,
    DMA_BUF, DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, DynamicContiguous, DynamicPages, ExclusiveHeap,
    ImportedDmaBuf, ImportedUserPhysical, ImportedUserVirtual, RESERVED, USER_PHYSICAL,
    USER_VIRTUAL,
};
use crate::cache::CacheOp;
use crate::config::{ConfigError, HeapConfig, PlatformConfig};
use crate::error::{Result, VidMemError};
use crate::flags::{CacheMode, Capabilities};
use crate::handle::{HandleId, HandleState, UserMappingToken, VideoMemoryHandle};
use crate::heap::{HeapStats, HeapSubAllocator};
use crate::os::OsMemory;
use crate::segment::PhysicalSegmentTable;
use crate::translate::AddressTranslation;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, warn};
use npu_memory_addresses::{DeviceAddress, PAGE_SIZE, PhysicalAddress, VirtualAddress};

pub struct VidMem {
    os: Arc<dyn OsMemory>,
    registry: BTreeMap<String, Arc<AllocatorDescriptor>>,
    next_handle: AtomicU64,
}

impl VidMem {
    /// Validate `config` and register every backend it enables.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] for an invalid configuration or a
    /// heap that cannot be set up.
    pub fn new(os: Arc<dyn OsMemory>, config: &PlatformConfig) -> Result<Self> {
        config.validate()?;
        let mut vm = Self {
            os,
            registry: BTreeMap::new(),
            next_handle: AtomicU64::new(1),
        };

        let contiguous = Capabilities::new().with_contiguous_only(true);
        let imported = Capabilities::new().with_imports(true);
        let enabled = config.backends;
        let builtins: [(bool, &str, Capabilities, Box<dyn AllocatorBackend>); 6] = [
            (
                enabled.reserved(),
                RESERVED,
                contiguous,
                Box::new(ContiguousReserved::new()),
            ),
            (
                enabled.dynamic_contiguous(),
                DYNAMIC_CONTIGUOUS,
                contiguous,
                Box::new(DynamicContiguous::new(config.dynamic_max_order)),
            ),
            (
                enabled.dynamic_pages(),
                DYNAMIC_PAGES,
                Capabilities::new(),
                Box::new(DynamicPages::new()),
            ),
            (
                enabled.dma_buf(),
                DMA_BUF,
                imported,
                Box::new(ImportedDmaBuf::new()),
            ),
            (
                enabled.user_virtual(),
                USER_VIRTUAL,
                imported,
                Box::new(ImportedUserVirtual::new()),
            ),
            (
                enabled.user_physical(),
                USER_PHYSICAL,
                imported,
                Box::new(ImportedUserPhysical::new()),
            ),
        ];
        for (on, name, caps, backend) in builtins {
            if on {
                vm.register(name, caps, AddressTranslation::Identity, backend)?;
            }
        }
        for heap in &config.heaps {
            vm.register_heap(heap)?;
        }
        Ok(vm)
    }

    fn register_heap(&mut self, config: &HeapConfig) -> Result<()> {
        let translation = config.translation.unwrap_or_default();
        let heap = HeapSubAllocator::new(
            config.name.clone(),
            translation.to_device(config.base),
            config.size,
            config.granularity,
        )?;
        let caps = Capabilities::new()
            .with_contiguous_only(true)
            .with_dma32_only(config.dma32)
            .with_cache_mode(config.cache_mode);
        let backend = Box::new(ExclusiveHeap::new(heap));
        self.register(&config.name, caps, translation, backend)
    }

    /// Add a backend under `name`. Only meaningful before the first
    /// allocation; the registry is not locked.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] if `name` is empty or taken.
    pub fn register(
        &mut self,
        name: &str,
        capabilities: Capabilities,
        translation: AddressTranslation,
        backend: Box<dyn AllocatorBackend>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(ConfigError::EmptyName.into());
        }
        if self.registry.contains_key(name) {
            return Err(ConfigError::DuplicateName.into());
        }
        info!("registered backend {name} ({capabilities:?})");
        let descriptor = AllocatorDescriptor::new(name, capabilities, translation, backend);
        self.registry.insert(name.to_string(), Arc::new(descriptor));
        Ok(())
    }

    #[must_use]
    pub fn os(&self) -> &dyn OsMemory {
        &*self.os
    }

    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&AllocatorDescriptor> {
        self.registry.get(name).map(|d| &**d)
    }

    #[must_use]
    pub fn backend_stats(&self, name: &str) -> Option<BackendStats> {
        self.registry.get(name).map(|d| d.stats())
    }

    /// Sub-allocator statistics of a heap backend.
    #[must_use]
    pub fn heap_stats(&self, name: &str) -> Option<HeapStats> {
        self.registry.get(name)?.backend().heap_stats()
    }

    fn lookup(&self, name: &str) -> Result<&Arc<AllocatorDescriptor>> {
        self.registry
            .get(name)
            .ok_or(VidMemError::InvalidArgument("unknown backend"))
    }

    /// The handle's descriptor, provided it was registered in this context.
    fn owner_of(&self, handle: &VideoMemoryHandle) -> Result<&Arc<AllocatorDescriptor>> {
        match self.registry.get(handle.allocator.name()) {
            Some(d) if Arc::ptr_eq(d, &handle.allocator) => Ok(d),
            _ => Err(VidMemError::InvalidArgument("handle belongs to another context")),
        }
    }

    fn live_owner_of(&self, handle: &VideoMemoryHandle) -> Result<&Arc<AllocatorDescriptor>> {
        let d = self.owner_of(handle)?;
        if handle.state == HandleState::Released {
            return Err(VidMemError::InvalidArgument("handle has been freed"));
        }
        Ok(d)
    }

    /// Allocate `request.size` bytes from backend `name`.
    ///
    /// # Errors
    /// - [`VidMemError::InvalidArgument`] for a zero size, a bad alignment
    ///   or an unknown backend.
    /// - Whatever the backend reports; nothing is left allocated.
    pub fn allocate(&self, name: &str, request: &AllocRequest) -> Result<VideoMemoryHandle> {
        if request.size == 0 {
            return Err(VidMemError::InvalidArgument("zero-sized allocation"));
        }
        let align = match request.align {
            0 => PAGE_SIZE,
            a if a.is_power_of_two() => a.max(PAGE_SIZE),
            _ => return Err(VidMemError::InvalidArgument("alignment is not a power of two")),
        };
        let descriptor = self.lookup(name)?;
        let request = AllocRequest {
            align,
            ..request.clone()
        };

        let (backing, cache) = descriptor.allocate(&*self.os, &request)?;
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            "{id:?}: {name} allocated {:#x} bytes ({:#x} rounded) in {} segment(s)",
            request.size,
            backing.rounded_size,
            backing.table.segment_count()
        );
        Ok(VideoMemoryHandle::new(
            id,
            request.size,
            align,
            request.flags,
            Arc::clone(descriptor),
            backing,
            cache,
        ))
    }

    /// Tear down all mappings and return the memory. Freeing a handle twice
    /// is a no-op.
    ///
    /// The scatter list is kept until the backend has taken the memory back,
    /// so a handle whose free failed can still be flushed.
    ///
    /// # Errors
    /// - [`VidMemError::InvalidArgument`] if the handle belongs to another
    ///   context.
    /// - The backend's free error; the handle then stays live.
    pub fn free(&self, handle: &mut VideoMemoryHandle) -> Result<()> {
        let descriptor = Arc::clone(self.owner_of(handle)?);
        if handle.state == HandleState::Released {
            debug!("{:?}: already released", handle.id);
            return Ok(());
        }
        let env = descriptor.env(&*self.os);
        let backend = descriptor.backend();

        if let Some(range) = handle.kernel.take() {
            backend.unmap_kernel(&env, &range);
        }
        if let Some(user) = handle.user.take() {
            warn!(
                "{:?}: freed while mapped into {:?}, unmapping",
                handle.id, user.owner
            );
            backend.unmap_user(&env, user.owner, &user.range);
        }

        descriptor.free(&*self.os, &mut handle.backing)?;
        if let Some(cache) = handle.cache.take() {
            cache.release(&*self.os);
        }
        handle.state = HandleState::Released;
        debug!("{:?}: released", handle.id);
        Ok(())
    }

    /// Map into kernel space; returns the address of the first byte.
    ///
    /// # Errors
    /// - [`VidMemError::InvalidArgument`] for a freed or foreign handle, or
    ///   one that is already mapped.
    /// - Mapping failures from the OS.
    pub fn map_kernel(&self, handle: &mut VideoMemoryHandle) -> Result<VirtualAddress> {
        let descriptor = Arc::clone(self.live_owner_of(handle)?);
        if handle.kernel.is_some() {
            return Err(VidMemError::InvalidArgument("kernel mapping already exists"));
        }
        let env = descriptor.env(&*self.os);
        let range = descriptor
            .backend()
            .map_kernel(&env, &handle.backing.table)?;
        handle.kernel = Some(range);
        Ok(range.address)
    }

    /// Remove the kernel mapping. Does nothing if there is none.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] for a freed or foreign handle.
    pub fn unmap_kernel(&self, handle: &mut VideoMemoryHandle) -> Result<()> {
        let descriptor = Arc::clone(self.live_owner_of(handle)?);
        if let Some(range) = handle.kernel.take() {
            descriptor
                .backend()
                .unmap_kernel(&descriptor.env(&*self.os), &range);
        }
        Ok(())
    }

    /// Map into the calling process. The returned token is the only way to
    /// remove the mapping again.
    ///
    /// # Errors
    /// As [`map_kernel`](Self::map_kernel).
    pub fn map_user(
        &self,
        handle: &mut VideoMemoryHandle,
    ) -> Result<(VirtualAddress, UserMappingToken)> {
        let descriptor = Arc::clone(self.live_owner_of(handle)?);
        if handle.user.is_some() {
            return Err(VidMemError::InvalidArgument("user mapping already exists"));
        }
        let pid = self.os.current_pid();
        let env = descriptor.env(&*self.os);
        let range = descriptor.backend().map_user(
            &env,
            &handle.backing.table,
            pid,
            handle.flags.read_only(),
        )?;
        let token = handle.record_user_mapping(range, pid);
        Ok((range.address, token))
    }

    /// Remove the user mapping `token` was issued for.
    ///
    /// Returns `Ok(false)` and leaves the mapping in place when the token is
    /// stale or the calling process is not the one that created it.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] for a freed or foreign handle.
    pub fn unmap_user(
        &self,
        handle: &mut VideoMemoryHandle,
        token: &UserMappingToken,
    ) -> Result<bool> {
        let descriptor = Arc::clone(self.live_owner_of(handle)?);
        let Some(user) = handle.user else {
            return Ok(false);
        };
        let caller = self.os.current_pid();
        if !handle.token_matches(token) || caller != user.owner {
            warn!(
                "{:?}: {caller:?} may not unmap the mapping of {:?}",
                handle.id, user.owner
            );
            return Ok(false);
        }
        descriptor
            .backend()
            .unmap_user(&descriptor.env(&*self.os), user.owner, &user.range);
        handle.user = None;
        Ok(true)
    }

    /// Cache maintenance before or after device access.
    ///
    /// # Errors
    /// - [`VidMemError::InvalidArgument`] for a freed or foreign handle.
    /// - Scatter list sync failures from the OS.
    pub fn flush(&self, handle: &VideoMemoryHandle, op: CacheOp) -> Result<()> {
        let descriptor = self.live_owner_of(handle)?;
        let Some(cache) = &handle.cache else {
            return Ok(());
        };
        descriptor
            .backend()
            .flush_cache(&descriptor.env(&*self.os), cache, op)
    }

    /// Read-only view of the handle's physical layout.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] for a freed or foreign handle.
    pub fn query_physical<'h>(
        &self,
        handle: &'h VideoMemoryHandle,
    ) -> Result<&'h PhysicalSegmentTable> {
        self.live_owner_of(handle)?;
        Ok(&handle.backing.table)
    }

    /// # Errors
    /// [`VidMemError::InvalidArgument`] if the handle belongs to another
    /// context.
    pub fn cpu_to_device(
        &self,
        handle: &VideoMemoryHandle,
        pa: PhysicalAddress,
    ) -> Result<DeviceAddress> {
        Ok(self.owner_of(handle)?.cpu_to_device(pa))
    }

    /// # Errors
    /// As [`cpu_to_device`](Self::cpu_to_device).
    pub fn device_to_cpu(
        &self,
        handle: &VideoMemoryHandle,
        da: DeviceAddress,
    ) -> Result<PhysicalAddress> {
        Ok(self.owner_of(handle)?.device_to_cpu(da))
    }

    /// Cache attribute used for the handle's mappings.
    ///
    /// # Errors
    /// As [`cpu_to_device`](Self::cpu_to_device).
    pub fn cache_mode(&self, handle: &VideoMemoryHandle) -> Result<CacheMode> {
        Ok(self.owner_of(handle)?.capabilities().cache_mode())
    }

    /// Run every backend's `uninit` and return the number of allocations
    /// that were never freed.
    #[must_use]
    pub fn shutdown(self) -> usize {
        let mut leaked = 0;
        for (name, descriptor) in &self.registry {
            let live = descriptor.stats().live_allocations;
            let inside = descriptor.backend().uninit(&descriptor.env(&*self.os));
            let count = usize::try_from(live).unwrap_or(usize::MAX).max(inside);
            if count > 0 {
                warn!("{name}: {count} allocation(s) outstanding at shutdown");
            }
            leaked += count;
        }
        info!("video memory shut down, {leaked} leak(s)");
        leaked
    }
}
