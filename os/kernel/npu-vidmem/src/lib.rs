//! # NPU Video Memory
//!
//! Allocation backends, heap sub-allocator and mapping lifecycle for the
//! memory an NPU reads and writes: model weights, tensors and command
//! buffers.
//!
//! ## Overview
//!
//! ```text
//!            VidMem::allocate(name, request)
//!                       │
//!          ┌────────────┴─────────────┐
//!          │   AllocatorDescriptor    │  flags, rollback, statistics
//!          └────────────┬─────────────┘
//!                       │ AllocatorBackend
//!   reserved · dynamic-contiguous · dynamic-pages · exclusive heap
//!   dma-buf · user-virtual · user-physical
//!                       │
//!             PhysicalSegmentTable  ──►  mapping (kernel / user)
//!                                   ──►  CacheSync (clean / invalidate)
//! ```
//!
//! A request goes to one named backend. The backend obtains memory (from
//! the OS through [`OsMemory`], from a [`HeapSubAllocator`] carve-out, or
//! from an import) and describes it as a [`PhysicalSegmentTable`] of
//! device addresses. The returned [`VideoMemoryHandle`] owns that table and
//! any kernel or user mapping made over it.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use npu_vidmem::*;
//! # use npu_vidmem::sim::SimulatedOs;
//! # use npu_memory_addresses::PhysicalAddress;
//! let os = Arc::new(SimulatedOs::new(PhysicalAddress::new(0x8000_0000), 256));
//! let vm = VidMem::new(os.clone(), &PlatformConfig::default()).unwrap();
//!
//! let req = AllocRequest::new(64 * 1024).with_flags(AllocFlags::new().with_contiguous(true));
//! let mut buf = vm.allocate(DYNAMIC_CONTIGUOUS, &req).unwrap();
//! assert!(vm.query_physical(&buf).unwrap().is_contiguous());
//!
//! let va = vm.map_kernel(&mut buf).unwrap();
//! vm.flush(&buf, CacheOp::Clean).unwrap();
//! vm.unmap_kernel(&mut buf).unwrap();
//! vm.free(&mut buf).unwrap();
//! # let _ = va;
//! assert_eq!(vm.shutdown(), 0);
//! ```
//!
//! ## Concurrency
//!
//! All calls are synchronous. Per-handle calls are ordered by `&mut`
//! borrows of the handle; different handles may be used from different
//! threads at once. Each heap serialises its own operations through a
//! [`TicketLock`]. The registry is read-only once [`VidMem::new`] returns.
//!
//! ## Features
//!
//! - `sim` (off by default): the `sim` module, an in-memory [`OsMemory`]
//!   for tests. This crate's own tests enable it through a dev-dependency.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod backend;
mod cache;
mod config;
mod context;
mod error;
mod flags;
mod handle;
pub mod heap;
mod lock;
mod mapping;
mod os;
pub mod segment;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod translate;

pub use backend::{
    AllocRequest, AllocatorBackend, AllocatorDescriptor, BackendEnv, BackendStats, DMA_BUF,
    DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, MemorySource, RESERVED, USER_PHYSICAL, USER_VIRTUAL,
};
pub use cache::{CacheOp, CacheSync};
pub use config::{
    ConfigError, DEFAULT_DYNAMIC_MAX_ORDER, EnabledBackends, HeapConfig, MAX_SUPPORTED_ORDER,
    PlatformConfig,
};
pub use context::VidMem;
pub use error::{OsError, Result, VidMemError};
pub use flags::{AllocFlags, CacheMode, Capabilities};
pub use handle::{
    BackendAllocation, BackendPrivate, HandleId, HandleState, UserMapping, UserMappingToken,
    VideoMemoryHandle,
};
pub use heap::{HeapBlock, HeapError, HeapStats, HeapSubAllocator};
pub use lock::{TicketLock, TicketLockGuard};
pub use mapping::MappedRange;
pub use os::{DmaBufAttachment, OsMemory, Pid, SgTableId};
pub use segment::{PhysicalSegmentTable, Segment, SegmentTableBuilder};
pub use translate::AddressTranslation;
