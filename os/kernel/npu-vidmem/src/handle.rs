use crate::backend::AllocatorDescriptor;
use crate::cache::CacheSync;
use crate::flags::AllocFlags;
use crate::heap::HeapBlock;
use crate::mapping::MappedRange;
use crate::os::Pid;
use crate::segment::PhysicalSegmentTable;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::warn;
use npu_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Context-unique handle number, for logs.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HandleId(pub u64);

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleState {
    Live,
    /// Memory has been returned; only `free` (a no-op) is still accepted.
    Released,
}

/// What a backend needs to give the memory back.
#[derive(Debug, Default, Eq, PartialEq)]
pub enum BackendPrivate {
    #[default]
    None,
    Reserved {
        base: PhysicalAddress,
        size: u64,
    },
    Order {
        base: PhysicalAddress,
        order: u32,
    },
    Pages(Vec<PhysicalAddress>),
    HeapBlock(HeapBlock),
    DmaBuf {
        attachment: u64,
    },
    Pinned(Vec<PhysicalAddress>),
}

/// Result of a backend allocation: the segment table plus the backend's own
/// bookkeeping.
#[derive(Debug, Default)]
pub struct BackendAllocation {
    pub table: PhysicalSegmentTable,
    /// Size after rounding to the backend's granularity.
    pub rounded_size: u64,
    pub private: BackendPrivate,
}

/// A user mapping and the process that created it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserMapping {
    pub range: MappedRange,
    pub owner: Pid,
    serial: u64,
}

/// Proof of having created a user mapping; required to tear it down.
#[derive(Debug, Eq, PartialEq)]
#[must_use = "the token is needed to unmap the user mapping"]
pub struct UserMappingToken {
    handle: HandleId,
    serial: u64,
    owner: Pid,
}

impl UserMappingToken {
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        self.handle
    }

    #[must_use]
    pub const fn owner(&self) -> Pid {
        self.owner
    }
}

/// One allocation, from `allocate` to `free`.
///
/// Only the owning context may mutate it; all state changes go through
/// `&mut self` so per-handle calls are ordered by the borrow checker.
pub struct VideoMemoryHandle {
    pub(crate) id: HandleId,
    pub(crate) size: u64,
    pub(crate) align: u64,
    pub(crate) flags: AllocFlags,
    pub(crate) allocator: Arc<AllocatorDescriptor>,
    pub(crate) backing: BackendAllocation,
    pub(crate) kernel: Option<MappedRange>,
    pub(crate) user: Option<UserMapping>,
    pub(crate) cache: Option<CacheSync>,
    pub(crate) state: HandleState,
    user_serial: u64,
}

impl VideoMemoryHandle {
    pub(crate) fn new(
        id: HandleId,
        size: u64,
        align: u64,
        flags: AllocFlags,
        allocator: Arc<AllocatorDescriptor>,
        backing: BackendAllocation,
        cache: Option<CacheSync>,
    ) -> Self {
        Self {
            id,
            size,
            align,
            flags,
            allocator,
            backing,
            kernel: None,
            user: None,
            cache,
            state: HandleState::Live,
            user_serial: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// Size the caller asked for.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn rounded_size(&self) -> u64 {
        self.backing.rounded_size
    }

    #[must_use]
    pub const fn align(&self) -> u64 {
        self.align
    }

    #[must_use]
    pub const fn flags(&self) -> AllocFlags {
        self.flags
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.allocator.name()
    }

    #[must_use]
    pub const fn state(&self) -> HandleState {
        self.state
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.state, HandleState::Live)
    }

    #[must_use]
    pub const fn segments(&self) -> &PhysicalSegmentTable {
        &self.backing.table
    }

    #[must_use]
    pub const fn backend_private(&self) -> &BackendPrivate {
        &self.backing.private
    }

    #[must_use]
    pub fn kernel_address(&self) -> Option<VirtualAddress> {
        self.kernel.map(|m| m.address)
    }

    #[must_use]
    pub fn user_address(&self) -> Option<VirtualAddress> {
        self.user.map(|m| m.range.address)
    }

    /// Process that created the current user mapping.
    #[must_use]
    pub fn user_owner(&self) -> Option<Pid> {
        self.user.map(|m| m.owner)
    }

    #[must_use]
    pub const fn has_cache_sync(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn record_user_mapping(
        &mut self,
        range: MappedRange,
        owner: Pid,
    ) -> UserMappingToken {
        self.user_serial += 1;
        self.user = Some(UserMapping {
            range,
            owner,
            serial: self.user_serial,
        });
        UserMappingToken {
            handle: self.id,
            serial: self.user_serial,
            owner,
        }
    }

    /// `true` if `token` was issued for the current user mapping.
    pub(crate) fn token_matches(&self, token: &UserMappingToken) -> bool {
        self.user.is_some_and(|m| {
            (token.handle, token.serial, token.owner) == (self.id, m.serial, m.owner)
        })
    }
}

impl fmt::Debug for VideoMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoMemoryHandle")
            .field("id", &self.id)
            .field("backend", &self.allocator.name())
            .field("size", &self.size)
            .field("segments", &self.backing.table.segment_count())
            .field("kernel", &self.kernel_address())
            .field("user", &self.user_address())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for VideoMemoryHandle {
    fn drop(&mut self) {
        if self.is_live() && !self.backing.table.is_empty() {
            warn!(
                "{:?}: dropped while still holding {:#x} bytes of {}",
                self.id,
                self.backing.rounded_size,
                self.allocator.name()
            );
        }
    }
}
