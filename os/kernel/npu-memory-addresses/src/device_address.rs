use crate::{MemoryAddress, PageFrameNumber, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Device-domain physical address.
///
/// The address the NPU's DMA engine and MMU use to reach a byte of memory.
/// It is derived from a [`PhysicalAddress`](super::PhysicalAddress) through a
/// per-heap translation (identity on most platforms) and is what the
/// physical-segment tables store.
///
/// ### Examples
/// ```rust
/// # use npu_memory_addresses::*;
/// let da = DeviceAddress::new(0x4000_1234);
/// assert_eq!(da.page_offset::<Size4K>(), 0x234);
/// assert_eq!(da.end(0x1000), Some(DeviceAddress::new(0x4000_2234)));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(pub(crate) MemoryAddress);

impl DeviceAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn frame<S: PageSize>(self) -> PageFrameNumber<S> {
        self.0.frame::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0.page_offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0.align_down::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0.is_aligned::<S>()
    }

    /// One past the last byte of a `len`-byte range starting here.
    #[inline]
    #[must_use]
    pub const fn end(self, len: u64) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for DeviceAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for DeviceAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for DeviceAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
