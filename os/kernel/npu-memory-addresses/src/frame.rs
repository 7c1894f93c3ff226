use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;

/// Page frame number for pages of size `S`.
///
/// A frame number is the address shifted right by `S::SHIFT`. Two pages are
/// physically adjacent iff their frame numbers differ by exactly one, which is
/// the test the segment-table builder relies on when collapsing page lists.
///
/// ### Examples
/// ```rust
/// # use npu_memory_addresses::*;
/// let a = PhysicalAddress::new(0x8000_0000).frame::<Size4K>();
/// let b = PhysicalAddress::new(0x8000_1000).frame::<Size4K>();
/// assert!(b.follows(a));
/// assert_eq!(b.base(), 0x8000_1000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrameNumber<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PageFrameNumber<S> {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    /// The frame that contains the raw address `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: u64) -> Self {
        Self::new(addr >> S::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.value
    }

    /// Raw base address of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> u64 {
        self.value << S::SHIFT
    }

    /// `true` if `self` is the frame directly after `prev`.
    #[inline]
    #[must_use]
    pub const fn follows(self, prev: Self) -> bool {
        match prev.value.checked_add(1) {
            Some(next) => next == self.value,
            None => false,
        }
    }
}

impl<S: PageSize> fmt::Debug for PageFrameNumber<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageFrameNumber<{}>({:#X})",
            core::any::type_name::<S>(),
            self.value
        )
    }
}

impl<S: PageSize> fmt::Display for PageFrameNumber<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.value)
    }
}
