//! # NPU Memory Address Types
//!
//! Strongly typed wrappers for the three address domains the NPU video-memory
//! subsystem juggles at once.
//!
//! ## Overview
//!
//! | Type | Domain | Produced by |
//! |------|--------|-------------|
//! | [`PhysicalAddress`] | CPU physical | OS page allocators, pinned user pages |
//! | [`DeviceAddress`] | NPU physical | per-heap translation of a `PhysicalAddress` |
//! | [`VirtualAddress`] | kernel / user logical | OS mapping calls |
//!
//! All three wrap a raw [`MemoryAddress`]. Page arithmetic is expressed in
//! terms of a [`PageSize`] marker; [`PageFrameNumber<S>`] is the unit the
//! segment-table builder compares when it decides whether two pages are
//! physically adjacent.
//!
//! ```rust
//! # use npu_memory_addresses::*;
//! let first = PhysicalAddress::new(0x1_0000);
//! let second = PhysicalAddress::new(0x1_1000);
//! assert!(second.frame::<Size4K>().follows(first.frame::<Size4K>()));
//!
//! assert_eq!(align_up(0x1001, PAGE_SIZE), Some(0x2000));
//! assert_eq!(pages_for(0x1001), Some(2));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]`, `Copy`, `Ord` and `Hash`, so they
//!   can be map keys.
//! - No implicit conversion exists between the CPU and device domains; the
//!   translation is always an explicit call.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod device_address;
mod frame;
mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use device_address::DeviceAddress;
pub use frame::PageFrameNumber;
pub use memory_address::MemoryAddress;
pub use page_size::{PAGE_SHIFT, PAGE_SIZE, PageSize, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// First address outside the 32-bit physical window.
pub const DMA32_LIMIT: u64 = 1 << 32;

/// Align `value` up to `align` (a power of two). Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `value` down to `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Number of base pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> Option<u64> {
    match align_up(bytes, PAGE_SIZE) {
        Some(v) => Some(v >> PAGE_SHIFT),
        None => None,
    }
}

/// `true` if `[base, base + len)` lies entirely below [`DMA32_LIMIT`].
#[inline]
#[must_use]
pub const fn fits_dma32(base: u64, len: u64) -> bool {
    match base.checked_add(len) {
        Some(end) => end <= DMA32_LIMIT,
        None => false,
    }
}
