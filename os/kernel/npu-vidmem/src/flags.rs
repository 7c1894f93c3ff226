//! # Request flags and backend capability bits
//!
//! Both are packed integers so they can be copied into command buffers and
//! trace records unchanged:
//!
//! ```text
//! AllocFlags (u32)
//!  31                         4  3  2  1  0
//! +----------------------------+--+--+--+--+
//! |         reserved           |RO|ZR|D3|CT|
//! +----------------------------+--+--+--+--+
//!
//! Capabilities (u8)
//!   7   5  4  3   2  1  0
//! +------+--+------+--+--+
//! | rsvd |IM|cache |D3|CT|
//! +------+--+------+--+--+
//! ```

use bitfield_struct::bitfield;

/// CPU cache attribute used for kernel and user mappings.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
#[repr(u8)]
pub enum CacheMode {
    #[default]
    Cached = 0,
    Uncached = 1,
    WriteCombine = 2,
}

impl CacheMode {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Cached,
            1 => Self::Uncached,
            _ => Self::WriteCombine,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Only cached memory needs explicit maintenance before device access.
    #[inline]
    #[must_use]
    pub const fn needs_sync(self) -> bool {
        matches!(self, Self::Cached)
    }
}

/// Per-request hints.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct AllocFlags {
    /// Backing must be a single physical run.
    pub contiguous: bool,
    /// Backing must lie entirely below 4 GiB (device domain).
    pub dma32: bool,
    /// Backing must read as zero on return.
    pub zeroed: bool,
    /// User mappings are created without write permission.
    pub read_only: bool,
    #[bits(28, default = 0)]
    _reserved: u32,
}

/// What a backend can promise about its memory.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct Capabilities {
    /// Every allocation is a single physical run.
    pub contiguous_only: bool,
    /// Every allocation lies below 4 GiB.
    pub dma32_only: bool,
    /// Cache attribute for mappings of this backend's memory.
    #[bits(2)]
    pub cache_mode: CacheMode,
    /// Backend wraps memory owned by someone else (dma-buf, user pages).
    pub imports: bool,
    #[bits(3, default = 0)]
    _reserved: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_stable() {
        let f = AllocFlags::new().with_contiguous(true).with_zeroed(true);
        assert_eq!(f.into_bits(), 0b0101);
        assert!(!f.dma32());
        assert!(AllocFlags::from_bits(0b1000).read_only());
    }

    #[test]
    fn capabilities_round_trip_cache_mode() {
        let c = Capabilities::new()
            .with_dma32_only(true)
            .with_cache_mode(CacheMode::WriteCombine);
        assert_eq!(c.cache_mode(), CacheMode::WriteCombine);
        assert!(!c.cache_mode().needs_sync());
        assert_eq!(Capabilities::new().cache_mode(), CacheMode::Cached);
        assert!(CacheMode::Cached.needs_sync());
    }
}
