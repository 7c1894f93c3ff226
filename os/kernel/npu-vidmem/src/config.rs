//! Platform configuration consumed once at [`VidMem::new`](crate::VidMem::new).

use crate::backend::{
    DMA_BUF, DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, RESERVED, USER_PHYSICAL, USER_VIRTUAL,
};
use crate::error::VidMemError;
use crate::flags::CacheMode;
use crate::translate::AddressTranslation;
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use npu_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K};

/// Largest order the dynamic-contiguous backend may be configured with
/// (1 GiB blocks with 4 KiB pages).
pub const MAX_SUPPORTED_ORDER: u32 = 18;

pub const DEFAULT_DYNAMIC_MAX_ORDER: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("heap name is empty")]
    EmptyName,
    #[error("backend name is registered twice")]
    DuplicateName,
    #[error("heap size is zero")]
    ZeroSize,
    #[error("heap base, size or granularity is misaligned")]
    Misaligned,
    #[error("DMA32 heap extends above 4 GiB")]
    AboveDma32,
    #[error("heap end overflows the address space")]
    Overflow,
    #[error("maximum order is out of range")]
    InvalidOrder,
}

impl From<ConfigError> for VidMemError {
    fn from(value: ConfigError) -> Self {
        let what = match value {
            ConfigError::EmptyName => "heap name is empty",
            ConfigError::DuplicateName => "backend name is registered twice",
            ConfigError::ZeroSize => "heap size is zero",
            ConfigError::Misaligned => "heap geometry is misaligned",
            ConfigError::AboveDma32 => "DMA32 heap extends above 4 GiB",
            ConfigError::Overflow => "heap end overflows",
            ConfigError::InvalidOrder => "maximum order is out of range",
        };
        Self::InvalidArgument(what)
    }
}

/// One driver-owned carve-out, served by an exclusive heap backend.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    pub name: String,
    /// CPU-physical base of the carve-out.
    pub base: PhysicalAddress,
    pub size: u64,
    /// Allocation unit; a power of two of at least one page.
    pub granularity: u64,
    pub cache_mode: CacheMode,
    pub dma32: bool,
    /// Overrides the identity CPU ⇄ device mapping for this heap.
    pub translation: Option<AddressTranslation>,
}

impl HeapConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, base: PhysicalAddress, size: u64) -> Self {
        Self {
            name: name.into(),
            base,
            size,
            granularity: PAGE_SIZE,
            cache_mode: CacheMode::Cached,
            dma32: false,
            translation: None,
        }
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    #[must_use]
    pub fn with_dma32(mut self, dma32: bool) -> Self {
        self.dma32 = dma32;
        self
    }

    #[must_use]
    pub fn with_translation(mut self, translation: AddressTranslation) -> Self {
        self.translation = Some(translation);
        self
    }

    /// # Errors
    /// The first [`ConfigError`] the heap geometry violates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if !self.granularity.is_power_of_two()
            || self.granularity < PAGE_SIZE
            || !self.base.is_aligned::<Size4K>()
            || self.base.as_u64() % self.granularity != 0
            || self.size % self.granularity != 0
        {
            return Err(ConfigError::Misaligned);
        }
        if self.base.checked_add(self.size).is_none() {
            return Err(ConfigError::Overflow);
        }
        if self.dma32 {
            let translation = self.translation.unwrap_or_default();
            let device_base = translation.to_device(self.base).as_u64();
            // Checked in the device domain: that is what the NPU addresses.
            if !npu_memory_addresses::fits_dma32(device_base, self.size) {
                return Err(ConfigError::AboveDma32);
            }
        }
        Ok(())
    }
}

/// Built-in backends a context registers. All are on by default.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct EnabledBackends {
    #[bits(default = true)]
    pub reserved: bool,
    #[bits(default = true)]
    pub dynamic_contiguous: bool,
    #[bits(default = true)]
    pub dynamic_pages: bool,
    #[bits(default = true)]
    pub dma_buf: bool,
    #[bits(default = true)]
    pub user_virtual: bool,
    #[bits(default = true)]
    pub user_physical: bool,
    #[bits(2, default = 0)]
    _reserved: u8,
}

impl EnabledBackends {
    /// Registry names paired with their enable bit, in registration order.
    #[must_use]
    pub const fn entries(self) -> [(bool, &'static str); 6] {
        [
            (self.reserved(), RESERVED),
            (self.dynamic_contiguous(), DYNAMIC_CONTIGUOUS),
            (self.dynamic_pages(), DYNAMIC_PAGES),
            (self.dma_buf(), DMA_BUF),
            (self.user_virtual(), USER_VIRTUAL),
            (self.user_physical(), USER_PHYSICAL),
        ]
    }
}

/// Which backends a context registers, and with what parameters.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub heaps: Vec<HeapConfig>,
    pub dynamic_max_order: u32,
    pub backends: EnabledBackends,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            heaps: Vec::new(),
            dynamic_max_order: DEFAULT_DYNAMIC_MAX_ORDER,
            backends: EnabledBackends::new(),
        }
    }
}

impl PlatformConfig {
    #[must_use]
    pub fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heaps.push(heap);
        self
    }

    #[must_use]
    pub fn with_dynamic_max_order(mut self, order: u32) -> Self {
        self.dynamic_max_order = order;
        self
    }

    #[must_use]
    pub fn with_backends(mut self, backends: EnabledBackends) -> Self {
        self.backends = backends;
        self
    }

    /// Names of the built-in backends this configuration enables.
    pub fn builtin_names(&self) -> impl Iterator<Item = &'static str> {
        self.backends
            .entries()
            .into_iter()
            .filter_map(|(on, name)| on.then_some(name))
    }

    /// # Errors
    /// - [`ConfigError::InvalidOrder`] if the dynamic order is out of range.
    /// - [`ConfigError::DuplicateName`] if two backends share a name.
    /// - Any error of [`HeapConfig::validate`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dynamic_max_order > MAX_SUPPORTED_ORDER {
            return Err(ConfigError::InvalidOrder);
        }
        let mut names: BTreeSet<&str> = self.builtin_names().collect();
        for heap in &self.heaps {
            heap.validate()?;
            if !names.insert(heap.name.as_str()) {
                return Err(ConfigError::DuplicateName);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn heap(name: &str) -> HeapConfig {
        HeapConfig::new(name, PhysicalAddress::new(0x9000_0000), 16 * MIB)
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = PlatformConfig::default().with_heap(heap("fw"));
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.builtin_names().count(), 6);
    }

    #[test]
    fn disabled_backends_are_skipped() {
        let backends = EnabledBackends::new()
            .with_dma_buf(false)
            .with_reserved(false);
        let cfg = PlatformConfig::default().with_backends(backends);
        let names: Vec<_> = cfg.builtin_names().collect();
        assert_eq!(
            names,
            [DYNAMIC_CONTIGUOUS, DYNAMIC_PAGES, USER_VIRTUAL, USER_PHYSICAL]
        );
        assert_eq!(EnabledBackends::new().into_bits(), 0b0011_1111);
    }

    #[test]
    fn rejects_bad_heaps() {
        let cases = [
            (heap(""), ConfigError::EmptyName),
            (
                HeapConfig::new("z", PhysicalAddress::new(0x9000_0000), 0),
                ConfigError::ZeroSize,
            ),
            (
                HeapConfig::new("m", PhysicalAddress::new(0x9000_0800), MIB),
                ConfigError::Misaligned,
            ),
            (heap("g").with_granularity(3 * PAGE_SIZE), ConfigError::Misaligned),
            (heap("s").with_granularity(PAGE_SIZE / 2), ConfigError::Misaligned),
            (
                HeapConfig::new("o", PhysicalAddress::new(u64::MAX - 0xFFF), 2 * PAGE_SIZE),
                ConfigError::Overflow,
            ),
            (
                HeapConfig::new("d", PhysicalAddress::new(0xFFF0_0000), 2 * MIB)
                    .with_dma32(true),
                ConfigError::AboveDma32,
            ),
        ];
        for (h, expected) in cases {
            assert_eq!(h.validate(), Err(expected), "{}", h.name);
        }
    }

    #[test]
    fn dma32_heap_may_be_translated_below_4g() {
        let h = HeapConfig::new("t", PhysicalAddress::new(0x8_0000_0000), 16 * MIB)
            .with_dma32(true)
            .with_translation(AddressTranslation::offset(0x8_0000_0000, 0x1000_0000));
        assert_eq!(h.validate(), Ok(()));
    }

    #[test]
    fn names_must_be_unique() {
        let dup = PlatformConfig::default()
            .with_heap(heap("a"))
            .with_heap(heap("a"));
        assert_eq!(dup.validate(), Err(ConfigError::DuplicateName));
        let clash = PlatformConfig::default().with_heap(heap(DYNAMIC_PAGES));
        assert_eq!(clash.validate(), Err(ConfigError::DuplicateName));
    }

    #[test]
    fn order_is_bounded() {
        let cfg = PlatformConfig::default()
            .with_dynamic_max_order(MAX_SUPPORTED_ORDER + 1);
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidOrder));
        assert_eq!(
            VidMemError::from(ConfigError::InvalidOrder),
            VidMemError::InvalidArgument("maximum order is out of range")
        );
    }
}
