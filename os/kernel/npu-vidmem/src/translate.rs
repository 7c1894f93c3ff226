use npu_memory_addresses::{DeviceAddress, PhysicalAddress};

/// CPU-physical ⇄ device-physical conversion for one heap or backend.
///
/// Most platforms wire the NPU to the same bus view as the CPU, so the
/// default is [`AddressTranslation::Identity`]. Some platforms place DRAM at
/// a different base in the NPU's view; they use a constant offset or a custom
/// pair of functions.
///
/// ```rust
/// # use npu_vidmem::AddressTranslation;
/// # use npu_memory_addresses::{DeviceAddress, PhysicalAddress};
/// let t = AddressTranslation::offset(0x8000_0000, 0x0);
/// assert_eq!(t.to_device(PhysicalAddress::new(0x8000_1000)), DeviceAddress::new(0x1000));
/// assert_eq!(t.to_cpu(DeviceAddress::new(0x1000)), PhysicalAddress::new(0x8000_1000));
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub enum AddressTranslation {
    #[default]
    Identity,
    /// `device = cpu - cpu_base + device_base`, wrapping.
    Offset { cpu_base: u64, device_base: u64 },
    Custom {
        cpu_to_device: fn(u64) -> u64,
        device_to_cpu: fn(u64) -> u64,
    },
}

impl AddressTranslation {
    #[must_use]
    pub const fn offset(cpu_base: u64, device_base: u64) -> Self {
        Self::Offset {
            cpu_base,
            device_base,
        }
    }

    #[must_use]
    pub const fn custom(cpu_to_device: fn(u64) -> u64, device_to_cpu: fn(u64) -> u64) -> Self {
        Self::Custom {
            cpu_to_device,
            device_to_cpu,
        }
    }

    #[must_use]
    pub fn to_device(&self, pa: PhysicalAddress) -> DeviceAddress {
        let v = pa.as_u64();
        DeviceAddress::new(match *self {
            Self::Identity => v,
            Self::Offset {
                cpu_base,
                device_base,
            } => v.wrapping_sub(cpu_base).wrapping_add(device_base),
            Self::Custom { cpu_to_device, .. } => cpu_to_device(v),
        })
    }

    #[must_use]
    pub fn to_cpu(&self, da: DeviceAddress) -> PhysicalAddress {
        let v = da.as_u64();
        PhysicalAddress::new(match *self {
            Self::Identity => v,
            Self::Offset {
                cpu_base,
                device_base,
            } => v.wrapping_sub(device_base).wrapping_add(cpu_base),
            Self::Custom { device_to_cpu, .. } => device_to_cpu(v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn set_bit_40(v: u64) -> u64 {
        v | (1 << 40)
    }

    const fn clear_bit_40(v: u64) -> u64 {
        v & !(1 << 40)
    }

    #[test]
    fn identity_is_default() {
        let t = AddressTranslation::default();
        let pa = PhysicalAddress::new(0x1234_5000);
        assert_eq!(t.to_device(pa).as_u64(), pa.as_u64());
        assert_eq!(t.to_cpu(t.to_device(pa)), pa);
    }

    #[test]
    fn offset_moves_both_ways() {
        let t = AddressTranslation::offset(0x1_0000_0000, 0x4000_0000);
        let pa = PhysicalAddress::new(0x1_0000_2000);
        assert_eq!(t.to_device(pa), DeviceAddress::new(0x4000_2000));
        assert_eq!(t.to_cpu(DeviceAddress::new(0x4000_2000)), pa);
    }

    #[test]
    fn custom_functions_are_used() {
        let t = AddressTranslation::custom(set_bit_40, clear_bit_40);
        let pa = PhysicalAddress::new(0x9000);
        assert_eq!(t.to_device(pa), DeviceAddress::new(0x100_0000_9000));
        assert_eq!(t.to_cpu(DeviceAddress::new(0x100_0000_9000)), pa);
    }
}
