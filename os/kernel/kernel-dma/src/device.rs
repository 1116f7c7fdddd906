//! Device context: addressing limits, bus window and the bound operation table.

use crate::error::DmaError;
use crate::ops::DmaOps;
use core::fmt;
use kernel_memory_addresses::{DeviceAddress, PhysicalAddress};
use kernel_sync::PublishOnce;

/// Mask covering the low `bits` address bits.
#[must_use]
pub const fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Stable identity of a device, used in diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// A device able to master the memory bus.
///
/// The operation table is bound at most once, when the device is added to its
/// bus; until then the non-coherent table applies.
pub struct Device {
    id: DeviceId,
    name: &'static str,
    dma_mask: u64,
    coherent_dma_mask: u64,
    bus_offset: u64,
    dma_coherent: bool,
    ops: PublishOnce<DmaOps>,
}

impl Device {
    #[must_use]
    pub const fn new(id: DeviceId, name: &'static str) -> Self {
        Self {
            id,
            name,
            dma_mask: dma_bit_mask(32),
            coherent_dma_mask: dma_bit_mask(32),
            bus_offset: 0,
            dma_coherent: false,
            ops: PublishOnce::new(),
        }
    }

    /// Mark the device as snooping CPU caches (the firmware `dma-coherent` property).
    #[must_use]
    pub const fn with_dma_coherent(mut self, coherent: bool) -> Self {
        self.dma_coherent = coherent;
        self
    }

    #[must_use]
    pub const fn with_dma_mask(mut self, mask: u64) -> Self {
        self.dma_mask = mask;
        self
    }

    #[must_use]
    pub const fn with_coherent_dma_mask(mut self, mask: u64) -> Self {
        self.coherent_dma_mask = mask;
        self
    }

    /// Device addresses are physical addresses minus `offset`.
    #[must_use]
    pub const fn with_bus_offset(mut self, offset: u64) -> Self {
        self.bus_offset = offset;
        self
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn dma_mask(&self) -> u64 {
        self.dma_mask
    }

    #[inline]
    #[must_use]
    pub const fn coherent_dma_mask(&self) -> u64 {
        self.coherent_dma_mask
    }

    #[inline]
    #[must_use]
    pub const fn bus_offset(&self) -> u64 {
        self.bus_offset
    }

    #[inline]
    #[must_use]
    pub const fn dma_coherent(&self) -> bool {
        self.dma_coherent
    }

    /// The operation table in effect for this device.
    ///
    /// A bind running on another CPU is waited for, so callers never see the
    /// default table once binding has started.
    #[must_use]
    pub fn dma_ops(&self) -> DmaOps {
        self.ops.wait().copied().unwrap_or(DmaOps::DEFAULT)
    }

    /// Whether a table has been bound explicitly.
    #[must_use]
    pub fn has_bound_ops(&self) -> bool {
        self.ops.is_published()
    }

    pub(crate) fn bind_ops(&self, ops: DmaOps) -> Result<DmaOps, DmaError> {
        self.ops
            .set(ops)
            .copied()
            .map_err(|_| DmaError::AlreadyBound(self.id))
    }

    /// Bus address under which the device sees `phys`.
    ///
    /// # Errors
    /// [`DmaError::AddressTranslation`] if `phys` lies below the bus window.
    pub const fn phys_to_dma(&self, phys: PhysicalAddress) -> Result<DeviceAddress, DmaError> {
        match phys.as_u64().checked_sub(self.bus_offset) {
            Some(addr) if addr != u64::MAX => Ok(DeviceAddress::new(addr)),
            _ => Err(DmaError::AddressTranslation),
        }
    }

    /// Physical address behind a bus address handed out for this device.
    ///
    /// # Errors
    /// [`DmaError::AddressTranslation`] for the invalid handle or on overflow.
    pub const fn dma_to_phys(&self, handle: DeviceAddress) -> Result<PhysicalAddress, DmaError> {
        if !handle.is_valid() {
            return Err(DmaError::AddressTranslation);
        }
        match handle.as_u64().checked_add(self.bus_offset) {
            Some(addr) => Ok(PhysicalAddress::new(addr)),
            None => Err(DmaError::AddressTranslation),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dma_mask", &format_args!("{:#x}", self.dma_mask))
            .field(
                "coherent_dma_mask",
                &format_args!("{:#x}", self.coherent_dma_mask),
            )
            .field("dma_coherent", &self.dma_coherent)
            .field("ops", &self.ops.get())
            .finish_non_exhaustive()
    }
}
