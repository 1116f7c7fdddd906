//! Cache maintenance around ownership transfers.

use crate::attrs::DmaDirection;
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::{CacheMaintenance, LinearMap};
use kernel_memory_addresses::{DeviceAddress, VirtualAddress};

/// A data cache operation over a virtual range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheOp {
    /// Write dirty lines back, keep them valid.
    Clean,
    /// Discard lines without writing them back.
    Invalidate,
    /// Write dirty lines back, then discard them.
    CleanInvalidate,
}

impl CacheOp {
    /// Operation before the device gets the buffer (map, sync-for-device).
    #[must_use]
    pub const fn for_device(dir: DmaDirection) -> Self {
        match dir {
            DmaDirection::ToDevice => Self::Clean,
            DmaDirection::FromDevice | DmaDirection::Bidirectional => Self::CleanInvalidate,
        }
    }

    /// Operation before the CPU looks at the buffer again (unmap, sync-for-cpu).
    #[must_use]
    pub const fn for_cpu(_dir: DmaDirection) -> Self {
        Self::Invalidate
    }
}

/// Run `op` over `size` bytes of the linear alias `va`.
pub(crate) fn maintain<C: CacheMaintenance>(
    platform: &C,
    dev: &Device,
    va: VirtualAddress,
    size: u64,
    op: CacheOp,
) {
    log::trace!("DMA: {op:?} {size:#x} bytes at {va} for {}", dev.id());
    platform.sync_area(va, size, op);
}

/// The cached linear alias of the memory behind `handle`.
///
/// Maintenance always goes through the handle the bounce engine returned,
/// so it hits the pages the device really accesses.
pub(crate) fn linear_alias<P: LinearMap>(
    platform: &P,
    dev: &Device,
    handle: DeviceAddress,
) -> Result<VirtualAddress, DmaError> {
    let phys = dev.dma_to_phys(handle)?;
    platform
        .phys_to_virt(phys)
        .ok_or(DmaError::AddressTranslation)
}

/// Write back and invalidate `size` bytes starting at `va`.
pub(crate) fn flush<P: CacheMaintenance>(
    platform: &P,
    va: VirtualAddress,
    size: u64,
) -> Result<(), DmaError> {
    let end = va.checked_add(size).ok_or(DmaError::AddressTranslation)?;
    platform.flush_range(va, end);
    Ok(())
}
