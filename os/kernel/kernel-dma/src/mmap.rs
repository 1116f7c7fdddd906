//! User-space mappings of DMA allocations.

use crate::attrs::PageProtection;
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::{Platform, UserArea};
use crate::subsystem::DmaSubsystem;
use kernel_memory_addresses::{DeviceAddress, PhysicalPage, Size4K, pages_for};

impl<P: Platform> DmaSubsystem<P> {
    /// Map the pages of the allocation behind `handle` into `area` with `prot`.
    ///
    /// `area` may start `pgoff` pages into the allocation but must not run
    /// past its end.
    pub(crate) fn mmap_pages(
        &self,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        prot: PageProtection,
    ) -> Result<(), DmaError> {
        let nr_pages = pages_for(size).ok_or(DmaError::MmapOutOfRange)?;
        let off = area.pgoff;
        if off >= nr_pages || area.pages() > nr_pages - off {
            return Err(DmaError::MmapOutOfRange);
        }

        let pfn = PhysicalPage::<Size4K>::from_addr(dev.dma_to_phys(handle)?).pfn();
        log::trace!(
            "DMA: {}: user mapping of {} pages at {} (pfn {:#x})",
            dev.id(),
            area.pages(),
            area.start,
            pfn + off
        );
        if self
            .platform
            .remap_pfn_range(area.start, pfn + off, area.len(), prot)
        {
            Ok(())
        } else {
            Err(DmaError::RemapFailed)
        }
    }
}
