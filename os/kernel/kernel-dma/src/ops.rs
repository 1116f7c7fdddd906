//! The per-device operation table.
//!
//! Both tables implement [`DmaMapOps`]; [`DmaOps`] picks one per device and
//! forwards to it, so callers never see which one is in effect.

use crate::allocation::DmaAllocation;
use crate::attrs::{AllocFlags, DmaAttrs, DmaDirection};
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::{Platform, UserArea};
use crate::scatterlist::ScatterEntry;
use crate::subsystem::DmaSubsystem;
use kernel_memory_addresses::{DeviceAddress, PhysicalAddress, VirtualAddress};

/// Allocation, user mapping, streaming map/unmap and sync.
pub trait DmaMapOps {
    /// Allocate `size` bytes the device can access.
    ///
    /// # Errors
    /// Resource errors once every fallback is exhausted; nothing stays allocated.
    fn alloc<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError>;

    /// Free an allocation made by [`alloc`](Self::alloc) with the same size, address and handle.
    ///
    /// # Errors
    /// Usage errors when the allocation cannot be identified; nothing is released then.
    fn free<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError>;

    /// Map (part of) an allocation into a user area.
    ///
    /// # Errors
    /// [`DmaError::MmapOutOfRange`] or [`DmaError::RemapFailed`].
    fn mmap<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError>;

    /// Hand `size` bytes at `phys` to the device.
    ///
    /// # Errors
    /// [`DmaError::MappingFailed`] if the bounce engine cannot map the buffer.
    fn map_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError>;

    /// Take a mapped buffer back for the CPU.
    ///
    /// # Errors
    /// [`DmaError::AddressTranslation`] for a handle that cannot be translated.
    fn unmap_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError>;

    /// Map a scatter-gather list; returns the number of entries mapped.
    ///
    /// # Errors
    /// [`DmaError::MappingFailed`] if no entry could be mapped.
    fn map_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError>;

    /// # Errors
    /// [`DmaError::AddressTranslation`] if an entry's handle cannot be translated.
    fn unmap_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError>;

    /// # Errors
    /// [`DmaError::AddressTranslation`] for a handle that cannot be translated.
    fn sync_single_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError>;

    /// # Errors
    /// [`DmaError::AddressTranslation`] for a handle that cannot be translated.
    fn sync_single_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError>;

    /// # Errors
    /// [`DmaError::AddressTranslation`] if an entry's handle cannot be translated.
    fn sync_sg_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError>;

    /// # Errors
    /// [`DmaError::AddressTranslation`] if an entry's handle cannot be translated.
    fn sync_sg_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError>;

    fn dma_supported<P: Platform>(&self, dma: &DmaSubsystem<P>, dev: &Device, mask: u64) -> bool {
        dma.platform().dma_supported(dev, mask)
    }

    fn mapping_error<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
    ) -> bool {
        dma.platform().mapping_error(dev, handle)
    }
}

/// For devices that snoop CPU caches: no remapping, no cache maintenance.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CoherentOps;

/// For devices that bypass CPU caches.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct NonCoherentOps;

impl DmaMapOps for CoherentOps {
    fn alloc<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        dma.alloc_coherent(dev, size, flags, attrs)
    }

    fn free<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        dma.free_coherent(dev, size, cpu_addr, handle)
    }

    fn mmap<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        _attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dma.mmap_pages(dev, area, handle, size, area.prot)
    }

    fn map_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        let platform = dma.platform();
        let handle = platform.map(dev, phys, size, dir, attrs);
        if platform.mapping_error(dev, handle) {
            return Err(DmaError::MappingFailed);
        }
        Ok(handle)
    }

    fn unmap_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dma.platform().unmap(dev, handle, size, dir, attrs);
        Ok(())
    }

    fn map_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        if sg.is_empty() {
            return Ok(0);
        }
        match dma.platform().map_sg(dev, sg, dir, attrs) {
            0 => Err(DmaError::MappingFailed),
            mapped => Ok(mapped),
        }
    }

    fn unmap_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dma.platform().unmap_sg(dev, sg, dir, attrs);
        Ok(())
    }

    fn sync_single_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.platform().sync_for_cpu(dev, handle, size, dir);
        Ok(())
    }

    fn sync_single_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.platform().sync_for_device(dev, handle, size, dir);
        Ok(())
    }

    fn sync_sg_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.platform().sync_sg_for_cpu(dev, sg, dir);
        Ok(())
    }

    fn sync_sg_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.platform().sync_sg_for_device(dev, sg, dir);
        Ok(())
    }
}

impl DmaMapOps for NonCoherentOps {
    fn alloc<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        dma.alloc_noncoherent(dev, size, flags, attrs)
    }

    fn free<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        dma.free_noncoherent(dev, size, cpu_addr, handle)
    }

    fn mmap<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        let prot = area.prot.for_dma(attrs, false);
        dma.mmap_pages(dev, area, handle, size, prot)
    }

    fn map_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        dma.map_page_noncoherent(dev, phys, size, dir, attrs)
    }

    fn unmap_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dma.unmap_page_noncoherent(dev, handle, size, dir, attrs)
    }

    fn map_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        dma.map_sg_noncoherent(dev, sg, dir, attrs)
    }

    fn unmap_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dma.unmap_sg_noncoherent(dev, sg, dir, attrs)
    }

    fn sync_single_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.sync_single_for_cpu_noncoherent(dev, handle, size, dir)
    }

    fn sync_single_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.sync_single_for_device_noncoherent(dev, handle, size, dir)
    }

    fn sync_sg_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.sync_sg_for_cpu_noncoherent(dev, sg, dir)
    }

    fn sync_sg_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dma.sync_sg_for_device_noncoherent(dev, sg, dir)
    }
}

/// The table bound to a device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DmaOps {
    Coherent,
    NonCoherent,
}

/// Forward a call to the table selected by `self`.
macro_rules! dispatch {
    ($self:ident, $method:ident($($arg:expr),* $(,)?)) => {
        match $self {
            DmaOps::Coherent => CoherentOps.$method($($arg),*),
            DmaOps::NonCoherent => NonCoherentOps.$method($($arg),*),
        }
    };
}

impl DmaOps {
    /// What a device uses until its bus binds something else.
    pub const DEFAULT: Self = Self::NonCoherent;

    #[must_use]
    pub const fn is_coherent(self) -> bool {
        matches!(self, Self::Coherent)
    }
}

impl Default for DmaOps {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl DmaMapOps for DmaOps {
    fn alloc<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        dispatch!(self, alloc(dma, dev, size, flags, attrs))
    }

    fn free<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        dispatch!(self, free(dma, dev, size, cpu_addr, handle))
    }

    fn mmap<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dispatch!(self, mmap(dma, dev, area, handle, size, attrs))
    }

    fn map_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        dispatch!(self, map_page(dma, dev, phys, size, dir, attrs))
    }

    fn unmap_page<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dispatch!(self, unmap_page(dma, dev, handle, size, dir, attrs))
    }

    fn map_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        dispatch!(self, map_sg(dma, dev, sg, dir, attrs))
    }

    fn unmap_sg<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dispatch!(self, unmap_sg(dma, dev, sg, dir, attrs))
    }

    fn sync_single_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dispatch!(self, sync_single_for_cpu(dma, dev, handle, size, dir))
    }

    fn sync_single_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dispatch!(self, sync_single_for_device(dma, dev, handle, size, dir))
    }

    fn sync_sg_for_cpu<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dispatch!(self, sync_sg_for_cpu(dma, dev, sg, dir))
    }

    fn sync_sg_for_device<P: Platform>(
        &self,
        dma: &DmaSubsystem<P>,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dispatch!(self, sync_sg_for_device(dma, dev, sg, dir))
    }
}
