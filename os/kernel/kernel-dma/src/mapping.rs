//! Map, unmap and sync for non-coherent devices.
//!
//! The bounce engine decides which pages the device really accesses, so cache
//! maintenance always runs on the linear alias of the address it returned:
//!
//! | call            | order                          | cache op          |
//! |-----------------|--------------------------------|-------------------|
//! | map             | bounce map, then maintenance   | clean / clean+inv |
//! | unmap           | maintenance, then bounce unmap | invalidate        |
//! | sync for cpu    | maintenance, then bounce sync  | invalidate        |
//! | sync for device | bounce sync, then maintenance  | clean / clean+inv |
//!
//! Addresses are translated before anything is done, so a call that fails
//! leaves caches and the bounce engine untouched.

use crate::attrs::{DmaAttrs, DmaDirection};
use crate::cache::{self, CacheOp};
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::Platform;
use crate::scatterlist::ScatterEntry;
use crate::subsystem::DmaSubsystem;
use kernel_memory_addresses::{DeviceAddress, PhysicalAddress};

impl<P: Platform> DmaSubsystem<P> {
    pub(crate) fn map_page_noncoherent(
        &self,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        let platform = &self.platform;
        let handle = platform.map(dev, phys, size, dir, attrs);
        if platform.mapping_error(dev, handle) {
            return Err(DmaError::MappingFailed);
        }

        match cache::linear_alias(platform, dev, handle) {
            Ok(va) => {
                cache::maintain(platform, dev, va, size, CacheOp::for_device(dir));
                Ok(handle)
            }
            Err(e) => {
                platform.unmap(dev, handle, size, dir, attrs | DmaAttrs::SKIP_CPU_SYNC);
                Err(e)
            }
        }
    }

    pub(crate) fn unmap_page_noncoherent(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        let va = cache::linear_alias(&self.platform, dev, handle)?;
        cache::maintain(&self.platform, dev, va, size, CacheOp::for_cpu(dir));
        self.platform.unmap(dev, handle, size, dir, attrs);
        Ok(())
    }

    pub(crate) fn sync_single_for_cpu_noncoherent(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        let va = cache::linear_alias(&self.platform, dev, handle)?;
        cache::maintain(&self.platform, dev, va, size, CacheOp::for_cpu(dir));
        self.platform.sync_for_cpu(dev, handle, size, dir);
        Ok(())
    }

    pub(crate) fn sync_single_for_device_noncoherent(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        let va = cache::linear_alias(&self.platform, dev, handle)?;
        self.platform.sync_for_device(dev, handle, size, dir);
        cache::maintain(&self.platform, dev, va, size, CacheOp::for_device(dir));
        Ok(())
    }

    /// Map every entry; cache maintenance follows unless `SKIP_CPU_SYNC` is set.
    pub(crate) fn map_sg_noncoherent(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        if sg.is_empty() {
            return Ok(0);
        }

        let mapped = self.platform.map_sg(dev, sg, dir, attrs);
        if mapped == 0 {
            return Err(DmaError::MappingFailed);
        }
        if attrs.contains(DmaAttrs::SKIP_CPU_SYNC) {
            return Ok(mapped);
        }

        if let Err(e) = self.check_sg(dev, &sg[..mapped]) {
            self.platform
                .unmap_sg(dev, &sg[..mapped], dir, attrs | DmaAttrs::SKIP_CPU_SYNC);
            sg.iter_mut().for_each(ScatterEntry::clear_mapping);
            return Err(e);
        }
        self.maintain_sg(dev, &sg[..mapped], CacheOp::for_device(dir))?;
        Ok(mapped)
    }

    /// Unmap every entry. Maintenance always runs, whatever `attrs` says.
    pub(crate) fn unmap_sg_noncoherent(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        self.check_sg(dev, sg)?;
        self.maintain_sg(dev, sg, CacheOp::for_cpu(dir))?;
        self.platform.unmap_sg(dev, sg, dir, attrs);
        Ok(())
    }

    pub(crate) fn sync_sg_for_cpu_noncoherent(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        self.check_sg(dev, sg)?;
        self.maintain_sg(dev, sg, CacheOp::for_cpu(dir))?;
        self.platform.sync_sg_for_cpu(dev, sg, dir);
        Ok(())
    }

    pub(crate) fn sync_sg_for_device_noncoherent(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        self.check_sg(dev, sg)?;
        self.platform.sync_sg_for_device(dev, sg, dir);
        self.maintain_sg(dev, sg, CacheOp::for_device(dir))
    }

    fn check_sg(&self, dev: &Device, sg: &[ScatterEntry]) -> Result<(), DmaError> {
        mapped(sg)
            .try_for_each(|entry| cache::linear_alias(&self.platform, dev, entry.dma_address).map(drop))
    }

    /// `op` on every mapped entry, in list order.
    fn maintain_sg(&self, dev: &Device, sg: &[ScatterEntry], op: CacheOp) -> Result<(), DmaError> {
        for entry in mapped(sg) {
            let va = cache::linear_alias(&self.platform, dev, entry.dma_address)?;
            cache::maintain(&self.platform, dev, va, entry.dma_length, op);
        }
        Ok(())
    }
}

fn mapped(sg: &[ScatterEntry]) -> impl Iterator<Item = &ScatterEntry> {
    sg.iter().filter(|entry| entry.dma_address.is_valid())
}
