//! Ownership-tracked streaming buffers.

use crate::attrs::{DmaAttrs, DmaDirection};
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::Platform;
use crate::subsystem::DmaSubsystem;
use kernel_memory_addresses::{DeviceAddress, PhysicalAddress};

/// Who may touch a streaming buffer right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The CPU may read and write; the device must not.
    CpuOwned,
    /// The device may access; the CPU must not.
    DeviceOwned,
    /// A map, unmap or sync call is moving the buffer between the two.
    Transferring,
}

/// A buffer handed back and forth between CPU and device.
///
/// Created CPU-owned. [`DmaSubsystem::map_region`](crate::DmaSubsystem::map_region)
/// and the sync calls move it between owners; a call made by the wrong owner
/// is refused without touching caches or the bounce engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaRegion {
    phys: PhysicalAddress,
    size: u64,
    dir: DmaDirection,
    handle: DeviceAddress,
    state: Ownership,
}

impl DmaRegion {
    #[must_use]
    pub const fn new(phys: PhysicalAddress, size: u64, dir: DmaDirection) -> Self {
        Self {
            phys,
            size,
            dir,
            handle: DeviceAddress::INVALID,
            state: Ownership::CpuOwned,
        }
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn direction(&self) -> DmaDirection {
        self.dir
    }

    /// Device address while mapped, [`DeviceAddress::INVALID`] otherwise.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> DeviceAddress {
        self.handle
    }

    #[inline]
    #[must_use]
    pub const fn ownership(&self) -> Ownership {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.handle.is_valid()
    }

    const fn expect_owner(&self, expected: Ownership) -> Result<(), DmaError> {
        if matches!(
            (self.state, expected),
            (Ownership::CpuOwned, Ownership::CpuOwned)
                | (Ownership::DeviceOwned, Ownership::DeviceOwned)
        ) {
            Ok(())
        } else {
            Err(DmaError::WrongOwner {
                expected,
                actual: self.state,
            })
        }
    }

    const fn begin_transfer(&mut self) -> Ownership {
        let previous = self.state;
        self.state = Ownership::Transferring;
        previous
    }

    const fn finish_transfer(&mut self, owner: Ownership) {
        self.state = owner;
    }

    const fn set_handle(&mut self, handle: DeviceAddress) {
        self.handle = handle;
    }
}

impl<P: Platform> DmaSubsystem<P> {
    /// Hand a CPU-owned region to the device.
    ///
    /// # Errors
    /// [`DmaError::WrongOwner`] unless the CPU owns the region, or whatever
    /// [`map_single`](Self::map_single) reports. On error the region keeps its owner.
    pub fn map_region(
        &self,
        dev: &Device,
        region: &mut DmaRegion,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        region.expect_owner(Ownership::CpuOwned)?;
        let previous = region.begin_transfer();
        match self.map_single(dev, region.phys, region.size, region.dir, attrs) {
            Ok(handle) => {
                region.set_handle(handle);
                region.finish_transfer(Ownership::DeviceOwned);
                Ok(handle)
            }
            Err(e) => {
                region.finish_transfer(previous);
                Err(e)
            }
        }
    }

    /// Take a device-owned region back for the CPU.
    ///
    /// # Errors
    /// [`DmaError::WrongOwner`] unless the device owns the region.
    pub fn unmap_region(
        &self,
        dev: &Device,
        region: &mut DmaRegion,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        region.expect_owner(Ownership::DeviceOwned)?;
        let previous = region.begin_transfer();
        let result = self.unmap_single(dev, region.handle, region.size, region.dir, attrs);
        if result.is_ok() {
            region.set_handle(DeviceAddress::INVALID);
            region.finish_transfer(Ownership::CpuOwned);
        } else {
            region.finish_transfer(previous);
        }
        result
    }

    /// Let the CPU look at a device-owned region. The device stays the owner.
    ///
    /// # Errors
    /// [`DmaError::WrongOwner`] unless the device owns the region.
    pub fn sync_region_for_cpu(&self, dev: &Device, region: &mut DmaRegion) -> Result<(), DmaError> {
        region.expect_owner(Ownership::DeviceOwned)?;
        let previous = region.begin_transfer();
        let result = self.sync_single_for_cpu(dev, region.handle, region.size, region.dir);
        region.finish_transfer(previous);
        result
    }

    /// Hand CPU changes to a device-owned region back to the device.
    ///
    /// # Errors
    /// [`DmaError::WrongOwner`] unless the device owns the region.
    pub fn sync_region_for_device(
        &self,
        dev: &Device,
        region: &mut DmaRegion,
    ) -> Result<(), DmaError> {
        region.expect_owner(Ownership::DeviceOwned)?;
        let previous = region.begin_transfer();
        let result = self.sync_single_for_device(dev, region.handle, region.size, region.dir);
        region.finish_transfer(previous);
        result
    }
}
