//! The DMA layer as one explicitly constructed object.

use crate::allocation::{DmaAllocation, Ledger};
use crate::atomic_pool::{self, AtomicPool};
use crate::attrs::{AllocFlags, DmaAttrs, DmaDirection};
use crate::config::DmaConfig;
use crate::device::Device;
use crate::error::DmaError;
use crate::ops::DmaMapOps;
use crate::platform::{Platform, UserArea};
use crate::scatterlist::ScatterEntry;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_memory_addresses::{DeviceAddress, PhysicalAddress, VirtualAddress};

/// Allocation, mapping and synchronization of DMA buffers on one machine.
///
/// Created once at boot with [`init`](Self::init) and shared by reference
/// afterwards; there is no teardown. Every call is routed through the
/// operation table of the device it is made for, so callers never need to
/// know whether a device is coherent.
///
/// # Example
/// ```ignore
/// let dma = DmaSubsystem::init(platform, DmaConfig::from_cmdline(cmdline)?)?;
/// dma_bus_notifier(BusEvent::AddDevice, &nic);
///
/// let ring = dma.alloc(Some(&nic), 4096, AllocFlags::KERNEL, DmaAttrs::NONE)?;
/// let handle = dma.map_single(&nic, rx_buffer, 2048, DmaDirection::FromDevice, DmaAttrs::NONE)?;
/// // ... the device writes ...
/// dma.unmap_single(&nic, handle, 2048, DmaDirection::FromDevice, DmaAttrs::NONE)?;
/// ```
pub struct DmaSubsystem<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: DmaConfig,
    pub(crate) pool: Option<AtomicPool>,
    pub(crate) ledger: Ledger,
    warned_no_device: AtomicBool,
}

impl<P: Platform> DmaSubsystem<P> {
    /// Validate `config` and bring up the atomic pool.
    ///
    /// A pool that cannot be brought up is logged and left out; the subsystem
    /// still works, but non-blocking non-coherent allocations then fail with
    /// [`DmaError::PoolUnavailable`].
    ///
    /// # Errors
    /// [`DmaError::InvalidPoolSize`] if the configured pool size is unusable.
    pub fn init(platform: P, config: DmaConfig) -> Result<Self, DmaError> {
        config.validate()?;
        let pool = atomic_pool::bring_up(&platform, &config).ok();
        Ok(Self {
            platform,
            config,
            pool,
            ledger: Ledger::new(),
            warned_no_device: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[must_use]
    pub const fn config(&self) -> &DmaConfig {
        &self.config
    }

    #[must_use]
    pub const fn atomic_pool(&self) -> Option<&AtomicPool> {
        self.pool.as_ref()
    }

    /// Number of allocations outside the atomic pool that have not been freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.ledger.len()
    }

    fn require_device<'d>(&self, dev: Option<&'d Device>) -> Result<&'d Device, DmaError> {
        dev.ok_or_else(|| {
            if !self.warned_no_device.swap(true, Ordering::Relaxed) {
                log::warn!("DMA: use an actual device structure for DMA allocation");
            }
            DmaError::MissingDevice
        })
    }

    /// Allocate `size` bytes for `dev`.
    ///
    /// Callers passing [`AllocFlags::ATOMIC`] for a non-coherent device are
    /// served from the atomic pool only.
    ///
    /// # Errors
    /// [`DmaError::MissingDevice`] without a device; otherwise see
    /// [`DmaMapOps::alloc`]. Use [`DmaAllocation::handle_or_invalid`] where a
    /// device address is needed even on failure.
    pub fn alloc(
        &self,
        dev: Option<&Device>,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        let dev = self.require_device(dev)?;
        dev.dma_ops().alloc(self, dev, size, flags, attrs)
    }

    /// Free an allocation with the size, CPU address and handle it was made with.
    ///
    /// # Errors
    /// [`DmaError::MissingDevice`] without a device; usage errors for anything
    /// this layer cannot attribute to a live allocation of `dev`.
    pub fn free(
        &self,
        dev: Option<&Device>,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        let dev = self.require_device(dev)?;
        dev.dma_ops().free(self, dev, size, cpu_addr, handle)
    }

    /// Map an allocation into the user range `area`.
    ///
    /// # Errors
    /// See [`DmaMapOps::mmap`].
    pub fn mmap(
        &self,
        dev: &Device,
        area: &UserArea,
        handle: DeviceAddress,
        size: u64,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dev.dma_ops().mmap(self, dev, area, handle, size, attrs)
    }

    /// # Errors
    /// See [`DmaMapOps::map_page`].
    pub fn map_single(
        &self,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DeviceAddress, DmaError> {
        dev.dma_ops().map_page(self, dev, phys, size, dir, attrs)
    }

    /// # Errors
    /// See [`DmaMapOps::unmap_page`].
    pub fn unmap_single(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dev.dma_ops().unmap_page(self, dev, handle, size, dir, attrs)
    }

    /// # Errors
    /// See [`DmaMapOps::map_sg`].
    pub fn map_sg(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        dev.dma_ops().map_sg(self, dev, sg, dir, attrs)
    }

    /// # Errors
    /// See [`DmaMapOps::unmap_sg`].
    pub fn unmap_sg(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        dev.dma_ops().unmap_sg(self, dev, sg, dir, attrs)
    }

    /// # Errors
    /// See [`DmaMapOps::sync_single_for_cpu`].
    pub fn sync_single_for_cpu(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dev.dma_ops().sync_single_for_cpu(self, dev, handle, size, dir)
    }

    /// # Errors
    /// See [`DmaMapOps::sync_single_for_device`].
    pub fn sync_single_for_device(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dev.dma_ops().sync_single_for_device(self, dev, handle, size, dir)
    }

    /// # Errors
    /// See [`DmaMapOps::sync_sg_for_cpu`].
    pub fn sync_sg_for_cpu(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dev.dma_ops().sync_sg_for_cpu(self, dev, sg, dir)
    }

    /// # Errors
    /// See [`DmaMapOps::sync_sg_for_device`].
    pub fn sync_sg_for_device(
        &self,
        dev: &Device,
        sg: &[ScatterEntry],
        dir: DmaDirection,
    ) -> Result<(), DmaError> {
        dev.dma_ops().sync_sg_for_device(self, dev, sg, dir)
    }

    #[must_use]
    pub fn dma_supported(&self, dev: &Device, mask: u64) -> bool {
        dev.dma_ops().dma_supported(self, dev, mask)
    }

    #[must_use]
    pub fn mapping_error(&self, dev: &Device, handle: DeviceAddress) -> bool {
        dev.dma_ops().mapping_error(self, dev, handle)
    }
}

impl<P: Platform> fmt::Debug for DmaSubsystem<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaSubsystem")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("live_allocations", &self.ledger.len())
            .finish_non_exhaustive()
    }
}
