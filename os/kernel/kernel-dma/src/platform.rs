//! # Platform collaborators
//!
//! The DMA layer does not touch hardware itself. Everything that depends on the
//! machine is reached through the traits in this module:
//!
//! - [`CacheMaintenance`]: clean/invalidate CPU data cache lines by virtual range.
//! - [`BounceEngine`]: turns a physical range into a device address, possibly
//!   through a bounce buffer, and provides a fallback coherent allocator.
//! - [`ContiguousAllocator`]: the movable contiguous reservation.
//! - [`PageAllocator`]: ordinary power-of-two page blocks.
//! - [`Remapper`]: creates and tears down additional kernel (and user) aliases.
//! - [`LinearMap`]: the kernel's direct map of physical memory.
//!
//! A type implementing all of them is a [`Platform`] and can drive a
//! [`DmaSubsystem`](crate::DmaSubsystem). Kernels, tests and simulators plug in
//! different implementations; the DMA logic stays the same.
//!
//! All methods take `&self`. Implementations that keep state use their own
//! non-blocking synchronization, since map/unmap/sync are called from
//! interrupt context.

use crate::attrs::{AllocFlags, DmaAttrs, DmaDirection, PageProtection};
use crate::cache::CacheOp;
use crate::device::Device;
use crate::scatterlist::ScatterEntry;
use kernel_memory_addresses::{
    DeviceAddress, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};

/// Physical memory zone an allocation is drawn from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Zone {
    /// Any memory.
    Normal,
    /// Memory addressable by devices with a narrow (typically 32-bit) mask.
    Dma,
}

/// A user virtual range to populate with an allocation's pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserArea {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    /// Offset into the allocation, in pages.
    pub pgoff: u64,
    /// Protection requested by the caller.
    pub prot: PageProtection,
}

impl UserArea {
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        match self.end.checked_sub(self.start) {
            Some(len) => len,
            None => 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length in whole pages.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.len() >> Size4K::SHIFT
    }
}

pub trait CacheMaintenance {
    /// Write back and invalidate `[start, end)` to the point of coherency.
    fn flush_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// Perform `op` on the lines covering `[start, start + size)`.
    fn sync_area(&self, start: VirtualAddress, size: u64, op: CacheOp);
}

/// The bounce-buffer engine.
///
/// `map` may substitute a different physical buffer than the one passed in;
/// the returned device address always names the memory the device will really
/// access.
pub trait BounceEngine {
    /// Map `size` bytes at `phys` for `dev`. Failure is reported through
    /// [`mapping_error`](Self::mapping_error).
    fn map(
        &self,
        dev: &Device,
        phys: PhysicalAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> DeviceAddress;

    fn unmap(
        &self,
        dev: &Device,
        handle: DeviceAddress,
        size: u64,
        dir: DmaDirection,
        attrs: DmaAttrs,
    );

    /// Make device-written data visible at the original buffer.
    fn sync_for_cpu(&self, dev: &Device, handle: DeviceAddress, size: u64, dir: DmaDirection);

    /// Make CPU-written data visible at the device-side buffer.
    fn sync_for_device(&self, dev: &Device, handle: DeviceAddress, size: u64, dir: DmaDirection);

    /// Map every entry of `sg`, returning how many were mapped.
    ///
    /// Either all entries are mapped or none: on the first failure the entries
    /// mapped so far are unmapped again and `0` is returned.
    fn map_sg(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> usize {
        let mut failed_at = None;
        for (index, entry) in sg.iter_mut().enumerate() {
            let handle = self.map(dev, entry.phys, entry.length, dir, attrs);
            if self.mapping_error(dev, handle) {
                failed_at = Some(index);
                break;
            }
            entry.dma_address = handle;
            entry.dma_length = entry.length;
        }

        let Some(mapped) = failed_at else {
            return sg.len();
        };
        self.unmap_sg(dev, &sg[..mapped], dir, attrs | DmaAttrs::SKIP_CPU_SYNC);
        sg.iter_mut().for_each(ScatterEntry::clear_mapping);
        0
    }

    fn unmap_sg(&self, dev: &Device, sg: &[ScatterEntry], dir: DmaDirection, attrs: DmaAttrs) {
        for entry in sg.iter().filter(|e| e.dma_address.is_valid()) {
            self.unmap(dev, entry.dma_address, entry.dma_length, dir, attrs);
        }
    }

    fn sync_sg_for_cpu(&self, dev: &Device, sg: &[ScatterEntry], dir: DmaDirection) {
        for entry in sg.iter().filter(|e| e.dma_address.is_valid()) {
            self.sync_for_cpu(dev, entry.dma_address, entry.dma_length, dir);
        }
    }

    fn sync_sg_for_device(&self, dev: &Device, sg: &[ScatterEntry], dir: DmaDirection) {
        for entry in sg.iter().filter(|e| e.dma_address.is_valid()) {
            self.sync_for_device(dev, entry.dma_address, entry.dma_length, dir);
        }
    }

    /// Allocate cached, physically contiguous memory the device can reach.
    ///
    /// Must not sleep unless `flags` allows blocking. Returns the linear-map
    /// address and the device address.
    fn alloc_coherent(
        &self,
        dev: &Device,
        size: u64,
        zone: Zone,
        flags: AllocFlags,
    ) -> Option<(VirtualAddress, DeviceAddress)>;

    fn free_coherent(&self, dev: &Device, size: u64, cpu_addr: VirtualAddress, handle: DeviceAddress);

    /// Whether the device can address everything below `mask`.
    fn dma_supported(&self, dev: &Device, mask: u64) -> bool;

    fn mapping_error(&self, _dev: &Device, handle: DeviceAddress) -> bool {
        !handle.is_valid()
    }
}

/// The contiguous memory reservation.
///
/// `dev = None` addresses the global reservation.
pub trait ContiguousAllocator {
    /// Whether a reservation exists that serves `dev`.
    fn has_area(&self, dev: Option<&Device>) -> bool;

    /// Whether `dev` has a reservation of its own, rather than the global one.
    fn is_private(&self, dev: &Device) -> bool;

    /// `count` contiguous pages aligned to `2^align_order` pages.
    fn reserve_pages(
        &self,
        dev: Option<&Device>,
        count: u64,
        align_order: u32,
    ) -> Option<PhysicalPage<Size4K>>;

    /// Return pages; `false` if they did not come from the reservation.
    fn release_pages(&self, dev: Option<&Device>, page: PhysicalPage<Size4K>, count: u64) -> bool;
}

pub trait PageAllocator {
    /// A naturally aligned block of `2^order` pages.
    fn alloc_pages(&self, order: u32, zone: Zone) -> Option<PhysicalPage<Size4K>>;

    fn free_pages(&self, page: PhysicalPage<Size4K>, order: u32);
}

/// Kernel virtual aliasing of physical pages.
pub trait Remapper {
    /// Map `size` bytes starting at `page` into a fresh kernel range with `prot`.
    fn remap(&self, page: PhysicalPage<Size4K>, size: u64, prot: PageProtection)
    -> Option<VirtualAddress>;

    /// Tear down a range returned by [`remap`](Self::remap).
    fn free_remap(&self, va: VirtualAddress, size: u64);

    /// Populate user pages at `user_va` with `len` bytes of frames starting at `pfn`.
    fn remap_pfn_range(
        &self,
        user_va: VirtualAddress,
        pfn: u64,
        len: u64,
        prot: PageProtection,
    ) -> bool;
}

/// The kernel's cached linear alias of physical memory.
pub trait LinearMap {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress>;

    /// Fill `[va, va + size)` with zeros through the linear alias.
    fn zero_range(&self, va: VirtualAddress, size: u64);
}

/// Everything the DMA layer needs from the machine.
pub trait Platform:
    CacheMaintenance + BounceEngine + ContiguousAllocator + PageAllocator + Remapper + LinearMap
{
}

impl<T> Platform for T where
    T: CacheMaintenance + BounceEngine + ContiguousAllocator + PageAllocator + Remapper + LinearMap
{
}

/// Address arithmetic of a linear map placed at a fixed virtual offset.
///
/// Every physical address `pa` is visible at `base + pa`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OffsetLinearMap {
    base: u64,
}

impl OffsetLinearMap {
    #[must_use]
    pub const fn new(base: VirtualAddress) -> Self {
        Self {
            base: base.as_u64(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        match self.base.checked_add(pa.as_u64()) {
            Some(va) => Some(VirtualAddress::new(va)),
            None => None,
        }
    }
}
