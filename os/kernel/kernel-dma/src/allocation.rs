//! # Allocation strategy selection
//!
//! Non-coherent devices get memory whose CPU view is a second, non-cacheable
//! alias of the backing pages. Callers that cannot block are served from the
//! [atomic pool](crate::AtomicPool) and nothing else; blocking callers get
//! fresh backing pages that are flushed and remapped.
//!
//! Coherent devices get the backing pages' cached linear alias as is.
//!
//! Backing pages for non-coherent devices are tried in this order:
//!
//! 1. the contiguous reservation serving the device; a miss in a device's
//!    *private* reservation fails the allocation,
//! 2. the page allocator, in the DMA zone for narrow devices,
//! 3. the bounce engine's coherent allocator.
//!
//! Coherent devices skip the page allocator, and only use the reservation
//! when the caller may block. Non-blocking coherent requests go straight to
//! the bounce engine, which is told the caller cannot sleep.
//!
//! Everything except pool allocations is recorded in a ledger keyed by the CPU
//! address handed out, so `free` can refuse anything it did not produce. The
//! ledger grows outside its lock.

use crate::attrs::{AllocFlags, DmaAttrs};
use crate::cache;
use crate::device::{Device, DeviceId};
use crate::error::DmaError;
use crate::platform::Platform;
use crate::remap::remap_noncacheable;
use crate::subsystem::DmaSubsystem;
use alloc::vec::Vec;
use kernel_memory_addresses::{
    DeviceAddress, PageSize, PhysicalPage, Size4K, VirtualAddress, order_for, page_align,
};
use kernel_sync::SpinLock;

/// Where an allocation's pages came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AllocStrategy {
    AtomicPool,
    Contiguous,
    PageAllocator,
    Bounce,
}

/// A successful allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaAllocation {
    cpu_addr: VirtualAddress,
    linear_alias: Option<VirtualAddress>,
    handle: DeviceAddress,
    size: u64,
    strategy: AllocStrategy,
}

impl DmaAllocation {
    /// The address the CPU should use. Non-cacheable for non-coherent devices.
    #[inline]
    #[must_use]
    pub const fn cpu_addr(&self) -> VirtualAddress {
        self.cpu_addr
    }

    /// The cached linear alias of the same pages, when `cpu_addr` is a separate
    /// non-cacheable alias. Must not be used to access the buffer.
    #[inline]
    #[must_use]
    pub const fn linear_alias(&self) -> Option<VirtualAddress> {
        self.linear_alias
    }

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> DeviceAddress {
        self.handle
    }

    /// Size in bytes, rounded up to whole pages.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    /// The device address of a successful allocation, [`DeviceAddress::INVALID`] otherwise.
    #[must_use]
    pub const fn handle_or_invalid(result: &Result<Self, DmaError>) -> DeviceAddress {
        match result {
            Ok(allocation) => allocation.handle,
            Err(_) => DeviceAddress::INVALID,
        }
    }
}

/// Pages that back an allocation, and how to give them back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Backing {
    Contiguous {
        page: PhysicalPage<Size4K>,
        count: u64,
    },
    Pages {
        page: PhysicalPage<Size4K>,
        order: u32,
    },
    Bounce {
        cpu: VirtualAddress,
        handle: DeviceAddress,
        page: PhysicalPage<Size4K>,
    },
}

impl Backing {
    pub(crate) const fn page(&self) -> PhysicalPage<Size4K> {
        match *self {
            Self::Contiguous { page, .. } | Self::Pages { page, .. } | Self::Bounce { page, .. } => {
                page
            }
        }
    }

    const fn strategy(&self) -> AllocStrategy {
        match self {
            Self::Contiguous { .. } => AllocStrategy::Contiguous,
            Self::Pages { .. } => AllocStrategy::PageAllocator,
            Self::Bounce { .. } => AllocStrategy::Bounce,
        }
    }

    fn release<P: Platform>(self, platform: &P, dev: Option<&Device>, size: u64) {
        match self {
            Self::Contiguous { page, count } => {
                if !platform.release_pages(dev, page, count) {
                    log::error!("DMA: {page} was not returned to the contiguous reservation");
                }
            }
            Self::Pages { page, order } => platform.free_pages(page, order),
            Self::Bounce { cpu, handle, .. } => match dev {
                Some(dev) => platform.free_coherent(dev, size, cpu, handle),
                None => log::error!("DMA: bounce allocation at {cpu} has no owning device"),
            },
        }
    }
}

/// Backing pages that are released on drop unless committed.
pub(crate) struct BackingGuard<'a, P: Platform> {
    platform: &'a P,
    dev: Option<&'a Device>,
    size: u64,
    backing: Backing,
    armed: bool,
}

impl<'a, P: Platform> BackingGuard<'a, P> {
    pub(crate) const fn new(
        platform: &'a P,
        dev: Option<&'a Device>,
        size: u64,
        backing: Backing,
    ) -> Self {
        Self {
            platform,
            dev,
            size,
            backing,
            armed: true,
        }
    }

    pub(crate) const fn page(&self) -> PhysicalPage<Size4K> {
        self.backing.page()
    }

    pub(crate) const fn backing(&self) -> Backing {
        self.backing
    }

    pub(crate) fn commit(mut self) -> Backing {
        self.armed = false;
        self.backing
    }
}

impl<P: Platform> Drop for BackingGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            log::trace!("DMA: rolling back {:?}", self.backing);
            self.backing.release(self.platform, self.dev, self.size);
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct LedgerEntry {
    device: DeviceId,
    size: u64,
    handle: DeviceAddress,
    coherent: bool,
    backing: Backing,
}

/// Live allocations that did not come from the atomic pool, sorted by CPU address.
pub(crate) struct Ledger {
    entries: SpinLock<Vec<(VirtualAddress, LedgerEntry)>>,
}

enum Insert {
    Done,
    Duplicate,
    Grow(usize),
}

impl Ledger {
    /// Initial room; later growth doubles.
    const MIN_CAPACITY: usize = 8;

    pub(crate) const fn new() -> Self {
        Self {
            entries: SpinLock::new(Vec::new()),
        }
    }

    /// Record a new allocation. Never allocates or frees with the lock held.
    ///
    /// # Errors
    /// [`DmaError::AddressReused`] if `cpu_addr` is already live,
    /// [`DmaError::OutOfMemory`] if the table cannot grow.
    fn insert(&self, cpu_addr: VirtualAddress, entry: LedgerEntry) -> Result<(), DmaError> {
        // Swapped with the table when it is full; the old buffer is freed on return.
        let mut spare = Vec::new();
        loop {
            let outcome = self.entries.with_lock(|entries| {
                if entries.len() == entries.capacity() {
                    if spare.capacity() <= entries.len() {
                        return Insert::Grow(entries.len());
                    }
                    spare.append(entries);
                    core::mem::swap(entries, &mut spare);
                }
                match entries.binary_search_by_key(&cpu_addr, |(va, _)| *va) {
                    Ok(_) => Insert::Duplicate,
                    Err(at) => {
                        entries.insert(at, (cpu_addr, entry));
                        Insert::Done
                    }
                }
            });

            match outcome {
                Insert::Done => return Ok(()),
                Insert::Duplicate => {
                    log::error!("DMA: {cpu_addr} handed out while still live");
                    return Err(DmaError::AddressReused(cpu_addr));
                }
                Insert::Grow(len) => {
                    let mut grown = Vec::new();
                    grown
                        .try_reserve_exact(len.saturating_mul(2).max(Self::MIN_CAPACITY))
                        .map_err(|_| DmaError::OutOfMemory)?;
                    spare = grown;
                }
            }
        }
    }

    /// Remove the entry for `cpu_addr` if every detail matches; otherwise leave it.
    fn take(
        &self,
        cpu_addr: VirtualAddress,
        dev: &Device,
        size: u64,
        handle: DeviceAddress,
        coherent: bool,
    ) -> Result<LedgerEntry, DmaError> {
        self.entries.with_lock(|entries| {
            let at = entries
                .binary_search_by_key(&cpu_addr, |(va, _)| *va)
                .map_err(|_| DmaError::UnknownAllocation(cpu_addr))?;
            let entry = &entries[at].1;
            if entry.device != dev.id() || entry.coherent != coherent {
                return Err(DmaError::UnknownAllocation(cpu_addr));
            }
            if page_align(size) != Some(entry.size) {
                return Err(DmaError::SizeMismatch {
                    allocated: entry.size,
                    freed: size,
                });
            }
            if entry.handle != handle {
                return Err(DmaError::HandleMismatch(handle));
            }
            Ok(entries.remove(at).1)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.with_lock(|entries| entries.len())
    }
}

impl<P: Platform> DmaSubsystem<P> {
    /// Pages from the contiguous reservation, if the caller may block and one
    /// serves `dev`. `Ok(None)` means try the next source.
    fn reserve_contiguous<'a>(
        &'a self,
        dev: &'a Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<Option<BackingGuard<'a, P>>, DmaError> {
        let platform = &self.platform;
        if !flags.can_block() || !self.config.contiguous || !platform.has_area(Some(dev)) {
            return Ok(None);
        }

        let pages = size >> Size4K::SHIFT;
        if let Some(page) = platform.reserve_pages(Some(dev), pages, order_for(size)) {
            let backing = Backing::Contiguous { page, count: pages };
            return Ok(Some(BackingGuard::new(platform, Some(dev), size, backing)));
        }
        if platform.is_private(dev) {
            if !attrs.contains(DmaAttrs::NO_WARN) {
                log::error!(
                    "DMA: {} ({}): failed to allocate {size:#x} bytes from its contiguous area",
                    dev.name(),
                    dev.id()
                );
            }
            return Err(DmaError::ContiguousExhausted);
        }
        Ok(None)
    }

    /// Pages from the bounce engine's coherent allocator.
    fn allocate_bounce<'a>(
        &'a self,
        dev: &'a Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<BackingGuard<'a, P>, DmaError> {
        let platform = &self.platform;
        let zone = self.config.zone_for(dev.coherent_dma_mask());
        let Some((cpu, handle)) = platform.alloc_coherent(dev, size, zone, flags) else {
            if !attrs.contains(DmaAttrs::NO_WARN) {
                log::warn!("DMA: {}: out of memory for {size:#x} bytes", dev.id());
            }
            return Err(DmaError::OutOfMemory);
        };
        match dev.dma_to_phys(handle) {
            Ok(phys) => {
                let page = PhysicalPage::from_addr(phys);
                let backing = Backing::Bounce { cpu, handle, page };
                Ok(BackingGuard::new(platform, Some(dev), size, backing))
            }
            Err(e) => {
                platform.free_coherent(dev, size, cpu, handle);
                Err(e)
            }
        }
    }

    /// Backing pages for a blocking non-coherent allocation of `size`
    /// (already page aligned) bytes.
    fn allocate_backing<'a>(
        &'a self,
        dev: &'a Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<BackingGuard<'a, P>, DmaError> {
        if let Some(backing) = self.reserve_contiguous(dev, size, flags, attrs)? {
            return Ok(backing);
        }

        if flags.can_block() {
            let order = order_for(size);
            let zone = self.config.zone_for(dev.coherent_dma_mask());
            if let Some(page) = self.platform.alloc_pages(order, zone) {
                let backing = Backing::Pages { page, order };
                return Ok(BackingGuard::new(&self.platform, Some(dev), size, backing));
            }
        }

        self.allocate_bounce(dev, size, flags, attrs)
    }

    /// Cached linear alias and device address of a backing.
    fn addresses(
        &self,
        dev: &Device,
        backing: Backing,
    ) -> Result<(VirtualAddress, DeviceAddress), DmaError> {
        match backing {
            Backing::Bounce { cpu, handle, .. } => Ok((cpu, handle)),
            Backing::Contiguous { page, .. } | Backing::Pages { page, .. } => {
                let linear = self
                    .platform
                    .phys_to_virt(page.base())
                    .ok_or(DmaError::AddressTranslation)?;
                Ok((linear, dev.phys_to_dma(page.base())?))
            }
        }
    }

    pub(crate) fn alloc_noncoherent(
        &self,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let size = page_align(size).ok_or(DmaError::OutOfMemory)?;

        if !flags.can_block() {
            return self.alloc_from_pool(dev, size);
        }

        let backing = self.allocate_backing(dev, size, flags, attrs)?;
        let (linear, handle) = self.addresses(dev, backing.backing())?;

        // The allocator may hand out pages with dirty lines on the cached alias.
        cache::flush(&self.platform, linear, size)?;
        let alias = remap_noncacheable(&self.platform, backing.page(), size, attrs)?;

        let cpu_addr = alias.va();
        self.ledger.insert(
            cpu_addr,
            LedgerEntry {
                device: dev.id(),
                size,
                handle,
                coherent: false,
                backing: backing.backing(),
            },
        )?;
        alias.commit();
        let backing = backing.commit();
        log::debug!(
            "DMA: {}: {size:#x} bytes at {cpu_addr} ({:?}, non-coherent)",
            dev.id(),
            backing.strategy()
        );

        Ok(DmaAllocation {
            cpu_addr,
            linear_alias: Some(linear),
            handle,
            size,
            strategy: backing.strategy(),
        })
    }

    fn alloc_from_pool(&self, dev: &Device, size: u64) -> Result<DmaAllocation, DmaError> {
        let Some(pool) = self.pool.as_ref() else {
            log::warn!("DMA: coherent pool not initialised");
            return Err(DmaError::PoolUnavailable);
        };

        let (cpu_addr, page) = pool.reserve(size)?;
        let handle = match dev.phys_to_dma(page.base()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release) = pool.release(cpu_addr, size) {
                    log::error!("DMA: could not return {cpu_addr} to the atomic pool: {release}");
                }
                return Err(e);
            }
        };

        Ok(DmaAllocation {
            cpu_addr,
            linear_alias: None,
            handle,
            size,
            strategy: AllocStrategy::AtomicPool,
        })
    }

    pub(crate) fn alloc_coherent(
        &self,
        dev: &Device,
        size: u64,
        flags: AllocFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let size = page_align(size).ok_or(DmaError::OutOfMemory)?;

        let backing = match self.reserve_contiguous(dev, size, flags, attrs)? {
            Some(backing) => backing,
            None => self.allocate_bounce(dev, size, flags, attrs)?,
        };
        let (cpu_addr, handle) = self.addresses(dev, backing.backing())?;
        self.ledger.insert(
            cpu_addr,
            LedgerEntry {
                device: dev.id(),
                size,
                handle,
                coherent: true,
                backing: backing.backing(),
            },
        )?;
        let backing = backing.commit();
        log::debug!(
            "DMA: {}: {size:#x} bytes at {cpu_addr} ({:?}, coherent)",
            dev.id(),
            backing.strategy()
        );

        Ok(DmaAllocation {
            cpu_addr,
            linear_alias: None,
            handle,
            size,
            strategy: backing.strategy(),
        })
    }

    pub(crate) fn free_noncoherent(
        &self,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        if let Some(pool) = self.pool.as_ref()
            && pool.contains(cpu_addr)
        {
            let phys = pool
                .phys_of(cpu_addr)
                .ok_or(DmaError::UnknownAllocation(cpu_addr))?;
            if dev.phys_to_dma(phys)? != handle {
                return Err(DmaError::HandleMismatch(handle));
            }
            pool.release(cpu_addr, size)?;
            return Ok(());
        }

        let entry = self.ledger.take(cpu_addr, dev, size, handle, false)?;
        self.platform.free_remap(cpu_addr, entry.size);
        entry.backing.release(&self.platform, Some(dev), entry.size);
        log::debug!("DMA: {}: freed {cpu_addr} (non-coherent)", dev.id());
        Ok(())
    }

    pub(crate) fn free_coherent(
        &self,
        dev: &Device,
        size: u64,
        cpu_addr: VirtualAddress,
        handle: DeviceAddress,
    ) -> Result<(), DmaError> {
        let entry = self.ledger.take(cpu_addr, dev, size, handle, true)?;
        entry.backing.release(&self.platform, Some(dev), entry.size);
        log::debug!("DMA: {}: freed {cpu_addr} (coherent)", dev.id());
        Ok(())
    }
}
