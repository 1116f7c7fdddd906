//! # Atomic pool
//!
//! A fixed region, reserved and remapped non-cacheable once at boot, that
//! serves non-coherent allocations from contexts which must not block.
//!
//! Bookkeeping lives beside the pool rather than inside it: the pool memory is
//! uncached and may be mapped to user space, so it cannot hold list headers.
//! Two address-sorted extent tables describe the pool, one for free ranges and
//! one for live allocations. Both are sized for the worst case when the pool is
//! created, so neither ever allocates while the lock is held.
//!
//! ```text
//! offset 0                                                    size
//! |--live--|----free----|--live--|--live--|---------free-------|
//! ```
//!
//! Allocation is first fit, with the start aligned (relative to the pool base)
//! to the buddy order of the rounded size, so a `16 KiB` request starts on a
//! `16 KiB` boundary. Release coalesces with both neighbors.

use crate::allocation::{Backing, BackingGuard};
use crate::attrs::DmaAttrs;
use crate::cache;
use crate::config::DmaConfig;
use crate::error::DmaError;
use crate::platform::{Platform, Zone};
use crate::remap::remap_noncacheable;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, order_for, page_align,
};
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Extent {
    offset: u64,
    len: u64,
}

impl Extent {
    const fn end(self) -> u64 {
        self.offset + self.len
    }

    const fn covers(self, offset: u64, len: u64) -> bool {
        self.offset <= offset && offset + len <= self.end()
    }
}

/// Why a release was refused. Carries no address; the pool adds it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Refused {
    SizeMismatch { allocated: u64 },
    DoubleFree,
    PartialOverlap,
}

/// Free and live extents of the pool, in offset order.
///
/// ### Invariants
/// - Free extents are disjoint and never adjacent (always coalesced).
/// - Free and live extents together tile `[0, size)` exactly.
struct FreeList {
    free: Vec<Extent>,
    live: Vec<Extent>,
}

impl FreeList {
    fn new(size: u64) -> Self {
        // Each live extent holds at least one page; free extents sit between them.
        let pages = usize::try_from(size >> Size4K::SHIFT).unwrap_or(usize::MAX);
        let mut free = Vec::with_capacity(pages.saturating_add(1));
        free.push(Extent {
            offset: 0,
            len: size,
        });
        Self {
            free,
            live: Vec::with_capacity(pages),
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|e| e.len).sum()
    }

    fn allocate(&mut self, len: u64, align: u64) -> Option<u64> {
        let (index, start) = self.free.iter().enumerate().find_map(|(index, ext)| {
            let start = ext.offset.checked_next_multiple_of(align)?;
            let end = start.checked_add(len)?;
            (end <= ext.end()).then_some((index, start))
        })?;

        let ext = self.free[index];
        let head = Extent {
            offset: ext.offset,
            len: start - ext.offset,
        };
        let tail = Extent {
            offset: start + len,
            len: ext.end() - (start + len),
        };
        match (head.len, tail.len) {
            (0, 0) => {
                self.free.remove(index);
            }
            (0, _) => self.free[index] = tail,
            (_, 0) => self.free[index] = head,
            _ => {
                self.free[index] = head;
                self.free.insert(index + 1, tail);
            }
        }

        let at = self.live.partition_point(|e| e.offset < start);
        self.live.insert(at, Extent { offset: start, len });
        Some(start)
    }

    fn release(&mut self, offset: u64, len: u64) -> Result<(), Refused> {
        if let Ok(index) = self.live.binary_search_by_key(&offset, |e| e.offset) {
            let live = self.live[index];
            if live.len != len {
                return Err(Refused::SizeMismatch {
                    allocated: live.len,
                });
            }
            self.live.remove(index);
            self.insert_free(live);
            return Ok(());
        }

        let already_free = self
            .free
            .iter()
            .any(|e| len <= u64::MAX - offset && e.covers(offset, len));
        if already_free {
            Err(Refused::DoubleFree)
        } else {
            Err(Refused::PartialOverlap)
        }
    }

    fn insert_free(&mut self, ext: Extent) {
        let at = self.free.partition_point(|e| e.offset < ext.offset);
        self.free.insert(at, ext);

        if at + 1 < self.free.len() && self.free[at].end() == self.free[at + 1].offset {
            self.free[at].len += self.free[at + 1].len;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].end() == self.free[at].offset {
            self.free[at - 1].len += self.free[at].len;
            self.free.remove(at);
        }
    }
}

/// The pre-reserved, non-cacheable pool for allocations that must not block.
pub struct AtomicPool {
    virt_base: VirtualAddress,
    phys_base: PhysicalPage<Size4K>,
    size: u64,
    state: SpinLock<FreeList>,
}

impl AtomicPool {
    /// Manage `size` bytes mapped at `virt_base` and backed by pages starting at `phys_base`.
    ///
    /// # Errors
    /// [`DmaError::InvalidPoolSize`] if `size` is zero, not page aligned, or
    /// the range wraps around either address space.
    pub fn new(
        virt_base: VirtualAddress,
        phys_base: PhysicalPage<Size4K>,
        size: u64,
    ) -> Result<Self, DmaError> {
        let wraps = virt_base.checked_add(size).is_none()
            || phys_base.base().checked_add(size).is_none();
        if size == 0 || !size.is_multiple_of(Size4K::SIZE) || wraps {
            return Err(DmaError::InvalidPoolSize(size));
        }
        if !virt_base.is_aligned::<Size4K>() {
            return Err(DmaError::InvalidPoolSize(size));
        }

        Ok(Self {
            virt_base,
            phys_base,
            size,
            state: SpinLock::new(FreeList::new(size)),
        })
    }

    /// Carve `size` bytes (rounded up to whole pages) out of the pool.
    ///
    /// # Errors
    /// - [`DmaError::ZeroSize`] for an empty request.
    /// - [`DmaError::PoolExhausted`] if no suitably aligned free range is large enough.
    pub fn reserve(&self, size: u64) -> Result<(VirtualAddress, PhysicalPage<Size4K>), DmaError> {
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let exhausted = DmaError::PoolExhausted { requested: size };
        let len = page_align(size).ok_or(exhausted)?;
        if len > self.size {
            return Err(exhausted);
        }
        let align = Size4K::SIZE << order_for(len);

        let offset = self
            .state
            .with_lock(|list| list.allocate(len, align))
            .ok_or(exhausted)?;
        log::trace!("DMA: atomic pool reserved {len:#x} bytes at offset {offset:#x}");

        let va = VirtualAddress::new(self.virt_base.as_u64() + offset);
        let page = PhysicalPage::from_pfn(self.phys_base.pfn() + (offset >> Size4K::SHIFT));
        Ok((va, page))
    }

    /// Give back a range obtained from [`reserve`](Self::reserve).
    ///
    /// Returns `Ok(false)` without doing anything if `va` is not inside the
    /// pool, so callers can try another free path.
    ///
    /// # Errors
    /// Usage errors leave the pool untouched:
    /// - [`DmaError::SizeMismatch`] when `va` starts a live allocation of another size,
    /// - [`DmaError::DoubleFree`] when the whole range is already free,
    /// - [`DmaError::PartialOverlap`] for anything else inside the pool.
    pub fn release(&self, va: VirtualAddress, size: u64) -> Result<bool, DmaError> {
        let Some(offset) = self.offset_of(va) else {
            return Ok(false);
        };
        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        let len = page_align(size).unwrap_or(u64::MAX);

        self.state
            .with_lock(|list| list.release(offset, len))
            .map_err(|refused| match refused {
                Refused::SizeMismatch { allocated } => DmaError::SizeMismatch {
                    allocated,
                    freed: size,
                },
                Refused::DoubleFree => DmaError::DoubleFree(va),
                Refused::PartialOverlap => DmaError::PartialOverlap(va),
            })?;
        log::trace!("DMA: atomic pool released {len:#x} bytes at offset {offset:#x}");
        Ok(true)
    }

    fn offset_of(&self, va: VirtualAddress) -> Option<u64> {
        va.checked_sub(self.virt_base)
            .filter(|&offset| offset < self.size)
    }

    /// Whether `va` lies inside the pool's virtual range.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.offset_of(va).is_some()
    }

    /// Physical address behind a pool virtual address.
    #[must_use]
    pub fn phys_of(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = self.offset_of(va)?;
        self.phys_base.base().checked_add(offset)
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.virt_base
    }

    #[must_use]
    pub const fn phys_base(&self) -> PhysicalPage<Size4K> {
        self.phys_base
    }

    /// Capacity in bytes. Fixed for the pool's lifetime.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.state.with_lock(|list| list.free_bytes())
    }
}

impl fmt::Debug for AtomicPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicPool")
            .field("virt_base", &self.virt_base)
            .field("phys_base", &self.phys_base)
            .field("size", &format_args!("{:#x}", self.size))
            .finish_non_exhaustive()
    }
}

/// Reserve, clear, flush and remap the atomic pool.
///
/// The backing comes from the global contiguous reservation if there is one,
/// otherwise from the page allocator. Every step that fails releases what the
/// earlier steps obtained.
pub(crate) fn bring_up<P: Platform>(platform: &P, config: &DmaConfig) -> Result<AtomicPool, DmaError> {
    let size = config.validate()?;
    let kib = size / 1024;

    let pool = build(platform, config, size);
    match &pool {
        Ok(_) => log::info!("DMA: preallocated {kib} KiB pool for atomic allocations"),
        Err(e) => {
            log::error!("DMA: failed to allocate {kib} KiB pool for atomic coherent allocation ({e})");
        }
    }
    pool
}

fn build<P: Platform>(platform: &P, config: &DmaConfig, size: u64) -> Result<AtomicPool, DmaError> {
    let pages = size >> Size4K::SHIFT;
    let order = order_for(size);

    let backing = if config.contiguous && platform.has_area(None) {
        let page = platform
            .reserve_pages(None, pages, order)
            .ok_or(DmaError::ContiguousExhausted)?;
        Backing::Contiguous { page, count: pages }
    } else {
        let zone = if config.zone_dma { Zone::Dma } else { Zone::Normal };
        let page = platform
            .alloc_pages(order, zone)
            .ok_or(DmaError::OutOfMemory)?;
        Backing::Pages { page, order }
    };
    let backing = BackingGuard::new(platform, None, size, backing);
    let page = backing.page();

    let linear = platform
        .phys_to_virt(page.base())
        .ok_or(DmaError::AddressTranslation)?;
    platform.zero_range(linear, size);
    cache::flush(platform, linear, size)?;

    let alias = remap_noncacheable(platform, page, size, DmaAttrs::NONE)?;
    let pool = AtomicPool::new(alias.va(), page, size)?;

    alias.commit();
    backing.commit();
    Ok(pool)
}
