use crate::{MemoryAddress, PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
/// let pp = pa.page::<Size4K>();
/// assert_eq!(pp.base().as_u64() & (Size4K::SIZE - 1), 0);
/// assert_eq!(pp.join(0x678), Some(pa));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.0.align_down::<S>().as_u64(),
            _phantom: PhantomData,
        }
    }

    /// The page starting exactly at `pa`, or `None` if `pa` is unaligned.
    #[inline]
    #[must_use]
    pub const fn try_from_addr(pa: PhysicalAddress) -> Option<Self> {
        if pa.is_aligned::<S>() {
            Some(Self::from_addr(pa))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self {
            base: pfn << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(MemoryAddress::new(self.base))
    }

    /// Page frame number.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.base >> S::SHIFT
    }

    /// Base plus an in-page offset; `None` if `offset` leaves the page.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> Option<PhysicalAddress> {
        if offset >= S::SIZE {
            return None;
        }
        Some(PhysicalAddress::new(self.base | offset))
    }

    /// The page `count` pages above this one.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, count: u64) -> Option<Self> {
        let Some(bytes) = count.checked_mul(S::SIZE) else {
            return None;
        };
        match self.base.checked_add(bytes) {
            Some(base) => Some(Self {
                base,
                _phantom: PhantomData,
            }),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.base)
    }
}
