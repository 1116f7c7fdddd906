use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes), the DMA allocation granule.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

impl fmt::Display for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Round `bytes` up to a whole number of 4 KiB pages.
#[inline]
#[must_use]
pub const fn page_align(bytes: u64) -> Option<u64> {
    match bytes.checked_add(Size4K::SIZE - 1) {
        Some(v) => Some(v & !(Size4K::SIZE - 1)),
        None => None,
    }
}

/// Number of 4 KiB pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> Option<u64> {
    match page_align(bytes) {
        Some(v) => Some(v >> Size4K::SHIFT),
        None => None,
    }
}

/// Smallest buddy order whose `2^order` pages hold `bytes`.
///
/// Zero and sub-page sizes are order 0.
#[inline]
#[must_use]
pub const fn order_for(bytes: u64) -> u32 {
    if bytes <= Size4K::SIZE {
        return 0;
    }
    let pages = (bytes - 1) >> Size4K::SHIFT;
    u64::BITS - pages.leading_zeros()
}
