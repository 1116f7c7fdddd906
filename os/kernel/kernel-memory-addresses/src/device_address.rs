use crate::MemoryAddress;
use core::fmt;

/// Bus address handed to a device ("DMA handle").
///
/// Opaque to the CPU: it is only ever handed back to unmap, sync or free.
/// [`DeviceAddress::INVALID`] is the all-ones sentinel left in place of a
/// handle when an allocation or mapping fails, and is also the `Default`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(MemoryAddress);

impl DeviceAddress {
    pub const INVALID: Self = Self(MemoryAddress::new(u64::MAX));

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0.as_u64() != u64::MAX
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "DA(0x{:016X})", self.as_u64())
        } else {
            f.write_str("DA(INVALID)")
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}
