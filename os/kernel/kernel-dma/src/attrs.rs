//! Transfer directions, mapping attributes, allocation flags and page protections.

use bitfield_struct::bitfield;
use core::ops::{BitAnd, BitOr};

/// Which way the data moves during a streaming transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// The device may read and write the buffer.
    Bidirectional,
    /// The device reads the buffer (CPU produced it).
    ToDevice,
    /// The device writes the buffer (CPU consumes it afterwards).
    FromDevice,
}

impl DmaDirection {
    /// Whether the device may write into the buffer.
    #[inline]
    #[must_use]
    pub const fn device_writes(self) -> bool {
        matches!(self, Self::Bidirectional | Self::FromDevice)
    }

    /// Whether the device may read CPU-produced data from the buffer.
    #[inline]
    #[must_use]
    pub const fn device_reads(self) -> bool {
        matches!(self, Self::Bidirectional | Self::ToDevice)
    }
}

/// Attributes that modify how a mapping or allocation is made.
///
/// Combine with `|`; test with [`DmaAttrs::contains`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DmaAttrs(u32);

impl DmaAttrs {
    pub const NONE: Self = Self(0);
    /// Writes to the CPU mapping may be buffered (write-combine memory type).
    pub const WRITE_COMBINE: Self = Self(1 << 0);
    /// The caller manages cache coherence of a scatter-gather map itself.
    pub const SKIP_CPU_SYNC: Self = Self(1 << 1);
    /// Suppress allocation failure reports.
    pub const NO_WARN: Self = Self(1 << 2);

    #[inline]
    #[must_use]
    pub const fn contains(self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for DmaAttrs {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for DmaAttrs {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

/// Caller context for an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// The caller may sleep (process context, no locks held).
    const WAIT: u32 = 1 << 0;

    /// Interrupt or atomic context: must not block.
    pub const ATOMIC: Self = Self(0);
    /// Ordinary process context: may block.
    pub const KERNEL: Self = Self(Self::WAIT);

    #[inline]
    #[must_use]
    pub const fn can_block(self) -> bool {
        self.0 & Self::WAIT != 0
    }
}

/// Memory type encoded in a [`PageProtection`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    /// Write-back cacheable.
    Normal = 0,
    /// Normal memory, not cached.
    NormalNonCacheable = 1,
    /// Uncached, writes may be merged in a buffer.
    WriteCombine = 2,
    /// Device memory, no gathering or reordering.
    Device = 3,
}

impl MemoryType {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::NormalNonCacheable,
            2 => Self::WriteCombine,
            _ => Self::Device,
        }
    }

    /// Whether CPU accesses through such a mapping allocate cache lines.
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::Normal)
    }
}

/// Protection bits of a CPU mapping, as passed to the remapper.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct PageProtection {
    /// Mapping is present.
    pub valid: bool,
    /// Mapping allows stores.
    pub writable: bool,
    /// Mapping may be handed out to user space.
    pub user: bool,
    /// Caching behavior of the mapping.
    #[bits(3)]
    pub memory_type: MemoryType,
    #[bits(58)]
    __: u64,
}

impl PageProtection {
    /// Cached, writable kernel mapping.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new()
            .with_valid(true)
            .with_writable(true)
            .with_memory_type(MemoryType::Normal)
    }

    /// The protection a DMA buffer's CPU mapping gets, derived from `self`.
    ///
    /// Write-combine wins when requested; otherwise non-coherent devices get
    /// a non-cacheable mapping and coherent devices keep `self` as is.
    #[must_use]
    pub const fn for_dma(self, attrs: DmaAttrs, coherent: bool) -> Self {
        if attrs.contains(DmaAttrs::WRITE_COMBINE) {
            self.with_memory_type(MemoryType::WriteCombine)
        } else if !coherent {
            self.with_memory_type(MemoryType::NormalNonCacheable)
        } else {
            self
        }
    }
}
