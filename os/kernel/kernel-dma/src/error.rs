use crate::device::DeviceId;
use crate::region::Ownership;
use kernel_memory_addresses::{DeviceAddress, VirtualAddress};

/// Everything that can go wrong in the DMA layer.
///
/// Every failure is reported after all sub-resources acquired by the failing
/// call have been returned; see [`DmaError::kind`] for the coarse class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    #[error("no device context supplied")]
    MissingDevice,
    #[error("atomic pool is not initialized")]
    PoolUnavailable,
    #[error("invalid atomic pool size ({0:#x} bytes)")]
    InvalidPoolSize(u64),
    #[error("invalid value for boot parameter `{0}`")]
    InvalidConfig(&'static str),
    #[error("{0} is already bound to a DMA operation table")]
    AlreadyBound(DeviceId),
    #[error("platform handed out {0}, which is still live")]
    AddressReused(VirtualAddress),

    #[error("atomic pool exhausted ({requested:#x} bytes requested)")]
    PoolExhausted { requested: u64 },
    #[error("contiguous reservation exhausted")]
    ContiguousExhausted,
    #[error("out of memory")]
    OutOfMemory,
    #[error("bounce engine failed to map the buffer")]
    MappingFailed,

    #[error("failed to remap memory")]
    RemapFailed,

    #[error("zero-sized request")]
    ZeroSize,
    #[error("{0} does not belong to a live allocation")]
    UnknownAllocation(VirtualAddress),
    #[error("size mismatch: allocated {allocated:#x} bytes, freeing {freed:#x} bytes")]
    SizeMismatch { allocated: u64, freed: u64 },
    #[error("{0} is already free")]
    DoubleFree(VirtualAddress),
    #[error("range at {0} overlaps a live allocation without matching it")]
    PartialOverlap(VirtualAddress),
    #[error("handle {0} does not match the allocation")]
    HandleMismatch(DeviceAddress),
    #[error("buffer is {actual:?}, operation requires {expected:?}")]
    WrongOwner {
        expected: Ownership,
        actual: Ownership,
    },
    #[error("address is not reachable through this device's bus window")]
    AddressTranslation,
    #[error("user mapping exceeds the allocation")]
    MmapOutOfRange,
}

/// Coarse error class, used by callers that only care about what to do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The call or the platform was set up wrong (no device, no pool, bad
    /// boot parameter, an allocator handing out live addresses).
    Configuration,
    /// Some allocator ran dry. Nothing is retried inside this layer.
    ResourceExhausted,
    /// Pages were obtained but could not be aliased; they were released again.
    RemapFailure,
    /// The caller handed in something this layer does not own.
    Usage,
}

impl DmaError {
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::MissingDevice
            | Self::PoolUnavailable
            | Self::InvalidPoolSize(_)
            | Self::InvalidConfig(_)
            | Self::AlreadyBound(_)
            | Self::AddressReused(_) => ErrorKind::Configuration,
            Self::PoolExhausted { .. }
            | Self::ContiguousExhausted
            | Self::OutOfMemory
            | Self::MappingFailed => ErrorKind::ResourceExhausted,
            Self::RemapFailed => ErrorKind::RemapFailure,
            Self::ZeroSize
            | Self::UnknownAllocation(_)
            | Self::SizeMismatch { .. }
            | Self::DoubleFree(_)
            | Self::PartialOverlap(_)
            | Self::HandleMismatch(_)
            | Self::WrongOwner { .. }
            | Self::AddressTranslation
            | Self::MmapOutOfRange => ErrorKind::Usage,
        }
    }
}
