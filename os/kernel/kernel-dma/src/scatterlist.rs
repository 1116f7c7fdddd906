use kernel_memory_addresses::{DeviceAddress, PhysicalAddress};

/// One physically contiguous piece of a scatter-gather transfer.
///
/// The mapping calls fill in `dma_address` and `dma_length`; entries beyond
/// the count a map call returns keep [`DeviceAddress::INVALID`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScatterEntry {
    pub phys: PhysicalAddress,
    pub length: u64,
    pub dma_address: DeviceAddress,
    pub dma_length: u64,
}

impl ScatterEntry {
    #[must_use]
    pub const fn new(phys: PhysicalAddress, length: u64) -> Self {
        Self {
            phys,
            length,
            dma_address: DeviceAddress::INVALID,
            dma_length: 0,
        }
    }

    /// Forget the device side of the entry.
    pub const fn clear_mapping(&mut self) {
        self.dma_address = DeviceAddress::INVALID;
        self.dma_length = 0;
    }
}
