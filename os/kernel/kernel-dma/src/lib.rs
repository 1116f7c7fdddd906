//! # DMA mapping for CPUs with caches and devices that may not see them
//!
//! This crate decides how memory is shared between the CPU and bus-mastering
//! devices, and brackets every hand-over with the cache maintenance the
//! device needs:
//!
//! - **Allocation**: coherent devices get cached memory as is. Non-coherent
//!   devices get a second, non-cacheable alias of flushed pages, or memory
//!   from the pre-remapped [`AtomicPool`] when the caller cannot block.
//! - **Streaming**: [`DmaSubsystem::map_single`], `unmap_single`, the sync
//!   calls and their scatter-gather forms hand existing buffers to a device
//!   and back, cleaning or invalidating the CPU caches on the way.
//! - **Binding**: [`dma_bus_notifier`] fixes each device's [`DmaOps`] table
//!   once, when the device is added to its bus.
//!
//! The machine itself (caches, bounce buffers, page allocators, page tables)
//! is reached through the traits in [`platform`].
//!
//! Physical, virtual and device addresses are distinct types from
//! [`kernel_memory_addresses`]; converting between them always goes through
//! a [`Device`] or the [`LinearMap`](platform::LinearMap).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod allocation;
mod atomic_pool;
mod attrs;
mod binding;
mod cache;
mod config;
mod device;
mod error;
mod mapping;
mod mmap;
mod ops;
pub mod platform;
mod region;
mod remap;
mod scatterlist;
mod subsystem;

pub use allocation::{AllocStrategy, DmaAllocation};
pub use atomic_pool::AtomicPool;
pub use attrs::{AllocFlags, DmaAttrs, DmaDirection, MemoryType, PageProtection};
pub use binding::{BusEvent, NotifyResult, bind_device, dma_bus_notifier};
pub use cache::CacheOp;
pub use config::{DEFAULT_ATOMIC_POOL_SIZE, DEFAULT_ZONE_DMA_BITS, DmaConfig, parse_size};
pub use device::{Device, DeviceId, dma_bit_mask};
pub use error::{DmaError, ErrorKind};
pub use ops::{CoherentOps, DmaMapOps, DmaOps, NonCoherentOps};
pub use region::{DmaRegion, Ownership};
pub use remap::noncoherent_protection;
pub use scatterlist::ScatterEntry;
pub use subsystem::DmaSubsystem;
