//! # Physical, Virtual and Device Address Types
//!
//! Strongly typed wrappers for the three address spaces a DMA transfer touches.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Host RAM as seen by the memory controller. |
//! | [`VirtualAddress`] | A CPU pointer, through either the cached linear alias or a remapped alias. |
//! | [`DeviceAddress`] | The bus address a device is programmed with (the "DMA handle"). |
//!
//! All three wrap a principal [`MemoryAddress`]. There is no
//! `From`/`Into` between the kinds: moving between spaces always goes through
//! a translation that knows the mapping (a linear map, a remap, or a device's
//! bus offset). Arithmetic *within* one space is offered in checked form.
//!
//! ## Page granularity
//!
//! [`Size4K`] is the allocation granule. The helpers [`page_align`],
//! [`pages_for`] and [`order_for`] mirror the rounding every allocation path
//! applies to a requested byte size.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert_eq!(page_align(1), Some(4096));
//! assert_eq!(pages_for(8193), Some(3));
//! assert_eq!(order_for(3 * 4096), 2);
//!
//! let pa = PhysicalAddress::new(0x8000_0042);
//! assert_eq!(pa.page::<Size4K>().base(), PhysicalAddress::new(0x8000_0000));
//! assert_eq!(pa.checked_sub(PhysicalAddress::new(0x8000_0000)), Some(0x42));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod device_address;
mod memory_address;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use device_address::DeviceAddress;
pub use memory_address::MemoryAddress;
pub use page_size::{PageSize, Size4K, order_for, page_align, pages_for};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
