//! The remapping step: a second, differently cached alias over pages the
//! caller already owns.

use crate::attrs::{DmaAttrs, PageProtection};
use crate::error::DmaError;
use crate::platform::Remapper;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Protection of the non-coherent alias: user-mappable, non-cacheable or
/// write-combine depending on `attrs`.
#[must_use]
pub const fn noncoherent_protection(attrs: DmaAttrs) -> PageProtection {
    PageProtection::kernel().with_user(true).for_dma(attrs, false)
}

/// Map `size` bytes at `page` into a fresh non-cacheable kernel range.
///
/// The caller must have flushed the cached alias first. The returned guard
/// unmaps the range again unless it is [committed](RemapGuard::commit).
///
/// # Errors
/// [`DmaError::RemapFailed`] if the remapper has no room.
pub(crate) fn remap_noncacheable<R: Remapper>(
    remapper: &R,
    page: PhysicalPage<Size4K>,
    size: u64,
    attrs: DmaAttrs,
) -> Result<RemapGuard<'_, R>, DmaError> {
    let prot = noncoherent_protection(attrs);
    let va = remapper
        .remap(page, size, prot)
        .ok_or(DmaError::RemapFailed)?;
    log::trace!("DMA: remapped {page} ({size:#x} bytes) at {va} as {:?}", prot.memory_type());
    Ok(RemapGuard {
        remapper,
        va,
        size,
        armed: true,
    })
}

/// An alias that is torn down on drop unless committed.
pub(crate) struct RemapGuard<'a, R: Remapper> {
    remapper: &'a R,
    va: VirtualAddress,
    size: u64,
    armed: bool,
}

impl<R: Remapper> RemapGuard<'_, R> {
    pub(crate) const fn va(&self) -> VirtualAddress {
        self.va
    }

    /// Keep the alias.
    pub(crate) fn commit(mut self) -> VirtualAddress {
        self.armed = false;
        self.va
    }
}

impl<R: Remapper> Drop for RemapGuard<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            log::trace!("DMA: dropping alias at {}", self.va);
            self.remapper.free_remap(self.va, self.size);
        }
    }
}
