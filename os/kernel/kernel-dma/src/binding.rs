//! Per-device coherence binding, driven by bus notifications.

use crate::device::Device;
use crate::error::DmaError;
use crate::ops::DmaOps;

/// Bus notifications a device can generate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BusEvent {
    AddDevice,
    DeleteDevice,
    BindDriver,
    BoundDriver,
    UnbindDriver,
    UnboundDriver,
}

/// Answer of a bus notifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NotifyResult {
    /// Not interested in this event.
    Done,
    /// Event handled.
    Ok,
}

/// Bind `dev` to the table matching its declared coherence.
///
/// # Errors
/// [`DmaError::AlreadyBound`] if the device already has a table; the existing
/// table stays in effect.
pub fn bind_device(dev: &Device) -> Result<DmaOps, DmaError> {
    let ops = if dev.dma_coherent() {
        DmaOps::Coherent
    } else {
        DmaOps::NonCoherent
    };
    let ops = dev.bind_ops(ops)?;
    log::debug!("DMA: {} ({}) uses {ops:?} operations", dev.name(), dev.id());
    Ok(ops)
}

/// Bus notifier: binds the operation table when a device is added.
///
/// Every other event is ignored.
pub fn dma_bus_notifier(event: BusEvent, dev: &Device) -> NotifyResult {
    if event != BusEvent::AddDevice {
        return NotifyResult::Done;
    }

    match bind_device(dev) {
        Ok(_) => NotifyResult::Ok,
        Err(e) => {
            log::warn!("DMA: {e}; keeping {:?}", dev.dma_ops());
            NotifyResult::Done
        }
    }
}
