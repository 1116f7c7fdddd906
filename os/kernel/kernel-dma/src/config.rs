//! Boot-time configuration of the DMA layer.

use crate::error::DmaError;
use crate::platform::Zone;
use kernel_memory_addresses::page_align;

/// Atomic pool size used when nothing else is configured (256 KiB).
pub const DEFAULT_ATOMIC_POOL_SIZE: u64 = 256 * 1024;

/// Devices whose coherent mask fits in this many bits allocate from the DMA zone.
pub const DEFAULT_ZONE_DMA_BITS: u32 = 32;

/// Tunables for [`DmaSubsystem::init`](crate::DmaSubsystem::init).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    /// Bytes reserved for non-blocking non-coherent allocations.
    pub atomic_pool_size: u64,
    /// Whether a contiguous reservation may back allocations at all.
    pub contiguous: bool,
    /// Whether the platform has a low-memory DMA zone.
    pub zone_dma: bool,
    /// Upper address width of the DMA zone.
    pub zone_dma_bits: u32,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            atomic_pool_size: DEFAULT_ATOMIC_POOL_SIZE,
            contiguous: true,
            zone_dma: true,
            zone_dma_bits: DEFAULT_ZONE_DMA_BITS,
        }
    }

    #[must_use]
    pub const fn with_atomic_pool_size(mut self, bytes: u64) -> Self {
        self.atomic_pool_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_contiguous(mut self, enabled: bool) -> Self {
        self.contiguous = enabled;
        self
    }

    #[must_use]
    pub const fn with_zone_dma(mut self, enabled: bool) -> Self {
        self.zone_dma = enabled;
        self
    }

    /// Defaults overridden by the recognized parameters of a kernel command line.
    ///
    /// # Errors
    /// See [`apply_cmdline`](Self::apply_cmdline).
    pub fn from_cmdline(cmdline: &str) -> Result<Self, DmaError> {
        let mut config = Self::new();
        config.apply_cmdline(cmdline)?;
        Ok(config)
    }

    /// Apply `coherent_pool=<size>` from a whitespace separated command line.
    ///
    /// Unknown parameters are ignored; the last occurrence wins.
    ///
    /// # Errors
    /// [`DmaError::InvalidConfig`] if the size does not parse.
    pub fn apply_cmdline(&mut self, cmdline: &str) -> Result<(), DmaError> {
        for param in cmdline.split_ascii_whitespace() {
            if let Some(value) = param.strip_prefix("coherent_pool=") {
                self.atomic_pool_size =
                    parse_size(value).ok_or(DmaError::InvalidConfig("coherent_pool"))?;
            }
        }
        Ok(())
    }

    /// The pool size to reserve, rounded up to whole pages.
    ///
    /// # Errors
    /// [`DmaError::InvalidPoolSize`] for a zero size or one that cannot be rounded.
    pub const fn validate(&self) -> Result<u64, DmaError> {
        let size = self.atomic_pool_size;
        match page_align(size) {
            Some(aligned) if aligned != 0 => Ok(aligned),
            _ => Err(DmaError::InvalidPoolSize(size)),
        }
    }

    /// The zone to allocate from for a device with this coherent mask.
    #[must_use]
    pub const fn zone_for(&self, coherent_mask: u64) -> Zone {
        if !self.zone_dma {
            return Zone::Normal;
        }
        let limit = if self.zone_dma_bits >= u64::BITS {
            u64::MAX
        } else {
            (1u64 << self.zone_dma_bits) - 1
        };
        if coherent_mask <= limit {
            Zone::Dma
        } else {
            Zone::Normal
        }
    }
}

/// Parse a size such as `512K`, `0x40000` or `1M`.
///
/// Decimal or `0x`-prefixed hex, optionally followed by one of
/// `K`, `M`, `G`, `T`, `P`, `E` (binary multiples, either case).
#[must_use]
pub fn parse_size(text: &str) -> Option<u64> {
    let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };

    let split = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let (number, suffix) = digits.split_at(split);
    if number.is_empty() {
        return None;
    }
    let value = u64::from_str_radix(number, radix).ok()?;

    let shift = match suffix {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        "e" | "E" => 60,
        _ => return None,
    };
    value.checked_mul(1u64 << shift)
}
