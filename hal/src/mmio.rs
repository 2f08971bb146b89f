//! # Memory-Mapped Register Access
//!
//! Drivers read and write device registers through [`RegisterInterface`].
//! The interface carries no policy: it is a typed window onto a BAR.

use core::ptr::NonNull;

/// Typed access to a block of device registers
///
/// Offsets are byte offsets from the start of the register block.
pub trait RegisterInterface: Send + Sync {
    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);

    /// Read a 64-bit register
    ///
    /// The default splits the access into two 32-bit reads, low word first.
    fn read64(&self, offset: usize) -> u64 {
        let low = self.read32(offset) as u64;
        let high = self.read32(offset + 4) as u64;
        (high << 32) | low
    }

    /// Write a 64-bit register
    ///
    /// The default splits the access into two 32-bit writes, low word first.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// A mapped MMIO window
#[derive(Debug)]
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a device mapping; every access is a single volatile
// load or store, which the device serializes.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap an already-mapped register window
    ///
    /// # Safety
    /// `base` must point to an uncached device mapping of at least `len`
    /// bytes that stays mapped for the lifetime of the region.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Size of the window in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0 && offset + width <= self.len,
            "register access out of window: offset {:#x}",
            offset
        );
    }
}

impl RegisterInterface for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: bounds and alignment checked above; mapping valid per `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        // SAFETY: bounds and alignment checked above; mapping valid per `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write_volatile(value) }
    }

    fn read64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        // SAFETY: bounds and alignment checked above; mapping valid per `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().read_volatile() }
    }

    fn write64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        // SAFETY: bounds and alignment checked above; mapping valid per `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().write_volatile(value) }
    }
}
