//! # Helix HAL - Hardware Abstraction Layer
//!
//! This crate defines the traits and primitives device drivers use to reach
//! hardware. Drivers never touch raw pointers or port I/O directly; they go
//! through the seams defined here so the same driver code runs against real
//! silicon or against a software model of the device.
//!
//! ## Seams
//!
//! - [`mmio::RegisterInterface`]: typed 32/64-bit register access
//! - [`dma::DmaAllocator`]: DMA-coherent memory visible to bus masters
//! - [`timer::Clock`]: monotonic time and busy delays
//! - [`interrupts::VectorController`]: per-vector MSI-X masking
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: Only exposes what drivers need
//! - **Safe**: Encapsulates all unsafe operations
//! - **Replaceable**: Every seam has a software implementation for emulation

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod dma;
pub mod interrupts;
pub mod mmio;
pub mod timer;

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Resource is not available
    ResourceBusy,
    /// Operation timed out
    Timeout,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// Memory allocation failed
    OutOfMemory,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "operation not supported"),
            HalError::InvalidParameter => write!(f, "invalid parameter"),
            HalError::HardwareError => write!(f, "hardware error"),
            HalError::ResourceBusy => write!(f, "resource busy"),
            HalError::Timeout => write!(f, "timed out"),
            HalError::InvalidAddress => write!(f, "invalid address"),
            HalError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Physical (bus) address as seen by a DMA-capable device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

static_assertions::assert_eq_size!(PhysAddr, u64);

impl PhysAddr {
    /// The null bus address
    pub const NULL: Self = Self(0);

    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Byte distance from `base`, if this address is not below it
    #[inline]
    pub const fn offset_from(self, base: PhysAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Low 32 bits, for split register programming
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, for split register programming
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
