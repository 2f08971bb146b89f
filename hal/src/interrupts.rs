//! # Interrupt Vector Control
//!
//! Message-signalled devices raise one vector per completion queue. Drivers
//! mask every vector around a controller reset and unmask them once the queues
//! exist again; the platform's interrupt dispatch then calls the driver's
//! handler with the vector index.

use crate::{HalError, HalResult};
use core::sync::atomic::{AtomicU64, Ordering};

/// Index of a message-signalled vector within one device
pub type InterruptVector = u16;

/// Per-device MSI-X vector masking
pub trait VectorController: Send + Sync {
    /// Number of vectors granted to the device
    fn vector_count(&self) -> u16;

    /// Unmask a vector
    fn enable_vector(&self, vector: InterruptVector) -> HalResult<()>;

    /// Mask a vector
    fn disable_vector(&self, vector: InterruptVector) -> HalResult<()>;

    /// Check if a vector is unmasked
    fn is_vector_enabled(&self, vector: InterruptVector) -> bool;

    /// Unmask the first `count` vectors
    fn enable_vectors(&self, count: u16) -> HalResult<()> {
        for v in 0..count {
            self.enable_vector(v)?;
        }
        Ok(())
    }

    /// Mask every vector
    fn disable_all(&self) {
        for v in 0..self.vector_count() {
            let _ = self.disable_vector(v);
        }
    }
}

/// Software vector table: a mask bit per vector, up to 64 vectors
#[derive(Debug)]
pub struct VectorTable {
    count: u16,
    enabled: AtomicU64,
}

impl VectorTable {
    /// Maximum vectors tracked
    pub const MAX_VECTORS: u16 = 64;

    /// Create a table of `count` masked vectors
    pub fn new(count: u16) -> Self {
        Self {
            count: count.min(Self::MAX_VECTORS),
            enabled: AtomicU64::new(0),
        }
    }

    /// Raw enabled mask
    pub fn mask(&self) -> u64 {
        self.enabled.load(Ordering::Acquire)
    }
}

impl VectorController for VectorTable {
    fn vector_count(&self) -> u16 {
        self.count
    }

    fn enable_vector(&self, vector: InterruptVector) -> HalResult<()> {
        if vector >= self.count {
            return Err(HalError::InvalidParameter);
        }
        self.enabled.fetch_or(1 << vector, Ordering::AcqRel);
        Ok(())
    }

    fn disable_vector(&self, vector: InterruptVector) -> HalResult<()> {
        if vector >= self.count {
            return Err(HalError::InvalidParameter);
        }
        self.enabled.fetch_and(!(1 << vector), Ordering::AcqRel);
        Ok(())
    }

    fn is_vector_enabled(&self, vector: InterruptVector) -> bool {
        vector < self.count && self.mask() & (1 << vector) != 0
    }

    fn disable_all(&self) {
        self.enabled.store(0, Ordering::Release);
    }
}
