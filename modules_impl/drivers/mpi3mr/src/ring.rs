//! # Phase Rings
//!
//! Every request and reply queue is a circular array of fixed-size entries in
//! DMA memory, indexed by a producer index (PI) and a consumer index (CI).
//!
//! Request rings are produced by the host: the ring is full when advancing PI
//! would make it equal to CI. Reply rings are produced by the controller: an
//! entry is valid only when the phase bit stored in it equals the phase the
//! host expects, and the expected phase flips each time CI wraps to zero.
//! PI/CI comparisons alone never decide whether a reply is present.

use crate::mpi::{reply_flags, REPLY_DESC_SIZE};
use core::fmt;
use helix_hal::dma::DmaRegion;
use helix_hal::PhysAddr;

/// Request ring has no free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue full")
    }
}

impl From<QueueFull> for crate::error::ControllerError {
    fn from(_: QueueFull) -> Self {
        crate::error::ControllerError::QueueFull
    }
}

/// Offset of the descriptor flags word inside a reply entry
const REPLY_FLAGS_OFFSET: usize = 14;

/// A circular ring of fixed-size entries in DMA memory
pub struct PhaseRing {
    region: DmaRegion,
    entry_size: usize,
    depth: u16,
    pi: u16,
    ci: u16,
    /// Phase the host expects in the next valid reply entry
    phase: bool,
}

impl PhaseRing {
    /// Wrap `region` as a ring of `depth` entries of `entry_size` bytes
    pub fn new(region: DmaRegion, entry_size: usize, depth: u16) -> Self {
        assert!(depth >= 2, "ring depth must be at least 2");
        assert!(
            region.len() >= entry_size * depth as usize,
            "ring region too small"
        );
        Self {
            region,
            entry_size,
            depth,
            pi: 0,
            ci: 0,
            phase: true,
        }
    }

    /// Number of entries
    #[inline]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Size of one entry
    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Bus address of entry 0
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.region.phys()
    }

    /// Producer index
    #[inline]
    pub fn pi(&self) -> u16 {
        self.pi
    }

    /// Consumer index
    #[inline]
    pub fn ci(&self) -> u16 {
        self.ci
    }

    /// Expected phase of the next reply entry
    #[inline]
    pub fn phase(&self) -> bool {
        self.phase
    }

    #[inline]
    fn last(&self) -> u16 {
        self.depth - 1
    }

    #[inline]
    fn next(&self, index: u16) -> u16 {
        if index == self.last() {
            0
        } else {
            index + 1
        }
    }

    /// Check if advancing PI would collide with CI
    #[inline]
    pub fn is_full(&self) -> bool {
        self.ci == self.pi + 1 || (self.ci == 0 && self.pi == self.last())
    }

    /// Number of entries the host has produced and the consumer has not taken
    pub fn outstanding(&self) -> u16 {
        if self.pi >= self.ci {
            self.pi - self.ci
        } else {
            self.depth - self.ci + self.pi
        }
    }

    /// Copy `frame` into the slot at PI and advance PI
    ///
    /// Returns the new PI, the value the doorbell must receive. The frame is
    /// zero-padded to the entry size; callers reject longer frames.
    pub fn try_push(&mut self, frame: &[u8]) -> Result<u16, QueueFull> {
        debug_assert!(frame.len() <= self.entry_size);
        if self.is_full() {
            return Err(QueueFull);
        }
        let off = self.pi as usize * self.entry_size;
        let len = frame.len().min(self.entry_size);
        self.region.zero_range(off, self.entry_size);
        self.region.write_bytes(off, &frame[..len]);
        self.pi = self.next(self.pi);
        Ok(self.pi)
    }

    /// Take the entry at CI if its phase bit matches the expected phase
    ///
    /// Advances CI, flipping the expected phase when CI wraps.
    pub fn try_pop_if_phase_matches(&mut self) -> Option<[u8; REPLY_DESC_SIZE]> {
        let off = self.ci as usize * self.entry_size;
        let flags = self.region.read_u16(off + REPLY_FLAGS_OFFSET);
        if (flags & reply_flags::PHASE_MASK != 0) != self.phase {
            return None;
        }
        let mut desc = [0u8; REPLY_DESC_SIZE];
        self.region.read_bytes(off, &mut desc);
        self.ci = self.next(self.ci);
        if self.ci == 0 {
            self.phase = !self.phase;
        }
        Some(desc)
    }

    /// Record the consumer index the controller reported for a request ring
    ///
    /// Out-of-range values are ignored.
    pub fn set_ci(&mut self, ci: u16) -> bool {
        if ci >= self.depth {
            log::warn!("[mpi3mr] request queue CI {} out of range (depth {})", ci, self.depth);
            return false;
        }
        self.ci = ci;
        true
    }

    /// Zero the ring memory and rewind the indices
    pub fn reset(&mut self) {
        self.region.zero();
        self.pi = 0;
        self.ci = 0;
        self.phase = true;
    }
}

impl fmt::Debug for PhaseRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseRing")
            .field("depth", &self.depth)
            .field("pi", &self.pi)
            .field("ci", &self.ci)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_hal::dma::{DmaAllocator, HeapDmaAllocator};

    fn ring(depth: u16, entry: usize) -> PhaseRing {
        let dma = HeapDmaAllocator::new();
        PhaseRing::new(dma.allocate(depth as usize * entry, 16).unwrap(), entry, depth)
    }

    fn produce(ring: &PhaseRing, index: u16, phase: bool, tag: u16) {
        let off = index as usize * REPLY_DESC_SIZE;
        ring.region.write_u16(off, tag);
        ring.region.write_u16(off + REPLY_FLAGS_OFFSET, phase as u16);
    }

    #[test]
    fn test_request_ring_full_leaves_one_slot() {
        let mut r = ring(4, 32);
        assert_eq!(r.try_push(&[1]), Ok(1));
        assert_eq!(r.try_push(&[2]), Ok(2));
        assert_eq!(r.try_push(&[3]), Ok(3));
        assert!(r.is_full());
        assert_eq!(r.try_push(&[4]), Err(QueueFull));
        assert_eq!(r.outstanding(), 3);

        assert!(r.set_ci(2));
        assert_eq!(r.try_push(&[4]), Ok(0));
        assert_eq!(r.try_push(&[5]), Ok(1));
        assert!(r.is_full());
        assert!(r.pi() < r.depth() && r.ci() < r.depth());
    }

    #[test]
    fn test_push_pads_entry() {
        let mut r = ring(2, 8);
        r.region.write_u64(0, u64::MAX);
        r.try_push(&[0xAA, 0xBB]).unwrap();
        assert_eq!(r.region.read_u64(0), 0xBBAA);
    }

    #[test]
    fn test_reply_invisible_until_phase_set() {
        let mut r = ring(4, REPLY_DESC_SIZE);
        assert!(r.try_pop_if_phase_matches().is_none());

        produce(&r, 0, true, 7);
        let desc = r.try_pop_if_phase_matches().unwrap();
        assert_eq!(u16::from_le_bytes([desc[0], desc[1]]), 7);
        assert_eq!(r.ci(), 1);
        assert!(r.try_pop_if_phase_matches().is_none());
    }

    #[test]
    fn test_phase_flips_on_wrap() {
        let mut r = ring(2, REPLY_DESC_SIZE);
        produce(&r, 0, true, 1);
        produce(&r, 1, true, 2);
        assert!(r.try_pop_if_phase_matches().is_some());
        assert!(r.try_pop_if_phase_matches().is_some());
        assert_eq!(r.ci(), 0);
        assert!(!r.phase());

        // Stale entry from the previous lap is not valid
        assert!(r.try_pop_if_phase_matches().is_none());
        produce(&r, 0, false, 3);
        assert!(r.try_pop_if_phase_matches().is_some());
    }

    #[test]
    fn test_set_ci_rejects_out_of_range() {
        let mut r = ring(4, 32);
        assert!(!r.set_ci(4));
        assert_eq!(r.ci(), 0);
    }

    #[test]
    fn test_reset() {
        let mut r = ring(2, REPLY_DESC_SIZE);
        produce(&r, 0, true, 1);
        produce(&r, 1, true, 1);
        r.try_pop_if_phase_matches();
        r.try_pop_if_phase_matches();
        r.reset();
        assert_eq!((r.pi(), r.ci(), r.phase()), (0, 0, true));
        assert!(r.try_pop_if_phase_matches().is_none());
    }
}
