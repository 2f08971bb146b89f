//! # Request and Reply Queues
//!
//! A [`RequestQueue`] is a host-produced [`PhaseRing`] with a producer-index
//! doorbell; a [`ReplyQueue`] is a controller-produced ring with a
//! consumer-index doorbell. The admin pair has id 0 and is owned by the
//! controller for its whole life; operational pairs are created during
//! bring-up with ids starting at 1, each request queue bound to the reply
//! queue with the same id.

use crate::descriptor::{self, DecodedReply};
use crate::mpi::REPLY_DESC_SIZE;
use crate::ring::{PhaseRing, QueueFull};
use crate::error::ControllerResult;
use crate::regs;
use core::sync::atomic::{fence, AtomicU32, Ordering};
use helix_hal::dma::DmaAllocator;
use helix_hal::interrupts::InterruptVector;
use helix_hal::mmio::RegisterInterface;
use helix_hal::PhysAddr;
use spin::{Mutex, MutexGuard};

/// Host-produced request ring
#[derive(Debug)]
pub struct RequestQueue {
    qid: u16,
    reply_qid: u16,
    doorbell: usize,
    ring: Mutex<PhaseRing>,
}

impl RequestQueue {
    /// Allocate a request ring of `depth` entries of `entry_size` bytes
    pub fn new(
        dma: &dyn DmaAllocator,
        qid: u16,
        reply_qid: u16,
        depth: u16,
        entry_size: usize,
    ) -> ControllerResult<Self> {
        let region = dma.allocate(depth as usize * entry_size, 64)?;
        let doorbell = if qid == 0 {
            regs::ADMIN_REQ_Q_PI
        } else {
            regs::oper_req_q_pi(qid)
        };
        Ok(Self {
            qid,
            reply_qid,
            doorbell,
            ring: Mutex::new(PhaseRing::new(region, entry_size, depth)),
        })
    }

    /// Queue id
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Id of the reply queue completions arrive on
    pub fn reply_qid(&self) -> u16 {
        self.reply_qid
    }

    /// Ring depth
    pub fn depth(&self) -> u16 {
        self.ring.lock().depth()
    }

    /// Largest frame one entry holds
    pub fn entry_size(&self) -> usize {
        self.ring.lock().entry_size()
    }

    /// Bus address of the ring
    pub fn phys(&self) -> PhysAddr {
        self.ring.lock().phys()
    }

    /// Current producer and consumer indices
    pub fn indices(&self) -> (u16, u16) {
        let ring = self.ring.lock();
        (ring.pi(), ring.ci())
    }

    /// Copy a request into the ring and ring the producer doorbell
    pub fn submit(&self, regs: &dyn RegisterInterface, frame: &[u8]) -> Result<(), QueueFull> {
        let mut ring = self.ring.lock();
        let pi = ring.try_push(frame)?;
        // The frame must be visible in memory before the controller sees the new PI.
        fence(Ordering::Release);
        regs.write32(self.doorbell, pi as u32);
        Ok(())
    }

    /// Record the consumer index the controller reported in a reply
    pub fn update_ci(&self, ci: u16) {
        self.ring.lock().set_ci(ci);
    }

    /// Zero the ring and rewind its indices
    pub fn reset(&self) {
        self.ring.lock().reset();
    }
}

/// Controller-produced reply ring
#[derive(Debug)]
pub struct ReplyQueue {
    qid: u16,
    vector: InterruptVector,
    doorbell: usize,
    ring: Mutex<PhaseRing>,
    pend_ios: AtomicU32,
}

impl ReplyQueue {
    /// Allocate a reply ring of `depth` descriptors serviced by `vector`
    pub fn new(dma: &dyn DmaAllocator, qid: u16, vector: InterruptVector, depth: u16) -> ControllerResult<Self> {
        let region = dma.allocate(depth as usize * REPLY_DESC_SIZE, 64)?;
        let doorbell = if qid == 0 {
            regs::ADMIN_REPLY_Q_CI
        } else {
            regs::oper_reply_q_ci(qid)
        };
        Ok(Self {
            qid,
            vector,
            doorbell,
            ring: Mutex::new(PhaseRing::new(region, REPLY_DESC_SIZE, depth)),
            pend_ios: AtomicU32::new(0),
        })
    }

    /// Queue id
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// Interrupt vector that services this queue
    pub fn vector(&self) -> InterruptVector {
        self.vector
    }

    /// Ring depth
    pub fn depth(&self) -> u16 {
        self.ring.lock().depth()
    }

    /// Bus address of the ring
    pub fn phys(&self) -> PhysAddr {
        self.ring.lock().phys()
    }

    /// Consumer index and expected phase
    pub fn position(&self) -> (u16, bool) {
        let ring = self.ring.lock();
        (ring.ci(), ring.phase())
    }

    /// I/Os submitted against this queue and not yet completed
    pub fn pending_ios(&self) -> u32 {
        self.pend_ios.load(Ordering::Acquire)
    }

    pub(crate) fn io_submitted(&self) {
        self.pend_ios.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn io_completed(&self) {
        let _ = self
            .pend_ios
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Start draining valid descriptors
    ///
    /// Only one drainer runs at a time; a concurrent caller gets an empty
    /// drain. The consumer-index doorbell is written once, when the drain is
    /// dropped, if anything was consumed.
    pub fn drain<'a>(&'a self, regs: &'a dyn RegisterInterface) -> ReplyDrain<'a> {
        ReplyDrain {
            ring: self.ring.try_lock(),
            regs,
            doorbell: self.doorbell,
            consumed: 0,
        }
    }

    /// Zero the ring, rewind its indices and forget pending I/O
    pub fn reset(&self) {
        self.ring.lock().reset();
        self.pend_ios.store(0, Ordering::Release);
    }
}

/// Lazy sequence of descriptors taken from a reply ring
pub struct ReplyDrain<'a> {
    ring: Option<MutexGuard<'a, PhaseRing>>,
    regs: &'a dyn RegisterInterface,
    doorbell: usize,
    consumed: u32,
}

impl ReplyDrain<'_> {
    /// Check if another drainer held the ring
    pub fn is_contended(&self) -> bool {
        self.ring.is_none()
    }
}

impl Iterator for ReplyDrain<'_> {
    type Item = Option<DecodedReply>;

    /// Yields `Some(None)` for a descriptor of unknown type; it is consumed
    /// and the drain continues.
    fn next(&mut self) -> Option<Self::Item> {
        let ring = self.ring.as_mut()?;
        let raw = ring.try_pop_if_phase_matches()?;
        self.consumed += 1;
        let decoded = descriptor::decode(&raw);
        if decoded.is_none() {
            log::warn!("[mpi3mr] unknown reply descriptor type {:#06x}", u16::from_le_bytes([raw[14], raw[15]]));
        }
        Some(decoded)
    }
}

impl Drop for ReplyDrain<'_> {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.as_ref() {
            if self.consumed > 0 {
                self.regs.write32(self.doorbell, ring.ci() as u32);
            }
        }
    }
}

/// A request queue and the reply queue its completions land on
#[derive(Debug)]
pub struct QueuePair {
    /// Request side
    pub request: RequestQueue,
    /// Reply side
    pub reply: ReplyQueue,
}

impl QueuePair {
    /// Allocate the admin pair
    pub fn admin(dma: &dyn DmaAllocator, req_depth: u16, reply_depth: u16, frame_size: usize) -> ControllerResult<Self> {
        Ok(Self {
            request: RequestQueue::new(dma, 0, 0, req_depth, frame_size)?,
            reply: ReplyQueue::new(dma, 0, 0, reply_depth)?,
        })
    }

    /// Allocate operational pair `qid` (1-based) serviced by `vector`
    pub fn operational(
        dma: &dyn DmaAllocator,
        qid: u16,
        vector: InterruptVector,
        req_depth: u16,
        reply_depth: u16,
        frame_size: usize,
    ) -> ControllerResult<Self> {
        Ok(Self {
            request: RequestQueue::new(dma, qid, qid, req_depth, frame_size)?,
            reply: ReplyQueue::new(dma, qid, vector, reply_depth)?,
        })
    }

    /// Zero both rings
    pub fn reset(&self) {
        self.request.reset();
        self.reply.reset();
    }
}
