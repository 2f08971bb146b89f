//! # Reply and Sense Buffer Pools
//!
//! A pool is an array of equally sized DMA buffers plus a free queue of their
//! bus addresses. The controller pops addresses off the free queue when it
//! needs a reply frame or sense buffer; the host pushes them back once it has
//! read the contents, advancing the host index and ringing the pool's doorbell.
//!
//! The free queue holds one entry more than there are buffers, so it is never
//! completely full from the hardware's point of view. At init every buffer is
//! posted and the host index sits at `num_bufs`.

use crate::error::ControllerResult;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use helix_hal::dma::{DmaAllocator, DmaRegion};
use helix_hal::mmio::RegisterInterface;
use helix_hal::PhysAddr;
use spin::Mutex;

/// Which pool, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Reply frames
    Reply,
    /// Sense buffers
    Sense,
}

impl PoolKind {
    fn name(self) -> &'static str {
        match self {
            PoolKind::Reply => "reply",
            PoolKind::Sense => "sense",
        }
    }
}

/// Why a repost was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepostError {
    /// Every buffer is already on the free queue
    Full,
    /// This buffer is already on the free queue
    AlreadyPosted,
    /// The address does not start a buffer of this pool
    NotInPool,
}

impl fmt::Display for RepostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepostError::Full => write!(f, "free queue full"),
            RepostError::AlreadyPosted => write!(f, "buffer already posted"),
            RepostError::NotInPool => write!(f, "address not in pool"),
        }
    }
}

struct FreeQueueState {
    host_index: u16,
    /// Buffers currently owned by the controller
    posted: Vec<bool>,
    posted_count: u16,
}

/// A pool of DMA buffers with its free queue
pub struct BufferPool {
    kind: PoolKind,
    buffers: DmaRegion,
    buf_size: usize,
    num_bufs: u16,
    free_queue: DmaRegion,
    doorbell: usize,
    state: Mutex<FreeQueueState>,
}

impl BufferPool {
    const FREE_ENTRY_SIZE: usize = 8;

    /// Allocate `num_bufs` buffers of `buf_size` bytes and post them all
    pub fn new(
        dma: &dyn DmaAllocator,
        kind: PoolKind,
        num_bufs: u16,
        buf_size: usize,
        doorbell: usize,
    ) -> ControllerResult<Self> {
        let buffers = dma.allocate(num_bufs as usize * buf_size, 16)?;
        let free_queue = dma.allocate((num_bufs as usize + 1) * Self::FREE_ENTRY_SIZE, 8)?;
        let pool = Self {
            kind,
            buffers,
            buf_size,
            num_bufs,
            free_queue,
            doorbell,
            state: Mutex::new(FreeQueueState {
                host_index: 0,
                posted: vec![false; num_bufs as usize],
                posted_count: 0,
            }),
        };
        pool.reset();
        log::debug!(
            "[mpi3mr] {} pool: {} buffers of {} bytes at {}",
            kind.name(),
            num_bufs,
            buf_size,
            pool.buffers.phys()
        );
        Ok(pool)
    }

    /// Number of buffers
    pub fn num_bufs(&self) -> u16 {
        self.num_bufs
    }

    /// Size of one buffer
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Free queue depth as programmed into the controller
    pub fn free_queue_depth(&self) -> u16 {
        self.num_bufs + 1
    }

    /// Bus address of the free queue
    pub fn free_queue_phys(&self) -> PhysAddr {
        self.free_queue.phys()
    }

    /// Current host index
    pub fn host_index(&self) -> u16 {
        self.state.lock().host_index
    }

    /// Buffers currently posted to the controller
    pub fn posted_count(&self) -> u16 {
        self.state.lock().posted_count
    }

    fn index_of(&self, addr: PhysAddr) -> Option<usize> {
        let off = self.buffers.offset_of(addr)?;
        (off % self.buf_size == 0).then_some(off / self.buf_size)
    }

    /// Check if `addr` starts a buffer of this pool
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.index_of(addr).is_some()
    }

    /// Copy `len` bytes of the buffer at `addr` and mark it consumed
    ///
    /// The buffer stays out of the free queue until [`repost`](Self::repost).
    pub fn take(&self, addr: PhysAddr, len: usize) -> Option<Vec<u8>> {
        let index = self.index_of(addr)?;
        let mut data = vec![0u8; len.min(self.buf_size)];
        self.buffers.read_bytes(index * self.buf_size, &mut data);

        let mut state = self.state.lock();
        if state.posted[index] {
            state.posted[index] = false;
            state.posted_count -= 1;
        }
        Some(data)
    }

    /// Return a consumed buffer to the free queue and ring the doorbell
    pub fn repost(&self, regs: &dyn RegisterInterface, addr: PhysAddr) -> Result<(), RepostError> {
        let index = self.index_of(addr).ok_or(RepostError::NotInPool)?;
        let mut state = self.state.lock();
        if state.posted[index] {
            log::warn!("[mpi3mr] {} buffer {} reposted twice", self.kind.name(), addr);
            return Err(RepostError::AlreadyPosted);
        }
        if state.posted_count >= self.num_bufs {
            log::warn!("[mpi3mr] {} free queue full, dropping {}", self.kind.name(), addr);
            return Err(RepostError::Full);
        }

        let slot = state.host_index as usize * Self::FREE_ENTRY_SIZE;
        self.free_queue.write_u64(slot, addr.as_u64());
        state.host_index = if state.host_index == self.num_bufs {
            0
        } else {
            state.host_index + 1
        };
        state.posted[index] = true;
        state.posted_count += 1;
        regs.write32(self.doorbell, state.host_index as u32);
        Ok(())
    }

    /// Zero the buffers and post every one of them again
    ///
    /// Used at allocation and on controller reset, before the host index is
    /// handed to the controller.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.buffers.zero();
        self.free_queue.zero();
        for i in 0..self.num_bufs as usize {
            let addr = self.buffers.phys_at(i * self.buf_size);
            self.free_queue.write_u64(i * Self::FREE_ENTRY_SIZE, addr.as_u64());
        }
        state.posted.iter_mut().for_each(|p| *p = true);
        state.posted_count = self.num_bufs;
        state.host_index = self.num_bufs;
    }

    /// Publish the host index to the controller
    pub fn post_host_index(&self, regs: &dyn RegisterInterface) {
        let host_index = self.state.lock().host_index;
        regs.write32(self.doorbell, host_index as u32);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("kind", &self.kind)
            .field("num_bufs", &self.num_bufs)
            .field("buf_size", &self.buf_size)
            .finish()
    }
}
