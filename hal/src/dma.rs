//! # DMA-Coherent Memory
//!
//! Rings, reply frames and sense buffers live in memory that both the CPU and
//! a bus-mastering device access. A [`DmaRegion`] owns one such allocation and
//! exposes little-endian volatile accessors; the device sees it at
//! [`DmaRegion::phys`].
//!
//! [`HeapDmaAllocator`] backs regions with the kernel heap under an identity
//! bus mapping. It also implements [`BusAccess`], the device-side view used
//! by device models and emulators.

use crate::{HalError, HalResult, PhysAddr};
use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Allocator of DMA-coherent regions
pub trait DmaAllocator: Send + Sync {
    /// Allocate `len` zeroed bytes aligned to `align`
    fn allocate(&self, len: usize, align: usize) -> HalResult<DmaRegion>;
}

/// Returns a region's memory to whoever handed it out
pub trait DmaRelease: Send + Sync {
    /// Called exactly once when the region is dropped
    fn release(&self, ptr: NonNull<u8>, layout: Layout, phys: PhysAddr);
}

/// Device-side access to host memory by bus address
pub trait BusAccess: Send + Sync {
    /// Copy `buf.len()` bytes starting at `phys` into `buf`
    fn bus_read(&self, phys: PhysAddr, buf: &mut [u8]) -> HalResult<()>;

    /// Copy `data` to host memory starting at `phys`
    fn bus_write(&self, phys: PhysAddr, data: &[u8]) -> HalResult<()>;
}

// =============================================================================
// DmaRegion
// =============================================================================

/// An owned DMA-coherent allocation
pub struct DmaRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    phys: PhysAddr,
    owner: Arc<dyn DmaRelease>,
}

// SAFETY: the region exclusively owns its allocation. All accesses are
// bounds-checked volatile loads and stores; callers serialize writers with
// their own locks, as they would for any shared device memory.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Wrap an allocation produced by a platform allocator
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `layout.size()` bytes until
    /// `owner.release` is called, and `phys` must be its bus address.
    pub unsafe fn from_raw(
        ptr: NonNull<u8>,
        layout: Layout,
        phys: PhysAddr,
        owner: Arc<dyn DmaRelease>,
    ) -> Self {
        Self { ptr, layout, phys, owner }
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Check if the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Bus address of the first byte
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Bus address of the byte at `offset`
    #[inline]
    pub fn phys_at(&self, offset: usize) -> PhysAddr {
        self.phys.add(offset as u64)
    }

    /// Offset of `phys` inside this region, if it falls inside
    pub fn offset_of(&self, phys: PhysAddr) -> Option<usize> {
        let off = phys.offset_from(self.phys)? as usize;
        (off < self.len()).then_some(off)
    }

    #[inline]
    fn at(&self, offset: usize, width: usize) -> *mut u8 {
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len()),
            "dma access out of bounds: {:#x}+{} > {:#x}",
            offset,
            width,
            self.len()
        );
        // SAFETY: offset + width is within the allocation.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// Read a byte
    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        // SAFETY: `at` checked bounds.
        unsafe { self.at(offset, 1).read_volatile() }
    }

    /// Read a little-endian `u16`
    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        u16::from_le_bytes(unsafe { self.at(offset, 2).cast::<[u8; 2]>().read_volatile() })
    }

    /// Read a little-endian `u32`
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        u32::from_le_bytes(unsafe { self.at(offset, 4).cast::<[u8; 4]>().read_volatile() })
    }

    /// Read a little-endian `u64`
    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        u64::from_le_bytes(unsafe { self.at(offset, 8).cast::<[u8; 8]>().read_volatile() })
    }

    /// Write a byte
    #[inline]
    pub fn write_u8(&self, offset: usize, value: u8) {
        // SAFETY: `at` checked bounds.
        unsafe { self.at(offset, 1).write_volatile(value) }
    }

    /// Write a little-endian `u16`
    #[inline]
    pub fn write_u16(&self, offset: usize, value: u16) {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        unsafe { self.at(offset, 2).cast::<[u8; 2]>().write_volatile(value.to_le_bytes()) }
    }

    /// Write a little-endian `u32`
    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        unsafe { self.at(offset, 4).cast::<[u8; 4]>().write_volatile(value.to_le_bytes()) }
    }

    /// Write a little-endian `u64`
    #[inline]
    pub fn write_u64(&self, offset: usize, value: u64) {
        // SAFETY: `at` checked bounds; byte arrays have alignment 1.
        unsafe { self.at(offset, 8).cast::<[u8; 8]>().write_volatile(value.to_le_bytes()) }
    }

    /// Copy bytes out of the region
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let src = self.at(offset, buf.len());
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: `at` checked the whole span.
            *b = unsafe { src.add(i).read_volatile() };
        }
    }

    /// Copy bytes into the region
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let dst = self.at(offset, data.len());
        for (i, b) in data.iter().enumerate() {
            // SAFETY: `at` checked the whole span.
            unsafe { dst.add(i).write_volatile(*b) };
        }
    }

    /// Zero `len` bytes starting at `offset`
    pub fn zero_range(&self, offset: usize, len: usize) {
        let dst = self.at(offset, len);
        for i in 0..len {
            // SAFETY: `at` checked the whole span.
            unsafe { dst.add(i).write_volatile(0) };
        }
    }

    /// Zero the whole region
    pub fn zero(&self) {
        self.zero_range(0, self.len());
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.owner.release(self.ptr, self.layout, self.phys);
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &self.phys)
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Heap-backed allocator
// =============================================================================

struct HeapDmaInner {
    /// Live regions: bus address -> length
    regions: Mutex<BTreeMap<u64, usize>>,
    allocated: AtomicUsize,
    limit: usize,
}

impl DmaRelease for HeapDmaInner {
    fn release(&self, ptr: NonNull<u8>, layout: Layout, phys: PhysAddr) {
        // Unregister first so a concurrent bus access cannot reach freed memory.
        self.regions.lock().remove(&phys.as_u64());
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        // SAFETY: allocated in `allocate` with this exact layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
    }
}

/// Heap-backed DMA allocator with an identity bus mapping
#[derive(Clone)]
pub struct HeapDmaAllocator {
    inner: Arc<HeapDmaInner>,
}

impl HeapDmaAllocator {
    /// Create an allocator with no size limit
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create an allocator that refuses to hand out more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(HeapDmaInner {
                regions: Mutex::new(BTreeMap::new()),
                allocated: AtomicUsize::new(0),
                limit,
            }),
        }
    }

    /// Bytes currently handed out
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Number of live regions
    pub fn region_count(&self) -> usize {
        self.inner.regions.lock().len()
    }

    /// Run `f` on the host pointer backing `[phys, phys + len)`
    fn with_span<R>(&self, phys: PhysAddr, len: usize, f: impl FnOnce(*mut u8) -> R) -> HalResult<R> {
        let regions = self.inner.regions.lock();
        let (&start, &size) = regions
            .range(..=phys.as_u64())
            .next_back()
            .ok_or(HalError::InvalidAddress)?;
        let end = phys.as_u64().checked_add(len as u64).ok_or(HalError::InvalidAddress)?;
        if end > start + size as u64 {
            return Err(HalError::InvalidAddress);
        }
        // The lock stays held while `f` runs so the region cannot be released.
        Ok(f(phys.as_u64() as usize as *mut u8))
    }
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapDmaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapDmaAllocator")
            .field("allocated", &self.allocated_bytes())
            .field("regions", &self.region_count())
            .finish()
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate(&self, len: usize, align: usize) -> HalResult<DmaRegion> {
        if len == 0 {
            return Err(HalError::InvalidParameter);
        }
        let layout = Layout::from_size_align(len, align.max(1)).map_err(|_| HalError::InvalidParameter)?;

        let prev = self.inner.allocated.fetch_add(len, Ordering::Relaxed);
        if prev.saturating_add(len) > self.inner.limit {
            self.inner.allocated.fetch_sub(len, Ordering::Relaxed);
            log::warn!("dma: allocation of {} bytes exceeds limit", len);
            return Err(HalError::OutOfMemory);
        }

        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            self.inner.allocated.fetch_sub(len, Ordering::Relaxed);
            HalError::OutOfMemory
        })?;
        let phys = PhysAddr::new(ptr.as_ptr() as usize as u64);
        self.inner.regions.lock().insert(phys.as_u64(), len);

        let owner: Arc<dyn DmaRelease> = self.inner.clone();
        // SAFETY: freshly allocated with `layout`; identity mapping.
        Ok(unsafe { DmaRegion::from_raw(ptr, layout, phys, owner) })
    }
}

impl BusAccess for HeapDmaAllocator {
    fn bus_read(&self, phys: PhysAddr, buf: &mut [u8]) -> HalResult<()> {
        self.with_span(phys, buf.len(), |src| {
            for (i, b) in buf.iter_mut().enumerate() {
                // SAFETY: span validated against a live region.
                *b = unsafe { src.add(i).read_volatile() };
            }
        })
    }

    fn bus_write(&self, phys: PhysAddr, data: &[u8]) -> HalResult<()> {
        self.with_span(phys, data.len(), |dst| {
            for (i, b) in data.iter().enumerate() {
                // SAFETY: span validated against a live region.
                unsafe { dst.add(i).write_volatile(*b) };
            }
        })
    }
}
