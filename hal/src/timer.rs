//! # Time Source
//!
//! Drivers poll hardware with bounded delays. [`Clock`] supplies a monotonic
//! microsecond counter and a busy delay; [`ManualClock`] is a virtual clock
//! whose delays advance time instantly, for device emulation.

use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic time source with busy-wait delays
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin
    fn now_us(&self) -> u64;

    /// Busy-wait for `us` microseconds
    fn delay_us(&self, us: u64);

    /// Busy-wait for `ms` milliseconds
    fn delay_ms(&self, ms: u64) {
        self.delay_us(ms.saturating_mul(1000));
    }

    /// Milliseconds since the origin
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

/// Virtual clock: time only moves when someone delays or advances it
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero
    pub const fn new() -> Self {
        Self { now_us: AtomicU64::new(0) }
    }

    /// Move time forward without a caller blocking
    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
        core::hint::spin_loop();
    }
}
