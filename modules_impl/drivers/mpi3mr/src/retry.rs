//! # Bounded Polling
//!
//! Every hardware handshake in the driver is "check, delay, check again, give
//! up after N tries". [`Retry`] is that loop, against an injected [`Clock`].

use crate::error::{ControllerError, ControllerResult};
use helix_hal::timer::Clock;

/// Poll up to `attempts` times, `interval_ms` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Maximum number of checks
    pub attempts: u32,
    /// Delay between checks
    pub interval_ms: u64,
}

impl Retry {
    /// Cover `timeout_ms` with checks every `interval_ms`
    pub fn new(timeout_ms: u64, interval_ms: u64) -> Self {
        let interval_ms = interval_ms.max(1);
        Self {
            attempts: timeout_ms.div_ceil(interval_ms).clamp(1, u32::MAX as u64) as u32,
            interval_ms,
        }
    }

    /// Poll until `check` yields a value
    pub fn until<T>(&self, clock: &dyn Clock, mut check: impl FnMut() -> Option<T>) -> ControllerResult<T> {
        self.try_until(clock, || Ok(check()))
    }

    /// Poll until `check` yields a value or fails
    ///
    /// The check runs once more after the last delay so a condition that
    /// becomes true during the final interval is not reported as a timeout.
    pub fn try_until<T>(
        &self,
        clock: &dyn Clock,
        mut check: impl FnMut() -> ControllerResult<Option<T>>,
    ) -> ControllerResult<T> {
        for _ in 0..self.attempts {
            if let Some(v) = check()? {
                return Ok(v);
            }
            clock.delay_ms(self.interval_ms);
        }
        check()?.ok_or(ControllerError::Timeout)
    }
}
