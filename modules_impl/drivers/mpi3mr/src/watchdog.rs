//! # Watchdog
//!
//! One pass of [`Controller::watchdog_tick`] looks at the controller the way
//! an interrupt-less host would: the prepare-for-reset countdown, the
//! reset-history bit, the fault register and resets other contexts asked
//! for. [`Controller::run_watchdog`] repeats it until shutdown.

use crate::controller::Controller;
use crate::regs::{fault, IocStatus};
use crate::state::ResetReason;
use core::sync::atomic::Ordering;

/// What one watchdog pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Nothing to do
    Idle,
    /// A fault is being handled elsewhere or the firmware is saving data
    Waiting,
    /// A controller reset was run
    Reset(ResetReason),
    /// The controller is gone; supervision ends
    Unrecoverable,
    /// Shutdown was requested; supervision ends
    Stopped,
}

impl WatchdogAction {
    /// Check if supervision should end after this pass
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchdogAction::Unrecoverable | WatchdogAction::Stopped)
    }
}

impl Controller {
    /// Run one supervision pass
    pub fn watchdog_tick(&self) -> WatchdogAction {
        if self.shutting_down.load(Ordering::Acquire) {
            return WatchdogAction::Stopped;
        }
        if self.is_unrecoverable() {
            return WatchdogAction::Unrecoverable;
        }

        if self.prepare_for_reset.load(Ordering::Acquire) {
            let ticks = self.prepare_for_reset_ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if ticks >= self.config.prepare_for_reset_ticks {
                log::warn!("[mpi3mr] announced reset did not happen within {} passes", ticks);
                return self.watchdog_reset(ResetReason::CiActivationTimer, true);
            }
        }

        let status = self.ioc_status();
        if status.contains(IocStatus::RESET_HISTORY) {
            log::warn!("[mpi3mr] controller reset itself");
            return self.watchdog_reset(ResetReason::Firmware, false);
        }

        if status.contains(IocStatus::FAULT) {
            if let Some(action) = self.watch_fault() {
                return action;
            }
        } else if let Some(request) = self.take_reset_request() {
            return self.watchdog_reset(request.reason, request.snapdump);
        }
        WatchdogAction::Idle
    }

    fn watch_fault(&self) -> Option<WatchdogAction> {
        if self.diag_save_in_progress() {
            let ticks = self.diagsave_ticks.fetch_add(1, Ordering::AcqRel);
            if ticks == 0 {
                self.log_fault_info();
            }
            if u64::from(ticks) < self.config.diag_save_timeout_ms / self.config.watchdog_interval_ms.max(1) {
                return Some(WatchdogAction::Waiting);
            }
        }
        self.log_fault_info();
        self.diagsave_ticks.store(0, Ordering::Release);

        let code = self.fault_code();
        if fault::is_terminal(code) {
            log::error!("[mpi3mr] fault {:#06x} needs intervention outside the driver", code);
            self.mark_unrecoverable();
            return Some(WatchdogAction::Unrecoverable);
        }
        if code == fault::DIAG_FAULT_RESET
            || code == fault::SOFT_RESET_IN_PROGRESS
            || self.is_reset_in_progress()
        {
            return Some(WatchdogAction::Waiting);
        }
        // A pending request is answered by the fault reset below.
        let _ = self.take_reset_request();
        let action = if code == fault::CI_ACTIVATION_RESET {
            self.watchdog_reset(ResetReason::CiActivationFault, false)
        } else {
            self.watchdog_reset(ResetReason::FaultWatch, self.config.snapdump_on_fault)
        };
        Some(action)
    }

    fn watchdog_reset(&self, reason: ResetReason, snapdump: bool) -> WatchdogAction {
        match self.request_reset(reason, snapdump) {
            Ok(()) => WatchdogAction::Reset(reason),
            Err(_) if self.is_unrecoverable() => WatchdogAction::Unrecoverable,
            Err(e) => {
                log::warn!("[mpi3mr] watchdog reset ({}) not run: {}", reason, e);
                WatchdogAction::Waiting
            }
        }
    }

    /// Supervise the controller until shutdown or an unrecoverable fault
    pub fn run_watchdog(&self) -> WatchdogAction {
        log::info!("[mpi3mr] watchdog started");
        loop {
            let action = self.watchdog_tick();
            if action.is_terminal() {
                log::info!("[mpi3mr] watchdog stopped: {:?}", action);
                return action;
            }
            self.clock.delay_ms(self.config.watchdog_interval_ms);
        }
    }
}
