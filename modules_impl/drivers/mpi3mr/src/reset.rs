//! # Reset and Recovery
//!
//! Every recovery path funnels into [`Controller::request_reset`]: the
//! watchdog, admin timeouts, the I/O escalation ladder and management
//! callers. A reset quiesces the host side, runs the host-diagnostic
//! handshake, flushes every outstanding command with a reset status and
//! brings the controller back up on the pools and rings it already owns.
//!
//! Only one reset runs at a time. The claim is a compare-and-swap on
//! `reset_in_progress`; the [`QuiesceGuard`] holding it lifts the freeze on
//! every exit path. A failed handshake or bring-up leaves the controller
//! unrecoverable and every later call fails fast.

use crate::bringup::InitType;
use crate::controller::Controller;
use crate::error::{ControllerError, ControllerResult};
use crate::mpi::{self, task_type, HOST_TAG_INVALID};
use crate::regs::{self, fault, HostDiag, IocConfig, IocStatus, ResetAction};
use crate::retry::Retry;
use crate::state::ResetReason;
use crate::tracker::{CommandSlot, IoBinding, TagRange};
use core::sync::atomic::{AtomicU32, Ordering};

/// Counts a pass-through caller in flight; a reset waits for it
pub(crate) struct PendingAdminGuard<'a> {
    counter: &'a AtomicU32,
}

impl<'a> PendingAdminGuard<'a> {
    pub(crate) fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for PendingAdminGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive claim on the reset path
///
/// While held, I/O submission and pass-through commands are refused.
struct QuiesceGuard<'a> {
    ctrl: &'a Controller,
}

impl<'a> QuiesceGuard<'a> {
    fn claim(ctrl: &'a Controller) -> ControllerResult<Self> {
        if ctrl
            .reset_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("[mpi3mr] reset already in progress");
            return Err(ControllerError::ResetInProgress);
        }
        ctrl.io_frozen.store(true, Ordering::Release);
        ctrl.block_ioctls.store(true, Ordering::Release);
        Ok(Self { ctrl })
    }
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        self.ctrl.block_ioctls.store(false, Ordering::Release);
        self.ctrl.io_frozen.store(false, Ordering::Release);
        self.ctrl.reset_in_progress.store(false, Ordering::Release);
    }
}

/// How a timed-out I/O was finally terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRecovery {
    /// An abort task terminated it
    Aborted,
    /// A target reset terminated it
    TargetReset,
    /// Only a controller reset got rid of it
    ControllerReset,
}

impl Controller {
    /// Reset the controller and bring it back up
    ///
    /// With `snapdump` the firmware is asked to save a diagnostic snapshot
    /// before the reset. A controller showing a fault only a power cycle or
    /// a complete reset can clear is marked unrecoverable without a
    /// handshake.
    pub fn request_reset(&self, reason: ResetReason, snapdump: bool) -> ControllerResult<()> {
        self.check_alive()?;
        if self.ioc_status().contains(IocStatus::FAULT) {
            let code = self.fault_code();
            if fault::is_terminal(code) {
                self.log_fault_info();
                log::error!("[mpi3mr] fault {:#06x} cannot be cleared by the driver", code);
                self.mark_unrecoverable();
                return Err(ControllerError::Unrecoverable);
            }
        }
        self.soft_reset_handler(reason, snapdump)
    }

    fn soft_reset_handler(&self, reason: ResetReason, snapdump: bool) -> ControllerResult<()> {
        self.wait_for_diag_save();
        self.check_alive()?;
        let quiesce = QuiesceGuard::claim(self)?;
        self.ready.store(false, Ordering::Release);
        log::info!("[mpi3mr] controller reset ({}) started", reason);

        if self.wait_for_events_idle().is_err() {
            log::warn!("[mpi3mr] event handlers still running at reset");
        }
        self.wait_for_pending_admin();
        if !snapdump && !reason.is_fault_driven() {
            self.mask_all_events();
        }
        self.irq.disable_all();
        if snapdump {
            self.trigger_snapdump(reason);
        }

        self.reset_count.fetch_add(1, Ordering::AcqRel);
        let result = self.issue_reset(ResetAction::SoftReset, reason).and_then(|_| {
            self.reset_buffers();
            self.initialize_ioc(InitType::Reset)
        });

        match result {
            Ok(()) => {
                self.clock.delay_ms(self.config.post_reset_settle_ms);
                self.diagsave_ticks.store(0, Ordering::Release);
                drop(quiesce);
                self.refresh_devices();
                log::info!("[mpi3mr] controller reset ({}) complete", reason);
                Ok(())
            }
            Err(e) => {
                log::error!("[mpi3mr] controller reset ({}) failed: {}", reason, e);
                let _ = self.issue_reset(ResetAction::DiagFault, reason);
                self.mark_unrecoverable();
                self.tracker.flush_for_reset(self);
                Err(ControllerError::Unrecoverable)
            }
        }
    }

    fn wait_for_pending_admin(&self) {
        let drained = Retry::new(self.config.pending_admin_wait_ms, self.config.poll_interval_ms).until(
            &*self.clock,
            || {
                let idle = self.pend_ioctls.load(Ordering::Acquire) == 0;
                (idle || self.ioc_status().contains(IocStatus::FAULT)).then_some(())
            },
        );
        if drained.is_err() {
            log::warn!(
                "[mpi3mr] {} pass-through commands still pending at reset",
                self.pend_ioctls.load(Ordering::Acquire)
            );
        }
    }

    /// Return every ring, pool and table to its post-allocation state
    fn reset_buffers(&self) {
        self.tracker.flush_for_reset(self);
        self.devices.invalidate_handles();
        self.devices.reset_counters();

        self.admin.reset();
        for pair in self.op_queues.read().iter() {
            pair.reset();
        }
        if let Some(pools) = self.pools.read().as_ref() {
            pools.reply.reset();
            pools.sense.reset();
        }
        self.events.clear_delayed();
        self.prepare_for_reset.store(false, Ordering::Release);
        self.prepare_for_reset_ticks.store(0, Ordering::Release);
    }

    // =========================================================================
    // Register handshakes
    // =========================================================================

    /// Run the host-diagnostic reset handshake
    ///
    /// A failure marks the controller unrecoverable.
    pub(crate) fn issue_reset(&self, action: ResetAction, reason: ResetReason) -> ControllerResult<()> {
        self.check_alive()?;
        if reason == ResetReason::Firmware {
            // The firmware already reset itself; only the history is left over.
            self.clear_reset_history();
            return Ok(());
        }
        log::info!("[mpi3mr] issuing {} ({})", action.name(), reason);

        self.clear_reset_history();
        if let Err(e) = self.unlock_host_diag() {
            log::error!("[mpi3mr] host diagnostic unlock failed");
            self.mark_unrecoverable();
            return Err(e);
        }

        self.regs.write32(regs::SCRATCHPAD0, reason.code());
        let diag = self.regs.read32(regs::HOST_DIAG);
        self.regs.write32(regs::HOST_DIAG, diag | action.bits());

        let acked = Retry::new(self.config.reset_ack_timeout_ms, self.config.poll_interval_ms).until(
            &*self.clock,
            || match action {
                ResetAction::SoftReset => {
                    let status = self.ioc_status();
                    if status.contains(IocStatus::RESET_HISTORY) && Self::reset_took_effect(status, self.ioc_config()) {
                        self.clear_reset_history();
                        Some(())
                    } else {
                        None
                    }
                }
                ResetAction::DiagFault => {
                    let faulted = self.ioc_status().contains(IocStatus::FAULT);
                    (faulted && self.fault_code() == fault::DIAG_FAULT_RESET).then_some(())
                }
            },
        );

        self.regs.write32(regs::WRITE_SEQUENCE, regs::WRITE_SEQUENCE_RELOCK);
        log::info!(
            "[mpi3mr] after {}: ioc_status {:#010x} ioc_config {:#010x}",
            action.name(),
            self.ioc_status().bits(),
            self.ioc_config().bits()
        );
        if acked.is_err() {
            log::error!("[mpi3mr] controller did not acknowledge {}", action.name());
            self.mark_unrecoverable();
        }
        acked
    }

    fn unlock_host_diag(&self) -> ControllerResult<()> {
        let attempts = self.config.host_diag_unlock_retries.max(1);
        for attempt in 1..=attempts {
            for key in regs::WRITE_SEQUENCE_KEYS {
                self.regs.write32(regs::WRITE_SEQUENCE, key);
            }
            self.clock.delay_ms(1);
            let diag = HostDiag::from_bits_retain(self.regs.read32(regs::HOST_DIAG));
            if diag.contains(HostDiag::DIAG_WRITE_ENABLE) {
                return Ok(());
            }
            log::debug!("[mpi3mr] unlock attempt {} of {} failed", attempt, attempts);
        }
        Err(ControllerError::Timeout)
    }

    fn reset_took_effect(status: IocStatus, config: IocConfig) -> bool {
        !status.intersects(IocStatus::READY | IocStatus::FAULT) && !config.contains(IocConfig::ENABLE_IOC)
    }

    /// Write the reset-history bit back to clear it
    pub(crate) fn clear_reset_history(&self) {
        let status = self.regs.read32(regs::IOC_STATUS);
        if status & IocStatus::RESET_HISTORY.bits() != 0 {
            self.regs.write32(regs::IOC_STATUS, status);
        }
    }

    /// Message unit reset: disable the IOC and wait for it to go idle
    pub(crate) fn message_unit_reset(&self, reason: ResetReason) -> ControllerResult<()> {
        self.check_alive()?;
        log::info!("[mpi3mr] message unit reset ({})", reason);
        self.clear_reset_history();
        self.regs.write32(regs::SCRATCHPAD0, reason.code());
        let config = self.ioc_config().difference(IocConfig::ENABLE_IOC);
        self.regs.write32(regs::IOC_CONFIG, config.bits());

        let done = Retry::new(self.config.mur_timeout_ms, self.config.poll_interval_ms).until(&*self.clock, || {
            let status = self.ioc_status();
            if !status.contains(IocStatus::RESET_HISTORY) {
                return None;
            }
            self.clear_reset_history();
            Self::reset_took_effect(status, self.ioc_config()).then_some(())
        });
        log::info!(
            "[mpi3mr] after message unit reset: ioc_status {:#010x} ioc_config {:#010x}",
            self.ioc_status().bits(),
            self.ioc_config().bits()
        );
        if done.is_err() {
            log::error!("[mpi3mr] message unit reset timed out");
        }
        done
    }

    // =========================================================================
    // Fault capture
    // =========================================================================

    /// Log the fault code and the three fault information words
    pub(crate) fn log_fault_info(&self) {
        if !self.ioc_status().contains(IocStatus::FAULT) {
            return;
        }
        let info = regs::FAULT_INFO.map(|r| self.regs.read32(r));
        log::error!(
            "[mpi3mr] fault {:#06x} info {:#010x} {:#010x} {:#010x}",
            self.fault_code(),
            info[0],
            info[1],
            info[2]
        );
    }

    pub(crate) fn diag_save_in_progress(&self) -> bool {
        HostDiag::from_bits_retain(self.regs.read32(regs::HOST_DIAG)).contains(HostDiag::SAVE_IN_PROGRESS)
    }

    fn wait_for_diag_save(&self) {
        if !self.diag_save_in_progress() {
            return;
        }
        log::info!("[mpi3mr] waiting for the diagnostic save to finish");
        let saved = Retry::new(self.config.diag_save_timeout_ms, self.config.poll_interval_ms)
            .until(&*self.clock, || (!self.diag_save_in_progress()).then_some(()));
        if saved.is_err() {
            log::warn!("[mpi3mr] diagnostic save still running");
        }
    }

    /// Fault the controller on purpose so the firmware saves a snapshot
    pub(crate) fn trigger_snapdump(&self, reason: ResetReason) {
        log::info!("[mpi3mr] snapdump triggered ({})", reason);
        let config = self.ioc_config() | IocConfig::DIAG_SAVE;
        self.regs.write32(regs::IOC_CONFIG, config.bits());
        if self.issue_reset(ResetAction::DiagFault, reason).is_ok() {
            self.wait_for_diag_save();
        }
    }

    /// Inspect the controller after an internal command timed out
    ///
    /// A fault or a firmware-initiated reset is logged; a silent controller
    /// is asked for a snapshot.
    pub(crate) fn check_rh_fault(&self, reason: ResetReason) {
        if self.is_unrecoverable() {
            return;
        }
        let status = self.ioc_status();
        if status.contains(IocStatus::RESET_HISTORY) {
            log::warn!("[mpi3mr] controller reset itself ({})", reason);
        }
        if status.intersects(IocStatus::RESET_HISTORY | IocStatus::FAULT) {
            self.log_fault_info();
            return;
        }
        self.trigger_snapdump(reason);
    }

    // =========================================================================
    // I/O escalation
    // =========================================================================

    /// Terminate a timed-out I/O: abort task, then target reset, then a
    /// controller reset
    pub fn escalate_io_timeout(&self, slot: &CommandSlot) -> ControllerResult<IoRecovery> {
        self.check_alive()?;
        let tag = slot.tag();
        let binding = self.tracker.io_binding(tag).ok_or(ControllerError::InvalidTag(tag))?;
        log::warn!("[mpi3mr] I/O {:#06x} to handle {:#06x} timed out", tag, binding.dev_handle);

        let ladder = [
            (task_type::ABORT_TASK, tag, IoRecovery::Aborted),
            (task_type::TARGET_RESET, HOST_TAG_INVALID, IoRecovery::TargetReset),
        ];
        for (task, task_tag, outcome) in ladder {
            match self.issue_task_mgmt(binding.dev_handle, task, task_tag) {
                Ok(()) if self.io_terminated(tag, &binding) => {
                    log::info!("[mpi3mr] I/O {:#06x} terminated by {:?}", tag, outcome);
                    self.withdraw_reset_request(ResetReason::ScsiIoTimeout);
                    return Ok(outcome);
                }
                Ok(()) => log::warn!("[mpi3mr] task {:#04x} left I/O {:#06x} outstanding", task, tag),
                Err(e) => log::warn!("[mpi3mr] task {:#04x} for I/O {:#06x} failed: {}", task, tag, e),
            }
        }

        // The controller reset below supersedes whatever the TM timeouts scheduled.
        let _ = self.take_reset_request();
        self.request_reset(ResetReason::ScsiIoTimeout, false)?;
        Ok(IoRecovery::ControllerReset)
    }

    fn issue_task_mgmt(&self, dev_handle: u16, task: u8, task_tag: u16) -> ControllerResult<()> {
        self.issue_internal(
            TagRange::TaskMgmt,
            self.config.admin_cmd_timeout_ms,
            ResetReason::TmTimeout,
            |tag| mpi::task_mgmt(tag, dev_handle, task, task_tag, 0),
        )?
        .check()
    }

    fn io_terminated(&self, tag: u16, binding: &IoBinding) -> bool {
        let vector = self
            .op_queues
            .read()
            .get(binding.queue_index as usize)
            .map_or(0, |q| q.reply.vector());
        self.poll_reply_queue(vector);
        self.tracker.io_binding(tag).is_none()
    }
}
