//! # Persistent Event Log Watch
//!
//! The controller keeps a persistent log of the events it raised. The host
//! parks a wait request on the event-log wait tag; the controller completes
//! it once an entry at or past a sequence number is logged for the watched
//! locales and classes. Each hit re-arms the wait one entry further on.
//!
//! A reset flushes the parked wait. The watch itself survives and the wait
//! is reissued once the controller is ready again.

use crate::controller::Controller;
use crate::error::ControllerResult;
use crate::mpi::{self, pel_status};
use crate::state::ResetReason;
use crate::tracker::{CompletionResult, CompletionStatus, TagRange, HOST_TAG_PEL_WAIT};
use alloc::boxed::Box;
use spin::Mutex;

/// Failed waits reissued before the watch is dropped
pub const PEL_WAIT_RETRIES: u8 = 3;

/// What an event log watch waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogFilter {
    /// First sequence number of interest
    pub seq_num: u32,
    /// Locale bits to match
    pub locale: u16,
    /// Lowest class to match
    pub class: u8,
}

#[derive(Debug, Default)]
struct WatchState {
    /// Set while a wait is wanted, parked or not
    filter: Option<EventLogFilter>,
    abort_requested: bool,
    retries: u8,
    updates: u32,
}

/// Event log watch bookkeeping
#[derive(Debug, Default)]
pub(crate) struct EventLogWatch {
    state: Mutex<WatchState>,
}

impl EventLogWatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Controller {
    /// Watch the persistent event log for entries matching `filter`
    ///
    /// A watch already in place is aborted and replaced.
    pub fn watch_event_log(&self, filter: EventLogFilter) -> ControllerResult<()> {
        self.check_alive()?;
        self.abort_event_log_watch()?;
        {
            let mut s = self.event_log.state.lock();
            s.filter = Some(filter);
            s.retries = 0;
        }
        self.issue_pel_wait().map_err(|e| {
            self.event_log.state.lock().filter = None;
            e
        })
    }

    /// Abort the event log watch, if one is in place
    pub fn abort_event_log_watch(&self) -> ControllerResult<()> {
        self.check_alive()?;
        {
            let mut s = self.event_log.state.lock();
            if s.filter.is_none() {
                return Ok(());
            }
            s.abort_requested = true;
        }
        let aborted = self
            .issue_internal(
                TagRange::PelAbort,
                self.config.admin_cmd_timeout_ms,
                ResetReason::PelAbortTimeout,
                |tag| mpi::pel_abort(tag, HOST_TAG_PEL_WAIT),
            )
            .and_then(|r| r.check());

        let mut s = self.event_log.state.lock();
        s.abort_requested = false;
        match aborted {
            Ok(()) => {
                s.filter = None;
                log::info!("[mpi3mr] event log watch aborted");
                Ok(())
            }
            Err(e) => {
                log::error!("[mpi3mr] event log abort failed: {}", e);
                Err(e)
            }
        }
    }

    /// Filter of the current event log watch
    pub fn event_log_watch(&self) -> Option<EventLogFilter> {
        self.event_log.state.lock().filter
    }

    /// Number of times the watch reported new entries
    pub fn event_log_updates(&self) -> u32 {
        self.event_log.state.lock().updates
    }

    /// Park the wait again after a reset
    pub(crate) fn reissue_event_log_watch(&self) {
        let armed = {
            let mut s = self.event_log.state.lock();
            s.abort_requested = false;
            s.retries = 0;
            s.filter.is_some()
        };
        if armed {
            if let Err(e) = self.issue_pel_wait() {
                log::warn!("[mpi3mr] event log watch not reissued: {}", e);
                self.event_log.state.lock().filter = None;
            }
        }
    }

    fn issue_pel_wait(&self) -> ControllerResult<()> {
        let Some(filter) = self.event_log.state.lock().filter else {
            return Ok(());
        };
        let slot = self.tracker.allocate(TagRange::PelWait)?;
        let frame = mpi::pel_wait(slot.tag(), filter.seq_num, filter.locale, filter.class);
        let submitted = self
            .tracker
            .set_callback(slot.tag(), Box::new(Controller::complete_pel_wait))
            .and_then(|_| self.submit_admin(frame.as_bytes()));
        if let Err(e) = submitted {
            self.return_tag(slot.tag());
            return Err(e);
        }
        log::debug!("[mpi3mr] event log wait parked at sequence {}", filter.seq_num);
        Ok(())
    }

    fn complete_pel_wait(&self, result: CompletionResult) {
        self.return_tag(result.host_tag);
        if result.status == CompletionStatus::Reset {
            return;
        }
        let log_status = result
            .reply
            .as_deref()
            .and_then(mpi::pel_log_status)
            .unwrap_or(pel_status::SUCCESS);

        {
            let mut s = self.event_log.state.lock();
            if log_status == pel_status::ABORTED {
                if !s.abort_requested {
                    log::warn!("[mpi3mr] event log wait aborted by the controller");
                    s.filter = None;
                }
                return;
            }
            if result.is_success() && log_status == pel_status::SUCCESS {
                s.retries = 0;
                s.updates += 1;
                if let Some(f) = s.filter.as_mut() {
                    log::info!("[mpi3mr] new event log entries from sequence {}", f.seq_num);
                    f.seq_num = f.seq_num.wrapping_add(1);
                }
            } else if s.retries < PEL_WAIT_RETRIES {
                s.retries += 1;
                log::warn!(
                    "[mpi3mr] event log wait failed: ioc_status {:#06x} log status {:#x}, retry {}",
                    result.ioc_status,
                    log_status,
                    s.retries
                );
            } else {
                log::error!("[mpi3mr] event log wait failed {} times, watch dropped", s.retries + 1);
                s.filter = None;
                return;
            }
        }

        if let Err(e) = self.issue_pel_wait() {
            log::warn!("[mpi3mr] event log wait not re-armed: {}", e);
            self.event_log.state.lock().filter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::sim;
    use crate::tracker::SlotState;

    const FILTER: EventLogFilter = EventLogFilter { seq_num: 100, locale: 0xFFFF, class: 2 };

    #[test]
    fn test_watch_parks_wait() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        assert_eq!(sim.pel_waits(), [FILTER]);
        assert!(sim.pel_wait_parked());
        assert_eq!(ctrl.tracker.state(HOST_TAG_PEL_WAIT), Some(SlotState::Pending));
    }

    #[test]
    fn test_hit_rearms_past_sequence() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        assert!(sim.log_pel_entry(pel_status::SUCCESS));
        ctrl.poll_reply_queue(0);
        assert_eq!(ctrl.event_log_updates(), 1);
        let waits = sim.pel_waits();
        assert_eq!(waits.len(), 2);
        assert_eq!(waits[1].seq_num, FILTER.seq_num + 1);
        assert!(sim.pel_wait_parked());
    }

    #[test]
    fn test_failed_wait_retried_then_dropped() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        for _ in 0..PEL_WAIT_RETRIES {
            assert!(sim.log_pel_entry(pel_status::NOT_READY));
            ctrl.poll_reply_queue(0);
            assert!(ctrl.event_log_watch().is_some());
        }
        assert!(sim.log_pel_entry(pel_status::NOT_READY));
        ctrl.poll_reply_queue(0);
        assert_eq!(ctrl.event_log_watch(), None);
        assert!(!sim.pel_wait_parked());
        assert_eq!(ctrl.event_log_updates(), 0);
    }

    #[test]
    fn test_abort_clears_watch() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        ctrl.abort_event_log_watch().unwrap();
        assert_eq!(ctrl.event_log_watch(), None);
        assert!(!sim.pel_wait_parked());
        assert_eq!(ctrl.tracker.state(HOST_TAG_PEL_WAIT), Some(SlotState::Free));
        // nothing to abort
        ctrl.abort_event_log_watch().unwrap();
    }

    #[test]
    fn test_new_watch_replaces_old() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        let wider = EventLogFilter { class: 0, ..FILTER };
        ctrl.watch_event_log(wider).unwrap();
        assert_eq!(ctrl.event_log_watch(), Some(wider));
        assert_eq!(sim.pel_waits(), [FILTER, wider]);
        assert!(sim.pel_wait_parked());
    }

    #[test]
    fn test_watch_reissued_after_reset() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.watch_event_log(FILTER).unwrap();
        ctrl.request_reset(ResetReason::Sysfs, false).unwrap();
        assert!(ctrl.is_ready());
        assert_eq!(ctrl.event_log_watch(), Some(FILTER));
        assert_eq!(sim.pel_waits(), [FILTER, FILTER]);
        assert!(sim.pel_wait_parked());
        assert_eq!(ctrl.tracker.state(HOST_TAG_PEL_WAIT), Some(SlotState::Pending));
    }

    #[test]
    fn test_no_watch_nothing_reissued() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.request_reset(ResetReason::Sysfs, false).unwrap();
        assert!(sim.pel_waits().is_empty());
    }
}
