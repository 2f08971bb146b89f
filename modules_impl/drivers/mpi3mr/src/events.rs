//! # Events
//!
//! The controller reports topology changes and other asynchronous conditions
//! as event notifications on the admin reply queue, tagged with the invalid
//! host tag. The driver chooses which events it wants through a 128-bit mask
//! and acknowledges the events that ask for it.
//!
//! Acknowledgements use the event-ack tag range. When every ack tag is busy
//! the ack is postponed; the completion of an earlier ack sends the oldest
//! postponed one on the same tag.

use crate::controller::Controller;
use crate::error::ControllerResult;
use crate::mpi::{self, EventNotification};
use crate::retry::Retry;
use crate::state::ResetReason;
use crate::tracker::{CompletionResult, CompletionStatus, TagRange};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

/// Event codes
pub mod event {
    /// Log data
    pub const LOG_DATA: u8 = 0x01;
    /// Generic change
    pub const CHANGE: u8 = 0x02;
    /// Cable management
    pub const CABLE_MGMT: u8 = 0x0B;
    /// Device added
    pub const DEVICE_ADDED: u8 = 0x0C;
    /// Device information changed
    pub const DEVICE_INFO_CHANGED: u8 = 0x0D;
    /// Firmware is about to reset the controller
    pub const PREPARE_FOR_RESET: u8 = 0x0E;
    /// Component image activation started
    pub const COMP_IMAGE_ACT_START: u8 = 0x0F;
    /// Enclosure device added
    pub const ENCL_DEVICE_ADDED: u8 = 0x10;
    /// Enclosure device status change
    pub const ENCL_DEVICE_STATUS_CHANGE: u8 = 0x11;
    /// Device status change
    pub const DEVICE_STATUS_CHANGE: u8 = 0x12;
    /// Energy pack change
    pub const ENERGY_PACK_CHANGE: u8 = 0x13;
    /// SAS discovery
    pub const SAS_DISCOVERY: u8 = 0x20;
    /// SAS broadcast primitive
    pub const SAS_BROADCAST_PRIMITIVE: u8 = 0x21;
    /// SAS topology change list
    pub const SAS_TOPOLOGY_CHANGE_LIST: u8 = 0x25;
    /// SAS device discovery error
    pub const SAS_DEVICE_DISCOVERY_ERROR: u8 = 0x27;
    /// PCIe topology change list
    pub const PCIE_TOPOLOGY_CHANGE_LIST: u8 = 0x30;
    /// PCIe enumeration
    pub const PCIE_ENUMERATION: u8 = 0x31;
}

/// Prepare-for-reset reason codes (first byte of the event data)
pub mod prepare_reset {
    /// The firmware will reset the controller
    pub const START: u8 = 0x01;
    /// The pending reset was called off
    pub const ABORT: u8 = 0x02;
}

/// Events the driver unmasks at registration
pub const DRIVER_EVENTS: [u8; 13] = [
    event::DEVICE_ADDED,
    event::DEVICE_INFO_CHANGED,
    event::DEVICE_STATUS_CHANGE,
    event::ENCL_DEVICE_STATUS_CHANGE,
    event::SAS_TOPOLOGY_CHANGE_LIST,
    event::SAS_DISCOVERY,
    event::SAS_DEVICE_DISCOVERY_ERROR,
    event::SAS_BROADCAST_PRIMITIVE,
    event::PCIE_TOPOLOGY_CHANGE_LIST,
    event::PCIE_ENUMERATION,
    event::PREPARE_FOR_RESET,
    event::CABLE_MGMT,
    event::ENERGY_PACK_CHANGE,
];

/// 128-bit event mask; a set bit masks the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask([u32; 4]);

impl EventMask {
    /// Every event masked
    pub const fn all_masked() -> Self {
        Self([u32::MAX; 4])
    }

    /// The driver's registration mask
    pub fn driver_default() -> Self {
        let mut mask = Self::all_masked();
        for e in DRIVER_EVENTS {
            mask.unmask(e);
        }
        mask
    }

    fn word(&mut self, event: u8) -> Option<&mut u32> {
        self.0.get_mut((event / 32) as usize)
    }

    /// Let `event` through
    ///
    /// Codes past the 128-bit mask cannot be registered and are ignored.
    pub fn unmask(&mut self, event: u8) {
        match self.word(event) {
            Some(word) => *word &= !(1 << (event % 32)),
            None => log::warn!("[mpi3mr] event {:#04x} outside the event mask", event),
        }
    }

    /// Block `event`
    pub fn mask(&mut self, event: u8) {
        if let Some(word) = self.word(event) {
            *word |= 1 << (event % 32);
        }
    }

    /// Check if `event` is masked; codes past the mask always are
    pub fn is_masked(&self, event: u8) -> bool {
        self.0
            .get((event / 32) as usize)
            .map_or(true, |word| word & (1 << (event % 32)) != 0)
    }

    /// Mask words as sent to the controller
    pub fn words(&self) -> &[u32; 4] {
        &self.0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::driver_default()
    }
}

/// Receives events the control plane does not consume itself
pub trait EventListener: Send + Sync {
    /// Called in interrupt context for each event notification
    fn on_event(&self, ctrl: &Controller, event: &EventNotification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedAck {
    event: u8,
    context: u32,
}

/// Event registration and acknowledgement bookkeeping
pub(crate) struct EventState {
    mask: Mutex<EventMask>,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    delayed_acks: Mutex<VecDeque<DelayedAck>>,
    in_flight: AtomicU32,
}

impl EventState {
    pub(crate) fn new() -> Self {
        Self {
            mask: Mutex::new(EventMask::driver_default()),
            listener: RwLock::new(None),
            delayed_acks: Mutex::new(VecDeque::new()),
            in_flight: AtomicU32::new(0),
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn delayed_ack_count(&self) -> usize {
        self.delayed_acks.lock().len()
    }

    pub(crate) fn clear_delayed(&self) {
        self.delayed_acks.lock().clear();
    }
}

impl fmt::Debug for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventState")
            .field("mask", &*self.mask.lock())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Counts an event handler in progress; a reset waits for it
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Controller {
    /// Route events not consumed by the control plane to `listener`
    pub fn set_event_listener(&self, listener: Arc<dyn EventListener>) {
        *self.events.listener.write() = Some(listener);
    }

    /// Mask currently registered with the controller
    pub fn event_mask(&self) -> EventMask {
        *self.events.mask.lock()
    }

    /// Register the driver's event mask with the controller
    pub fn register_events(&self) -> ControllerResult<()> {
        *self.events.mask.lock() = EventMask::driver_default();
        self.issue_event_notification()
    }

    /// Mask every event so the firmware stops sending them
    pub(crate) fn mask_all_events(&self) {
        *self.events.mask.lock() = EventMask::all_masked();
        if let Err(e) = self.issue_event_notification() {
            log::warn!("[mpi3mr] masking events failed: {}", e);
        }
    }

    fn issue_event_notification(&self) -> ControllerResult<()> {
        let words = *self.event_mask().words();
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::EventNotifyTimeout,
            |tag| mpi::event_notification(tag, &words),
        )?
        .check()
        .map_err(|e| {
            log::error!("[mpi3mr] event notification failed: {}", e);
            e
        })
    }

    /// Handle an unsolicited event notification frame
    pub(crate) fn handle_event_frame(&self, frame: &[u8]) {
        let Some(ev) = EventNotification::parse(frame) else {
            log::warn!("[mpi3mr] malformed event notification dropped");
            return;
        };
        let _in_flight = InFlight::new(&self.events.in_flight);
        log::debug!("[mpi3mr] event {:#04x} context {:#x}", ev.event, ev.event_context);

        match ev.event {
            event::PREPARE_FOR_RESET => self.prepare_for_reset_event(&ev),
            _ => {
                let listener = self.events.listener.read().clone();
                if let Some(l) = listener {
                    l.on_event(self, &ev);
                }
            }
        }
        if ev.ack_required {
            self.send_event_ack(ev.event, ev.event_context);
        }
    }

    fn prepare_for_reset_event(&self, ev: &EventNotification) {
        match ev.data.first().copied() {
            Some(prepare_reset::START) => {
                if !self.prepare_for_reset.swap(true, Ordering::AcqRel) {
                    log::info!("[mpi3mr] firmware announced a reset");
                    self.prepare_for_reset_ticks.store(0, Ordering::Release);
                }
            }
            Some(prepare_reset::ABORT) => {
                log::info!("[mpi3mr] announced reset called off");
                self.prepare_for_reset.store(false, Ordering::Release);
                self.prepare_for_reset_ticks.store(0, Ordering::Release);
            }
            other => log::warn!("[mpi3mr] prepare-for-reset with reason {:?} ignored", other),
        }
    }

    /// Acknowledge an event, postponing the ack if no ack tag is free
    pub(crate) fn send_event_ack(&self, event: u8, context: u32) {
        match self.tracker.allocate(TagRange::EventAck) {
            Ok(slot) => self.issue_event_ack(slot.tag(), DelayedAck { event, context }),
            Err(_) => {
                log::debug!("[mpi3mr] ack for event {:#04x} postponed", event);
                self.events.delayed_acks.lock().push_back(DelayedAck { event, context });
            }
        }
    }

    fn issue_event_ack(&self, tag: u16, ack: DelayedAck) {
        let frame = mpi::event_ack(tag, ack.event, ack.context);
        let submitted = self
            .tracker
            .set_callback(tag, Box::new(Controller::complete_event_ack))
            .and_then(|_| self.submit_admin(frame.as_bytes()));
        if let Err(e) = submitted {
            log::warn!("[mpi3mr] ack for event {:#04x} not sent: {}", ack.event, e);
            self.return_tag(tag);
        }
    }

    fn complete_event_ack(&self, result: CompletionResult) {
        if result.status == CompletionStatus::Complete && !result.is_success() {
            log::warn!(
                "[mpi3mr] event ack failed: ioc_status {:#06x} loginfo {:#010x}",
                result.ioc_status,
                result.loginfo
            );
        }
        let next = if result.status == CompletionStatus::Reset {
            None
        } else {
            self.events.delayed_acks.lock().pop_front()
        };
        match next {
            Some(ack) => self.issue_event_ack(result.host_tag, ack),
            None => {
                self.return_tag(result.host_tag);
            }
        }
    }

    /// Wait for event handlers running on other CPUs to finish
    pub(crate) fn wait_for_events_idle(&self) -> ControllerResult<()> {
        Retry::new(self.config.pending_admin_wait_ms, self.config.poll_interval_ms)
            .until(&*self.clock, || (self.events.in_flight() == 0).then_some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::sim;
    use std::vec::Vec;

    #[test]
    fn test_default_mask() {
        let mask = EventMask::driver_default();
        assert!(!mask.is_masked(event::DEVICE_ADDED));
        assert!(!mask.is_masked(event::PCIE_ENUMERATION));
        assert!(mask.is_masked(event::LOG_DATA));
        assert!(mask.is_masked(0x7F));
        assert_eq!(mask.words()[2], u32::MAX);
        assert_eq!(EventMask::all_masked().words(), &[u32::MAX; 4]);
    }

    #[test]
    fn test_codes_past_mask_ignored() {
        let mut mask = EventMask::driver_default();
        let before = mask;
        mask.unmask(200);
        mask.mask(200);
        assert_eq!(mask, before);
        assert!(mask.is_masked(200));
        assert!(mask.is_masked(u8::MAX));

        mask.mask(event::DEVICE_ADDED);
        assert!(mask.is_masked(event::DEVICE_ADDED));
        mask.unmask(event::DEVICE_ADDED);
        assert_eq!(mask, before);
    }

    #[test]
    fn test_registration_reaches_controller() {
        let (sim, _ctrl) = sim::ready_controller(DriverConfig::for_testing());
        assert_eq!(sim.event_mask(), *EventMask::driver_default().words());
    }

    struct Recorder(Mutex<Vec<u8>>);

    impl EventListener for Recorder {
        fn on_event(&self, _ctrl: &Controller, ev: &EventNotification) {
            self.0.lock().push(ev.event);
        }
    }

    #[test]
    fn test_event_forwarded_and_acked() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        ctrl.set_event_listener(recorder.clone());

        sim.post_event(event::DEVICE_ADDED, &[0; 4], true, 0x42);
        ctrl.poll_reply_queue(0);
        assert_eq!(*recorder.0.lock(), [event::DEVICE_ADDED]);
        assert_eq!(sim.acked_events(), [(event::DEVICE_ADDED, 0x42)]);

        // the ack completion released its tag
        ctrl.poll_reply_queue(0);
        let slots: Vec<_> = (0..ctrl.config().event_ack_cmds)
            .map(|_| ctrl.allocate_tag(TagRange::EventAck).unwrap())
            .collect();
        assert_eq!(slots.len(), ctrl.config().event_ack_cmds as usize);
    }

    #[test]
    fn test_acks_postponed_when_tags_busy() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        let held: Vec<_> = (0..ctrl.config().event_ack_cmds)
            .map(|_| ctrl.allocate_tag(TagRange::EventAck).unwrap())
            .collect();
        ctrl.send_event_ack(event::DEVICE_ADDED, 1);
        ctrl.send_event_ack(event::CABLE_MGMT, 2);
        assert_eq!(ctrl.events.delayed_ack_count(), 2);
        assert!(sim.acked_events().is_empty());
        for slot in held {
            ctrl.release_tag(slot).unwrap();
        }

        ctrl.send_event_ack(event::ENERGY_PACK_CHANGE, 3);
        // completing the first ack sends the postponed ones on the same tag
        ctrl.poll_reply_queue(0);
        ctrl.poll_reply_queue(0);
        ctrl.poll_reply_queue(0);
        assert_eq!(
            sim.acked_events(),
            [(event::ENERGY_PACK_CHANGE, 3), (event::DEVICE_ADDED, 1), (event::CABLE_MGMT, 2)]
        );
        assert_eq!(ctrl.events.delayed_ack_count(), 0);
    }

    #[test]
    fn test_prepare_for_reset_start_and_abort() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        sim.post_event(event::PREPARE_FOR_RESET, &[prepare_reset::START, 0, 0, 0], false, 0);
        ctrl.poll_reply_queue(0);
        assert!(ctrl.prepare_for_reset.load(Ordering::Acquire));

        sim.post_event(event::PREPARE_FOR_RESET, &[prepare_reset::ABORT, 0, 0, 0], false, 0);
        ctrl.poll_reply_queue(0);
        assert!(!ctrl.prepare_for_reset.load(Ordering::Acquire));
    }
}
