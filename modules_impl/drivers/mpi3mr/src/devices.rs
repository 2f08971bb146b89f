//! # Devices and Throttling
//!
//! Discovery belongs to a collaborator that tells the control plane about
//! targets through [`Controller::on_device_added`],
//! [`Controller::on_device_removed`] and
//! [`Controller::on_device_status_changed`]. The control plane keeps only
//! what it needs to account I/O: outstanding counts, pending large-transfer
//! sizes and the throttle divert flags.
//!
//! Removing a device runs a two-step handshake with the controller on a
//! device-removal tag: a target reset, then an IO unit control naming the
//! handle. The second step is chained from the first one's completion.

use crate::controller::{Controller, IocLimits};
use crate::error::{ControllerError, ControllerResult};
use crate::mpi::{self, iounit_op, task_type, HOST_TAG_INVALID, INVALID_DEV_HANDLE};
use crate::tracker::{CompletionResult, CompletionStatus, IoBinding, TagRange};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

const BLOCK_SHIFT: u32 = 9;

/// What the discovery collaborator knows about a new target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Persistent id, stable across resets
    pub persistent_id: u16,
    /// Current firmware device handle
    pub dev_handle: u16,
    /// Large transfers to this device count against the throttle
    pub throttle_enabled: bool,
    /// Throttle group of a virtual disk
    pub throttle_group: Option<u8>,
}

/// Status transitions reported for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatusChange {
    /// The firmware started an internal reset; I/O is refused
    ResetStarted,
    /// The internal reset finished
    ResetCompleted,
}

/// A target as seen by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    /// Persistent id
    pub persistent_id: u16,
    /// Firmware device handle, [`INVALID_DEV_HANDLE`] after a reset
    pub dev_handle: u16,
    /// Large transfers count against the throttle
    pub throttle_enabled: bool,
    /// Throttle group, for virtual disks
    pub throttle_group: Option<u8>,
    /// I/O submitted and not yet completed
    pub outstanding: u32,
    /// Large I/O should be diverted while set
    pub divert: bool,
    /// I/O is refused while set
    pub blocked: bool,
}

impl TargetDevice {
    fn has_valid_handle(&self) -> bool {
        self.dev_handle != INVALID_DEV_HANDLE
    }
}

/// Throttle group shared by the virtual disks of one array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleGroup {
    /// Group id
    pub id: u8,
    /// High-water mark in blocks
    pub high: u64,
    /// Low-water mark in blocks
    pub low: u64,
    /// Large-transfer blocks outstanding
    pub pending: u64,
    /// Members divert large I/O while set
    pub divert: bool,
}

struct Inner {
    devices: BTreeMap<u16, TargetDevice>,
    groups: BTreeMap<u8, ThrottleGroup>,
    removal_pending: BTreeSet<u16>,
    delayed_removals: VecDeque<(u16, u8)>,
    ioc_pending: u64,
}

impl Inner {
    fn pid_of(&self, dev_handle: u16) -> Option<u16> {
        if dev_handle == INVALID_DEV_HANDLE {
            return None;
        }
        self.devices
            .values()
            .find(|d| d.dev_handle == dev_handle)
            .map(|d| d.persistent_id)
    }

    fn set_group_divert(&mut self, group: u8, divert: bool) {
        if let Some(tg) = self.groups.get_mut(&group) {
            tg.divert = divert;
        }
        self.devices
            .values_mut()
            .filter(|d| d.throttle_group == Some(group))
            .for_each(|d| d.divert = divert);
    }
}

/// Targets, throttle groups and removal handshakes in flight
pub(crate) struct DeviceTable {
    inner: Mutex<Inner>,
}

impl DeviceTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: BTreeMap::new(),
                groups: BTreeMap::new(),
                removal_pending: BTreeSet::new(),
                delayed_removals: VecDeque::new(),
                ioc_pending: 0,
            }),
        }
    }

    /// Account an I/O to `dev_handle` and build its binding
    ///
    /// Unknown handles are accepted without per-device accounting.
    pub(crate) fn io_started(
        &self,
        queue_index: u16,
        dev_handle: u16,
        data_len: u32,
        limits: &IocLimits,
    ) -> ControllerResult<IoBinding> {
        let data_len_blks = data_len >> BLOCK_SHIFT;
        let mut binding = IoBinding { queue_index, dev_handle, data_len_blks, large: false };

        let mut inner = self.inner.lock();
        if inner.removal_pending.contains(&dev_handle) {
            return Err(ControllerError::Busy);
        }
        let Some(pid) = inner.pid_of(dev_handle) else {
            return Ok(binding);
        };
        let (blocked, throttled, group) = {
            let d = &inner.devices[&pid];
            (d.blocked, d.throttle_enabled, d.throttle_group)
        };
        if blocked {
            return Err(ControllerError::Busy);
        }

        binding.large = throttled
            && limits.io_throttle_data_length > 0
            && data_len_blks >= limits.io_throttle_data_length;
        if binding.large {
            inner.ioc_pending += data_len_blks as u64;
            let ioc_over = limits.io_throttle_high > 0 && inner.ioc_pending >= limits.io_throttle_high;
            match group {
                Some(g) => {
                    let enter = inner.groups.get_mut(&g).is_some_and(|tg| {
                        tg.pending += data_len_blks as u64;
                        !tg.divert && (ioc_over || (tg.high > 0 && tg.pending >= tg.high))
                    });
                    if enter {
                        log::debug!("[mpi3mr] throttle group {} diverting", g);
                        inner.set_group_divert(g, true);
                    }
                }
                None if ioc_over => {
                    if let Some(d) = inner.devices.get_mut(&pid) {
                        d.divert = true;
                    }
                }
                None => {}
            }
        }
        if let Some(d) = inner.devices.get_mut(&pid) {
            d.outstanding += 1;
        }
        Ok(binding)
    }

    /// Undo the accounting of a finished I/O
    pub(crate) fn io_completed(&self, binding: &IoBinding, limits: &IocLimits) {
        let mut inner = self.inner.lock();
        let Some(pid) = inner.pid_of(binding.dev_handle) else {
            return;
        };
        let (group, divert) = {
            let d = &inner.devices[&pid];
            (d.throttle_group, d.divert)
        };

        if binding.large {
            inner.ioc_pending = inner.ioc_pending.saturating_sub(binding.data_len_blks as u64);
        }
        let ioc_low = inner.ioc_pending <= limits.io_throttle_low;

        match group {
            Some(g) if binding.large || (divert && ioc_low) => {
                let leave = inner.groups.get_mut(&g).is_some_and(|tg| {
                    if binding.large {
                        tg.pending = tg.pending.saturating_sub(binding.data_len_blks as u64);
                    }
                    tg.divert && ioc_low && tg.pending <= tg.low
                });
                if leave {
                    log::debug!("[mpi3mr] throttle group {} leaving divert", g);
                    inner.set_group_divert(g, false);
                }
            }
            None if (binding.large || divert) && ioc_low => {
                if let Some(d) = inner.devices.get_mut(&pid) {
                    d.divert = false;
                }
            }
            _ => {}
        }
        if let Some(d) = inner.devices.get_mut(&pid) {
            d.outstanding = d.outstanding.saturating_sub(1);
        }
    }

    /// Mark every handle invalid; the firmware hands out new ones after a reset
    pub(crate) fn invalidate_handles(&self) {
        let mut inner = self.inner.lock();
        inner.devices.values_mut().for_each(|d| d.dev_handle = INVALID_DEV_HANDLE);
        inner.removal_pending.clear();
        inner.delayed_removals.clear();
    }

    /// Zero outstanding counts and throttle state
    pub(crate) fn reset_counters(&self) {
        let mut inner = self.inner.lock();
        inner.ioc_pending = 0;
        inner.groups.values_mut().for_each(|tg| {
            tg.pending = 0;
            tg.divert = false;
        });
        inner.devices.values_mut().for_each(|d| {
            d.outstanding = 0;
            d.divert = false;
        });
    }

    /// Drop devices that did not come back with a valid handle
    pub(crate) fn drop_invalid(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.devices.len();
        inner.devices.retain(|_, d| d.has_valid_handle());
        before - inner.devices.len()
    }
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeviceTable")
            .field("devices", &inner.devices.len())
            .field("groups", &inner.groups.len())
            .field("removal_pending", &inner.removal_pending.len())
            .finish()
    }
}

// =============================================================================
// Collaborator surface and removal handshake
// =============================================================================

impl Controller {
    /// Register or refresh a target
    pub fn on_device_added(&self, info: DeviceInfo) {
        let mut inner = self.devices.inner.lock();
        let dev = inner.devices.entry(info.persistent_id).or_insert_with(|| TargetDevice {
            persistent_id: info.persistent_id,
            dev_handle: INVALID_DEV_HANDLE,
            throttle_enabled: false,
            throttle_group: None,
            outstanding: 0,
            divert: false,
            blocked: false,
        });
        dev.dev_handle = info.dev_handle;
        dev.throttle_enabled = info.throttle_enabled;
        dev.throttle_group = info.throttle_group;
        log::debug!("[mpi3mr] device {} handle {:#06x}", info.persistent_id, info.dev_handle);
    }

    /// Forget a target and run the removal handshake for its handle
    pub fn on_device_removed(&self, dev_handle: u16) {
        {
            let mut inner = self.devices.inner.lock();
            if let Some(pid) = inner.pid_of(dev_handle) {
                inner.devices.remove(&pid);
            }
        }
        self.start_removal_handshake(dev_handle, iounit_op::REMOVE_DEVICE);
    }

    /// Acknowledge a device the firmware hid from the host
    pub fn acknowledge_hidden_device(&self, dev_handle: u16) {
        self.start_removal_handshake(dev_handle, iounit_op::HIDDEN_ACK);
    }

    /// Apply a status transition reported for `dev_handle`
    pub fn on_device_status_changed(&self, dev_handle: u16, change: DeviceStatusChange) {
        let mut inner = self.devices.inner.lock();
        let Some(pid) = inner.pid_of(dev_handle) else {
            log::warn!("[mpi3mr] status change for unknown handle {:#06x}", dev_handle);
            return;
        };
        if let Some(d) = inner.devices.get_mut(&pid) {
            d.blocked = change == DeviceStatusChange::ResetStarted;
        }
    }

    /// Create or update a throttle group; marks are in 512-byte blocks
    pub fn configure_throttle_group(&self, id: u8, high: u64, low: u64) {
        let mut inner = self.devices.inner.lock();
        let tg = inner.groups.entry(id).or_insert(ThrottleGroup {
            id,
            high,
            low,
            pending: 0,
            divert: false,
        });
        tg.high = high;
        tg.low = low;
    }

    /// Snapshot of a target by persistent id
    pub fn device(&self, persistent_id: u16) -> Option<TargetDevice> {
        self.devices.inner.lock().devices.get(&persistent_id).cloned()
    }

    /// Snapshot of a throttle group
    pub fn throttle_group(&self, id: u8) -> Option<ThrottleGroup> {
        self.devices.inner.lock().groups.get(&id).cloned()
    }

    /// Check if a removal handshake is running for `dev_handle`
    pub fn is_removal_pending(&self, dev_handle: u16) -> bool {
        self.devices.inner.lock().removal_pending.contains(&dev_handle)
    }

    /// Drop devices that were not rediscovered after a reset
    pub fn refresh_devices(&self) {
        let dropped = self.devices.drop_invalid();
        if dropped > 0 {
            log::info!("[mpi3mr] {} devices gone after reset", dropped);
        }
    }

    fn start_removal_handshake(&self, dev_handle: u16, op: u8) {
        if dev_handle == INVALID_DEV_HANDLE {
            return;
        }
        match self.tracker.allocate(TagRange::DevRemoval) {
            Ok(slot) => self.send_removal_tm(slot.tag(), dev_handle, op),
            Err(_) => {
                log::debug!("[mpi3mr] removal of handle {:#06x} postponed", dev_handle);
                self.devices.inner.lock().delayed_removals.push_back((dev_handle, op));
            }
        }
    }

    fn send_removal_tm(&self, tag: u16, dev_handle: u16, op: u8) {
        self.devices.inner.lock().removal_pending.insert(dev_handle);
        self.tracker.set_dev_handle(tag, dev_handle);
        let frame = mpi::task_mgmt(tag, dev_handle, task_type::TARGET_RESET, HOST_TAG_INVALID, 0);
        let sent = self
            .tracker
            .set_callback(
                tag,
                Box::new(move |ctrl: &Controller, r: CompletionResult| ctrl.removal_tm_done(r, dev_handle, op)),
            )
            .and_then(|_| self.submit_admin(frame.as_bytes()));
        if let Err(e) = sent {
            log::warn!("[mpi3mr] removal target reset for {:#06x} not sent: {}", dev_handle, e);
            self.finish_removal_slot(tag);
        }
    }

    fn removal_tm_done(&self, result: CompletionResult, dev_handle: u16, op: u8) {
        let tag = result.host_tag;
        if result.status == CompletionStatus::Reset {
            self.finish_removal_slot(tag);
            return;
        }
        log::debug!(
            "[mpi3mr] removal target reset for {:#06x}: ioc_status {:#06x}",
            dev_handle,
            result.ioc_status
        );
        let frame = mpi::iounit_control(tag, op, dev_handle);
        let sent = self
            .tracker
            .set_callback(
                tag,
                Box::new(move |ctrl: &Controller, r: CompletionResult| ctrl.removal_iou_done(r, dev_handle, op)),
            )
            .and_then(|_| self.submit_admin(frame.as_bytes()));
        if let Err(e) = sent {
            log::warn!("[mpi3mr] removal IO unit control for {:#06x} not sent: {}", dev_handle, e);
            self.finish_removal_slot(tag);
        }
    }

    fn removal_iou_done(&self, result: CompletionResult, dev_handle: u16, op: u8) {
        let tag = result.host_tag;
        if result.status == CompletionStatus::Reset {
            self.finish_removal_slot(tag);
            return;
        }
        if !result.is_success() {
            if self.tracker.retry_count(tag) < self.config.dev_removal_retries {
                let retry = self.tracker.bump_retry(tag);
                log::debug!("[mpi3mr] retrying removal of {:#06x} ({})", dev_handle, retry);
                self.send_removal_tm(tag, dev_handle, op);
                return;
            }
            log::error!("[mpi3mr] removal handshake for {:#06x} failed after all retries", dev_handle);
        } else {
            log::info!("[mpi3mr] removal handshake for {:#06x} complete", dev_handle);
            self.devices.inner.lock().removal_pending.remove(&dev_handle);
        }

        let next = self.devices.inner.lock().delayed_removals.pop_front();
        match next {
            Some((handle, next_op)) => {
                self.tracker.clear_retry(tag);
                self.send_removal_tm(tag, handle, next_op)
            }
            None => {
                self.return_tag(tag);
            }
        }
    }

    fn finish_removal_slot(&self, tag: u16) {
        if let Some(handle) = self.tracker.dev_handle(tag) {
            self.devices.inner.lock().removal_pending.remove(&handle);
        }
        self.return_tag(tag);
    }

    /// Handles with a removal handshake in flight
    pub fn pending_removals(&self) -> Vec<u16> {
        self.devices.inner.lock().removal_pending.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::mpi::ioc_status;
    use crate::sim::{self, IoCompletion};

    fn limits() -> IocLimits {
        IocLimits {
            io_throttle_data_length: 16,
            io_throttle_high: 100,
            io_throttle_low: 40,
            ..IocLimits::default()
        }
    }

    fn table_with(info: DeviceInfo) -> DeviceTable {
        let table = DeviceTable::new();
        table.inner.lock().devices.insert(
            info.persistent_id,
            TargetDevice {
                persistent_id: info.persistent_id,
                dev_handle: info.dev_handle,
                throttle_enabled: info.throttle_enabled,
                throttle_group: info.throttle_group,
                outstanding: 0,
                divert: false,
                blocked: false,
            },
        );
        table
    }

    #[test]
    fn test_outstanding_counts() {
        let table = table_with(DeviceInfo { persistent_id: 1, dev_handle: 0x10, throttle_enabled: false, throttle_group: None });
        let a = table.io_started(0, 0x10, 4096, &limits()).unwrap();
        let _b = table.io_started(0, 0x10, 4096, &limits()).unwrap();
        assert_eq!(a.data_len_blks, 8);
        assert!(!a.large);
        assert_eq!(table.inner.lock().devices[&1].outstanding, 2);
        table.io_completed(&a, &limits());
        assert_eq!(table.inner.lock().devices[&1].outstanding, 1);
    }

    #[test]
    fn test_unknown_handle_accepted() {
        let table = DeviceTable::new();
        let b = table.io_started(1, 0x99, 512, &limits()).unwrap();
        assert_eq!(b.queue_index, 1);
        table.io_completed(&b, &limits());
    }

    #[test]
    fn test_group_divert_enters_and_leaves() {
        let table = table_with(DeviceInfo { persistent_id: 2, dev_handle: 0x20, throttle_enabled: true, throttle_group: Some(1) });
        table.inner.lock().groups.insert(1, ThrottleGroup { id: 1, high: 60, low: 20, pending: 0, divert: false });

        // 32 blocks each; the group crosses its high mark on the second
        let a = table.io_started(0, 0x20, 32 * 512, &limits()).unwrap();
        let b = table.io_started(0, 0x20, 32 * 512, &limits()).unwrap();
        assert!(a.large && b.large);
        assert!(table.inner.lock().groups[&1].divert);
        assert!(table.inner.lock().devices[&2].divert);

        table.io_completed(&a, &limits());
        // 32 pending, above the group low mark
        assert!(table.inner.lock().groups[&1].divert);
        table.io_completed(&b, &limits());
        let inner = table.inner.lock();
        assert!(!inner.groups[&1].divert);
        assert!(!inner.devices[&2].divert);
        assert_eq!(inner.ioc_pending, 0);
    }

    #[test]
    fn test_blocked_device_refuses_io() {
        let (_sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.on_device_added(DeviceInfo { persistent_id: 3, dev_handle: 0x30, throttle_enabled: false, throttle_group: None });
        ctrl.on_device_status_changed(0x30, DeviceStatusChange::ResetStarted);
        let slot = ctrl.allocate_tag(TagRange::Io).unwrap();
        assert_eq!(ctrl.submit_io(0, &sim::scsi_io(slot.tag(), 0x30, 512)), Err(ControllerError::Busy));
        ctrl.on_device_status_changed(0x30, DeviceStatusChange::ResetCompleted);
        assert!(ctrl.submit_io(0, &sim::scsi_io(slot.tag(), 0x30, 512)).is_ok());
    }

    #[test]
    fn test_io_completion_updates_device() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        sim.set_io_completion(IoCompletion::Hold);
        ctrl.on_device_added(DeviceInfo { persistent_id: 4, dev_handle: 0x40, throttle_enabled: false, throttle_group: None });
        let slot = ctrl.allocate_tag(TagRange::Io).unwrap();
        ctrl.submit_io(0, &sim::scsi_io(slot.tag(), 0x40, 512)).unwrap();
        assert_eq!(ctrl.device(4).unwrap().outstanding, 1);
        sim.complete_held(slot.tag());
        ctrl.poll_reply_queue(ctrl.op_queues.read()[0].reply.vector());
        assert_eq!(ctrl.device(4).unwrap().outstanding, 0);
    }

    #[test]
    fn test_removal_handshake() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.on_device_added(DeviceInfo { persistent_id: 5, dev_handle: 0x50, throttle_enabled: false, throttle_group: None });
        ctrl.on_device_removed(0x50);
        ctrl.poll_reply_queue(0);
        assert!(ctrl.device(5).is_none());
        assert!(!ctrl.is_removal_pending(0x50));
        assert_eq!(sim.removed_handles(), [0x50]);
        assert_eq!(sim.target_resets(), [0x50]);
    }

    #[test]
    fn test_removal_retried_then_given_up() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        sim.set_iounit_status(ioc_status::INVALID_STATE);
        ctrl.on_device_removed(0x60);
        ctrl.poll_reply_queue(0);
        let retries = ctrl.config().dev_removal_retries as usize;
        assert_eq!(sim.target_resets().len(), retries + 1);
        // failed handshakes keep the handle marked
        assert!(ctrl.is_removal_pending(0x60));
        assert_eq!(ctrl.allocate_tag(TagRange::DevRemoval).map(|_| ()), Ok(()));
    }

    #[test]
    fn test_removals_postponed_when_tags_busy() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        sim.set_admin_silent(true);
        for handle in [0x70, 0x71, 0x72] {
            ctrl.on_device_removed(handle);
        }
        assert_eq!(ctrl.devices.inner.lock().delayed_removals.len(), 1);
        assert_eq!(sim.target_resets(), [0x70, 0x71]);

        sim.set_admin_silent(false);
        sim.release_silent_admin();
        ctrl.poll_reply_queue(0);
        assert_eq!(sim.target_resets(), [0x70, 0x71, 0x72]);
        assert!(ctrl.pending_removals().is_empty());
    }

    #[test]
    fn test_reset_invalidates_and_refresh_drops() {
        let table = table_with(DeviceInfo { persistent_id: 8, dev_handle: 0x80, throttle_enabled: false, throttle_group: None });
        table.invalidate_handles();
        assert_eq!(table.inner.lock().devices[&8].dev_handle, INVALID_DEV_HANDLE);
        assert_eq!(table.drop_invalid(), 1);
    }
}
