//! # Controller
//!
//! The [`Controller`] aggregate owns every piece of per-adapter state: the
//! admin queue pair, the operational queue pairs, the reply and sense pools,
//! the command tracker, event and device bookkeeping, and the health flags
//! the reset path and the watchdog coordinate through.
//!
//! Each field is guarded on its own: rings by their spin locks, pools by
//! their free-queue lock, slots by their slot lock, and health by atomics.
//! A reset is serialized by the `reset_in_progress` flag, which only one
//! caller can claim.
//!
//! The behaviour is split across modules by concern:
//!
//! - [`crate::processor`]: reply draining and completion
//! - [`crate::bringup`]: initialization, port enable, shutdown
//! - [`crate::reset`]: reset handshakes and recovery
//! - [`crate::events`]: event mask, notifications, acknowledgements
//! - [`crate::devices`]: per-device accounting and removal handshakes
//! - [`crate::watchdog`]: periodic health supervision

use crate::config::DriverConfig;
use crate::devices::DeviceTable;
use crate::error::{ControllerError, ControllerResult};
use crate::event_log::EventLogWatch;
use crate::events::EventState;
use crate::mpi::{self, Frame, IocFacts};
use crate::pool::BufferPool;
use crate::queue::QueuePair;
use crate::regs::{self, IocConfig, IocStatus};
use crate::reset::PendingAdminGuard;
use crate::retry::Retry;
use crate::state::{ControllerState, ResetReason};
use crate::tracker::{CommandSlot, CommandTracker, CompletionResult, IoBinding, SlotState, TagRange};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use helix_hal::dma::DmaAllocator;
use helix_hal::interrupts::VectorController;
use helix_hal::mmio::RegisterInterface;
use helix_hal::timer::Clock;
use spin::{Mutex, RwLock};

/// Hardware seams one controller instance runs against
#[derive(Clone)]
pub struct Platform {
    /// System interface registers (BAR 0)
    pub regs: Arc<dyn RegisterInterface>,
    /// Time source for polling and timeouts
    pub clock: Arc<dyn Clock>,
    /// DMA-coherent memory
    pub dma: Arc<dyn DmaAllocator>,
    /// MSI-X vectors granted to the device
    pub irq: Arc<dyn VectorController>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("vectors", &self.irq.vector_count())
            .finish()
    }
}

/// Limits derived from IOC facts and the driver configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IocLimits {
    /// Tags available for I/O
    pub max_host_ios: u16,
    /// Size of one reply frame
    pub reply_frame_size: usize,
    /// Operational request entry size
    pub op_req_entry_size: usize,
    /// Operational reply entry size
    pub op_reply_entry_size: usize,
    /// Reply frames in the reply pool
    pub reply_pool_size: u16,
    /// Buffers in the sense pool
    pub sense_pool_size: u16,
    /// Transfers of at least this many blocks count against the throttle
    pub io_throttle_data_length: u32,
    /// Throttle high-water mark in blocks
    pub io_throttle_high: u64,
    /// Throttle low-water mark in blocks
    pub io_throttle_low: u64,
    /// How long READY may take after enabling the IOC
    pub ready_timeout_ms: u64,
    /// How long the IOC may take to shut down
    pub shutdown_timeout_ms: u64,
}

/// Reply and sense pools, allocated once and reused across resets
#[derive(Debug)]
pub(crate) struct Pools {
    pub(crate) reply: BufferPool,
    pub(crate) sense: BufferPool,
}

/// A reset requested from a context that cannot run it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResetRequest {
    pub(crate) reason: ResetReason,
    pub(crate) snapdump: bool,
}

/// One MPI3 controller instance
pub struct Controller {
    pub(crate) config: DriverConfig,
    pub(crate) regs: Arc<dyn RegisterInterface>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) irq: Arc<dyn VectorController>,

    pub(crate) admin: QueuePair,
    pub(crate) op_queues: RwLock<Vec<QueuePair>>,
    pub(crate) pools: RwLock<Option<Pools>>,
    pub(crate) facts: RwLock<Option<IocFacts>>,
    pub(crate) limits: RwLock<IocLimits>,
    pub(crate) tracker: CommandTracker<Controller>,
    pub(crate) events: EventState,
    pub(crate) event_log: EventLogWatch,
    pub(crate) devices: DeviceTable,

    pub(crate) ready: AtomicBool,
    pub(crate) unrecoverable: AtomicBool,
    pub(crate) reset_in_progress: AtomicBool,
    pub(crate) block_ioctls: AtomicBool,
    pub(crate) io_frozen: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) prepare_for_reset: AtomicBool,
    pub(crate) prepare_for_reset_ticks: AtomicU32,
    pub(crate) diagsave_ticks: AtomicU32,
    pub(crate) pend_ioctls: AtomicU32,
    pub(crate) reset_count: AtomicU32,
    pub(crate) reset_request: Mutex<Option<ResetRequest>>,
}

impl Controller {
    /// Create a controller and allocate its admin queues
    ///
    /// The controller is not touched until [`initialize`](Self::initialize).
    pub fn new(platform: Platform, config: DriverConfig) -> ControllerResult<Self> {
        config.validate()?;
        let admin = QueuePair::admin(
            &*platform.dma,
            config.admin_req_entries,
            config.admin_reply_entries,
            mpi::ADMIN_REQ_FRAME_SIZE,
        )?;
        Ok(Self {
            tracker: CommandTracker::new(&config),
            events: EventState::new(),
            event_log: EventLogWatch::new(),
            devices: DeviceTable::new(),
            admin,
            op_queues: RwLock::new(Vec::new()),
            pools: RwLock::new(None),
            facts: RwLock::new(None),
            limits: RwLock::new(IocLimits::default()),
            regs: platform.regs,
            clock: platform.clock,
            dma: platform.dma,
            irq: platform.irq,
            config,
            ready: AtomicBool::new(false),
            unrecoverable: AtomicBool::new(false),
            reset_in_progress: AtomicBool::new(false),
            block_ioctls: AtomicBool::new(false),
            io_frozen: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            prepare_for_reset: AtomicBool::new(false),
            prepare_for_reset_ticks: AtomicU32::new(0),
            diagsave_ticks: AtomicU32::new(0),
            pend_ioctls: AtomicU32::new(0),
            reset_count: AtomicU32::new(0),
            reset_request: Mutex::new(None),
        })
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Driver configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// IOC facts from the last bring-up
    pub fn facts(&self) -> Option<IocFacts> {
        self.facts.read().clone()
    }

    /// Limits derived at the last bring-up
    pub fn limits(&self) -> IocLimits {
        *self.limits.read()
    }

    /// Number of operational queue pairs
    pub fn num_op_queues(&self) -> u16 {
        self.op_queues.read().len() as u16
    }

    /// State derived from the controller registers
    pub fn current_state(&self) -> ControllerState {
        ControllerState::from_registers(self.is_unrecoverable(), self.ioc_status(), self.ioc_config())
    }

    /// Check if the driver gave up on the controller
    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::Acquire)
    }

    /// Check if bring-up completed and no reset is running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.is_reset_in_progress()
    }

    /// Check if a reset is running
    pub fn is_reset_in_progress(&self) -> bool {
        self.reset_in_progress.load(Ordering::Acquire)
    }

    /// Number of reset handshakes performed since creation
    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::Acquire)
    }

    pub(crate) fn ioc_status(&self) -> IocStatus {
        IocStatus::from_bits_retain(self.regs.read32(regs::IOC_STATUS))
    }

    pub(crate) fn ioc_config(&self) -> IocConfig {
        IocConfig::from_bits_retain(self.regs.read32(regs::IOC_CONFIG))
    }

    pub(crate) fn fault_code(&self) -> u32 {
        self.regs.read32(regs::FAULT) & regs::FAULT_CODE_MASK
    }

    pub(crate) fn mark_unrecoverable(&self) {
        if !self.unrecoverable.swap(true, Ordering::AcqRel) {
            log::error!("[mpi3mr] controller marked unrecoverable");
        }
        self.ready.store(false, Ordering::Release);
    }

    /// Fail fast once the controller is gone
    #[inline]
    pub(crate) fn check_alive(&self) -> ControllerResult<()> {
        if self.is_unrecoverable() {
            Err(ControllerError::Unrecoverable)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Tags and completion
    // =========================================================================

    /// Allocate a command tag from `range`
    pub fn allocate_tag(&self, range: TagRange) -> ControllerResult<CommandSlot> {
        self.check_alive()?;
        self.tracker.allocate(range)
    }

    /// Return a tag; refused while its command is pending
    ///
    /// The tag of a timed out command is held back until the controller
    /// returns the command or a reset flushes it.
    pub fn release_tag(&self, slot: CommandSlot) -> ControllerResult<()> {
        self.tracker.release(slot.tag())
    }

    /// Deliver the next completion of `slot` to `callback` instead of a waiter
    pub fn set_callback<F>(&self, slot: &CommandSlot, callback: F) -> ControllerResult<()>
    where
        F: FnOnce(&Controller, CompletionResult) + Send + 'static,
    {
        self.tracker.set_callback(slot.tag(), Box::new(callback))
    }

    /// State of the command on `slot`
    pub fn slot_state(&self, slot: &CommandSlot) -> Option<SlotState> {
        self.tracker.state(slot.tag())
    }

    /// Wait for the command on `slot` to complete
    ///
    /// The wait polls the reply queue the command completes on, so it works
    /// with interrupts disabled. On timeout the slot is marked timed out, a
    /// late reply is dropped and a controller reset is scheduled. The tag
    /// stays reserved until the controller gives the command back.
    pub fn wait_for_completion(&self, slot: &CommandSlot, timeout_ms: u64) -> ControllerResult<CompletionResult> {
        self.wait_for_slot(slot, timeout_ms, timeout_reason(slot.range()))
    }

    fn wait_for_slot(&self, slot: &CommandSlot, timeout_ms: u64, reason: ResetReason) -> ControllerResult<CompletionResult> {
        let tag = slot.tag();
        let waiter = self.tracker.waiter(tag).ok_or(ControllerError::InvalidTag(tag))?;
        let vector = match self.tracker.io_binding(tag) {
            Some(binding) => self
                .op_queues
                .read()
                .get(binding.queue_index as usize)
                .map_or(0, |q| q.reply.vector()),
            None => 0,
        };

        let polled = Retry::new(timeout_ms, self.config.poll_interval_ms).until(&*self.clock, || {
            if let Some(r) = waiter.take() {
                return Some(r);
            }
            self.poll_reply_queue(vector);
            waiter.take()
        });
        match polled {
            Ok(result) => Ok(result),
            Err(ControllerError::Timeout) if self.tracker.mark_timed_out(tag) => {
                log::error!("[mpi3mr] command {:#06x} timed out after {} ms", tag, timeout_ms);
                self.command_timed_out(slot.range(), reason);
                Err(ControllerError::Timeout)
            }
            Err(ControllerError::Timeout) => loop {
                // Completed (or flushed) while giving up: the result is in flight.
                if let Some(r) = waiter.take() {
                    return Ok(r);
                }
                match self.tracker.state(tag) {
                    Some(SlotState::Complete) | Some(SlotState::Reset) => core::hint::spin_loop(),
                    _ => return Err(ControllerError::Timeout),
                }
            },
            Err(e) => Err(e),
        }
    }

    /// During bring-up or reset the fault state is checked and a snapshot
    /// captured; otherwise a reset is scheduled for the watchdog.
    fn command_timed_out(&self, range: TagRange, reason: ResetReason) {
        if self.is_reset_in_progress() || !self.ready.load(Ordering::Acquire) {
            if range != TagRange::Io {
                self.check_rh_fault(reason);
            }
        } else {
            self.schedule_reset(reason, range != TagRange::Io);
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit an admin request whose host tag was allocated by the caller
    pub fn submit_admin(&self, frame: &[u8]) -> ControllerResult<()> {
        self.check_alive()?;
        if frame.len() <= Frame::FUNCTION || frame.len() > self.admin.request.entry_size() {
            return Err(ControllerError::InvalidFrame(frame.len()));
        }
        let tag = Frame::from_bytes(frame).host_tag();
        if self.tracker.range_of(tag) == Some(TagRange::Ioctl) && self.block_ioctls.load(Ordering::Acquire) {
            return Err(ControllerError::ResetInProgress);
        }
        self.tracker.arm(tag)?;
        if let Err(e) = self.admin.request.submit(&*self.regs, frame) {
            self.tracker.disarm(tag);
            log::warn!("[mpi3mr] admin queue full, tag {:#06x} not submitted", tag);
            return Err(e.into());
        }
        Ok(())
    }

    /// Submit a SCSI I/O request on operational queue `queue_index`
    ///
    /// The device handle and data length are read from the frame for
    /// per-device accounting. A full request ring gets one drain of its
    /// reply ring before the request is refused.
    pub fn submit_io(&self, queue_index: u16, frame: &[u8]) -> ControllerResult<()> {
        self.check_alive()?;
        if self.io_frozen.load(Ordering::Acquire) {
            return Err(ControllerError::ResetInProgress);
        }
        if frame.len() < mpi::scsi_io::MIN_LEN {
            return Err(ControllerError::InvalidFrame(frame.len()));
        }
        let tag = Frame::from_bytes(frame).host_tag();
        if !self.tracker.is_io_tag(tag) {
            return Err(ControllerError::InvalidTag(tag));
        }

        let queues = self.op_queues.read();
        let pair = queues.get(queue_index as usize).ok_or(ControllerError::NotReady)?;
        if frame.len() > pair.request.entry_size() {
            return Err(ControllerError::InvalidFrame(frame.len()));
        }
        let dev_handle = mpi::le_u16(frame, mpi::scsi_io::DEV_HANDLE);
        let data_len = mpi::le_u32(frame, mpi::scsi_io::DATA_LENGTH);

        self.tracker.arm(tag)?;
        let binding = match self.devices.io_started(queue_index, dev_handle, data_len, &self.limits()) {
            Ok(binding) => binding,
            Err(e) => {
                self.tracker.disarm(tag);
                return Err(e);
            }
        };
        self.tracker.bind_io(tag, binding);
        pair.reply.io_submitted();

        let mut submitted = pair.request.submit(&*self.regs, frame);
        if submitted.is_err() {
            self.process_op_reply_queue(pair);
            submitted = pair.request.submit(&*self.regs, frame);
        }
        if let Err(e) = submitted {
            self.undo_io(tag, pair);
            log::warn!("[mpi3mr] operational queue {} full", pair.request.qid());
            return Err(e.into());
        }
        Ok(())
    }

    fn undo_io(&self, tag: u16, pair: &QueuePair) {
        if let Some(binding) = self.tracker.take_io_binding(tag) {
            self.io_finished(&binding);
        }
        pair.reply.io_completed();
        self.tracker.disarm(tag);
    }

    pub(crate) fn io_finished(&self, binding: &IoBinding) {
        self.devices.io_completed(binding, &self.limits());
    }

    /// Run a pass-through admin command and wait for it
    ///
    /// The frame's host tag is replaced. Refused while a reset is running;
    /// the reset waits for calls already in flight.
    pub fn ioctl_command(&self, frame: &[u8], timeout_ms: u64) -> ControllerResult<CompletionResult> {
        self.check_alive()?;
        if self.block_ioctls.load(Ordering::Acquire) {
            return Err(ControllerError::ResetInProgress);
        }
        let _pending = PendingAdminGuard::new(&self.pend_ioctls);
        let mut request = Frame::from_bytes(frame);
        self.issue_internal(TagRange::Ioctl, timeout_ms, ResetReason::IoctlTimeout, move |tag| {
            request.set_host_tag(tag);
            request
        })
    }

    /// Issue an admin command on a reserved tag and wait for it
    ///
    /// A timeout is reported under `reason`.
    pub(crate) fn issue_internal(
        &self,
        range: TagRange,
        timeout_ms: u64,
        reason: ResetReason,
        build: impl FnOnce(u16) -> Frame,
    ) -> ControllerResult<CompletionResult> {
        let slot = self.tracker.allocate(range).map_err(|e| {
            log::warn!("[mpi3mr] {:?} command slot in use", range);
            e
        })?;
        let frame = build(slot.tag());
        let function = frame.function();
        let result = self
            .submit_admin(frame.as_bytes())
            .and_then(|_| self.wait_for_slot(&slot, timeout_ms, reason));
        self.return_tag(slot.tag());

        if result == Err(ControllerError::Timeout) {
            log::error!("[mpi3mr] admin function {:#04x} timed out ({})", function, reason);
        }
        result
    }

    /// Ask the watchdog to reset the controller on its next pass
    pub fn schedule_reset(&self, reason: ResetReason, snapdump: bool) {
        let mut pending = self.reset_request.lock();
        if pending.is_none() {
            log::warn!("[mpi3mr] reset scheduled: {}", reason);
            *pending = Some(ResetRequest { reason, snapdump });
        }
    }

    pub(crate) fn take_reset_request(&self) -> Option<ResetRequest> {
        self.reset_request.lock().take()
    }

    /// Drop a scheduled reset that was requested for `reason`
    pub(crate) fn withdraw_reset_request(&self, reason: ResetReason) {
        let mut pending = self.reset_request.lock();
        if pending.is_some_and(|r| r.reason == reason) {
            log::info!("[mpi3mr] scheduled reset withdrawn: {}", reason);
            *pending = None;
        }
    }

    /// Give a reserved tag back, logging a refusal
    pub(crate) fn return_tag(&self, tag: u16) {
        if let Err(e) = self.tracker.release(tag) {
            log::warn!("[mpi3mr] tag {:#06x} not returned: {}", tag, e);
        }
    }
}

/// Reset reason for a command that ran out of time
fn timeout_reason(range: TagRange) -> ResetReason {
    match range {
        TagRange::Io => ResetReason::ScsiIoTimeout,
        TagRange::TaskMgmt => ResetReason::TmTimeout,
        TagRange::Ioctl => ResetReason::IoctlTimeout,
        TagRange::PelAbort => ResetReason::PelAbortTimeout,
        TagRange::EventAck => ResetReason::EventAckTimeout,
        TagRange::Init | TagRange::PelWait | TagRange::DevRemoval => ResetReason::EhHost,
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .field("unrecoverable", &self.is_unrecoverable())
            .field("reset_in_progress", &self.is_reset_in_progress())
            .field("op_queues", &self.num_op_queues())
            .finish()
    }
}
