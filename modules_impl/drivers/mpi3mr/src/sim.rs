//! # Simulated Controller
//!
//! A register-level model of an MPI3 controller. Doorbell writes are served
//! synchronously: the request is read out of host memory through the
//! bus-visible DMA allocator and the reply lands in the reply ring before
//! the write returns. Behaviour knobs let tests hold I/O, silence the admin
//! queue, inject faults and break the reset handshake.

use crate::config::DriverConfig;
use crate::controller::{Controller, Platform};
use crate::descriptor::{encode, DecodedReply, ReplyDescriptor};
use crate::event_log::EventLogFilter;
use crate::mpi::{
    self, function, ioc_status, iounit_op, le_u16, le_u32, le_u64, pel_action, pel_status, task_type, ScsiIoReply,
    ADMIN_REQ_FRAME_SIZE, HOST_TAG_INVALID, IOC_FACTS_DATA_SIZE, REPLY_DESC_SIZE,
};
use crate::regs::{self, fault, HostDiag, IocConfig, IocStatus, ResetAction};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use helix_hal::dma::{BusAccess, HeapDmaAllocator};
use helix_hal::interrupts::VectorTable;
use helix_hal::mmio::RegisterInterface;
use helix_hal::timer::ManualClock;
use helix_hal::PhysAddr;
use spin::Mutex;

/// Outstanding request limit reported in the facts
pub(crate) const MAX_REQS: u16 = 64;
/// MSI-X vectors granted to the simulated device
pub(crate) const VECTORS: u16 = 4;
/// Fixed-format sense data returned with CHECK CONDITION
pub(crate) const SENSE_DATA: [u8; 18] = [
    0x70, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Ready timeout advertised in IOC_INFO_LOW, in 2-second units
const READY_TIMEOUT_UNITS: u32 = 5;
/// Operational request entry size the model reads
const OP_REQ_ENTRY_SIZE: usize = 1 << mpi::OP_REQ_ENTRY_SIZE_LOG2;
/// SCSI status CHECK CONDITION
const SCSI_STATUS_CHECK_CONDITION: u8 = 0x02;

/// Build a SCSI I/O request frame
pub(crate) fn scsi_io(tag: u16, dev_handle: u16, data_len: u32) -> Vec<u8> {
    let mut f = vec![0u8; OP_REQ_ENTRY_SIZE];
    f[0..2].copy_from_slice(&tag.to_le_bytes());
    f[3] = function::SCSI_IO;
    f[mpi::scsi_io::DEV_HANDLE..mpi::scsi_io::DEV_HANDLE + 2].copy_from_slice(&dev_handle.to_le_bytes());
    f[mpi::scsi_io::DATA_LENGTH..mpi::scsi_io::DATA_LENGTH + 4].copy_from_slice(&data_len.to_le_bytes());
    f
}

/// A controller backed by a fresh model; bring-up is left to the test
pub(crate) fn controller(config: DriverConfig) -> (Arc<MockIoc>, Controller) {
    let sim = Arc::new(MockIoc::new());
    let platform = Platform {
        regs: sim.clone(),
        clock: Arc::new(ManualClock::new()),
        dma: Arc::new(sim.dma.clone()),
        irq: Arc::new(VectorTable::new(VECTORS)),
    };
    let ctrl = Controller::new(platform, config).unwrap();
    (sim, ctrl)
}

/// A controller that completed bring-up
pub(crate) fn ready_controller(config: DriverConfig) -> (Arc<MockIoc>, Controller) {
    let (sim, ctrl) = controller(config);
    ctrl.initialize().unwrap();
    (sim, ctrl)
}

// =============================================================================
// Register file
// =============================================================================

/// Plain register storage that counts writes per register
#[derive(Debug, Default)]
pub(crate) struct RegisterFile {
    values: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<BTreeMap<usize, usize>>,
    total_writes: AtomicUsize,
}

impl RegisterFile {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn get(&self, offset: usize) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    fn set(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
    }

    fn update(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let mut values = self.values.lock();
        let v = values.entry(offset).or_insert(0);
        *v = f(*v);
    }

    fn get64(&self, offset: usize) -> u64 {
        (self.get(offset) as u64) | ((self.get(offset + 4) as u64) << 32)
    }

    fn record_write(&self, offset: usize) {
        self.total_writes.fetch_add(1, Ordering::SeqCst);
        *self.writes.lock().entry(offset).or_insert(0) += 1;
    }

    /// Writes seen by one register
    pub(crate) fn write_count(&self, offset: usize) -> usize {
        self.writes.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Writes seen by all registers
    pub(crate) fn total_writes(&self) -> usize {
        self.total_writes.load(Ordering::SeqCst)
    }
}

impl RegisterInterface for RegisterFile {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.record_write(offset);
        self.set(offset, value);
    }
}

// =============================================================================
// Controller model
// =============================================================================

/// How the model answers SCSI I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoCompletion {
    /// Success descriptor
    Success,
    /// Full reply frame, optionally with sense data
    AddressReply { ioc_status: u16, sense: bool },
    /// No reply until the test completes it
    Hold,
}

#[derive(Debug, Clone, Copy)]
struct ReplyRing {
    base: u64,
    depth: u16,
    pi: u16,
    phase: bool,
}

#[derive(Debug, Clone, Copy)]
struct RequestRing {
    base: u64,
    depth: u16,
    ci: u16,
    reply_qid: u16,
}

#[derive(Debug, Clone, Copy)]
struct FreeQueue {
    base: u64,
    depth: u16,
    ci: u16,
    doorbell: usize,
}

#[derive(Debug, Clone, Copy)]
struct HeldIo {
    qid: u16,
    reply_qid: u16,
    tag: u16,
    dev_handle: u16,
}

#[derive(Debug)]
struct Model {
    admin_req: Option<RequestRing>,
    admin_reply: Option<ReplyRing>,
    op_req: BTreeMap<u16, RequestRing>,
    op_reply: BTreeMap<u16, ReplyRing>,
    reply_free: Option<FreeQueue>,
    sense_free: Option<FreeQueue>,
    unlock_progress: usize,

    io_completion: IoCompletion,
    admin_silent: bool,
    silent_frames: Vec<Vec<u8>>,
    iounit_status: u16,
    tm_effective: bool,
    fail_unlock: bool,
    ignore_resets: bool,
    ignore_shutdown: bool,
    fail_request_qid: Option<u16>,
    max_reqs: u16,
    max_op_queues: u16,
    throttle: (u16, u16, u16),

    held: Vec<HeldIo>,
    io_count: usize,
    reply_frames_consumed: usize,
    mask_registrations: Vec<[u32; 4]>,
    acked_events: Vec<(u8, u32)>,
    removed_handles: Vec<u16>,
    target_resets: Vec<u16>,
    pel_waits: Vec<EventLogFilter>,
    parked_pel_wait: Option<u16>,
    port_enables: usize,
    soft_resets: usize,
    diag_faults: usize,
    shutdowns: usize,
}

impl Model {
    fn new() -> Self {
        Self {
            admin_req: None,
            admin_reply: None,
            op_req: BTreeMap::new(),
            op_reply: BTreeMap::new(),
            reply_free: None,
            sense_free: None,
            unlock_progress: 0,
            io_completion: IoCompletion::Success,
            admin_silent: false,
            silent_frames: Vec::new(),
            iounit_status: ioc_status::SUCCESS,
            tm_effective: true,
            fail_unlock: false,
            ignore_resets: false,
            ignore_shutdown: false,
            fail_request_qid: None,
            max_reqs: MAX_REQS,
            max_op_queues: 8,
            throttle: (0, 0, 0),
            held: Vec::new(),
            io_count: 0,
            reply_frames_consumed: 0,
            mask_registrations: Vec::new(),
            acked_events: Vec::new(),
            removed_handles: Vec::new(),
            target_resets: Vec::new(),
            pel_waits: Vec::new(),
            parked_pel_wait: None,
            port_enables: 0,
            soft_resets: 0,
            diag_faults: 0,
            shutdowns: 0,
        }
    }

    /// Everything the message unit forgets on a reset
    fn forget_queues(&mut self) {
        self.admin_req = None;
        self.admin_reply = None;
        self.op_req.clear();
        self.op_reply.clear();
        self.reply_free = None;
        self.sense_free = None;
        self.silent_frames.clear();
        self.held.clear();
        self.parked_pel_wait = None;
    }
}

/// Reply frame with just the header filled in
fn reply_frame(tag: u16, func: u8, status: u16) -> [u8; ScsiIoReply::LEN] {
    let mut frame = [0u8; ScsiIoReply::LEN];
    frame[0..2].copy_from_slice(&tag.to_le_bytes());
    frame[3] = func;
    frame[0x0A..0x0C].copy_from_slice(&status.to_le_bytes());
    frame
}

/// Simulated MPI3 controller
pub(crate) struct MockIoc {
    regs: RegisterFile,
    dma: HeapDmaAllocator,
    model: Mutex<Model>,
    hold_resets: AtomicBool,
    reset_waiting: AtomicBool,
}

impl MockIoc {
    pub(crate) fn new() -> Self {
        let regs = RegisterFile::new();
        regs.set(regs::IOC_INFO_LOW, READY_TIMEOUT_UNITS << regs::IOC_INFO_LOW_TIMEOUT_SHIFT);
        Self {
            regs,
            dma: HeapDmaAllocator::new(),
            model: Mutex::new(Model::new()),
            hold_resets: AtomicBool::new(false),
            reset_waiting: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Knobs
    // -------------------------------------------------------------------------

    pub(crate) fn set_io_completion(&self, mode: IoCompletion) {
        self.model.lock().io_completion = mode;
    }

    pub(crate) fn set_admin_silent(&self, silent: bool) {
        self.model.lock().admin_silent = silent;
    }

    pub(crate) fn set_iounit_status(&self, status: u16) {
        self.model.lock().iounit_status = status;
    }

    pub(crate) fn set_tm_effective(&self, effective: bool) {
        self.model.lock().tm_effective = effective;
    }

    pub(crate) fn fail_unlock(&self, fail: bool) {
        self.model.lock().fail_unlock = fail;
    }

    pub(crate) fn ignore_resets(&self, ignore: bool) {
        self.model.lock().ignore_resets = ignore;
    }

    pub(crate) fn ignore_shutdown(&self, ignore: bool) {
        self.model.lock().ignore_shutdown = ignore;
    }

    pub(crate) fn fail_request_queue(&self, qid: u16) {
        self.model.lock().fail_request_qid = Some(qid);
    }

    pub(crate) fn set_max_op_queues(&self, n: u16) {
        self.model.lock().max_op_queues = n;
    }

    pub(crate) fn set_max_reqs(&self, n: u16) {
        self.model.lock().max_reqs = n;
    }

    /// Throttle data length (4 KiB units) and high/low marks (MiB)
    pub(crate) fn set_throttle(&self, data_length: u16, high: u16, low: u16) {
        self.model.lock().throttle = (data_length, high, low);
    }

    /// Park the next soft reset until released
    pub(crate) fn hold_resets(&self, hold: bool) {
        self.hold_resets.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn reset_waiting(&self) -> bool {
        self.reset_waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn inject_fault(&self, code: u32) {
        self.regs.set(regs::FAULT, code);
        self.regs.update(regs::IOC_STATUS, |s| s | IocStatus::FAULT.bits());
    }

    pub(crate) fn set_diag_save(&self, saving: bool) {
        let bit = HostDiag::SAVE_IN_PROGRESS.bits();
        self.regs.update(regs::HOST_DIAG, |d| if saving { d | bit } else { d & !bit });
    }

    /// The firmware resets itself behind the host's back
    pub(crate) fn firmware_reset(&self) {
        self.model.lock().forget_queues();
        self.regs.set(regs::IOC_CONFIG, 0);
        self.regs.set(regs::IOC_STATUS, IocStatus::RESET_HISTORY.bits());
    }

    /// Power on already enabled and ready
    pub(crate) fn start_ready(&self) {
        let config = IocConfig::ENABLE_IOC.with_entry_sizes(mpi::OP_REQ_ENTRY_SIZE_LOG2, mpi::OP_REPLY_ENTRY_SIZE_LOG2);
        self.regs.set(regs::IOC_CONFIG, config.bits());
        self.regs.set(regs::IOC_STATUS, IocStatus::READY.bits());
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    pub(crate) fn register(&self, offset: usize) -> u32 {
        self.regs.get(offset)
    }

    pub(crate) fn register_writes(&self) -> usize {
        self.regs.total_writes()
    }

    pub(crate) fn scratchpad(&self) -> u32 {
        self.regs.get(regs::SCRATCHPAD0)
    }

    pub(crate) fn op_queue_count(&self) -> usize {
        self.model.lock().op_req.len()
    }

    pub(crate) fn io_count(&self) -> usize {
        self.model.lock().io_count
    }

    pub(crate) fn reply_frames_consumed(&self) -> usize {
        self.model.lock().reply_frames_consumed
    }

    pub(crate) fn event_mask(&self) -> [u32; 4] {
        self.model.lock().mask_registrations.last().copied().unwrap_or([0; 4])
    }

    pub(crate) fn mask_registrations(&self) -> Vec<[u32; 4]> {
        self.model.lock().mask_registrations.clone()
    }

    pub(crate) fn acked_events(&self) -> Vec<(u8, u32)> {
        self.model.lock().acked_events.clone()
    }

    pub(crate) fn removed_handles(&self) -> Vec<u16> {
        self.model.lock().removed_handles.clone()
    }

    pub(crate) fn target_resets(&self) -> Vec<u16> {
        self.model.lock().target_resets.clone()
    }

    /// Every event log wait received, in order
    pub(crate) fn pel_waits(&self) -> Vec<EventLogFilter> {
        self.model.lock().pel_waits.clone()
    }

    pub(crate) fn pel_wait_parked(&self) -> bool {
        self.model.lock().parked_pel_wait.is_some()
    }

    pub(crate) fn port_enables(&self) -> usize {
        self.model.lock().port_enables
    }

    pub(crate) fn soft_resets(&self) -> usize {
        self.model.lock().soft_resets
    }

    pub(crate) fn diag_faults(&self) -> usize {
        self.model.lock().diag_faults
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.model.lock().shutdowns
    }

    pub(crate) fn admin_reply_pi(&self) -> u16 {
        self.model.lock().admin_reply.map_or(0, |r| r.pi)
    }

    // -------------------------------------------------------------------------
    // Unsolicited traffic
    // -------------------------------------------------------------------------

    /// Complete a held I/O with success
    pub(crate) fn complete_held(&self, tag: u16) -> bool {
        let mut m = self.model.lock();
        let Some(pos) = m.held.iter().position(|h| h.tag == tag) else {
            return false;
        };
        let io = m.held.remove(pos);
        let ci = m.op_req.get(&io.qid).map_or(0, |r| r.ci);
        self.post_reply(&mut m, io.reply_qid, ReplyDescriptor::Success { host_tag: tag }, io.qid, ci);
        true
    }

    /// Answer admin requests swallowed while the queue was silent
    pub(crate) fn release_silent_admin(&self) {
        let mut m = self.model.lock();
        let frames = core::mem::take(&mut m.silent_frames);
        let ci = m.admin_req.map_or(0, |r| r.ci);
        for frame in frames {
            self.handle_admin(&mut m, &frame, ci);
        }
    }

    /// Post an address reply on the admin queue for an arbitrary tag
    pub(crate) fn post_admin_address_reply(&self, tag: u16, func: u8, status: u16) {
        let mut m = self.model.lock();
        self.post_admin_frame(&mut m, &reply_frame(tag, func, status));
    }

    /// Answer the parked event log wait with `log_status`
    pub(crate) fn log_pel_entry(&self, log_status: u16) -> bool {
        let mut m = self.model.lock();
        let Some(tag) = m.parked_pel_wait.take() else {
            return false;
        };
        self.post_pel_reply(&mut m, tag, log_status);
        true
    }

    fn post_pel_reply(&self, m: &mut Model, tag: u16, log_status: u16) {
        let mut frame = reply_frame(tag, function::PERSISTENT_EVENT_LOG, ioc_status::SUCCESS);
        frame[pel_status::OFFSET..pel_status::OFFSET + 2].copy_from_slice(&log_status.to_le_bytes());
        self.post_admin_frame(m, &frame);
    }

    fn post_admin_frame(&self, m: &mut Model, frame: &[u8]) {
        let Some(addr) = self.pop_free(m, true) else {
            return;
        };
        self.dma.bus_write(PhysAddr::new(addr), frame).unwrap();
        let ci = m.admin_req.map_or(0, |r| r.ci);
        self.post_reply(m, 0, ReplyDescriptor::AddressReply { dma_address: PhysAddr::new(addr) }, 0, ci);
    }

    /// Post a descriptor with arbitrary flags on the admin queue
    pub(crate) fn post_admin_raw_descriptor(&self, flags: u16) {
        let mut m = self.model.lock();
        let Some(ring) = m.admin_reply.as_mut() else {
            return;
        };
        let mut raw = [0u8; REPLY_DESC_SIZE];
        let flags = (flags & !mpi::reply_flags::PHASE_MASK) | ring.phase as u16;
        raw[REPLY_DESC_SIZE - 2..].copy_from_slice(&flags.to_le_bytes());
        self.write_descriptor(ring, &raw);
    }

    /// Post an event notification on the admin queue
    pub(crate) fn post_event(&self, event: u8, data: &[u8], ack_required: bool, context: u32) {
        let mut frame = vec![0u8; mpi::EventNotification::DATA_OFFSET + data.len()];
        frame[0..2].copy_from_slice(&HOST_TAG_INVALID.to_le_bytes());
        frame[3] = function::EVENT_NOTIFICATION;
        frame[7] = ack_required as u8;
        frame[0x10] = (data.len() / 4) as u8;
        frame[0x11] = event;
        frame[0x14..0x18].copy_from_slice(&context.to_le_bytes());
        frame[mpi::EventNotification::DATA_OFFSET..].copy_from_slice(data);
        let mut m = self.model.lock();
        self.post_admin_frame(&mut m, &frame);
    }

    // -------------------------------------------------------------------------
    // Register side effects
    // -------------------------------------------------------------------------

    fn write_ioc_config(&self, value: u32) {
        let old = IocConfig::from_bits_retain(self.regs.get(regs::IOC_CONFIG));
        let new = IocConfig::from_bits_retain(value);
        self.regs.set(regs::IOC_CONFIG, value);
        let mut m = self.model.lock();
        let faulted = IocStatus::from_bits_retain(self.regs.get(regs::IOC_STATUS)).contains(IocStatus::FAULT);

        if new.contains(IocConfig::ENABLE_IOC) && !old.contains(IocConfig::ENABLE_IOC) && !faulted {
            let entries = self.regs.get(regs::ADMIN_Q_NUM_ENTRIES);
            m.admin_req = Some(RequestRing {
                base: self.regs.get64(regs::ADMIN_REQ_Q_ADDR),
                depth: entries as u16,
                ci: 0,
                reply_qid: 0,
            });
            m.admin_reply = Some(ReplyRing {
                base: self.regs.get64(regs::ADMIN_REPLY_Q_ADDR),
                depth: (entries >> 16) as u16,
                pi: 0,
                phase: true,
            });
            self.regs.update(regs::IOC_STATUS, |s| s | IocStatus::READY.bits());
        }
        if !new.contains(IocConfig::ENABLE_IOC) && old.contains(IocConfig::ENABLE_IOC) {
            m.forget_queues();
            self.regs.update(regs::IOC_STATUS, |s| {
                (s & !IocStatus::READY.bits()) | IocStatus::RESET_HISTORY.bits()
            });
        }

        let shutdown = value & regs::IOC_CONFIG_SHUTDOWN_MASK;
        if shutdown == IocConfig::SHUTDOWN_NORMAL.bits()
            && old.bits() & regs::IOC_CONFIG_SHUTDOWN_MASK != shutdown
        {
            m.shutdowns += 1;
            if !m.ignore_shutdown {
                self.regs.update(regs::IOC_STATUS, |s| {
                    (s & !regs::IOC_STATUS_SHUTDOWN_MASK) | IocStatus::SHUTDOWN_COMPLETE.bits()
                });
            }
        }
    }

    fn write_sequence(&self, value: u32) {
        let mut m = self.model.lock();
        let enable = HostDiag::DIAG_WRITE_ENABLE.bits();
        if self.regs.get(regs::HOST_DIAG) & enable != 0 {
            self.regs.update(regs::HOST_DIAG, |d| d & !enable);
            m.unlock_progress = 0;
        }
        let keys = regs::WRITE_SEQUENCE_KEYS;
        m.unlock_progress = if value == keys[m.unlock_progress] {
            m.unlock_progress + 1
        } else {
            (value == keys[0]) as usize
        };
        if m.unlock_progress == keys.len() {
            m.unlock_progress = 0;
            if !m.fail_unlock {
                self.regs.update(regs::HOST_DIAG, |d| d | enable);
            }
        }
    }

    fn write_host_diag(&self, value: u32) {
        let current = HostDiag::from_bits_retain(self.regs.get(regs::HOST_DIAG));
        let action = value & HostDiag::RESET_ACTION_MASK.bits();
        let kept = HostDiag::DIAG_WRITE_ENABLE | HostDiag::SAVE_IN_PROGRESS;
        self.regs.set(
            regs::HOST_DIAG,
            (value & !(HostDiag::RESET_ACTION_MASK | kept).bits()) | (current & kept).bits(),
        );
        if !current.contains(HostDiag::DIAG_WRITE_ENABLE) {
            return;
        }

        if action == ResetAction::SoftReset.bits() {
            if self.hold_resets.load(Ordering::SeqCst) {
                self.reset_waiting.store(true, Ordering::SeqCst);
                while self.hold_resets.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
            }
            let mut m = self.model.lock();
            if m.ignore_resets {
                return;
            }
            m.soft_resets += 1;
            m.forget_queues();
            self.regs.set(regs::IOC_CONFIG, 0);
            self.regs.set(regs::IOC_STATUS, IocStatus::RESET_HISTORY.bits());
            self.regs.set(regs::FAULT, 0);
        } else if action == ResetAction::DiagFault.bits() {
            let mut m = self.model.lock();
            if m.ignore_resets {
                return;
            }
            m.diag_faults += 1;
            self.inject_fault(fault::DIAG_FAULT_RESET);
        }
    }

    // -------------------------------------------------------------------------
    // Rings
    // -------------------------------------------------------------------------

    fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.dma.bus_read(PhysAddr::new(addr), &mut buf).unwrap();
        buf
    }

    fn write_descriptor(&self, ring: &mut ReplyRing, raw: &[u8; REPLY_DESC_SIZE]) {
        let slot = ring.base + ring.pi as u64 * REPLY_DESC_SIZE as u64;
        self.dma.bus_write(PhysAddr::new(slot), raw).unwrap();
        ring.pi += 1;
        if ring.pi == ring.depth {
            ring.pi = 0;
            ring.phase = !ring.phase;
        }
    }

    fn post_reply(&self, m: &mut Model, reply_qid: u16, desc: ReplyDescriptor, req_q_id: u16, req_q_ci: u16) {
        let ring = if reply_qid == 0 {
            m.admin_reply.as_mut()
        } else {
            m.op_reply.get_mut(&reply_qid)
        };
        let Some(ring) = ring else {
            return;
        };
        let raw = encode(&DecodedReply { desc, req_q_id, req_q_ci }, ring.phase);
        self.write_descriptor(ring, &raw);
    }

    fn post_status(&self, m: &mut Model, reply_qid: u16, tag: u16, status: u16, req_q_id: u16, req_q_ci: u16) {
        let desc = if status == ioc_status::SUCCESS {
            ReplyDescriptor::Success { host_tag: tag }
        } else {
            ReplyDescriptor::Status { host_tag: tag, ioc_status: status, loginfo: None }
        };
        self.post_reply(m, reply_qid, desc, req_q_id, req_q_ci);
    }

    /// Take the next buffer the host posted to a free queue
    fn pop_free(&self, m: &mut Model, reply: bool) -> Option<u64> {
        let queue = if reply { m.reply_free.as_mut()? } else { m.sense_free.as_mut()? };
        if queue.ci == self.regs.get(queue.doorbell) as u16 {
            return None;
        }
        let entry = self.read_bytes(queue.base + queue.ci as u64 * 8, 8);
        queue.ci = (queue.ci + 1) % queue.depth;
        if reply {
            m.reply_frames_consumed += 1;
        }
        Some(le_u64(&entry, 0))
    }

    fn process_admin(&self, pi: u16) {
        let mut m = self.model.lock();
        while let Some(mut ring) = m.admin_req.filter(|r| r.ci != pi) {
            let frame = self.read_bytes(ring.base + ring.ci as u64 * ADMIN_REQ_FRAME_SIZE as u64, ADMIN_REQ_FRAME_SIZE);
            ring.ci = (ring.ci + 1) % ring.depth;
            m.admin_req = Some(ring);
            if frame[3] == function::SCSI_TASK_MGMT && frame[0x0E] == task_type::TARGET_RESET {
                m.target_resets.push(le_u16(&frame, 0x0A));
            }
            if m.admin_silent {
                m.silent_frames.push(frame);
                continue;
            }
            self.handle_admin(&mut m, &frame, ring.ci);
        }
    }

    fn handle_admin(&self, m: &mut Model, frame: &[u8], ci: u16) {
        let tag = le_u16(frame, 0);
        let status = match frame[3] {
            function::IOC_FACTS => {
                self.write_facts(m, le_u64(frame, 0x10));
                ioc_status::SUCCESS
            }
            function::IOC_INIT => {
                m.reply_free = Some(FreeQueue {
                    base: le_u64(frame, 0x20),
                    depth: le_u16(frame, 0x1C),
                    ci: 0,
                    doorbell: regs::REPLY_FREE_HOST_INDEX,
                });
                m.sense_free = Some(FreeQueue {
                    base: le_u64(frame, 0x30),
                    depth: le_u16(frame, 0x2C),
                    ci: 0,
                    doorbell: regs::SENSE_BUF_FREE_HOST_INDEX,
                });
                ioc_status::SUCCESS
            }
            function::CREATE_REPLY_QUEUE => {
                let ring = ReplyRing { base: le_u64(frame, 0x18), depth: le_u16(frame, 0x0C), pi: 0, phase: true };
                m.op_reply.insert(le_u16(frame, 0x0E), ring);
                ioc_status::SUCCESS
            }
            function::CREATE_REQUEST_QUEUE => {
                let qid = le_u16(frame, 0x0E);
                let reply_qid = le_u16(frame, 0x10);
                if m.fail_request_qid == Some(qid) || !m.op_reply.contains_key(&reply_qid) {
                    ioc_status::INVALID_FIELD
                } else {
                    let ring = RequestRing { base: le_u64(frame, 0x18), depth: le_u16(frame, 0x0C), ci: 0, reply_qid };
                    m.op_req.insert(qid, ring);
                    ioc_status::SUCCESS
                }
            }
            function::DELETE_REPLY_QUEUE => {
                m.op_reply.remove(&le_u16(frame, 0x0A));
                ioc_status::SUCCESS
            }
            function::EVENT_NOTIFICATION => {
                let words = [0, 1, 2, 3].map(|i| le_u32(frame, 0x10 + i * 4));
                m.mask_registrations.push(words);
                ioc_status::SUCCESS
            }
            function::EVENT_ACK => {
                m.acked_events.push((frame[0x0C], le_u32(frame, 0x10)));
                ioc_status::SUCCESS
            }
            function::PORT_ENABLE => {
                m.port_enables += 1;
                ioc_status::SUCCESS
            }
            function::SCSI_TASK_MGMT => self.task_mgmt(m, frame),
            function::PERSISTENT_EVENT_LOG => match frame[0x0A] {
                pel_action::WAIT => {
                    m.pel_waits.push(EventLogFilter {
                        seq_num: le_u32(frame, 0x0C),
                        locale: le_u16(frame, 0x10),
                        class: frame[0x12],
                    });
                    // answered when an entry is logged or the wait is aborted
                    m.parked_pel_wait = Some(tag);
                    return;
                }
                pel_action::ABORT => {
                    let target = le_u16(frame, 0x10);
                    if m.parked_pel_wait == Some(target) {
                        m.parked_pel_wait = None;
                        self.post_pel_reply(m, target, pel_status::ABORTED);
                    }
                    ioc_status::SUCCESS
                }
                _ => ioc_status::INVALID_FIELD,
            },
            function::IO_UNIT_CONTROL => {
                if m.iounit_status == ioc_status::SUCCESS && frame[0x0B] == iounit_op::REMOVE_DEVICE {
                    m.removed_handles.push(le_u16(frame, 0x30));
                }
                m.iounit_status
            }
            _ => ioc_status::INVALID_FUNCTION,
        };
        self.post_status(m, 0, tag, status, 0, ci);
    }

    fn task_mgmt(&self, m: &mut Model, frame: &[u8]) -> u16 {
        let dev_handle = le_u16(frame, 0x0A);
        let task_tag = le_u16(frame, 0x0C);
        let victims: Vec<HeldIo> = match frame[0x0E] {
            task_type::TARGET_RESET => m.held.iter().filter(|h| h.dev_handle == dev_handle).copied().collect(),
            task_type::ABORT_TASK => m.held.iter().filter(|h| h.tag == task_tag).copied().collect(),
            _ => Vec::new(),
        };
        if m.tm_effective {
            for io in victims {
                m.held.retain(|h| h.tag != io.tag);
                let ci = m.op_req.get(&io.qid).map_or(0, |r| r.ci);
                self.post_status(m, io.reply_qid, io.tag, ioc_status::SCSI_IOC_TERMINATED, io.qid, ci);
            }
        }
        ioc_status::SUCCESS
    }

    fn write_facts(&self, m: &Model, addr: u64) {
        let mut d = [0u8; IOC_FACTS_DATA_SIZE];
        let mut put16 = |off: usize, v: u16| d[off..off + 2].copy_from_slice(&v.to_le_bytes());
        put16(0x00, (IOC_FACTS_DATA_SIZE / 4) as u16);
        put16(0x16, VECTORS);
        put16(0x18, m.max_reqs);
        put16(0x1C, (OP_REQ_ENTRY_SIZE / 4) as u16);
        put16(0x1E, 32);
        put16(0x32, 0x0400);
        put16(0x48, m.max_op_queues);
        put16(0x4A, m.max_op_queues);
        put16(0x60, m.throttle.0);
        put16(0x64, m.throttle.2);
        put16(0x66, m.throttle.1);
        d[0x04..0x08].copy_from_slice(&mpi::MPI_VERSION.to_le_bytes());
        d[0x08..0x0C].copy_from_slice(&[4, 3, 2, 1]);
        self.dma.bus_write(PhysAddr::new(addr), &d).unwrap();
    }

    fn process_op(&self, qid: u16, pi: u16) {
        let mut m = self.model.lock();
        while let Some(mut ring) = m.op_req.get(&qid).copied().filter(|r| r.ci != pi) {
            let frame = self.read_bytes(ring.base + ring.ci as u64 * OP_REQ_ENTRY_SIZE as u64, OP_REQ_ENTRY_SIZE);
            ring.ci = (ring.ci + 1) % ring.depth;
            m.op_req.insert(qid, ring);
            self.handle_io(&mut m, qid, ring.reply_qid, ring.ci, &frame);
        }
    }

    fn handle_io(&self, m: &mut Model, qid: u16, reply_qid: u16, ci: u16, frame: &[u8]) {
        let tag = le_u16(frame, 0);
        let dev_handle = le_u16(frame, mpi::scsi_io::DEV_HANDLE);
        m.io_count += 1;
        match m.io_completion {
            IoCompletion::Success => self.post_status(m, reply_qid, tag, ioc_status::SUCCESS, qid, ci),
            IoCompletion::Hold => m.held.push(HeldIo { qid, reply_qid, tag, dev_handle }),
            IoCompletion::AddressReply { ioc_status: status, sense } => {
                let Some(addr) = self.pop_free(m, true) else {
                    self.post_status(m, reply_qid, tag, ioc_status::INTERNAL_ERROR, qid, ci);
                    return;
                };
                let mut reply = [0u8; ScsiIoReply::LEN];
                reply[0..2].copy_from_slice(&tag.to_le_bytes());
                reply[3] = function::SCSI_IO;
                reply[0x0A..0x0C].copy_from_slice(&status.to_le_bytes());
                reply[0x12..0x14].copy_from_slice(&dev_handle.to_le_bytes());
                if sense {
                    if let Some(buf) = self.pop_free(m, false) {
                        self.dma.bus_write(PhysAddr::new(buf), &SENSE_DATA).unwrap();
                        reply[0x10] = SCSI_STATUS_CHECK_CONDITION;
                        reply[0x11] = ScsiIoReply::STATE_SENSE_VALID;
                        reply[0x18..0x1C].copy_from_slice(&(SENSE_DATA.len() as u32).to_le_bytes());
                        reply[0x30..0x38].copy_from_slice(&buf.to_le_bytes());
                    }
                }
                self.dma.bus_write(PhysAddr::new(addr), &reply).unwrap();
                self.post_reply(m, reply_qid, ReplyDescriptor::AddressReply { dma_address: PhysAddr::new(addr) }, qid, ci);
            }
        }
    }
}

/// Operational request queue whose producer doorbell sits at `offset`
fn op_req_doorbell(offset: usize) -> Option<u16> {
    let first = regs::oper_req_q_pi(1);
    if offset < first || offset >= regs::WRITE_SEQUENCE || (offset - first) % 8 != 0 {
        return None;
    }
    Some(((offset - first) / 8) as u16 + 1)
}

impl RegisterInterface for MockIoc {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.regs.record_write(offset);
        match offset {
            regs::IOC_CONFIG => self.write_ioc_config(value),
            regs::IOC_STATUS => {
                let cleared = value & IocStatus::RESET_HISTORY.bits();
                self.regs.update(regs::IOC_STATUS, |s| s & !cleared);
            }
            regs::WRITE_SEQUENCE => self.write_sequence(value),
            regs::HOST_DIAG => self.write_host_diag(value),
            regs::ADMIN_REQ_Q_PI => {
                self.regs.set(offset, value);
                self.process_admin(value as u16);
            }
            _ => {
                self.regs.set(offset, value);
                if let Some(qid) = op_req_doorbell(offset) {
                    self.process_op(qid, value as u16);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_file_counts_writes() {
        let regs = RegisterFile::new();
        regs.write32(0x10, 5);
        regs.write64(0x20, 0x1_0000_0002);
        assert_eq!(regs.read32(0x10), 5);
        assert_eq!(regs.read64(0x20), 0x1_0000_0002);
        assert_eq!(regs.write_count(0x10), 1);
        assert_eq!(regs.write_count(0x24), 1);
        assert_eq!(regs.total_writes(), 3);
    }

    #[test]
    fn test_unlock_sequence() {
        let sim = MockIoc::new();
        for key in regs::WRITE_SEQUENCE_KEYS {
            sim.write32(regs::WRITE_SEQUENCE, key);
        }
        assert_ne!(sim.read32(regs::HOST_DIAG) & HostDiag::DIAG_WRITE_ENABLE.bits(), 0);
        sim.write32(regs::WRITE_SEQUENCE, regs::WRITE_SEQUENCE_RELOCK);
        assert_eq!(sim.read32(regs::HOST_DIAG) & HostDiag::DIAG_WRITE_ENABLE.bits(), 0);
    }

    #[test]
    fn test_op_doorbell_decoding() {
        assert_eq!(op_req_doorbell(regs::oper_req_q_pi(1)), Some(1));
        assert_eq!(op_req_doorbell(regs::oper_req_q_pi(5)), Some(5));
        assert_eq!(op_req_doorbell(regs::oper_reply_q_ci(1)), None);
        assert_eq!(op_req_doorbell(regs::ADMIN_REPLY_Q_CI), None);
    }
}
