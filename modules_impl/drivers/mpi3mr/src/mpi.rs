//! # MPI3 Message Layer
//!
//! Request frame builders and reply frame parsers for the management messages
//! the control plane issues itself: facts, init, queue creation, events,
//! port enable, task management and IO unit control.
//!
//! Frames are little-endian byte images. Only the fields the driver uses are
//! named here; everything else is left zero.

use alloc::vec::Vec;
use helix_hal::PhysAddr;

/// Size of an admin request frame
pub const ADMIN_REQ_FRAME_SIZE: usize = 128;
/// Size of a reply descriptor
pub const REPLY_DESC_SIZE: usize = 16;
/// log2 of the operational request entry size the driver programs
pub const OP_REQ_ENTRY_SIZE_LOG2: u32 = 7;
/// log2 of the operational reply entry size the driver programs
pub const OP_REPLY_ENTRY_SIZE_LOG2: u32 = 4;
/// Size of the IOC facts data buffer
pub const IOC_FACTS_DATA_SIZE: usize = 0x68;
/// Host tag the firmware uses for unsolicited replies
pub const HOST_TAG_INVALID: u16 = 0xFFFF;
/// Device handle value meaning "no device"
pub const INVALID_DEV_HANDLE: u16 = 0xFFFF;
/// MPI version 3.0 as reported in IOC init
pub const MPI_VERSION: u32 = 0x0300_0000;
/// Value of the who-init field when the host driver initializes the IOC
pub const WHOINIT_HOST_DRIVER: u8 = 0x03;

/// Message function codes
pub mod function {
    /// IOC facts
    pub const IOC_FACTS: u8 = 0x01;
    /// IOC init
    pub const IOC_INIT: u8 = 0x02;
    /// Port enable
    pub const PORT_ENABLE: u8 = 0x03;
    /// Event notification (request and unsolicited reply)
    pub const EVENT_NOTIFICATION: u8 = 0x04;
    /// Event acknowledge
    pub const EVENT_ACK: u8 = 0x05;
    /// IO unit control
    pub const IO_UNIT_CONTROL: u8 = 0x08;
    /// Persistent event log
    pub const PERSISTENT_EVENT_LOG: u8 = 0x09;
    /// SCSI I/O
    pub const SCSI_IO: u8 = 0x20;
    /// SCSI task management
    pub const SCSI_TASK_MGMT: u8 = 0x21;
    /// Create operational request queue
    pub const CREATE_REQUEST_QUEUE: u8 = 0x70;
    /// Create operational reply queue
    pub const CREATE_REPLY_QUEUE: u8 = 0x72;
    /// Delete operational reply queue
    pub const DELETE_REPLY_QUEUE: u8 = 0x73;
}

/// IOC status values
pub mod ioc_status {
    /// Status field mask
    pub const STATUS_MASK: u16 = 0x7FFF;
    /// Log info is valid
    pub const LOGINFO_AVAIL: u16 = 0x8000;
    /// Success
    pub const SUCCESS: u16 = 0x0000;
    /// Unsupported function
    pub const INVALID_FUNCTION: u16 = 0x0001;
    /// IOC busy
    pub const BUSY: u16 = 0x0002;
    /// Internal error
    pub const INTERNAL_ERROR: u16 = 0x0004;
    /// Invalid field in the request
    pub const INVALID_FIELD: u16 = 0x0007;
    /// Request not valid in the current state
    pub const INVALID_STATE: u16 = 0x0008;
    /// I/O terminated by the IOC
    pub const SCSI_IOC_TERMINATED: u16 = 0x004B;
    /// Synthesized by the driver for commands flushed by a reset
    pub const DRIVER_RESET_TERMINATED: u16 = 0x7FF0;
    /// Synthesized by the driver for I/O flushed by a reset; the midlayer retries these
    pub const DRIVER_BUS_RESET: u16 = 0x7FF1;
}

/// Reply descriptor flag bits (offset 0x0E of every descriptor)
pub mod reply_flags {
    /// Phase bit
    pub const PHASE_MASK: u16 = 0x0001;
    /// Descriptor type field
    pub const TYPE_MASK: u16 = 0xF000;
    /// Address reply
    pub const TYPE_ADDRESS_REPLY: u16 = 0x0000;
    /// Success
    pub const TYPE_SUCCESS: u16 = 0x1000;
    /// Status
    pub const TYPE_STATUS: u16 = 0x4000;
}

/// Task management task types
pub mod task_type {
    /// Abort one task
    pub const ABORT_TASK: u8 = 0x01;
    /// Reset the target
    pub const TARGET_RESET: u8 = 0x03;
    /// Reset one logical unit
    pub const LOGICAL_UNIT_RESET: u8 = 0x05;
}

/// IO unit control operations
pub mod iounit_op {
    /// Device removal handshake, second half
    pub const REMOVE_DEVICE: u8 = 0x10;
    /// Acknowledge a hidden device
    pub const HIDDEN_ACK: u8 = 0x11;
}

/// Persistent event log actions
pub mod pel_action {
    /// Complete once a matching entry is logged
    pub const WAIT: u8 = 0x05;
    /// Abort an outstanding wait
    pub const ABORT: u8 = 0x06;
}

/// Event log status carried in a persistent event log reply
pub mod pel_status {
    /// Success
    pub const SUCCESS: u16 = 0x00;
    /// No matching entry
    pub const NOT_FOUND: u16 = 0x01;
    /// The wait was aborted
    pub const ABORTED: u16 = 0x02;
    /// The log is not available yet
    pub const NOT_READY: u16 = 0x03;
    /// Offset in the reply frame
    pub const OFFSET: usize = 0x14;
}

/// Fields of a SCSI I/O request the driver reads for accounting
pub mod scsi_io {
    /// Offset of the device handle
    pub const DEV_HANDLE: usize = 0x0A;
    /// Offset of the data length in bytes
    pub const DATA_LENGTH: usize = 0x14;
    /// Shortest frame that holds both fields
    pub const MIN_LEN: usize = DATA_LENGTH + 4;
}

/// Simple SGE flags: system address, end of list
const SGE_FLAGS_SIMPLE_END_OF_LIST: u8 = 0x08;
/// Create reply queue: interrupts enabled
const CREATE_REPLY_QUEUE_FLAGS_INT_ENABLE: u8 = 0x01;
/// Event notification message flag: acknowledgement required
const EVENT_NOTIFY_MSGFLAGS_ACK_REQUIRED: u8 = 0x01;

// =============================================================================
// Little-endian field access
// =============================================================================

#[inline]
pub(crate) fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
    (le_u32(buf, off) as u64) | ((le_u32(buf, off + 4) as u64) << 32)
}

// =============================================================================
// Request frames
// =============================================================================

/// A request frame image
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: [u8; ADMIN_REQ_FRAME_SIZE],
    len: usize,
}

impl Frame {
    /// Offset of the host tag
    pub const HOST_TAG: usize = 0x00;
    /// Offset of the function code
    pub const FUNCTION: usize = 0x03;
    /// Offset of the message flags
    pub const MSG_FLAGS: usize = 0x07;

    /// Create a zeroed frame of `len` bytes for `function`
    pub fn new(function: u8, host_tag: u16, len: usize) -> Self {
        let mut frame = Self {
            buf: [0; ADMIN_REQ_FRAME_SIZE],
            len: len.min(ADMIN_REQ_FRAME_SIZE),
        };
        frame.set_u16(Self::HOST_TAG, host_tag);
        frame.set_u8(Self::FUNCTION, function);
        frame
    }

    /// Wrap caller-built bytes (truncated to one frame)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes.len().min(ADMIN_REQ_FRAME_SIZE);
        let mut buf = [0; ADMIN_REQ_FRAME_SIZE];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self { buf, len }
    }

    /// Frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Host tag
    pub fn host_tag(&self) -> u16 {
        le_u16(&self.buf, Self::HOST_TAG)
    }

    /// Function code
    pub fn function(&self) -> u8 {
        self.buf[Self::FUNCTION]
    }

    /// Replace the host tag
    pub fn set_host_tag(&mut self, tag: u16) {
        self.set_u16(Self::HOST_TAG, tag);
    }

    /// Set a byte field
    pub fn set_u8(&mut self, off: usize, v: u8) -> &mut Self {
        self.buf[off] = v;
        self
    }

    /// Set a 16-bit field
    pub fn set_u16(&mut self, off: usize, v: u16) -> &mut Self {
        self.buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
        self
    }

    /// Set a 32-bit field
    pub fn set_u32(&mut self, off: usize, v: u32) -> &mut Self {
        self.buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        self
    }

    /// Set a 64-bit field
    pub fn set_u64(&mut self, off: usize, v: u64) -> &mut Self {
        self.buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
        self
    }

    fn set_simple_sge(&mut self, off: usize, addr: PhysAddr, len: u32) {
        self.set_u64(off, addr.as_u64());
        self.set_u32(off + 8, len);
        self.set_u8(off + 15, SGE_FLAGS_SIMPLE_END_OF_LIST);
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame")
            .field("function", &self.function())
            .field("host_tag", &self.host_tag())
            .field("len", &self.len)
            .finish()
    }
}

/// IOC facts request; facts data lands in `data`
pub fn ioc_facts(host_tag: u16, data: PhysAddr) -> Frame {
    let mut f = Frame::new(function::IOC_FACTS, host_tag, 0x20);
    f.set_simple_sge(0x10, data, IOC_FACTS_DATA_SIZE as u32);
    f
}

/// Parameters of the IOC init request
#[derive(Debug, Clone, Copy)]
pub struct IocInitParams {
    /// Host timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Reply free queue depth (entries, including the spare)
    pub reply_free_depth: u16,
    /// Reply free queue base
    pub reply_free_addr: PhysAddr,
    /// Sense free queue depth (entries, including the spare)
    pub sense_free_depth: u16,
    /// Size of one sense buffer
    pub sense_buf_len: u16,
    /// Sense free queue base
    pub sense_free_addr: PhysAddr,
}

/// IOC init request
pub fn ioc_init(host_tag: u16, p: &IocInitParams) -> Frame {
    let mut f = Frame::new(function::IOC_INIT, host_tag, 0x40);
    f.set_u32(0x0C, MPI_VERSION)
        .set_u64(0x10, p.timestamp_ms)
        .set_u8(0x19, WHOINIT_HOST_DRIVER)
        .set_u16(0x1C, p.reply_free_depth)
        .set_u64(0x20, p.reply_free_addr.as_u64())
        .set_u16(0x2C, p.sense_free_depth)
        .set_u16(0x2E, p.sense_buf_len)
        .set_u64(0x30, p.sense_free_addr.as_u64());
    f
}

/// Create operational reply queue request
pub fn create_reply_queue(host_tag: u16, qid: u16, size: u16, msix: u16, base: PhysAddr) -> Frame {
    let mut f = Frame::new(function::CREATE_REPLY_QUEUE, host_tag, 0x20);
    f.set_u8(0x0A, CREATE_REPLY_QUEUE_FLAGS_INT_ENABLE)
        .set_u16(0x0C, size)
        .set_u16(0x0E, qid)
        .set_u16(0x10, msix)
        .set_u64(0x18, base.as_u64());
    f
}

/// Create operational request queue request, bound to `reply_qid`
pub fn create_request_queue(host_tag: u16, qid: u16, size: u16, reply_qid: u16, base: PhysAddr) -> Frame {
    let mut f = Frame::new(function::CREATE_REQUEST_QUEUE, host_tag, 0x20);
    f.set_u16(0x0C, size)
        .set_u16(0x0E, qid)
        .set_u16(0x10, reply_qid)
        .set_u64(0x18, base.as_u64());
    f
}

/// Delete operational reply queue request
pub fn delete_reply_queue(host_tag: u16, qid: u16) -> Frame {
    let mut f = Frame::new(function::DELETE_REPLY_QUEUE, host_tag, 0x10);
    f.set_u16(0x0A, qid);
    f
}

/// Event notification request carrying the four mask words
pub fn event_notification(host_tag: u16, masks: &[u32; 4]) -> Frame {
    let mut f = Frame::new(function::EVENT_NOTIFICATION, host_tag, 0x20);
    for (i, m) in masks.iter().enumerate() {
        f.set_u32(0x10 + i * 4, *m);
    }
    f
}

/// Event acknowledge request
pub fn event_ack(host_tag: u16, event: u8, event_context: u32) -> Frame {
    let mut f = Frame::new(function::EVENT_ACK, host_tag, 0x14);
    f.set_u8(0x0C, event).set_u32(0x10, event_context);
    f
}

/// Port enable request
pub fn port_enable(host_tag: u16) -> Frame {
    Frame::new(function::PORT_ENABLE, host_tag, 0x0C)
}

/// SCSI task management request
pub fn task_mgmt(host_tag: u16, dev_handle: u16, task: u8, task_host_tag: u16, lun: u64) -> Frame {
    let mut f = Frame::new(function::SCSI_TASK_MGMT, host_tag, 0x20);
    f.set_u16(0x0A, dev_handle)
        .set_u16(0x0C, task_host_tag)
        .set_u8(0x0E, task)
        .set_u64(0x18, lun);
    f
}

/// Event log wait from `seq_num` on for entries of `locale` at or above `class`
///
/// A wait time of zero waits until an entry arrives or the wait is aborted.
pub fn pel_wait(host_tag: u16, seq_num: u32, locale: u16, class: u8) -> Frame {
    let mut f = Frame::new(function::PERSISTENT_EVENT_LOG, host_tag, 0x20);
    f.set_u8(0x0A, pel_action::WAIT)
        .set_u32(0x0C, seq_num)
        .set_u16(0x10, locale)
        .set_u8(0x12, class);
    f
}

/// Abort the event log wait issued on `abort_host_tag`
pub fn pel_abort(host_tag: u16, abort_host_tag: u16) -> Frame {
    let mut f = Frame::new(function::PERSISTENT_EVENT_LOG, host_tag, 0x18);
    f.set_u8(0x0A, pel_action::ABORT).set_u16(0x10, abort_host_tag);
    f
}

/// Event log status of a persistent event log reply frame
pub fn pel_log_status(reply: &[u8]) -> Option<u16> {
    (reply.len() >= pel_status::OFFSET + 2).then(|| le_u16(reply, pel_status::OFFSET))
}

/// IO unit control request for one device handle
pub fn iounit_control(host_tag: u16, operation: u8, dev_handle: u16) -> Frame {
    let mut f = Frame::new(function::IO_UNIT_CONTROL, host_tag, 0x40);
    f.set_u8(0x0B, operation).set_u16(0x30, dev_handle);
    f
}

// =============================================================================
// Reply frames
// =============================================================================

/// Header shared by every reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Host tag of the request
    pub host_tag: u16,
    /// Function code of the request
    pub function: u8,
    /// Message flags
    pub msg_flags: u8,
    /// Raw IOC status, including the log-info flag
    pub ioc_status: u16,
    /// Log info
    pub loginfo: u32,
}

impl ReplyHeader {
    /// Minimum frame length that holds the header
    pub const LEN: usize = 0x10;

    /// Parse the header of a reply frame
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::LEN {
            return None;
        }
        Some(Self {
            host_tag: le_u16(frame, 0x00),
            function: frame[0x03],
            msg_flags: frame[0x07],
            ioc_status: le_u16(frame, 0x0A),
            loginfo: le_u32(frame, 0x0C),
        })
    }

    /// Status with the log-info flag removed
    pub fn status(&self) -> u16 {
        self.ioc_status & ioc_status::STATUS_MASK
    }

    /// Log info, if the IOC flagged it valid
    pub fn loginfo(&self) -> Option<u32> {
        (self.ioc_status & ioc_status::LOGINFO_AVAIL != 0).then_some(self.loginfo)
    }
}

/// Fields of a SCSI I/O reply frame past the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiIoReply {
    /// SCSI status byte
    pub scsi_status: u8,
    /// SCSI state flags
    pub scsi_state: u8,
    /// Device handle the I/O went to
    pub dev_handle: u16,
    /// Bytes transferred
    pub transfer_count: u32,
    /// Valid sense bytes
    pub sense_count: u32,
    /// Sense buffer the IOC consumed, zero if none
    pub sense_buffer: PhysAddr,
}

impl ScsiIoReply {
    /// Minimum frame length
    pub const LEN: usize = 0x38;
    /// Sense data in the sense buffer is valid
    pub const STATE_SENSE_VALID: u8 = 0x01;

    /// Parse a SCSI I/O reply frame
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::LEN {
            return None;
        }
        Some(Self {
            scsi_status: frame[0x10],
            scsi_state: frame[0x11],
            dev_handle: le_u16(frame, 0x12),
            transfer_count: le_u32(frame, 0x14),
            sense_count: le_u32(frame, 0x18),
            sense_buffer: PhysAddr::new(le_u64(frame, 0x30)),
        })
    }

    /// Check if sense data is valid
    pub fn sense_valid(&self) -> bool {
        self.scsi_state & Self::STATE_SENSE_VALID != 0 && self.sense_count > 0
    }
}

/// An unsolicited event notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    /// Event code
    pub event: u8,
    /// The IOC waits for an event ack
    pub ack_required: bool,
    /// IOC change count
    pub change_count: u16,
    /// Context echoed in the ack
    pub event_context: u32,
    /// Event-specific data
    pub data: Vec<u8>,
}

impl EventNotification {
    /// Offset of the event data
    pub const DATA_OFFSET: usize = 0x18;

    /// Parse an event notification reply frame
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::DATA_OFFSET {
            return None;
        }
        let data_len = (frame[0x10] as usize) * 4;
        let end = (Self::DATA_OFFSET + data_len).min(frame.len());
        Some(Self {
            event: frame[0x11],
            ack_required: frame[0x07] & EVENT_NOTIFY_MSGFLAGS_ACK_REQUIRED != 0,
            change_count: le_u16(frame, 0x12),
            event_context: le_u32(frame, 0x14),
            data: frame[Self::DATA_OFFSET..end].to_vec(),
        })
    }
}

// =============================================================================
// IOC facts
// =============================================================================

/// Controller personalities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// Enhanced HBA
    EnhancedHba,
    /// RAID
    Raid,
    /// Unknown value
    Unknown(u8),
}

/// Parsed IOC facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IocFacts {
    /// Facts data length in dwords
    pub data_length: u16,
    /// MPI version word
    pub mpi_version: u32,
    /// Firmware version: generation major/minor, phase major/minor
    pub fw_version: [u8; 4],
    /// Firmware customer id
    pub fw_customer_id: u16,
    /// Firmware build number
    pub fw_build: u16,
    /// Capability bits
    pub ioc_capabilities: u32,
    /// IOC number
    pub ioc_number: u8,
    /// Who initialized the IOC
    pub who_init: u8,
    /// MSI-X vectors the IOC supports
    pub max_msix_vectors: u16,
    /// Outstanding request limit
    pub max_reqs: u16,
    /// Product id
    pub product_id: u16,
    /// Operational request frame size in bytes
    pub req_frame_size: u16,
    /// Reply frame size in bytes
    pub reply_frame_size: u16,
    /// Exception flags
    pub exceptions: u16,
    /// Highest persistent id
    pub max_persistent_id: u16,
    /// Protocol flags
    pub protocol_flags: u8,
    /// Lowest device handle
    pub min_dev_handle: u16,
    /// Highest device handle
    pub max_dev_handle: u16,
    /// Maximum virtual disks
    pub max_vds: u16,
    /// Flags (personality, DMA width)
    pub flags: u32,
    /// Operational request queues supported
    pub max_op_req_queues: u16,
    /// Operational reply queues supported
    pub max_op_reply_queues: u16,
    /// Shutdown timeout in seconds
    pub shutdown_timeout: u16,
    /// Devices per throttle group
    pub max_devs_per_throttle_group: u8,
    /// Throttle data length in 4 KiB units
    pub io_throttle_data_length: u16,
    /// Throttle groups supported
    pub max_io_throttle_groups: u16,
    /// Throttle low-water mark in MiB
    pub io_throttle_low: u16,
    /// Throttle high-water mark in MiB
    pub io_throttle_high: u16,
}

impl IocFacts {
    /// Parse facts data as written by the IOC
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IOC_FACTS_DATA_SIZE {
            return None;
        }
        Some(Self {
            data_length: le_u16(data, 0x00),
            mpi_version: le_u32(data, 0x04),
            fw_version: [data[0x0B], data[0x0A], data[0x09], data[0x08]],
            fw_customer_id: le_u16(data, 0x0C),
            fw_build: le_u16(data, 0x0E),
            ioc_capabilities: le_u32(data, 0x10),
            ioc_number: data[0x14],
            who_init: data[0x15],
            max_msix_vectors: le_u16(data, 0x16),
            max_reqs: le_u16(data, 0x18),
            product_id: le_u16(data, 0x1A),
            req_frame_size: le_u16(data, 0x1C).saturating_mul(4),
            reply_frame_size: le_u16(data, 0x1E).saturating_mul(4),
            exceptions: le_u16(data, 0x20),
            max_persistent_id: le_u16(data, 0x22),
            protocol_flags: data[0x27],
            min_dev_handle: le_u16(data, 0x30),
            max_dev_handle: le_u16(data, 0x32),
            max_vds: le_u16(data, 0x3A),
            flags: le_u32(data, 0x44),
            max_op_req_queues: le_u16(data, 0x48),
            max_op_reply_queues: le_u16(data, 0x4A),
            shutdown_timeout: le_u16(data, 0x4C),
            max_devs_per_throttle_group: data[0x5F],
            io_throttle_data_length: le_u16(data, 0x60),
            max_io_throttle_groups: le_u16(data, 0x62),
            io_throttle_low: le_u16(data, 0x64),
            io_throttle_high: le_u16(data, 0x66),
        })
    }

    /// Controller personality
    pub fn personality(&self) -> Personality {
        match (self.flags & 0x0F) as u8 {
            0x00 => Personality::EnhancedHba,
            0x02 => Personality::Raid,
            other => Personality::Unknown(other),
        }
    }

    /// DMA address width in bits, zero if unreported
    pub fn dma_width(&self) -> u8 {
        ((self.flags & 0x0000_FF00) >> 8) as u8
    }
}
