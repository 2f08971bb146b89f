//! # Driver Configuration
//!
//! Tunables for queue depths, buffer pools, reserved command tags and every
//! timeout the control plane polls against.

use crate::error::{ControllerError, ControllerResult};

/// Configuration for one controller instance
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Admin request ring depth
    pub admin_req_entries: u16,
    /// Admin reply ring depth
    pub admin_reply_entries: u16,
    /// Depth of each operational request ring
    pub op_req_entries: u16,
    /// Depth of each operational reply ring
    pub op_reply_entries: u16,
    /// Upper bound on operational queue pairs, before facts and vectors
    pub max_op_queues: u16,
    /// Extra reply frames on top of `max_reqs`, for unsolicited events
    pub event_reply_frames: u16,
    /// `max_reqs / sense_buf_factor` sense buffers are allocated
    pub sense_buf_factor: u16,
    /// Size of one sense buffer in bytes
    pub sense_buf_size: u16,
    /// Tags reserved for device-removal handshakes
    pub dev_removal_cmds: u16,
    /// Tags reserved for event acknowledgements
    pub event_ack_cmds: u16,
    /// Timeout for internal admin commands
    pub admin_cmd_timeout_ms: u64,
    /// Timeout for port enable
    pub port_enable_timeout_ms: u64,
    /// How long to wait for the controller to acknowledge a reset
    pub reset_ack_timeout_ms: u64,
    /// How long a message unit reset may take
    pub mur_timeout_ms: u64,
    /// How long firmware may spend saving diagnostic data
    pub diag_save_timeout_ms: u64,
    /// Interval between register polls
    pub poll_interval_ms: u64,
    /// Interval between watchdog passes
    pub watchdog_interval_ms: u64,
    /// Watchdog passes to wait after a prepare-for-reset event
    pub prepare_for_reset_ticks: u32,
    /// Attempts at the host-diagnostic unlock sequence
    pub host_diag_unlock_retries: u32,
    /// Retries of a failed device-removal handshake
    pub dev_removal_retries: u8,
    /// How long a reset waits for outstanding admin callers to drain
    pub pending_admin_wait_ms: u64,
    /// Settle time after a successful reinitialization
    pub post_reset_settle_ms: u64,
    /// Capture a firmware snapshot before fault-triggered resets
    pub snapdump_on_fault: bool,
}

impl DriverConfig {
    /// Admin request ring depth: two pages of 128-byte frames
    pub const DEFAULT_ADMIN_REQ_ENTRIES: u16 = 64;
    /// Admin reply ring depth: two pages of 16-byte descriptors
    pub const DEFAULT_ADMIN_REPLY_ENTRIES: u16 = 512;
    /// Operational request ring depth
    pub const DEFAULT_OP_REQ_ENTRIES: u16 = 512;
    /// Operational reply ring depth
    pub const DEFAULT_OP_REPLY_ENTRIES: u16 = 1024;
    /// Reply frames reserved for events
    pub const DEFAULT_EVENT_REPLY_FRAMES: u16 = 64;
    /// Sense buffer ratio
    pub const DEFAULT_SENSE_BUF_FACTOR: u16 = 3;
    /// Sense buffer size
    pub const DEFAULT_SENSE_BUF_SIZE: u16 = 256;
    /// Device-removal handshake tags
    pub const DEFAULT_DEV_REMOVAL_CMDS: u16 = 16;
    /// Event-ack tags
    pub const DEFAULT_EVENT_ACK_CMDS: u16 = 4;
    /// Internal admin command timeout: 60s
    pub const DEFAULT_ADMIN_CMD_TIMEOUT_MS: u64 = 60_000;
    /// Port enable timeout: 300s
    pub const DEFAULT_PORT_ENABLE_TIMEOUT_MS: u64 = 300_000;
    /// Reset acknowledgement timeout: 30s
    pub const DEFAULT_RESET_ACK_TIMEOUT_MS: u64 = 30_000;
    /// Message unit reset timeout: 120s
    pub const DEFAULT_MUR_TIMEOUT_MS: u64 = 120_000;
    /// Diagnostic save timeout: 60s
    pub const DEFAULT_DIAG_SAVE_TIMEOUT_MS: u64 = 60_000;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            admin_req_entries: Self::DEFAULT_ADMIN_REQ_ENTRIES,
            admin_reply_entries: Self::DEFAULT_ADMIN_REPLY_ENTRIES,
            op_req_entries: Self::DEFAULT_OP_REQ_ENTRIES,
            op_reply_entries: Self::DEFAULT_OP_REPLY_ENTRIES,
            max_op_queues: 64,
            event_reply_frames: Self::DEFAULT_EVENT_REPLY_FRAMES,
            sense_buf_factor: Self::DEFAULT_SENSE_BUF_FACTOR,
            sense_buf_size: Self::DEFAULT_SENSE_BUF_SIZE,
            dev_removal_cmds: Self::DEFAULT_DEV_REMOVAL_CMDS,
            event_ack_cmds: Self::DEFAULT_EVENT_ACK_CMDS,
            admin_cmd_timeout_ms: Self::DEFAULT_ADMIN_CMD_TIMEOUT_MS,
            port_enable_timeout_ms: Self::DEFAULT_PORT_ENABLE_TIMEOUT_MS,
            reset_ack_timeout_ms: Self::DEFAULT_RESET_ACK_TIMEOUT_MS,
            mur_timeout_ms: Self::DEFAULT_MUR_TIMEOUT_MS,
            diag_save_timeout_ms: Self::DEFAULT_DIAG_SAVE_TIMEOUT_MS,
            poll_interval_ms: 100,
            watchdog_interval_ms: 1000,
            prepare_for_reset_ticks: 180,
            host_diag_unlock_retries: 5,
            dev_removal_retries: 5,
            pending_admin_wait_ms: 180_000,
            post_reset_settle_ms: 10_000,
            snapdump_on_fault: false,
        }
    }

    /// Create a configuration for memory-constrained systems
    pub fn small() -> Self {
        Self {
            op_req_entries: 128,
            op_reply_entries: 256,
            max_op_queues: 4,
            dev_removal_cmds: 4,
            event_ack_cmds: 2,
            ..Self::new()
        }
    }

    /// Create a configuration with tiny rings and short timeouts
    pub fn for_testing() -> Self {
        Self {
            admin_req_entries: 16,
            admin_reply_entries: 32,
            op_req_entries: 8,
            op_reply_entries: 16,
            max_op_queues: 2,
            event_reply_frames: 8,
            dev_removal_cmds: 2,
            event_ack_cmds: 2,
            admin_cmd_timeout_ms: 500,
            port_enable_timeout_ms: 500,
            reset_ack_timeout_ms: 1_000,
            mur_timeout_ms: 1_000,
            diag_save_timeout_ms: 1_000,
            poll_interval_ms: 10,
            pending_admin_wait_ms: 100,
            post_reset_settle_ms: 0,
            ..Self::new()
        }
    }

    /// Number of internal (non-I/O) tags, including the single-purpose ones
    pub fn internal_tag_count(&self) -> u16 {
        crate::tracker::SINGLE_PURPOSE_TAGS + self.dev_removal_cmds + self.event_ack_cmds
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> ControllerResult<()> {
        let rings = [
            self.admin_req_entries,
            self.admin_reply_entries,
            self.op_req_entries,
            self.op_reply_entries,
        ];
        if rings.iter().any(|&n| n < 2) {
            log::error!("[mpi3mr] ring depths must be at least 2");
            return Err(ControllerError::InvalidConfig);
        }
        if self.max_op_queues == 0 || self.sense_buf_factor == 0 || self.sense_buf_size == 0 {
            log::error!("[mpi3mr] queue count and sense pool parameters must be non-zero");
            return Err(ControllerError::InvalidConfig);
        }
        if self.dev_removal_cmds == 0 || self.event_ack_cmds == 0 {
            log::error!("[mpi3mr] handshake tag ranges must not be empty");
            return Err(ControllerError::InvalidConfig);
        }
        if self.poll_interval_ms == 0 || self.watchdog_interval_ms == 0 {
            return Err(ControllerError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}
