//! # System Interface Registers
//!
//! Offsets and bit definitions of the MPI3 system interface register block.

use bitflags::bitflags;

// =============================================================================
// Offsets
// =============================================================================

/// IOC information, low word (ready timeout in bits 31:24)
pub const IOC_INFO_LOW: usize = 0x0000;
/// IOC information, high word
pub const IOC_INFO_HIGH: usize = 0x0004;
/// IOC configuration
pub const IOC_CONFIG: usize = 0x0014;
/// IOC status
pub const IOC_STATUS: usize = 0x001C;
/// Admin queue depths: request in bits 15:0, reply in bits 31:16
pub const ADMIN_Q_NUM_ENTRIES: usize = 0x0024;
/// Admin request queue base address (64-bit)
pub const ADMIN_REQ_Q_ADDR: usize = 0x0028;
/// Admin reply queue base address (64-bit)
pub const ADMIN_REPLY_Q_ADDR: usize = 0x0030;
/// Interrupt coalescing control
pub const COALESCE_CONTROL: usize = 0x0040;
/// Admin request queue producer index doorbell
pub const ADMIN_REQ_Q_PI: usize = 0x1000;
/// Admin reply queue consumer index doorbell
pub const ADMIN_REPLY_Q_CI: usize = 0x1004;
/// Host diagnostic write sequence (unlock key register)
pub const WRITE_SEQUENCE: usize = 0x1C04;
/// Host diagnostic
pub const HOST_DIAG: usize = 0x1C08;
/// Fault code
pub const FAULT: usize = 0x1C10;
/// Fault information words
pub const FAULT_INFO: [usize; 3] = [0x1C14, 0x1C18, 0x1C1C];
/// Reply free queue host index doorbell
pub const REPLY_FREE_HOST_INDEX: usize = 0x1C28;
/// Sense buffer free queue host index doorbell
pub const SENSE_BUF_FREE_HOST_INDEX: usize = 0x1C2C;
/// Scratchpad 0: the driver writes the reset reason here
pub const SCRATCHPAD0: usize = 0x1C40;

/// Size of the register window the driver touches
pub const REGISTER_WINDOW: usize = 0x2000;

/// Producer index doorbell of operational request queue `qid` (1-based)
#[inline]
pub const fn oper_req_q_pi(qid: u16) -> usize {
    0x1008 + (qid as usize - 1) * 8
}

/// Consumer index doorbell of operational reply queue `qid` (1-based)
#[inline]
pub const fn oper_reply_q_ci(qid: u16) -> usize {
    0x100C + (qid as usize - 1) * 8
}

// =============================================================================
// Bit definitions
// =============================================================================

/// Ready timeout field of IOC_INFO_LOW, in 2-second units
pub const IOC_INFO_LOW_TIMEOUT_MASK: u32 = 0xFF00_0000;
/// Shift of the ready timeout field
pub const IOC_INFO_LOW_TIMEOUT_SHIFT: u32 = 24;

bitflags! {
    /// IOC_CONFIG register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IocConfig: u32 {
        /// Enable the message unit
        const ENABLE_IOC = 1 << 0;
        /// Preserve diagnostic data across the next fault
        const DIAG_SAVE = 1 << 4;
        /// Request a normal shutdown
        const SHUTDOWN_NORMAL = 0x0000_4000;
        /// Request an abrupt shutdown
        const SHUTDOWN_ABRUPT = 0x0000_8000;
        /// log2 of the operational request entry size
        const OPER_REQ_ENT_SZ = 0x000F_0000;
        /// log2 of the operational reply entry size
        const OPER_RPLY_ENT_SZ = 0x00F0_0000;

        const _ = !0;
    }
}

/// Shift of the operational request entry size field
pub const IOC_CONFIG_OPER_REQ_ENT_SZ_SHIFT: u32 = 16;
/// Shift of the operational reply entry size field
pub const IOC_CONFIG_OPER_RPLY_ENT_SZ_SHIFT: u32 = 20;
/// Shutdown request mask
pub const IOC_CONFIG_SHUTDOWN_MASK: u32 = 0x0000_C000;

impl IocConfig {
    /// Operational request entry size in bytes
    pub fn oper_req_entry_size(self) -> usize {
        1 << ((self.bits() & Self::OPER_REQ_ENT_SZ.bits()) >> IOC_CONFIG_OPER_REQ_ENT_SZ_SHIFT)
    }

    /// Operational reply entry size in bytes
    pub fn oper_reply_entry_size(self) -> usize {
        1 << ((self.bits() & Self::OPER_RPLY_ENT_SZ.bits()) >> IOC_CONFIG_OPER_RPLY_ENT_SZ_SHIFT)
    }

    /// Replace both entry-size fields with log2 values
    pub fn with_entry_sizes(self, req_log2: u32, reply_log2: u32) -> Self {
        let cleared = self.bits() & !(Self::OPER_REQ_ENT_SZ.bits() | Self::OPER_RPLY_ENT_SZ.bits());
        Self::from_bits_retain(
            cleared
                | (req_log2 << IOC_CONFIG_OPER_REQ_ENT_SZ_SHIFT)
                | (reply_log2 << IOC_CONFIG_OPER_RPLY_ENT_SZ_SHIFT),
        )
    }
}

bitflags! {
    /// IOC_STATUS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IocStatus: u32 {
        /// Message unit is ready
        const READY = 1 << 0;
        /// Controller is faulted; see FAULT
        const FAULT = 1 << 1;
        /// Shutdown in progress
        const SHUTDOWN_IN_PROGRESS = 0x0000_0004;
        /// Shutdown complete
        const SHUTDOWN_COMPLETE = 0x0000_0008;
        /// A reset happened since the bit was last cleared (write 1 to clear)
        const RESET_HISTORY = 1 << 4;

        const _ = !0;
    }
}

/// Shutdown status mask of IOC_STATUS
pub const IOC_STATUS_SHUTDOWN_MASK: u32 = 0x0000_000C;

bitflags! {
    /// HOST_DIAG register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostDiag: u32 {
        /// Firmware is saving diagnostic data
        const SAVE_IN_PROGRESS = 1 << 5;
        /// The unlock sequence succeeded; reset actions are accepted
        const DIAG_WRITE_ENABLE = 1 << 7;
        /// Reset action field
        const RESET_ACTION_MASK = 0x0000_0700;

        const _ = !0;
    }
}

/// Reset actions written into HOST_DIAG
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAction {
    /// Soft reset of the message unit
    SoftReset = 0x0000_0100,
    /// Force a diagnostic fault
    DiagFault = 0x0000_0700,
}

impl ResetAction {
    /// Raw register value
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Human-readable name for logs
    pub const fn name(self) -> &'static str {
        match self {
            ResetAction::SoftReset => "soft reset",
            ResetAction::DiagFault => "diag fault",
        }
    }
}

/// Unlock keys written to WRITE_SEQUENCE, in order
pub const WRITE_SEQUENCE_KEYS: [u32; 7] = [0x0, 0xF, 0x4, 0xB, 0x2, 0x7, 0xD];
/// Writing the second key alone relocks the diagnostic register
pub const WRITE_SEQUENCE_RELOCK: u32 = WRITE_SEQUENCE_KEYS[2];

// =============================================================================
// Fault codes
// =============================================================================

/// Mask of the fault code field of FAULT
pub const FAULT_CODE_MASK: u32 = 0x0000_FFFF;

/// Fault codes reported in FAULT
pub mod fault {
    /// Fault caused by a diag-fault reset action
    pub const DIAG_FAULT_RESET: u32 = 0xF000;
    /// Firmware component image activation requires a reset
    pub const CI_ACTIVATION_RESET: u32 = 0xF001;
    /// Soft reset is in progress
    pub const SOFT_RESET_IN_PROGRESS: u32 = 0xF002;
    /// Controller needs a complete reset
    pub const COMPLETE_RESET_NEEDED: u32 = 0xF003;
    /// Controller needs a soft reset
    pub const SOFT_RESET_NEEDED: u32 = 0xF004;
    /// Only a power cycle recovers the controller
    pub const POWER_CYCLE_REQUIRED: u32 = 0xF005;
    /// Temperature threshold exceeded
    pub const TEMP_THRESHOLD_EXCEEDED: u32 = 0xF006;

    /// Check if the fault code can only be cleared from outside the driver
    pub const fn is_terminal(code: u32) -> bool {
        code == POWER_CYCLE_REQUIRED || code == COMPLETE_RESET_NEEDED
    }
}
