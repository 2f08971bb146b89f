//! # Controller State
//!
//! The controller's state is never stored; it is derived from IOC_STATUS and
//! IOC_CONFIG on every query, except `Unrecoverable`, which only the driver
//! asserts.

use crate::regs::{IocConfig, IocStatus};
use core::fmt;

/// Controller state as seen through the system interface registers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Message unit enabled and ready
    Ready = 0,
    /// Enabled, waiting for READY
    BecomingReady = 1,
    /// A reset was requested and has not taken effect
    ResetRequested = 2,
    /// Held in reset: neither enabled nor ready
    Reset = 3,
    /// The controller raised a fault
    Fault = 4,
    /// The driver gave up on the controller
    Unrecoverable = 5,
}

impl ControllerState {
    /// Derive the state from register values
    pub fn from_registers(unrecoverable: bool, status: IocStatus, config: IocConfig) -> Self {
        if unrecoverable {
            return ControllerState::Unrecoverable;
        }
        if status.contains(IocStatus::FAULT) {
            return ControllerState::Fault;
        }
        let ready = status.contains(IocStatus::READY);
        let enabled = config.contains(IocConfig::ENABLE_IOC);
        match (ready, enabled) {
            (true, true) => ControllerState::Ready,
            (false, false) => ControllerState::Reset,
            (false, true) => ControllerState::BecomingReady,
            (true, false) => ControllerState::ResetRequested,
        }
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            ControllerState::Ready => "ready",
            ControllerState::BecomingReady => "becoming ready",
            ControllerState::ResetRequested => "reset requested",
            ControllerState::Reset => "reset",
            ControllerState::Fault => "fault",
            ControllerState::Unrecoverable => "unrecoverable",
        }
    }

    /// Check if the controller is in transition and worth waiting for
    pub fn is_transitional(self) -> bool {
        matches!(self, ControllerState::BecomingReady | ControllerState::ResetRequested)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a reset was issued; written to SCRATCHPAD0 for the firmware
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Controller bring-up
    Bringup = 1,
    /// Watchdog saw a fault
    FaultWatch = 2,
    /// Requested through the management interface
    Ioctl = 3,
    /// Host error handling
    EhHost = 4,
    /// Task management timed out
    TmTimeout = 5,
    /// Pass-through command timed out
    IoctlTimeout = 6,
    /// Message unit reset failed
    MurFailure = 7,
    /// Controller cleanup
    CtlrCleanup = 8,
    /// Firmware component image activation fault
    CiActivationFault = 9,
    /// Port enable timed out
    PortEnableTimeout = 10,
    /// Timestamp update timed out
    TsuTimeout = 11,
    /// Delete request queue timed out
    DeleteRequestQueueTimeout = 12,
    /// Delete reply queue timed out
    DeleteReplyQueueTimeout = 13,
    /// Create reply queue timed out
    CreateReplyQueueTimeout = 14,
    /// Create request queue timed out
    CreateRequestQueueTimeout = 15,
    /// IOC facts timed out
    IocFactsTimeout = 16,
    /// IOC init timed out
    IocInitTimeout = 17,
    /// Event notification timed out
    EventNotifyTimeout = 18,
    /// Event acknowledgement timed out
    EventAckTimeout = 19,
    /// Prepare-for-reset countdown expired
    CiActivationTimer = 20,
    /// Package version query timed out
    GetPackageVersionTimeout = 21,
    /// Event-log abort timed out
    PelAbortTimeout = 22,
    /// Requested through sysfs-style tunables
    Sysfs = 23,
    /// Sysfs-initiated command timed out
    SysfsTimeout = 24,
    /// Diagnostic buffer post timed out
    DiagBufferPostTimeout = 25,
    /// SCSI I/O timed out and escalation reached the controller
    ScsiIoTimeout = 26,
    /// Firmware reset itself
    Firmware = 27,
}

impl ResetReason {
    /// Value written to SCRATCHPAD0
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Human-readable name for logs
    pub const fn name(self) -> &'static str {
        match self {
            ResetReason::Bringup => "timeout in bringup",
            ResetReason::FaultWatch => "fault",
            ResetReason::Ioctl => "application invocation",
            ResetReason::EhHost => "error handling",
            ResetReason::TmTimeout => "TM timeout",
            ResetReason::IoctlTimeout => "IOCTL timeout",
            ResetReason::MurFailure => "MUR failure",
            ResetReason::CtlrCleanup => "timeout in controller cleanup",
            ResetReason::CiActivationFault => "component image activation fault",
            ResetReason::PortEnableTimeout => "port enable timeout",
            ResetReason::TsuTimeout => "time stamp update timeout",
            ResetReason::DeleteRequestQueueTimeout => "delete request queue timeout",
            ResetReason::DeleteReplyQueueTimeout => "delete reply queue timeout",
            ResetReason::CreateReplyQueueTimeout => "create reply queue timeout",
            ResetReason::CreateRequestQueueTimeout => "create request queue timeout",
            ResetReason::IocFactsTimeout => "IOC facts timeout",
            ResetReason::IocInitTimeout => "IOC init timeout",
            ResetReason::EventNotifyTimeout => "event notify timeout",
            ResetReason::EventAckTimeout => "event acknowledgment timeout",
            ResetReason::CiActivationTimer => "component image activation timeout",
            ResetReason::GetPackageVersionTimeout => "get package version timeout",
            ResetReason::PelAbortTimeout => "persistent event log abort timeout",
            ResetReason::Sysfs => "sysfs invocation",
            ResetReason::SysfsTimeout => "sysfs TM timeout",
            ResetReason::DiagBufferPostTimeout => "diagnostic buffer post timeout",
            ResetReason::ScsiIoTimeout => "SCSI IO timeout",
            ResetReason::Firmware => "firmware asynchronous reset",
        }
    }

    /// Check if the reset was caused by a controller fault
    ///
    /// Events are left unmasked for these; the firmware is not listening.
    pub fn is_fault_driven(self) -> bool {
        matches!(
            self,
            ResetReason::FaultWatch | ResetReason::Firmware | ResetReason::CiActivationFault
        )
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
