//! # Controller Errors

use core::fmt;
use helix_hal::HalError;

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors surfaced by the controller core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    /// Request ring has no free slot; retry later
    QueueFull,
    /// No free tag in the requested range; retry later
    Busy,
    /// A command or hardware handshake did not complete in time
    Timeout,
    /// The controller is permanently failed
    Unrecoverable,
    /// A reset is running; the operation was not started
    ResetInProgress,
    /// The controller has not finished bring-up
    NotReady,
    /// The tag is out of range or in the wrong state
    InvalidTag(u16),
    /// The controller rejected the command
    CommandFailed {
        /// Masked IOC status
        ioc_status: u16,
        /// IOC log info, zero when not reported
        loginfo: u32,
    },
    /// The command was terminated by a controller reset
    CommandReset,
    /// IOC facts are inconsistent with what the driver can run
    InvalidFacts,
    /// Driver configuration is inconsistent
    InvalidConfig,
    /// Request frame is shorter than its header or longer than a ring entry
    InvalidFrame(usize),
    /// Queue count changed across a reset
    QueueCountMismatch,
    /// Error from the hardware abstraction layer
    Hal(HalError),
}

/// Error classes handed to the administrative surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient: retry later
    Busy,
    /// The command timed out
    Timeout,
    /// The controller will not come back without intervention
    Unrecoverable,
    /// Wait for the running reset to finish
    ResetInProgress,
    /// The command itself failed
    Failed,
}

impl ControllerError {
    /// Classify the error for administrative callers
    pub fn category(&self) -> ErrorCategory {
        match self {
            ControllerError::QueueFull | ControllerError::Busy | ControllerError::NotReady => {
                ErrorCategory::Busy
            }
            ControllerError::Timeout => ErrorCategory::Timeout,
            ControllerError::Unrecoverable => ErrorCategory::Unrecoverable,
            ControllerError::ResetInProgress | ControllerError::CommandReset => {
                ErrorCategory::ResetInProgress
            }
            _ => ErrorCategory::Failed,
        }
    }

    /// Check if a retry may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::QueueFull | ControllerError::Busy | ControllerError::ResetInProgress
        )
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::QueueFull => write!(f, "request queue full"),
            ControllerError::Busy => write!(f, "no free command tag"),
            ControllerError::Timeout => write!(f, "timed out"),
            ControllerError::Unrecoverable => write!(f, "controller unrecoverable"),
            ControllerError::ResetInProgress => write!(f, "reset in progress"),
            ControllerError::NotReady => write!(f, "controller not ready"),
            ControllerError::InvalidTag(tag) => write!(f, "invalid host tag {:#06x}", tag),
            ControllerError::CommandFailed { ioc_status, loginfo } => write!(
                f,
                "command failed: ioc_status {:#06x} loginfo {:#010x}",
                ioc_status, loginfo
            ),
            ControllerError::CommandReset => write!(f, "command terminated by reset"),
            ControllerError::InvalidFacts => write!(f, "invalid IOC facts"),
            ControllerError::InvalidConfig => write!(f, "invalid driver configuration"),
            ControllerError::InvalidFrame(len) => write!(f, "request frame of {} bytes does not fit", len),
            ControllerError::QueueCountMismatch => write!(f, "queue count changed across reset"),
            ControllerError::Hal(e) => write!(f, "hal: {}", e),
        }
    }
}

impl From<HalError> for ControllerError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::Timeout => ControllerError::Timeout,
            other => ControllerError::Hal(other),
        }
    }
}
