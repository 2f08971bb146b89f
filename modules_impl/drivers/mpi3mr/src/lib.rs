//! # MPI3 Storage Controller Driver
//!
//! Control plane for MPI3 message-passing storage controllers: register
//! handshake, admin and operational queue pairs, command tracking, the
//! firmware event stream, device removal handshakes, reset recovery and the
//! fault watchdog.
//!
//! ## Layout
//!
//! - [`regs`] and [`mpi`]: register map and message frame layouts
//! - [`ring`], [`descriptor`], [`queue`], [`pool`]: host memory structures
//!   shared with the controller
//! - [`tracker`]: host tag allocation and completion delivery
//! - [`controller`]: the per-adapter state and command submission
//! - `processor`, [`events`], [`event_log`], [`devices`]: reply dispatch,
//!   firmware events, the persistent event log watch and the target device
//!   table
//! - `bringup`, `reset`, `watchdog`: initialization, recovery and supervision
//!
//! All hardware access goes through the `helix-hal` seams, so the same code
//! runs against silicon or a software model of the controller.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod controller;
pub mod descriptor;
pub mod devices;
pub mod error;
pub mod event_log;
pub mod events;
pub mod mpi;
pub mod pool;
pub mod queue;
pub mod regs;
pub mod retry;
pub mod ring;
pub mod state;
pub mod tracker;

mod bringup;
mod processor;
mod reset;
mod watchdog;

#[cfg(test)]
mod sim;

pub use bringup::InitType;
pub use config::DriverConfig;
pub use controller::{Controller, IocLimits, Platform};
pub use devices::{DeviceInfo, DeviceStatusChange, TargetDevice, ThrottleGroup};
pub use error::{ControllerError, ControllerResult, ErrorCategory};
pub use event_log::EventLogFilter;
pub use events::{EventListener, EventMask, DRIVER_EVENTS};
pub use reset::IoRecovery;
pub use state::{ControllerState, ResetReason};
pub use tracker::{CommandSlot, CompletionResult, CompletionStatus, SlotState, TagRange};
pub use watchdog::WatchdogAction;
