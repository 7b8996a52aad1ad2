//! # armtrap-core
//!
//! Trap engine for an ARM64 Darwin debugger.
//!
//! This crate turns the kernel's exception messages into debugger semantics:
//! - Process attach, suspend, resume and detach through a [`ProcessController`]
//! - Hardware breakpoints with a `BRK #0` software fallback
//! - Hardware watchpoints with before/after value reporting
//! - Single-step and transparent step-over of breakpoints and watchpoints
//! - Signal policies (pass, stop, notify) per signal
//! - Exactly one reply per trap, across concurrent threads and detach
//!
//! [`Debugger`] is the entry point. The OS side is pluggable: the Mach
//! backend lives in [`platform::macos`] and [`platform::simulated`] provides
//! an in-process target used by the test suite.
//!
//! ## Why unsafe code is needed
//!
//! The Mach backend calls `task_for_pid`, `mach_msg`, `thread_get_state`
//! and friends directly. Each call is wrapped in a safe function; nothing
//! outside `platform::macos` uses `unsafe`.

#![allow(unsafe_code)] // Required for Mach and ptrace calls

pub mod breakpoints;
pub mod config;
pub mod controller;
pub mod debug_state;
pub mod debugger;
pub mod error;
pub mod events;
pub mod exception;
pub mod platform;
pub mod resume;
pub mod session;
pub mod signals;
pub mod stepping;
pub mod threads;
pub mod types;
pub mod watchpoints;

pub use controller::ProcessController;
pub use debugger::Debugger;
// Re-export commonly used types
pub use error::{ArmtrapError, ArmtrapResult};
#[cfg(target_os = "macos")]
pub use platform::macos::MachController;
pub use types::{Address, ProcessId, ThreadId};
