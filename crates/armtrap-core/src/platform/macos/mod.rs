//! # macOS Backend
//!
//! [`ProcessController`](crate::controller::ProcessController) for Darwin on
//! Apple silicon, built on Mach task and thread ports.
//!
//! - **mach2**: `mach_msg`, `task_threads`, `task_suspend`/`task_resume`
//!   and the message header types
//! - **libc**: `ptrace`, `kill`, `sysctlbyname` and the Mach scalar types
//! - **libproc**: process name lookup
//! - **extern "C"** ([`ffi`]): restricted or mistyped calls such as
//!   `task_for_pid` and `thread_get_state`
//!
//! Everything here needs root or the `com.apple.security.cs.debugger`
//! entitlement at runtime.

pub mod constants;
pub mod controller;
pub mod error;
pub mod ffi;
pub mod memory;

pub use controller::MachController;
pub use error::MachError;
