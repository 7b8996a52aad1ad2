//! # Platform Backends
//!
//! Implementations of [`crate::controller::ProcessController`].
//!
//! - **macOS**: Mach tasks, exception ports and `ptrace(PT_ATTACHEXC)`
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - **simulated**: an in-process target, available everywhere

#[cfg(target_os = "macos")]
pub mod macos;
pub mod simulated;
