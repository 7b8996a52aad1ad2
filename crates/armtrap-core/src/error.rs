//! # Error Types
//!
//! Error handling for the trap engine and process controller.
//!
//! Every fallible operation in the crate returns [`ArmtrapResult`]. Errors
//! caused by target behaviour (a fault while reading memory, a thread that
//! vanished, a malformed trap message) are values, never panics.

use std::fmt;
use std::io;

use thiserror::Error;

#[cfg(target_os = "macos")]
use crate::platform::macos::error::MachError;

/// Kind of object a [`ArmtrapError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind
{
    /// A user-visible or internal breakpoint.
    Breakpoint,
    /// A data watchpoint.
    Watchpoint,
    /// A thread in the registry.
    Thread,
}

impl fmt::Display for ObjectKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            Self::Breakpoint => "breakpoint",
            Self::Watchpoint => "watchpoint",
            Self::Thread => "thread",
        };
        f.write_str(label)
    }
}

/// Main error type for debugger operations
///
/// ## Error Categories
///
/// 1. **Process errors**: ProcessNotFound, AlreadyAttached, NotAttached, TargetDied
/// 2. **State errors**: NotStopped, SuspendFailed, ResumeFailed
/// 3. **Lookup errors**: NotFound, InvalidAddress, InvalidArgument
/// 4. **Resource errors**: ResourceExhausted (debug register limits)
/// 5. **Trap errors**: ProtocolError (malformed exception message)
/// 6. **Platform errors**: MachError (macOS-specific), Io
#[derive(Error, Debug)]
pub enum ArmtrapError
{
    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Insufficient permissions to debug the target process
    ///
    /// On macOS, `task_for_pid()` returned `KERN_PROTECTION_FAILURE` (or
    /// `KERN_FAILURE` for a process that does exist). Run as root or sign
    /// the binary with the debugger entitlement.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A session is already active
    ///
    /// Only one process can be debugged at a time. Detach first.
    #[error("Already attached to process {0}")]
    AlreadyAttached(u32),

    /// Operation requires an attached process
    #[error("Not attached to a process")]
    NotAttached,

    /// Operation requires the target to be stopped at a trap
    #[error("Process must be stopped for this operation")]
    NotStopped,

    /// Target memory at the address could not be read or written
    #[error("Invalid address 0x{address:016x}: {reason}")]
    InvalidAddress
    {
        /// Faulting address
        address: u64,
        /// What the controller reported
        reason: String,
    },

    /// Invalid argument passed to a debugger function
    ///
    /// Examples:
    /// - A watchpoint size outside {1, 2, 4, 8}
    /// - A watched range that crosses an 8-byte boundary
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No breakpoint, watchpoint or thread exists for the given identifier
    #[error("No {kind} with id {id}")]
    NotFound
    {
        /// What was looked up
        kind: ObjectKind,
        /// Identifier as printed to the user
        id: String,
    },

    /// A required resource has been exhausted
    ///
    /// ARM64 cores expose a small, implementation-defined number of
    /// breakpoint (DBGBVR/DBGBCR) and watchpoint (DBGWVR/DBGWCR) register
    /// pairs. Breakpoints fall back to code patching when they run out;
    /// watchpoints have no fallback and surface this error.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A trap message could not be interpreted
    ///
    /// Fatal to that one trap only: it is replied to with failure and logged.
    #[error("Malformed trap message: {0}")]
    ProtocolError(String),

    /// The target died while the session was active
    #[error("Target process {0} died")]
    TargetDied(u32),

    /// Failed to suspend the target (or one of its threads)
    #[error("Failed to suspend process: {0}")]
    SuspendFailed(String),

    /// Failed to resume the target (or one of its threads)
    #[error("Failed to resume process: {0}")]
    ResumeFailed(String),

    /// Mach API error (macOS only)
    #[cfg(target_os = "macos")]
    #[error("Mach API error: {0}")]
    MachError(#[from] MachError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArmtrapError
{
    /// Shorthand for a [`ArmtrapError::NotFound`] with a displayable id.
    pub fn not_found(kind: ObjectKind, id: impl fmt::Display) -> Self
    {
        Self::NotFound { kind, id: id.to_string() }
    }

    /// Shorthand for a [`ArmtrapError::InvalidAddress`].
    pub fn invalid_address(address: u64, reason: impl Into<String>) -> Self
    {
        Self::InvalidAddress {
            address,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type ArmtrapResult<T> = std::result::Result<T, ArmtrapError>;
