//! # Mach Constants
//!
//! Flavors, masks and request numbers the Mach backend passes to the kernel.

use libc::{c_int, mach_msg_type_number_t};

use crate::debug_state::DEBUG_STATE_WORDS;
use crate::types::registers::THREAD_STATE_WORDS;

// ============================================================================
// Thread state
// ============================================================================

/// ARM64 general register file (X0-X28, FP, LR, SP, PC, CPSR)
pub const ARM_THREAD_STATE64: c_int = 6;

/// `natural_t` words in [`ARM_THREAD_STATE64`]
pub const ARM_THREAD_STATE64_COUNT: mach_msg_type_number_t = THREAD_STATE_WORDS as mach_msg_type_number_t;

/// ARM64 debug registers (BVR/BCR/WVR/WCR and MDSCR_EL1)
pub const ARM_DEBUG_STATE64: c_int = 15;

/// `natural_t` words in [`ARM_DEBUG_STATE64`]
pub const ARM_DEBUG_STATE64_COUNT: mach_msg_type_number_t = DEBUG_STATE_WORDS as mach_msg_type_number_t;

/// `thread_info` flavor carrying the kernel thread id
pub const THREAD_IDENTIFIER_INFO: c_int = 4;

/// `thread_info` flavor carrying the pthread name
pub const THREAD_EXTENDED_INFO: c_int = 5;

// ============================================================================
// Exceptions
// ============================================================================

/// Every exception class the debugger routes to itself
///
/// `EXC_MASK_BAD_ACCESS | EXC_MASK_BAD_INSTRUCTION | EXC_MASK_ARITHMETIC |
/// EXC_MASK_SOFTWARE | EXC_MASK_BREAKPOINT`
pub const EXC_MASK_DEBUGGER: u32 = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 5) | (1 << 6);

/// `EXCEPTION_DEFAULT`: the message carries thread and task ports
pub const EXCEPTION_DEFAULT: c_int = 1;

/// `MACH_EXCEPTION_CODES`: codes arrive as 64-bit values
pub const MACH_EXCEPTION_CODES: c_int = 0x8000_0000_u32 as c_int;

/// `THREAD_STATE_NONE`
pub const THREAD_STATE_NONE: c_int = 5;

/// Size of the saved exception port arrays (`EXC_TYPES_COUNT`)
pub const EXC_TYPES_COUNT: usize = 14;

/// `mach_exception_raise` message id; the reply id is this plus 100
pub const MACH_EXCEPTION_RAISE_ID: i32 = 2405;

/// Offset between a request id and its reply id
pub const REPLY_ID_OFFSET: i32 = 100;

/// Receive buffer size; comfortably larger than any exception request
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

// ============================================================================
// Ports
// ============================================================================

/// `MACH_PORT_RIGHT_RECEIVE`
pub const MACH_PORT_RIGHT_RECEIVE: u32 = 1;

/// `MACH_MSG_TYPE_MAKE_SEND`
pub const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;

/// `MACH_PORT_TYPE_DEAD_NAME`
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 1 << 20;

// ============================================================================
// ptrace
// ============================================================================

/// Deliver signals to the debugger as `EXC_SOFTWARE` exceptions
pub const PT_ATTACHEXC: c_int = 14;

/// Set or clear the signal a thread resumes with
pub const PT_THUPDATE: c_int = 13;

/// Stop tracing
pub const PT_DETACH: c_int = 11;

// ============================================================================
// Hardware
// ============================================================================

/// sysctl reporting implemented breakpoint register pairs
pub const SYSCTL_BREAKPOINTS: &str = "hw.optional.breakpoint";

/// sysctl reporting implemented watchpoint register pairs
pub const SYSCTL_WATCHPOINTS: &str = "hw.optional.watchpoint";

/// Register pairs assumed when sysctl does not answer
pub const FALLBACK_BREAKPOINTS: usize = 6;

/// Watchpoint pairs assumed when sysctl does not answer
pub const FALLBACK_WATCHPOINTS: usize = 4;
