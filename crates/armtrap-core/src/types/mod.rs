//! # Types
//!
//! Plain data types shared by every component: addresses, identifiers and
//! the ARM64 general register file.

pub mod address;
pub mod process;
pub mod registers;

pub use address::Address;
pub use process::{ProcessId, ThreadId, ThreadPort};
pub use registers::Arm64Registers;
