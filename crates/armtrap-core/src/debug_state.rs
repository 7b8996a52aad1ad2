//! # ARM64 Debug Registers
//!
//! In-memory model of `ARM_DEBUG_STATE64` (flavor 15) and the bit layouts
//! used to program it.
//!
//! ## Register pairs
//!
//! - **DBGBVR/DBGBCR**: instruction address + control, one pair per hardware breakpoint
//! - **DBGWVR/DBGWCR**: data address + control, one pair per hardware watchpoint
//! - **MDSCR_EL1**: monitor debug control; bit 0 (`SS`) arms single-step
//!
//! The kernel accepts 16 of each pair in the state structure, but only the
//! first N are implemented by the core. N is reported by
//! `hw.optional.breakpoint` / `hw.optional.watchpoint`.
//!
//! ## References
//!
//! - [ARM DBGBCR_EL1](https://developer.arm.com/documentation/ddi0595/2021-12/AArch64-Registers/DBGBCR-n--EL1--Debug-Breakpoint-Control-Registers)
//! - [ARM DBGWCR_EL1](https://developer.arm.com/documentation/ddi0595/2021-12/AArch64-Registers/DBGWCR-n--EL1--Debug-Watchpoint-Control-Registers)

use std::fmt;

use crate::error::{ArmtrapError, ArmtrapResult};
use crate::types::Address;

/// Register pairs present in the kernel's state structure.
pub const MAX_DEBUG_REGISTERS: usize = 16;

/// Number of `u32` words in `ARM_DEBUG_STATE64`.
pub const DEBUG_STATE_WORDS: usize = 130;

/// Enable bit shared by DBGBCR and DBGWCR.
const CTRL_ENABLE: u64 = 1;
/// Privilege: match at EL0 only.
const CTRL_EL0: u64 = 0b10 << 1;
/// Byte-address-select: all four bytes of an instruction.
const BCR_BAS_ALL: u64 = 0b1111 << 5;
/// MDSCR_EL1.SS
const MDSCR_SS: u64 = 1;

/// Control value for an execution breakpoint on an A64 instruction.
pub const BREAKPOINT_CONTROL: u64 = CTRL_ENABLE | CTRL_EL0 | BCR_BAS_ALL;

/// Which data accesses a watchpoint traps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchAccess
{
    /// Loads
    Read,
    /// Stores
    Write,
    /// Loads and stores
    ReadWrite,
}

impl WatchAccess
{
    /// DBGWCR.LSC field value.
    const fn lsc(self) -> u64
    {
        match self {
            Self::Read => 0b01,
            Self::Write => 0b10,
            Self::ReadWrite => 0b11,
        }
    }
}

impl std::str::FromStr for WatchAccess
{
    type Err = ArmtrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "r" | "read" => Ok(Self::Read),
            "w" | "write" => Ok(Self::Write),
            "rw" | "wr" | "readwrite" => Ok(Self::ReadWrite),
            _ => Err(ArmtrapError::InvalidArgument(format!(
                "Unknown watch type: {s}. Use 'r', 'w' or 'rw'"
            ))),
        }
    }
}

impl fmt::Display for WatchAccess
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read/write",
        };
        f.write_str(label)
    }
}

/// Value register for an execution breakpoint (word aligned).
pub const fn breakpoint_value(address: Address) -> u64
{
    address.value() & !0x3
}

/// Encode DBGWVR and DBGWCR for a `size`-byte watchpoint at `address`.
///
/// ## Errors
///
/// `InvalidArgument` if `size` is not 1, 2, 4 or 8, or if the watched range
/// crosses the 8-byte block that DBGWVR addresses.
pub fn watchpoint_registers(address: Address, size: u8, access: WatchAccess) -> ArmtrapResult<(u64, u64)>
{
    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(ArmtrapError::InvalidArgument(format!(
            "watchpoint size must be 1, 2, 4 or 8 bytes, got {size}"
        )));
    }

    let offset = address.offset_in(8);
    if offset + u64::from(size) > 8 {
        return Err(ArmtrapError::InvalidArgument(format!(
            "{size}-byte watchpoint at {address} crosses an 8-byte boundary"
        )));
    }

    let bas = ((1u64 << size) - 1) << offset;
    let control = CTRL_ENABLE | CTRL_EL0 | (access.lsc() << 3) | (bas << 5);
    Ok((address.align_down(8).value(), control))
}

/// `ARM_DEBUG_STATE64`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugState
{
    /// Breakpoint value registers
    pub bvr: [u64; MAX_DEBUG_REGISTERS],
    /// Breakpoint control registers
    pub bcr: [u64; MAX_DEBUG_REGISTERS],
    /// Watchpoint value registers
    pub wvr: [u64; MAX_DEBUG_REGISTERS],
    /// Watchpoint control registers
    pub wcr: [u64; MAX_DEBUG_REGISTERS],
    /// Monitor debug system control
    pub mdscr_el1: u64,
}

impl DebugState
{
    /// Program breakpoint pair `index` for `address`.
    pub fn set_breakpoint(&mut self, index: usize, address: Address)
    {
        self.bvr[index] = breakpoint_value(address);
        self.bcr[index] = BREAKPOINT_CONTROL;
    }

    /// Clear breakpoint pair `index`.
    pub fn clear_breakpoint(&mut self, index: usize)
    {
        self.bvr[index] = 0;
        self.bcr[index] = 0;
    }

    /// Program watchpoint pair `index` with precomputed value/control.
    pub fn set_watchpoint(&mut self, index: usize, value: u64, control: u64)
    {
        self.wvr[index] = value;
        self.wcr[index] = control;
    }

    /// Clear watchpoint pair `index`.
    pub fn clear_watchpoint(&mut self, index: usize)
    {
        self.wvr[index] = 0;
        self.wcr[index] = 0;
    }

    /// Whether MDSCR_EL1.SS is set.
    pub const fn single_step(&self) -> bool
    {
        self.mdscr_el1 & MDSCR_SS != 0
    }

    /// Set or clear MDSCR_EL1.SS.
    pub fn set_single_step(&mut self, enabled: bool)
    {
        if enabled {
            self.mdscr_el1 |= MDSCR_SS;
        } else {
            self.mdscr_el1 &= !MDSCR_SS;
        }
    }

    /// Serialize to the kernel's word layout.
    pub fn to_words(&self) -> [u32; DEBUG_STATE_WORDS]
    {
        let mut words = [0u32; DEBUG_STATE_WORDS];
        let values = self
            .bvr
            .iter()
            .chain(&self.bcr)
            .chain(&self.wvr)
            .chain(&self.wcr)
            .chain(std::iter::once(&self.mdscr_el1));
        for (i, value) in values.enumerate() {
            words[i * 2] = (*value & 0xffff_ffff) as u32;
            words[i * 2 + 1] = (*value >> 32) as u32;
        }
        words
    }

    /// Deserialize from the kernel's word layout.
    pub fn from_words(words: &[u32; DEBUG_STATE_WORDS]) -> Self
    {
        let read_u64 = |idx: usize| -> u64 { u64::from(words[idx * 2]) | (u64::from(words[idx * 2 + 1]) << 32) };
        let mut state = Self::default();
        for i in 0..MAX_DEBUG_REGISTERS {
            state.bvr[i] = read_u64(i);
            state.bcr[i] = read_u64(MAX_DEBUG_REGISTERS + i);
            state.wvr[i] = read_u64(2 * MAX_DEBUG_REGISTERS + i);
            state.wcr[i] = read_u64(3 * MAX_DEBUG_REGISTERS + i);
        }
        state.mdscr_el1 = read_u64(4 * MAX_DEBUG_REGISTERS);
        state
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_breakpoint_control_matches_el0_word_match()
    {
        assert_eq!(BREAKPOINT_CONTROL, 0x1e5);
        assert_eq!(breakpoint_value(Address::new(0x1003)), 0x1000);
    }

    #[test]
    fn test_watchpoint_encoding()
    {
        let (value, control) = watchpoint_registers(Address::new(0x2004), 4, WatchAccess::Write).unwrap();
        assert_eq!(value, 0x2000);
        // BAS = 0b1111_0000, LSC = 0b10
        assert_eq!(control, 1 | (0b10 << 1) | (0b10 << 3) | (0xf0 << 5));
    }

    #[test]
    fn test_watchpoint_rejects_bad_ranges()
    {
        assert!(watchpoint_registers(Address::new(0x2006), 4, WatchAccess::Read).is_err());
        assert!(watchpoint_registers(Address::new(0x2000), 3, WatchAccess::Read).is_err());
        assert!(watchpoint_registers(Address::new(0x2000), 8, WatchAccess::ReadWrite).is_ok());
    }

    #[test]
    fn test_single_step_bit_is_idempotent()
    {
        let mut state = DebugState::default();
        state.set_single_step(true);
        state.set_single_step(true);
        assert_eq!(state.mdscr_el1, 1);
        state.set_single_step(false);
        state.set_single_step(false);
        assert!(!state.single_step());
    }

    #[test]
    fn test_word_layout_round_trip()
    {
        let mut state = DebugState::default();
        state.set_breakpoint(2, Address::new(0x1_0000_4000));
        state.set_watchpoint(1, 0x8000, 0x1f5);
        state.set_single_step(true);
        let words = state.to_words();
        assert_eq!(words[4], 0x4000);
        assert_eq!(words[5], 0x1);
        assert_eq!(words[128], 1);
        assert_eq!(DebugState::from_words(&words), state);
    }
}
