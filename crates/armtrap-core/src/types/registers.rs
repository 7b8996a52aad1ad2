//! # ARM64 General Registers
//!
//! Snapshot of `ARM_THREAD_STATE64` as seen by the debugger.
//!
//! ```text
//! words 0..58   X0-X28 (29 registers, two u32 halves each)
//! words 58..60  FP (X29)
//! words 60..62  LR (X30)
//! words 62..64  SP
//! words 64..66  PC
//! word  66      CPSR
//! word  67      padding
//! ```

use std::fmt;

use super::Address;

/// Number of general-purpose registers before FP.
pub const GENERAL_REGISTER_COUNT: usize = 29;

/// Number of `u32` words in `ARM_THREAD_STATE64`.
pub const THREAD_STATE_WORDS: usize = 68;

/// ARM64 general register file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64Registers
{
    /// X0 through X28
    pub x: [u64; GENERAL_REGISTER_COUNT],
    /// Frame pointer (X29)
    pub fp: u64,
    /// Link register (X30)
    pub lr: u64,
    /// Stack pointer
    pub sp: u64,
    /// Program counter
    pub pc: u64,
    /// Current program status register
    pub cpsr: u32,
}

impl Default for Arm64Registers
{
    fn default() -> Self
    {
        Self {
            x: [0; GENERAL_REGISTER_COUNT],
            fp: 0,
            lr: 0,
            sp: 0,
            pc: 0,
            cpsr: 0,
        }
    }
}

impl Arm64Registers
{
    /// Program counter as an [`Address`].
    pub fn pc(&self) -> Address
    {
        Address::from(self.pc)
    }

    /// Decode the raw `natural_t` words returned by `thread_get_state`.
    ///
    /// Returns `None` if fewer than [`THREAD_STATE_WORDS`] words are given.
    pub fn from_words(words: &[u32]) -> Option<Self>
    {
        if words.len() < THREAD_STATE_WORDS {
            return None;
        }

        let read_u64 = |idx: usize| -> u64 { u64::from(words[idx * 2]) | (u64::from(words[idx * 2 + 1]) << 32) };

        let mut regs = Self::default();
        for (i, slot) in regs.x.iter_mut().enumerate() {
            *slot = read_u64(i);
        }
        regs.fp = read_u64(29);
        regs.lr = read_u64(30);
        regs.sp = read_u64(31);
        regs.pc = read_u64(32);
        regs.cpsr = words[66];
        Some(regs)
    }

    /// Register value by conventional name (`x0`..`x28`, `fp`, `lr`, `sp`, `pc`, `cpsr`).
    pub fn by_name(&self, name: &str) -> Option<u64>
    {
        match name {
            "fp" | "x29" => Some(self.fp),
            "lr" | "x30" => Some(self.lr),
            "sp" => Some(self.sp),
            "pc" => Some(self.pc),
            "cpsr" => Some(u64::from(self.cpsr)),
            _ => {
                let index: usize = name.strip_prefix('x')?.parse().ok()?;
                self.x.get(index).copied()
            }
        }
    }
}

impl fmt::Display for Arm64Registers
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for (i, value) in self.x.iter().enumerate() {
            writeln!(f, "{:>6} = 0x{value:016x}", format!("x{i}"))?;
        }
        writeln!(f, "{:>6} = 0x{:016x}", "fp", self.fp)?;
        writeln!(f, "{:>6} = 0x{:016x}", "lr", self.lr)?;
        writeln!(f, "{:>6} = 0x{:016x}", "sp", self.sp)?;
        writeln!(f, "{:>6} = 0x{:016x}", "pc", self.pc)?;
        write!(f, "{:>6} = 0x{:08x}", "cpsr", self.cpsr)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_from_words_reassembles_halves()
    {
        let mut words = [0u32; THREAD_STATE_WORDS];
        words[64] = 0x0000_1000;
        words[65] = 0x0000_0001;
        words[0] = 0xdead_beef;
        words[66] = 0x6000_0000;

        let regs = Arm64Registers::from_words(&words).unwrap();
        assert_eq!(regs.pc, 0x1_0000_1000);
        assert_eq!(regs.x[0], 0xdead_beef);
        assert_eq!(regs.cpsr, 0x6000_0000);
    }

    #[test]
    fn test_from_words_rejects_short_buffer()
    {
        assert!(Arm64Registers::from_words(&[0u32; 10]).is_none());
    }

    #[test]
    fn test_by_name()
    {
        let mut regs = Arm64Registers::default();
        regs.x[3] = 7;
        regs.lr = 0x44;
        assert_eq!(regs.by_name("x3"), Some(7));
        assert_eq!(regs.by_name("x30"), Some(0x44));
        assert_eq!(regs.by_name("x31"), None);
        assert_eq!(regs.by_name("bogus"), None);
    }
}
