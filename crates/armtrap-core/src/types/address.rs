//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Address in the target's virtual address space
///
/// Breakpoint and watchpoint addresses are always post-ASLR: the command
/// layer adds [`crate::session::Debuggee::aslr_slide`] before handing an
/// address to the core.
///
/// ## Example
///
/// ```rust
/// use armtrap_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// assert_eq!((addr + 4).value(), 0x1004);
/// assert_eq!(addr.align_down(8).value(), 0x1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address
    pub const ZERO: Self = Address(0);

    /// Create an address in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw value for platform calls.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Round down to a power-of-two `alignment`.
    #[must_use]
    pub const fn align_down(self, alignment: u64) -> Self
    {
        Address(self.0 & !(alignment - 1))
    }

    /// Byte offset of this address inside its `alignment`-sized block.
    #[must_use]
    pub const fn offset_in(self, alignment: u64) -> u64
    {
        self.0 & (alignment - 1)
    }

    /// Add an offset, returning `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
