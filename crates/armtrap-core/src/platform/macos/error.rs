//! # Mach Errors
//!
//! Conversion of `kern_return_t` codes into a typed error.

use thiserror::Error;

use crate::error::ArmtrapError;

const KERN_TERMINATED: libc::kern_return_t = 37;

/// A non-success `kern_return_t`.
///
/// Only the codes the debugger reacts to get their own variant; everything
/// else keeps its raw value in [`MachError::Unknown`].
///
/// ## References
///
/// - [kern_return_t documentation](https://developer.apple.com/documentation/kernel/kern_return_t)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachError
{
    /// `KERN_INVALID_ADDRESS` (1)
    ///
    /// The address is not mapped in the target task.
    #[error("KERN_INVALID_ADDRESS: address not mapped")]
    InvalidAddress,

    /// `KERN_INVALID_ARGUMENT` (4)
    ///
    /// Usually a stale thread port or a state flavor the kernel rejects.
    #[error("KERN_INVALID_ARGUMENT: invalid port or argument")]
    InvalidArgument,

    /// `KERN_PROTECTION_FAILURE` (5)
    ///
    /// Blocked by the security policy. `task_for_pid()` needs root or the
    /// `com.apple.security.cs.debugger` entitlement.
    #[error("KERN_PROTECTION_FAILURE: permission denied")]
    ProtectionFailure,

    /// `KERN_FAILURE` (14)
    ///
    /// `task_for_pid()` also returns this for a missing process, and for a
    /// permission problem on some releases.
    #[error("KERN_FAILURE: process not found")]
    ProcessNotFound,

    /// `KERN_TERMINATED` (37)
    ///
    /// The task or thread went away.
    #[error("target task terminated")]
    Terminated,

    /// Any other code, preserved for lookup
    #[error("unknown Mach error: {0}")]
    Unknown(i32),
}

impl From<libc::kern_return_t> for MachError
{
    fn from(code: libc::kern_return_t) -> Self
    {
        match code {
            libc::KERN_INVALID_ADDRESS => MachError::InvalidAddress,
            libc::KERN_INVALID_ARGUMENT => MachError::InvalidArgument,
            libc::KERN_PROTECTION_FAILURE => MachError::ProtectionFailure,
            libc::KERN_FAILURE => MachError::ProcessNotFound,
            KERN_TERMINATED => MachError::Terminated,
            _ => MachError::Unknown(code),
        }
    }
}

/// `Ok(())` for `KERN_SUCCESS`, the converted error otherwise.
pub fn kern_check(code: libc::kern_return_t) -> Result<(), MachError>
{
    if code == libc::KERN_SUCCESS {
        Ok(())
    } else {
        Err(MachError::from(code))
    }
}

/// Like [`kern_check`] but maps an unmapped address to
/// [`ArmtrapError::InvalidAddress`].
pub fn kern_check_address(code: libc::kern_return_t, address: u64, what: &str) -> Result<(), ArmtrapError>
{
    match kern_check(code) {
        Ok(()) => Ok(()),
        Err(MachError::InvalidAddress | MachError::ProtectionFailure) => {
            Err(ArmtrapError::invalid_address(address, format!("{what} failed with {code}")))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_known_codes_map_to_variants()
    {
        assert_eq!(MachError::from(libc::KERN_PROTECTION_FAILURE), MachError::ProtectionFailure);
        assert_eq!(MachError::from(libc::KERN_FAILURE), MachError::ProcessNotFound);
        assert_eq!(MachError::from(12345), MachError::Unknown(12345));
        assert!(kern_check(libc::KERN_SUCCESS).is_ok());
    }

    #[test]
    fn test_unmapped_address_is_invalid_address()
    {
        let err = kern_check_address(libc::KERN_INVALID_ADDRESS, 0x10, "vm_read").unwrap_err();
        assert!(matches!(err, ArmtrapError::InvalidAddress { address: 0x10, .. }));
    }
}
