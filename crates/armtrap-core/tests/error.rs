//! Tests for error handling

use armtrap_core::error::{ArmtrapError, ArmtrapResult, ObjectKind};
#[cfg(target_os = "macos")]
use armtrap_core::platform::macos::error::MachError;

#[cfg(target_os = "macos")]
#[test]
fn test_mach_error_messages()
{
    assert!(MachError::ProtectionFailure.to_string().contains("permission denied"));
    assert!(MachError::InvalidArgument.to_string().contains("invalid"));
    assert!(MachError::ProcessNotFound.to_string().contains("not found"));
    assert!(MachError::Unknown(999).to_string().contains("999"));
}

#[cfg(target_os = "macos")]
#[test]
fn test_mach_error_to_armtrap_error()
{
    let error: ArmtrapError = MachError::Terminated.into();
    assert!(matches!(error, ArmtrapError::MachError(MachError::Terminated)));
}

#[test]
fn test_error_display()
{
    assert_eq!(ArmtrapError::ProcessNotFound(12345).to_string(), "Process not found: PID 12345");
    assert_eq!(ArmtrapError::AlreadyAttached(7).to_string(), "Already attached to process 7");
    assert!(ArmtrapError::PermissionDenied("task_for_pid".to_string())
        .to_string()
        .contains("task_for_pid"));
    assert_eq!(
        ArmtrapError::invalid_address(0x1000, "unmapped").to_string(),
        "Invalid address 0x0000000000001000: unmapped"
    );
    assert_eq!(
        ArmtrapError::not_found(ObjectKind::Watchpoint, 3).to_string(),
        "No watchpoint with id 3"
    );
}

#[test]
fn test_io_errors_convert()
{
    let error: ArmtrapError = std::io::Error::other("spawn failed").into();
    assert!(matches!(error, ArmtrapError::Io(_)));
    assert!(error.to_string().contains("spawn failed"));
}

#[test]
fn test_result_type()
{
    let ok: ArmtrapResult<u8> = Ok(1);
    let err: ArmtrapResult<u8> = Err(ArmtrapError::TargetDied(4));
    assert_eq!(ok.ok(), Some(1));
    assert!(err.unwrap_err().to_string().contains("died"));
}
