//! Tests for error handling

use grapnel_core::error::{GrapnelError, Result};
use grapnel_core::types::StopReason;

#[test]
fn test_process_not_found_display()
{
    let error = GrapnelError::ProcessNotFound(12345);
    let message = format!("{}", error);
    assert!(message.contains("12345"));
    assert!(message.contains("not found"));
}

#[test]
fn test_permission_denied_display()
{
    let error = GrapnelError::PermissionDenied("ptrace_scope is 1".to_string());
    let message = format!("{}", error);
    assert!(message.contains("Permission denied"));
    assert!(message.contains("ptrace_scope is 1"));
}

#[test]
fn test_ptrace_error_names_request_and_errno()
{
    let error = GrapnelError::Ptrace {
        operation: "PEEKDATA",
        errno: libc::EIO,
    };
    let message = format!("{}", error);
    assert!(message.contains("PEEKDATA"));
    assert!(message.to_lowercase().contains("input/output"));
}

#[test]
fn test_syscall_failed_carries_errno_text()
{
    let error = GrapnelError::SyscallFailed {
        syscall: "mmap",
        errno: libc::ENOMEM,
    };
    let message = format!("{}", error);
    assert!(message.contains("mmap"));
    assert!(message.to_lowercase().contains("memory"));
}

#[test]
fn test_addresses_are_hex()
{
    assert!(format!("{}", GrapnelError::NoBreakpoint(0x401000)).contains("0x0000000000401000"));
    assert!(format!("{}", GrapnelError::UnmappedAddress(0xdead)).contains("0x000000000000dead"));

    let error = GrapnelError::DisplacementOutOfRange {
        from: 0x1000,
        to: 0x1_0000_1000,
    };
    let message = format!("{}", error);
    assert!(message.contains("0x1000"));
    assert!(message.contains("0x100001000"));
}

#[test]
fn test_unexpected_stop_shows_reason()
{
    let error = GrapnelError::UnexpectedStop(StopReason::Signal(libc::SIGSEGV));
    let message = format!("{}", error);
    assert!(message.contains("Unexpected stop"));
}

#[test]
fn test_io_error_converts()
{
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let error: GrapnelError = io.into();
    assert!(matches!(error, GrapnelError::Io(_)));
    assert!(format!("{}", error).contains("gone"));
}

#[test]
fn test_session_fatal_classification()
{
    assert!(GrapnelError::ProcessExited(7).is_session_fatal());
    assert!(GrapnelError::ProcessNotFound(7).is_session_fatal());
    assert!(GrapnelError::WorkerUnavailable.is_session_fatal());

    assert!(!GrapnelError::SymbolNotFound("dlopen".to_string()).is_session_fatal());
    assert!(!GrapnelError::BreakpointExists(0x1000).is_session_fatal());
    assert!(!GrapnelError::SyscallFailed {
        syscall: "munmap",
        errno: libc::EINVAL
    }
    .is_session_fatal());
}

#[test]
fn test_result_type()
{
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(GrapnelError::NotStopped);
}
