//! # Error Types
//!
//! Every fallible operation in the crate returns [`GrapnelError`]. Failures
//! that only mean "this process has no such mapping/section/symbol" are plain
//! variants the caller can match on; nothing here aborts the host.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::StopReason;

/// Main error type for instrumentation operations
///
/// ## Error Categories
///
/// 1. **I/O**: Io, FileOpen
/// 2. **Tracing interface**: ProcessNotFound, PermissionDenied, AttachFailed, NotAttached,
///    NotStopped, ProcessExited, Ptrace, MisalignedLength, UnterminatedString, WrongThread,
///    UnmappedAddress, WorkerUnavailable
/// 3. **Malformed binary**: BadMagic, UnsupportedClass, UnsupportedEncoding, Truncated, MalformedElf
/// 4. **Resolution**: SectionNotFound, SymbolNotFound, LibraryNotFound, LibraryDeleted
/// 5. **Architecture**: UnknownMachine, UnsupportedAbi, UnsupportedArchitecture
/// 6. **Encoding**: DisplacementOutOfRange
/// 7. **Protocol misuse**: BreakpointAlreadyEnabled, BreakpointNotEnabled, BreakpointExists, NoBreakpoint
/// 8. **Remote syscalls**: SyscallFailed, UnexpectedStop
#[derive(Error, Debug)]
pub enum GrapnelError
{
    /// I/O error without a more specific context.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A file could not be opened or read.
    #[error("Failed to open {}: {source}", path.display())]
    FileOpen
    {
        /// Path that was tried last.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The process does not exist (or its `/proc` entry is gone).
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// The kernel refused to let us trace the process.
    ///
    /// Usually Yama's `ptrace_scope` or a missing `CAP_SYS_PTRACE`; the message
    /// carries the scope value when it could be read.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Attach failed for a reason other than permissions or a missing process.
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// Operation requires an attached tracee.
    #[error("Not attached to a process")]
    NotAttached,

    /// Operation requires the tracee to be stopped, but it is running.
    #[error("Process must be stopped for this operation")]
    NotStopped,

    /// The tracee exited or was killed during the session.
    #[error("Process {0} has exited")]
    ProcessExited(u32),

    /// A ptrace or wait request failed.
    #[error("ptrace {operation} failed: {}", io::Error::from_raw_os_error(*errno))]
    Ptrace
    {
        /// Request name (`PEEKDATA`, `GETREGS`, ...).
        operation: &'static str,
        /// Raw errno value.
        errno: i32,
    },

    /// Memory transfer length is not a whole number of words.
    #[error("Length {len} is not a multiple of the word size ({word})")]
    MisalignedLength
    {
        /// Requested length.
        len: usize,
        /// Word size in bytes.
        word: usize,
    },

    /// No NUL byte within the allowed bound.
    #[error("No string terminator within {max} bytes of 0x{address:x}")]
    UnterminatedString
    {
        /// Start of the string.
        address: u64,
        /// Bound that was exhausted.
        max: usize,
    },

    /// A tracee-bound handle was used from a thread other than the one that attached.
    #[error("Tracee operations must be issued from the thread that attached")]
    WrongThread,

    /// The address is not inside any mapping of the tracee.
    #[error("Address 0x{0:016x} is not mapped in the tracee")]
    UnmappedAddress(u64),

    /// The dedicated tracer thread is gone.
    #[error("Tracer worker thread is no longer running")]
    WorkerUnavailable,

    /// File does not start with `\x7fELF`.
    #[error("Bad ELF magic: {0:02x?}")]
    BadMagic([u8; 4]),

    /// `EI_CLASS` is neither 32- nor 64-bit.
    #[error("Unsupported ELF class {0}")]
    UnsupportedClass(u8),

    /// `EI_DATA` is neither little- nor big-endian.
    #[error("Unsupported ELF data encoding {0}")]
    UnsupportedEncoding(u8),

    /// A header or table record runs past the end of the file.
    #[error("Truncated {what} at offset 0x{offset:x}")]
    Truncated
    {
        /// Which record was being read.
        what: &'static str,
        /// File offset of the record.
        offset: u64,
    },

    /// Structurally invalid ELF content.
    #[error("Malformed ELF: {0}")]
    MalformedElf(String),

    /// A required section is absent.
    #[error("Section not found: {0}")]
    SectionNotFound(String),

    /// A required symbol is absent.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// No mapping of the C library was found in the process.
    #[error("No C library mapping found in process {0}")]
    LibraryNotFound(u32),

    /// The mapped C library was unlinked from disk.
    #[error("Mapped library has been deleted: {0}")]
    LibraryDeleted(String),

    /// `e_machine` is not one we have a syscall table for.
    #[error("Unknown ELF machine type {0}")]
    UnknownMachine(u16),

    /// Known machine, unsupported ABI variant.
    #[error("Unsupported ABI: {0}")]
    UnsupportedAbi(String),

    /// Operation not implemented for this architecture.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// A rel32 displacement does not fit.
    #[error("Relative displacement from 0x{from:x} to 0x{to:x} does not fit in 32 bits")]
    DisplacementOutOfRange
    {
        /// Instruction address.
        from: u64,
        /// Target address.
        to: u64,
    },

    /// Enabling would overwrite the saved byte with the trap byte.
    #[error("Breakpoint at 0x{0:016x} is already enabled")]
    BreakpointAlreadyEnabled(u64),

    /// Disabling a breakpoint that has no saved byte.
    #[error("Breakpoint at 0x{0:016x} is not enabled")]
    BreakpointNotEnabled(u64),

    /// A breakpoint is already registered at this address.
    #[error("Breakpoint already exists at 0x{0:016x}")]
    BreakpointExists(u64),

    /// No breakpoint registered at this address.
    #[error("No breakpoint at address 0x{0:016x}")]
    NoBreakpoint(u64),

    /// The remote syscall returned an error.
    #[error("Remote {syscall} failed: {}", io::Error::from_raw_os_error(*errno))]
    SyscallFailed
    {
        /// Syscall name.
        syscall: &'static str,
        /// Positive errno returned by the kernel.
        errno: i32,
    },

    /// The tracee stopped for something other than the expected step trap.
    #[error("Unexpected stop during remote call: {0}")]
    UnexpectedStop(StopReason),

    /// Invalid argument passed to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl GrapnelError
{
    /// Whether the tracing session cannot continue after this error.
    ///
    /// Fatal errors leave the tracee detached or gone; everything else can be
    /// handled locally and the session reused.
    pub fn is_session_fatal(&self) -> bool
    {
        matches!(
            self,
            GrapnelError::ProcessExited(_)
                | GrapnelError::ProcessNotFound(_)
                | GrapnelError::PermissionDenied(_)
                | GrapnelError::AttachFailed(_)
                | GrapnelError::WorkerUnavailable
        )
    }
}

/// Convenience type alias for `Result<T, GrapnelError>`
///
/// ```rust
/// use grapnel_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, GrapnelError>;
