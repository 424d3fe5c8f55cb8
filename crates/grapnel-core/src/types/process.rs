//! Process identity and tracee state types.

use std::fmt;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use grapnel_core::types::ProcessId;
///
/// let pid = ProcessId::from(4242);
/// assert_eq!(u32::from(pid), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Where a traced process is in its lifecycle
///
/// ```text
/// Detached --attach--> Stopped --continue/step--> Running --wait--> Stopped
///                         |                                    \--> Exited
///                         \--detach--> Detached
/// ```
///
/// Every transition is synchronous: `Running` only lasts until the owning
/// thread's next wait returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceeState
{
    /// Not traced (never attached, or detached).
    #[default]
    Detached,
    /// Traced and stopped; registers and memory may be accessed.
    Stopped,
    /// Resumed by continue or single-step; a wait is outstanding.
    Running,
    /// The process is gone. Terminal.
    Exited,
}

impl TraceeState
{
    /// Whether the process is still traced by us.
    pub const fn is_attached(self) -> bool
    {
        matches!(self, TraceeState::Stopped | TraceeState::Running)
    }
}

/// Decoded result of waiting on a tracee
///
/// The kernel reports one of a handful of status changes; the variants here
/// keep the signal number or exit code so the caller can decide whether to
/// re-issue a continue or surface the event. Signals are raw numbers so the
/// type stays usable off Linux (e.g. in tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason
{
    /// Stopped by `SIGTRAP` (breakpoint hit or single-step completion).
    Trap,
    /// Stopped by some other signal, which is still pending delivery.
    Signal(i32),
    /// Stopped at `execve` completion; the address space was replaced.
    Exec,
    /// Exited normally with the given status code.
    Exited(i32),
    /// Terminated by a signal.
    Killed(i32),
    /// Resumed by `SIGCONT`.
    Continued,
}

impl StopReason
{
    /// Whether the process no longer exists after this event.
    pub const fn is_terminal(self) -> bool
    {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

impl fmt::Display for StopReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            StopReason::Trap => write!(f, "stopped by trap"),
            StopReason::Signal(sig) => write!(f, "stopped by signal {sig}"),
            StopReason::Exec => write!(f, "stopped at exec"),
            StopReason::Exited(code) => write!(f, "exited, status={code}"),
            StopReason::Killed(sig) => write!(f, "killed by signal {sig}"),
            StopReason::Continued => write!(f, "continued"),
        }
    }
}
