//! Wait-status decoding.

use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use tracing::info;

use crate::types::StopReason;

/// Translate a `waitpid` result into a [`StopReason`].
///
/// Returns `None` for `StillAlive`, which only appears with `WNOHANG`.
/// Every decoded status is logged at `info`.
pub fn decode(status: WaitStatus) -> Option<StopReason>
{
    let reason = match status {
        WaitStatus::Exited(pid, code) => {
            info!(pid = pid.as_raw(), status = code, "process exited");
            StopReason::Exited(code)
        }
        WaitStatus::Signaled(pid, signal, core_dumped) => {
            info!(pid = pid.as_raw(), signal = %signal, core_dumped, "process killed by signal");
            StopReason::Killed(signal as i32)
        }
        WaitStatus::Stopped(pid, Signal::SIGTRAP) | WaitStatus::PtraceSyscall(pid) => {
            info!(pid = pid.as_raw(), "process stopped by trap");
            StopReason::Trap
        }
        WaitStatus::Stopped(pid, signal) => {
            info!(pid = pid.as_raw(), signal = %signal, "process stopped by signal");
            StopReason::Signal(signal as i32)
        }
        WaitStatus::PtraceEvent(pid, _, event) if event == Event::PTRACE_EVENT_EXEC as i32 => {
            info!(pid = pid.as_raw(), "process replaced its image (exec)");
            StopReason::Exec
        }
        WaitStatus::PtraceEvent(pid, signal, event) => {
            info!(pid = pid.as_raw(), signal = %signal, event, "process stopped at ptrace event");
            StopReason::Signal(signal as i32)
        }
        WaitStatus::Continued(pid) => {
            info!(pid = pid.as_raw(), "process continued");
            StopReason::Continued
        }
        WaitStatus::StillAlive => return None,
    };
    Some(reason)
}

#[cfg(test)]
mod tests
{
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn test_decode_exit_and_kill()
    {
        let pid = Pid::from_raw(100);
        assert_eq!(decode(WaitStatus::Exited(pid, 3)), Some(StopReason::Exited(3)));
        assert_eq!(
            decode(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(StopReason::Killed(libc::SIGKILL))
        );
    }

    #[test]
    fn test_decode_stops()
    {
        let pid = Pid::from_raw(100);
        assert_eq!(decode(WaitStatus::Stopped(pid, Signal::SIGTRAP)), Some(StopReason::Trap));
        assert_eq!(
            decode(WaitStatus::Stopped(pid, Signal::SIGSEGV)),
            Some(StopReason::Signal(libc::SIGSEGV))
        );
        assert_eq!(
            decode(WaitStatus::PtraceEvent(pid, Signal::SIGTRAP, Event::PTRACE_EVENT_EXEC as i32)),
            Some(StopReason::Exec)
        );
        assert_eq!(decode(WaitStatus::Continued(pid)), Some(StopReason::Continued));
        assert_eq!(decode(WaitStatus::StillAlive), None);
    }
}
