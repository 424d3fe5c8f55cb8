//! Linux `ptrace(2)` backend.

use std::cell::Cell;
use std::marker::PhantomData;
use std::path::Path;
use std::thread::{self, ThreadId};

use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, info_span, trace, warn, Span};

use super::{wait, yama};
use crate::debugger::Debugger;
use crate::error::{GrapnelError, Result};
use crate::types::{Address, ProcessId, Registers, StopReason, TraceeState, Word};

/// Tracer for one process, bound to the thread that created it
///
/// The kernel only accepts ptrace requests for a tracee from the thread that
/// attached, so this type is `!Send` and additionally checks the calling
/// thread on every request.
///
/// All log output of a debugger is emitted inside a `tracee` span carrying
/// the pid, so concurrent sessions stay distinguishable without any global
/// state.
///
/// ## Example
///
/// ```rust,no_run
/// use grapnel_core::platform::linux::LinuxDebugger;
/// use grapnel_core::types::{Address, ProcessId};
/// use grapnel_core::Debugger;
///
/// let mut debugger = LinuxDebugger::new();
/// debugger.attach(ProcessId::from(1234))?;
/// let regs = debugger.read_registers()?;
/// let bytes = debugger.read_memory(regs.pc(), 16)?;
/// debugger.detach()?;
/// # Ok::<(), grapnel_core::error::GrapnelError>(())
/// ```
pub struct LinuxDebugger
{
    pid: Option<Pid>,
    state: Cell<TraceeState>,
    trace_exec: bool,
    owner: ThreadId,
    span: Span,
    _not_send: PhantomData<*const ()>,
}

impl Default for LinuxDebugger
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl LinuxDebugger
{
    /// Create a detached debugger owned by the current thread.
    pub fn new() -> Self
    {
        Self {
            pid: None,
            state: Cell::new(TraceeState::Detached),
            trace_exec: true,
            owner: thread::current().id(),
            span: Span::none(),
            _not_send: PhantomData,
        }
    }

    /// Whether attach should request `PTRACE_O_TRACEEXEC` (default on).
    #[must_use]
    pub fn with_trace_exec(mut self, enabled: bool) -> Self
    {
        self.trace_exec = enabled;
        self
    }

    /// The span all of this debugger's events are recorded in.
    pub fn span(&self) -> &Span
    {
        &self.span
    }

    fn check_thread(&self) -> Result<()>
    {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(GrapnelError::WrongThread)
        }
    }

    /// Pid of a stopped tracee on the owning thread.
    fn stopped_pid(&self) -> Result<Pid>
    {
        self.check_thread()?;
        self.ensure_stopped()?;
        self.pid.ok_or(GrapnelError::NotAttached)
    }

    fn ptrace_error(&self, operation: &'static str, errno: Errno) -> GrapnelError
    {
        let Some(pid) = self.pid else {
            return GrapnelError::NotAttached;
        };
        if errno == Errno::ESRCH && !Path::new(&format!("/proc/{pid}")).exists() {
            self.state.set(TraceeState::Exited);
            return GrapnelError::ProcessExited(pid.as_raw().unsigned_abs());
        }
        GrapnelError::Ptrace {
            operation,
            errno: errno as i32,
        }
    }

    /// Forget a tracee whose attach did not complete.
    fn abandon(&mut self)
    {
        self.pid = None;
        self.state.set(TraceeState::Detached);
    }

    fn resumed(&self)
    {
        self.state.set(TraceeState::Running);
    }

    /// Bring a running tracee to the stop our `SIGSTOP` causes.
    ///
    /// Other stops may already be pending when the signal is sent; they are
    /// passed over until the `SIGSTOP` itself is reported, so it is never
    /// left queued for after the detach. Returns `None` if the tracee
    /// terminated instead, otherwise the last other signal seen, which the
    /// detach hands back to the tracee.
    fn interrupt(&mut self, pid: Pid) -> Result<Option<Option<i32>>>
    {
        signal::kill(pid, Signal::SIGSTOP).map_err(|errno| self.ptrace_error("kill(SIGSTOP)", errno))?;

        let mut deferred = None;
        loop {
            match self.wait_for_stop()? {
                reason if reason.is_terminal() => return Ok(None),
                StopReason::Signal(sig) if sig == Signal::SIGSTOP as i32 => return Ok(Some(deferred)),
                StopReason::Signal(sig) => {
                    debug!(signal = sig, "deferring signal until detach");
                    deferred = Some(sig);
                }
                other => debug!(reason = %other, "passing over stop while detaching"),
            }
            // the queued SIGSTOP is reported before the tracee runs any code
            ptrace::cont(pid, None).map_err(|errno| self.ptrace_error("CONT", errno))?;
            self.resumed();
        }
    }

    /// Wait for the first stop after `PTRACE_ATTACH`.
    fn wait_attach_stop(&self, pid: Pid) -> Result<()>
    {
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, signal)) => {
                    if signal != Signal::SIGSTOP {
                        // SIGSTOP is still queued and will be reported on a later wait
                        debug!(signal = %signal, "first stop after attach was not SIGSTOP");
                    }
                    return Ok(());
                }
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    wait::decode(status);
                    self.state.set(TraceeState::Exited);
                    return Err(GrapnelError::ProcessExited(pid.as_raw().unsigned_abs()));
                }
                Ok(other) => trace!(status = ?other, "ignoring status while waiting for attach stop"),
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(GrapnelError::AttachFailed(format!("waitpid after attach: {errno}")));
                }
            }
        }
    }

    fn attach_error(pid: ProcessId, errno: Errno) -> GrapnelError
    {
        match errno {
            Errno::ESRCH => GrapnelError::ProcessNotFound(pid.0),
            Errno::EPERM => {
                let reason = match yama::ptrace_scope() {
                    Some(scope) => format!("cannot trace PID {pid}: {scope}"),
                    None => format!("cannot trace PID {pid}: operation not permitted"),
                };
                GrapnelError::PermissionDenied(reason)
            }
            other => GrapnelError::AttachFailed(format!("PTRACE_ATTACH on PID {pid}: {other}")),
        }
    }
}

impl Debugger for LinuxDebugger
{
    fn pid(&self) -> Option<ProcessId>
    {
        self.pid.map(|pid| ProcessId(pid.as_raw().unsigned_abs()))
    }

    fn state(&self) -> TraceeState
    {
        self.state.get()
    }

    fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.check_thread()?;
        if self.state().is_attached() {
            return Err(GrapnelError::AttachFailed(format!(
                "already tracing PID {}",
                self.pid().map_or(0, |p| p.0)
            )));
        }

        let raw = i32::try_from(pid.0).map_err(|_| GrapnelError::ProcessNotFound(pid.0))?;
        let target = Pid::from_raw(raw);
        self.span = info_span!("tracee", pid = pid.0);
        let _enter = self.span.clone().entered();

        ptrace::attach(target).map_err(|errno| Self::attach_error(pid, errno))?;
        self.pid = Some(target);
        if let Err(err) = self.wait_attach_stop(target) {
            self.abandon();
            return Err(err);
        }

        if self.trace_exec {
            if let Err(errno) = ptrace::setoptions(target, Options::PTRACE_O_TRACEEXEC) {
                if let Err(err) = ptrace::detach(target, None) {
                    warn!(error = %err, "detach after failed PTRACE_SETOPTIONS");
                }
                self.abandon();
                return Err(GrapnelError::AttachFailed(format!("PTRACE_SETOPTIONS: {errno}")));
            }
        }

        self.state.set(TraceeState::Stopped);
        info!("attached");
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        self.check_thread()?;
        let _enter = self.span.clone().entered();
        let Some(pid) = self.pid else {
            return Err(GrapnelError::NotAttached);
        };

        let mut deliver = None;
        match self.state() {
            TraceeState::Detached => return Err(GrapnelError::NotAttached),
            TraceeState::Exited => {
                self.state.set(TraceeState::Detached);
                return Ok(());
            }
            // PTRACE_DETACH needs a stopped tracee
            TraceeState::Running => match self.interrupt(pid)? {
                Some(signal) => deliver = signal,
                None => {
                    self.state.set(TraceeState::Detached);
                    return Ok(());
                }
            },
            TraceeState::Stopped => {}
        }

        match ptrace::detach(pid, to_signal(deliver)?) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(self.ptrace_error("DETACH", errno)),
        }
        self.state.set(TraceeState::Detached);
        info!("detached");
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn read_registers(&self) -> Result<Registers>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        let raw = ptrace::getregs(pid).map_err(|errno| self.ptrace_error("GETREGS", errno))?;
        let regs = from_user_regs(&raw);
        debug!(pc = %regs.pc(), sp = %regs.sp(), "read registers");
        Ok(regs)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read_registers(&self) -> Result<Registers>
    {
        self.stopped_pid()?;
        Err(GrapnelError::UnsupportedArchitecture(std::env::consts::ARCH.to_string()))
    }

    #[cfg(target_arch = "x86_64")]
    fn write_registers(&mut self, regs: &Registers) -> Result<()>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        ptrace::setregs(pid, to_user_regs(regs)).map_err(|errno| self.ptrace_error("SETREGS", errno))?;
        debug!(pc = %regs.pc(), "wrote registers");
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn write_registers(&mut self, _regs: &Registers) -> Result<()>
    {
        self.stopped_pid()?;
        Err(GrapnelError::UnsupportedArchitecture(std::env::consts::ARCH.to_string()))
    }

    fn read_word(&self, addr: Address) -> Result<Word>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        let word = ptrace::read(pid, addr.value() as AddressType).map_err(|errno| self.ptrace_error("PEEKDATA", errno))?;
        trace!(addr = %addr, word, "peek");
        Ok(word)
    }

    fn write_word(&mut self, addr: Address, word: Word) -> Result<()>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        ptrace::write(pid, addr.value() as AddressType, word).map_err(|errno| self.ptrace_error("POKEDATA", errno))?;
        trace!(addr = %addr, word, "poke");
        Ok(())
    }

    fn continue_execution(&mut self, signal: Option<i32>) -> Result<()>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        ptrace::cont(pid, to_signal(signal)?).map_err(|errno| self.ptrace_error("CONT", errno))?;
        self.resumed();
        Ok(())
    }

    fn single_step(&mut self, signal: Option<i32>) -> Result<()>
    {
        let pid = self.stopped_pid()?;
        let _enter = self.span.enter();
        ptrace::step(pid, to_signal(signal)?).map_err(|errno| self.ptrace_error("SINGLESTEP", errno))?;
        self.resumed();
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<StopReason>
    {
        self.check_thread()?;
        let _enter = self.span.clone().entered();
        let pid = self.pid.ok_or(GrapnelError::NotAttached)?;
        match self.state() {
            TraceeState::Running => {}
            TraceeState::Stopped => {
                return Err(GrapnelError::InvalidArgument("tracee is already stopped".to_string()));
            }
            TraceeState::Exited => return Err(GrapnelError::ProcessExited(pid.as_raw().unsigned_abs())),
            TraceeState::Detached => return Err(GrapnelError::NotAttached),
        }

        loop {
            let status = match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    self.state.set(TraceeState::Exited);
                    return Err(GrapnelError::ProcessExited(pid.as_raw().unsigned_abs()));
                }
                Err(errno) => return Err(GrapnelError::Ptrace { operation: "waitpid", errno: errno as i32 }),
            };

            let Some(reason) = wait::decode(status) else {
                continue;
            };
            match reason {
                StopReason::Exited(_) | StopReason::Killed(_) => self.state.set(TraceeState::Exited),
                StopReason::Continued => continue,
                StopReason::Trap | StopReason::Signal(_) | StopReason::Exec => self.state.set(TraceeState::Stopped),
            }
            return Ok(reason);
        }
    }
}

impl Drop for LinuxDebugger
{
    fn drop(&mut self)
    {
        if self.state().is_attached() && self.check_thread().is_ok() {
            if let Err(err) = self.detach() {
                let _enter = self.span.enter();
                warn!(error = %err, "failed to detach on drop");
            }
        }
    }
}

fn to_signal(signal: Option<i32>) -> Result<Option<Signal>>
{
    signal
        .map(Signal::try_from)
        .transpose()
        .map_err(|errno| GrapnelError::InvalidArgument(format!("invalid signal: {errno}")))
}

#[cfg(target_arch = "x86_64")]
fn from_user_regs(raw: &libc::user_regs_struct) -> Registers
{
    Registers {
        r15: raw.r15,
        r14: raw.r14,
        r13: raw.r13,
        r12: raw.r12,
        rbp: raw.rbp,
        rbx: raw.rbx,
        r11: raw.r11,
        r10: raw.r10,
        r9: raw.r9,
        r8: raw.r8,
        rax: raw.rax,
        rcx: raw.rcx,
        rdx: raw.rdx,
        rsi: raw.rsi,
        rdi: raw.rdi,
        orig_rax: raw.orig_rax,
        rip: raw.rip,
        cs: raw.cs,
        eflags: raw.eflags,
        rsp: raw.rsp,
        ss: raw.ss,
        fs_base: raw.fs_base,
        gs_base: raw.gs_base,
        ds: raw.ds,
        es: raw.es,
        fs: raw.fs,
        gs: raw.gs,
    }
}

#[cfg(target_arch = "x86_64")]
fn to_user_regs(regs: &Registers) -> libc::user_regs_struct
{
    libc::user_regs_struct {
        r15: regs.r15,
        r14: regs.r14,
        r13: regs.r13,
        r12: regs.r12,
        rbp: regs.rbp,
        rbx: regs.rbx,
        r11: regs.r11,
        r10: regs.r10,
        r9: regs.r9,
        r8: regs.r8,
        rax: regs.rax,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rsi: regs.rsi,
        rdi: regs.rdi,
        orig_rax: regs.orig_rax,
        rip: regs.rip,
        cs: regs.cs,
        eflags: regs.eflags,
        rsp: regs.rsp,
        ss: regs.ss,
        fs_base: regs.fs_base,
        gs_base: regs.gs_base,
        ds: regs.ds,
        es: regs.es,
        fs: regs.fs,
        gs: regs.gs,
    }
}
