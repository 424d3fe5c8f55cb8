//! # Sessions
//!
//! [`Session`] bundles everything that belongs to one tracee: the debugger,
//! its breakpoint set, the lazily resolved [`LibcInfo`], and the
//! [`SessionConfig`] it was attached with. It keeps the tracee-scoped caches
//! honest: `LibcInfo` and breakpoint bookkeeping are dropped when the tracee
//! execs a new image, exits, or is detached.
//!
//! [`TraceeWorker`] owns a session on a dedicated thread. The kernel ties a
//! tracee to the thread that attached to it, so every request is shipped to
//! that thread and the result is sent back.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::breakpoints::{Breakpoint, BreakpointId, BreakpointManager};
use crate::config::SessionConfig;
use crate::debugger::Debugger;
use crate::elf::{ElfFile, TableKind};
use crate::error::{GrapnelError, Result};
use crate::libc::{LibcInfo, LibcResolver};
use crate::maps::{self, MemoryMap};
use crate::remote::RemoteCall;
use crate::types::{Address, ProcessId, Registers, StopReason};

#[cfg(target_os = "linux")]
use crate::platform::linux::LinuxDebugger;

/// One attached tracee and its caches
pub struct Session<D: Debugger>
{
    pid: ProcessId,
    debugger: D,
    breakpoints: BreakpointManager,
    libc: Option<LibcInfo>,
    resolver: LibcResolver,
    config: SessionConfig,
}

#[cfg(target_os = "linux")]
impl Session<LinuxDebugger>
{
    /// Attach to `pid` with a fresh ptrace debugger on the current thread.
    pub fn attach(pid: ProcessId, config: SessionConfig) -> Result<Self>
    {
        let mut debugger = LinuxDebugger::new().with_trace_exec(config.trace_exec);
        debugger.attach(pid)?;
        Self::with_debugger(debugger, config)
    }
}

impl<D: Debugger> Session<D>
{
    /// Wrap an already attached debugger.
    pub fn with_debugger(debugger: D, config: SessionConfig) -> Result<Self>
    {
        let pid = debugger.pid().ok_or(GrapnelError::NotAttached)?;
        let breakpoints = BreakpointManager::new(pid).with_architecture(debugger.architecture());
        Ok(Self {
            pid,
            debugger,
            breakpoints,
            libc: None,
            resolver: LibcResolver::new(config.clone()),
            config,
        })
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    pub fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    pub fn debugger(&self) -> &D
    {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut D
    {
        &mut self.debugger
    }

    pub fn breakpoints(&self) -> &BreakpointManager
    {
        &self.breakpoints
    }

    /// Fresh memory map of the tracee.
    pub fn memory_map(&self) -> Result<MemoryMap>
    {
        self.debugger.memory_map()
    }

    /// The tracee's C library, resolved on first use.
    pub fn libc(&mut self) -> Result<&mut LibcInfo>
    {
        if self.libc.is_none() {
            let map = self.debugger.memory_map()?;
            let libc = self.resolver.resolve_in(self.pid, &map)?;
            self.breakpoints.set_architecture(Some(libc.arch));
            self.libc = Some(libc);
        }
        self.libc.as_mut().ok_or(GrapnelError::LibraryNotFound(self.pid.0))
    }

    /// The cached C library, if it has been resolved since the last exec.
    pub fn cached_libc(&self) -> Option<&LibcInfo>
    {
        self.libc.as_ref()
    }

    /// Use C library information obtained elsewhere.
    pub fn set_libc(&mut self, libc: LibcInfo)
    {
        self.breakpoints.set_architecture(Some(libc.arch));
        self.libc = Some(libc);
    }

    /// Register and enable a breakpoint at `address`.
    pub fn add_breakpoint(&mut self, address: Address) -> Result<BreakpointId>
    {
        let id = self.breakpoints.insert(address)?;
        if let Err(err) = self.breakpoints.enable(&mut self.debugger, address) {
            let _ = self.breakpoints.remove(&mut self.debugger, address);
            return Err(err);
        }
        Ok(id)
    }

    pub fn enable_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.enable(&mut self.debugger, address)
    }

    pub fn disable_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.breakpoints.disable(&mut self.debugger, address)
    }

    /// Disable (if needed) and forget the breakpoint at `address`.
    pub fn remove_breakpoint(&mut self, address: Address) -> Result<Breakpoint>
    {
        self.breakpoints.remove(&mut self.debugger, address)
    }

    /// Continue and wait for the next stop.
    pub fn resume(&mut self, signal: Option<i32>) -> Result<StopReason>
    {
        self.debugger.continue_execution(signal)?;
        self.wait(Resumed::Continue)
    }

    /// Single-step and wait for the resulting stop.
    pub fn step(&mut self, signal: Option<i32>) -> Result<StopReason>
    {
        self.debugger.single_step(signal)?;
        self.wait(Resumed::Step)
    }

    fn wait(&mut self, how: Resumed) -> Result<StopReason>
    {
        let reason = self.debugger.wait_for_stop()?;
        self.observe(reason, how)?;
        Ok(reason)
    }

    /// Update caches for a stop reported by the debugger.
    ///
    /// Only a trap after a continue can be an `int3`; a step trap one byte
    /// past a breakpoint is not a hit.
    fn observe(&mut self, reason: StopReason, how: Resumed) -> Result<()>
    {
        match reason {
            StopReason::Exec => {
                info!(pid = self.pid.0, "tracee replaced its image; dropping cached state");
                self.libc = None;
                self.breakpoints.clear();
                self.breakpoints.set_architecture(self.debugger.architecture());
            }
            reason if reason.is_terminal() => {
                self.libc = None;
                self.breakpoints.clear();
            }
            StopReason::Trap if how == Resumed::Continue => {
                let pc = self.debugger.read_registers()?.pc();
                if let Some(bp) = self.breakpoints.record_hit(pc) {
                    info!(address = %bp.address(), hits = bp.hit_count(), "breakpoint hit");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-execute the instruction under the breakpoint that was just hit.
    ///
    /// Rewinds the program counter onto the breakpoint, restores the original
    /// byte, single-steps it, and re-arms the trap. The caller continues
    /// afterwards as usual.
    pub fn step_over_breakpoint(&mut self) -> Result<StopReason>
    {
        let mut regs = self.debugger.read_registers()?;
        let address = self
            .breakpoints
            .hit_by(&regs)
            .map(Breakpoint::address)
            .ok_or(GrapnelError::NoBreakpoint(regs.trap_address().value()))?;

        regs.set_pc(address);
        self.debugger.write_registers(&regs)?;
        self.breakpoints.disable(&mut self.debugger, address)?;

        let reason = self.step(None)?;
        if !reason.is_terminal() && reason != StopReason::Exec {
            self.breakpoints.enable(&mut self.debugger, address)?;
        }
        Ok(reason)
    }

    /// Run until the tracee reaches `address`, then step past it.
    ///
    /// A temporary breakpoint is planted and removed again before returning,
    /// unless an exit or exec already discarded it.
    pub fn run_to(&mut self, address: Address) -> Result<RunOutcome>
    {
        self.add_breakpoint(address)?;
        debug!(address = %address, "running to breakpoint");

        let outcome = match self.resume(None)? {
            StopReason::Trap => {
                let regs = self.debugger.read_registers()?;
                if self.breakpoints.hit_by(&regs).is_some_and(|bp| bp.address() == address) {
                    let after = self.step_over_breakpoint()?;
                    RunOutcome::Hit { regs, after }
                } else {
                    RunOutcome::Stopped(StopReason::Trap)
                }
            }
            other => RunOutcome::Stopped(other),
        };

        if self.breakpoints.get(address).is_some() {
            self.remove_breakpoint(address)?;
        }
        Ok(outcome)
    }

    /// Map one executable page in the tracee.
    pub fn allocate_exec_page(&mut self) -> Result<Address>
    {
        self.remote()?.allocate_exec_page()
    }

    pub fn protect(&mut self, addr: Address, len: u64, prot: i32) -> Result<()>
    {
        self.remote()?.protect_page(addr, len, prot)
    }

    pub fn unmap(&mut self, addr: Address, len: u64) -> Result<()>
    {
        self.remote()?.unmap_page(addr, len)
    }

    fn remote(&mut self) -> Result<RemoteCall<'_, D>>
    {
        self.libc()?;
        let libc = self.libc.as_mut().ok_or(GrapnelError::LibraryNotFound(self.pid.0))?;
        Ok(RemoteCall::new(&mut self.debugger, libc))
    }

    /// Read `len` bytes, checking the range against the live map first.
    pub fn peek(&self, addr: Address, len: usize) -> Result<Vec<u8>>
    {
        self.check_mapped(addr, len)?;
        self.debugger.read_memory(addr, len)
    }

    /// Write `data` and return the bytes it replaced.
    pub fn poke(&mut self, addr: Address, data: &[u8]) -> Result<Vec<u8>>
    {
        self.check_mapped(addr, data.len())?;
        self.debugger.swap_memory(addr, data)
    }

    /// Read a C string bounded by the configured maximum.
    pub fn read_cstring(&self, addr: Address) -> Result<String>
    {
        self.check_mapped(addr, 1)?;
        let s = self.debugger.read_cstring(addr, self.config.max_cstring_len)?;
        Ok(s.to_string_lossy().into_owned())
    }

    fn check_mapped(&self, addr: Address, len: usize) -> Result<()>
    {
        if !self.config.check_mappings {
            return Ok(());
        }
        if self.memory_map()?.contains_range(addr, len as u64) {
            Ok(())
        } else {
            Err(GrapnelError::UnmappedAddress(addr.value()))
        }
    }

    /// Runtime address of `main` in the tracee's executable.
    ///
    /// Reads the static symbol table through `/proc/<pid>/exe`, so it works
    /// for tracees in another mount namespace, but fails for stripped
    /// executables.
    pub fn main_address(&self) -> Result<Address>
    {
        let exe_link = format!("/proc/{}/exe", self.pid.0);
        let mut elf = ElfFile::open(&exe_link)?;
        let tables = elf.find_symbol_tables(TableKind::Static)?;
        let offset = elf.lookup_symbol(&tables, "main")?.value;

        if elf.header().kind != object::elf::ET_DYN {
            return Ok(Address::new(offset));
        }

        let exe = maps::exe_path(self.pid)?;
        let map = self.memory_map()?;
        let base = map
            .base_address(&exe.to_string_lossy())
            .or_else(|| map.image_base())
            .ok_or_else(|| GrapnelError::MalformedElf(format!("{} is not mapped", exe.display())))?;
        debug!(base = %base, offset, "resolved main");
        base.checked_add(offset)
            .ok_or_else(|| GrapnelError::MalformedElf(format!("main offset {offset:#x} overflows from {base}")))
    }

    /// Release the tracee.
    ///
    /// Enabled breakpoints are left in place; the tracee will take a
    /// `SIGTRAP` if it reaches one.
    pub fn detach(&mut self) -> Result<()>
    {
        let enabled = self.breakpoints.enabled_count();
        if enabled > 0 {
            warn!(pid = self.pid.0, enabled, "detaching with breakpoints still enabled");
        }
        self.libc = None;
        self.breakpoints.clear();
        if self.debugger.is_attached() {
            self.debugger.detach()?;
        }
        Ok(())
    }
}

/// Where [`Session::run_to`] left the tracee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome
{
    /// The breakpoint was reached with `regs`; stepping past it then ended
    /// in `after`.
    Hit
    {
        regs: Registers,
        after: StopReason,
    },
    /// The tracee stopped for another reason first.
    Stopped(StopReason),
}

/// How the tracee was last set running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resumed
{
    Continue,
    Step,
}

#[cfg(target_os = "linux")]
type Job = Box<dyn FnOnce(&mut Session<LinuxDebugger>) + Send>;

/// A [`Session`] living on its own control thread
///
/// Every call to [`TraceeWorker::run`] executes on the thread that attached,
/// which is the only thread the kernel accepts ptrace requests from. Dropping
/// the worker detaches and joins the thread.
///
/// ## Example
///
/// ```rust,no_run
/// use grapnel_core::config::SessionConfig;
/// use grapnel_core::session::TraceeWorker;
/// use grapnel_core::types::ProcessId;
///
/// let worker = TraceeWorker::spawn(ProcessId(1234), SessionConfig::default())?;
/// let base = worker.run(|session| Ok(session.libc()?.base))?;
/// println!("libc at {base}");
/// # Ok::<(), grapnel_core::error::GrapnelError>(())
/// ```
#[cfg(target_os = "linux")]
pub struct TraceeWorker
{
    pid: ProcessId,
    jobs: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

#[cfg(target_os = "linux")]
impl TraceeWorker
{
    /// Start the control thread and attach from it.
    ///
    /// Returns once the attach has succeeded or failed.
    pub fn spawn(pid: ProcessId, config: SessionConfig) -> Result<Self>
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();

        let thread = thread::Builder::new()
            .name(format!("grapnel-tracee-{pid}"))
            .spawn(move || {
                let mut session = match Session::attach(pid, config) {
                    Ok(session) => {
                        let _ = ready_tx.send(Ok(()));
                        session
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                for job in jobs_rx {
                    job(&mut session);
                }

                if let Err(err) = session.detach() {
                    warn!(pid = pid.0, error = %err, "detach on worker shutdown failed");
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                pid,
                jobs: Some(jobs_tx),
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(GrapnelError::WorkerUnavailable)
            }
        }
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    /// Run `job` on the control thread and wait for its result.
    ///
    /// ## Errors
    ///
    /// Whatever `job` returns, or `WorkerUnavailable` if the control thread
    /// is gone (for instance because an earlier job panicked).
    pub fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Session<LinuxDebugger>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let boxed: Job = Box::new(move |session| {
            let _ = reply_tx.send(job(session));
        });

        self.jobs
            .as_ref()
            .ok_or(GrapnelError::WorkerUnavailable)?
            .send(boxed)
            .map_err(|_| GrapnelError::WorkerUnavailable)?;
        reply_rx.recv().map_err(|_| GrapnelError::WorkerUnavailable)?
    }
}

#[cfg(target_os = "linux")]
impl Drop for TraceeWorker
{
    fn drop(&mut self)
    {
        // closing the channel ends the job loop
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(pid = self.pid.0, "tracee control thread panicked");
            }
        }
    }
}
