//! # Debugger Trait
//!
//! The synchronous primitive layer every higher component is written against.
//!
//! An implementation supplies the handful of kernel operations (attach,
//! detach, word peek/poke, register get/set, continue, single-step, wait);
//! the trait builds byte-level memory transfer, C string reads, and state
//! checks on top of them. [`LinuxDebugger`](crate::platform::linux::LinuxDebugger)
//! is the ptrace-backed implementation. Breakpoints, remote calls, and the
//! session layer are generic over the trait, so they can be exercised against
//! an in-memory tracee in tests.
//!
//! ## State machine
//!
//! ```text
//! Detached --attach--> Stopped --continue/step--> Running --wait_for_stop--> Stopped | Exited
//!                         \--detach--> Detached
//! ```
//!
//! Memory and register access require `Stopped`. Nothing may be issued while
//! the tracee is `Running` except [`Debugger::wait_for_stop`].

use std::ffi::CString;

use crate::error::{GrapnelError, Result};
use crate::maps::MemoryMap;
use crate::types::{Address, Architecture, ProcessId, Registers, StopReason, TraceeState, Word, WORD_SIZE};

/// Main tracing interface
///
/// ## Thread Safety
///
/// The kernel binds a tracee to the thread that attached to it. Implementations
/// are expected to be `!Send` and to refuse calls from any other thread; use
/// [`TraceeWorker`](crate::session::TraceeWorker) to drive a tracee from
/// elsewhere.
pub trait Debugger
{
    /// Process currently (or last) traced.
    fn pid(&self) -> Option<ProcessId>;

    /// Current lifecycle state.
    fn state(&self) -> TraceeState;

    /// Attach to a running process and wait until it reports stopped.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the PID doesn't exist
    /// - `PermissionDenied`: the kernel refused (Yama scope, missing capability)
    /// - `AttachFailed`: anything else, including already being attached
    fn attach(&mut self, pid: ProcessId) -> Result<()>;

    /// Release the tracee; it resumes on its own.
    ///
    /// Memory or register changes already made are not rolled back.
    fn detach(&mut self) -> Result<()>;

    /// Snapshot the full register set.
    fn read_registers(&self) -> Result<Registers>;

    /// Restore a full register set.
    fn write_registers(&mut self, regs: &Registers) -> Result<()>;

    /// Read one machine word.
    fn read_word(&self, addr: Address) -> Result<Word>;

    /// Write one machine word.
    fn write_word(&mut self, addr: Address, word: Word) -> Result<()>;

    /// Resume the tracee, optionally delivering `signal`.
    fn continue_execution(&mut self, signal: Option<i32>) -> Result<()>;

    /// Execute exactly one instruction, optionally delivering `signal`.
    fn single_step(&mut self, signal: Option<i32>) -> Result<()>;

    /// Block until the tracee changes state after a continue or step.
    ///
    /// The caller decides what a stop means; a signal stop is reported as
    /// [`StopReason::Signal`] and is not retried here.
    fn wait_for_stop(&mut self) -> Result<StopReason>;

    /// Instruction set the tracee executes; the tracer's own unless a
    /// backend knows better.
    fn architecture(&self) -> Option<Architecture>
    {
        Architecture::host()
    }

    /// Fresh snapshot of the tracee's memory map.
    fn memory_map(&self) -> Result<MemoryMap>
    {
        MemoryMap::read(self.pid().ok_or(GrapnelError::NotAttached)?)
    }

    fn is_attached(&self) -> bool
    {
        self.state().is_attached()
    }

    fn is_stopped(&self) -> bool
    {
        self.state() == TraceeState::Stopped
    }

    /// Fail unless the tracee is attached and stopped.
    fn ensure_stopped(&self) -> Result<()>
    {
        match self.state() {
            TraceeState::Stopped => Ok(()),
            TraceeState::Running => Err(GrapnelError::NotStopped),
            TraceeState::Exited => Err(GrapnelError::ProcessExited(self.pid().map_or(0, |p| p.0))),
            TraceeState::Detached => Err(GrapnelError::NotAttached),
        }
    }

    /// Read `len` bytes, one word at a time.
    ///
    /// ## Errors
    ///
    /// `MisalignedLength` if `len` is not a multiple of the word size; the
    /// request is rejected rather than truncated.
    fn read_memory(&self, addr: Address, len: usize) -> Result<Vec<u8>>
    {
        check_word_multiple(len)?;
        let mut out = Vec::with_capacity(len);
        for offset in (0..len).step_by(WORD_SIZE) {
            let word = self.read_word(word_address(addr, offset)?)?;
            out.extend_from_slice(&word.to_ne_bytes());
        }
        Ok(out)
    }

    /// Write `data`, one word at a time.
    ///
    /// ## Errors
    ///
    /// `MisalignedLength` if `data.len()` is not a multiple of the word size.
    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<()>
    {
        check_word_multiple(data.len())?;
        for (i, chunk) in data.chunks_exact(WORD_SIZE).enumerate() {
            self.write_word(word_address(addr, i * WORD_SIZE)?, word_from(chunk))?;
        }
        Ok(())
    }

    /// Write `data` and return the bytes it replaced.
    fn swap_memory(&mut self, addr: Address, data: &[u8]) -> Result<Vec<u8>>
    {
        let old = self.read_memory(addr, data.len())?;
        self.write_memory(addr, data)?;
        Ok(old)
    }

    /// Read a NUL-terminated string of at most `max` bytes (terminator excluded).
    ///
    /// ## Errors
    ///
    /// `UnterminatedString` if no NUL occurs within `max` bytes; partial data
    /// is never returned.
    fn read_cstring(&self, addr: Address, max: usize) -> Result<CString>
    {
        let unterminated = || GrapnelError::UnterminatedString {
            address: addr.value(),
            max,
        };

        // the terminator may sit in the word after the last accepted byte
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            let word = self.read_word(cursor)?;
            for byte in word.to_ne_bytes() {
                if byte == 0 {
                    return CString::new(out).map_err(|e| GrapnelError::InvalidArgument(e.to_string()));
                }
                if out.len() == max {
                    return Err(unterminated());
                }
                out.push(byte);
            }
            cursor = cursor.checked_add(WORD_SIZE as u64).ok_or_else(unterminated)?;
        }
    }
}

/// Reject lengths that are not a whole number of words.
pub fn check_word_multiple(len: usize) -> Result<()>
{
    if len % WORD_SIZE == 0 {
        Ok(())
    } else {
        Err(GrapnelError::MisalignedLength { len, word: WORD_SIZE })
    }
}

fn word_address(base: Address, offset: usize) -> Result<Address>
{
    base.checked_add(offset as u64).ok_or(GrapnelError::UnmappedAddress(base.value()))
}

fn word_from(chunk: &[u8]) -> Word
{
    let mut bytes = [0u8; WORD_SIZE];
    bytes.copy_from_slice(chunk);
    Word::from_ne_bytes(bytes)
}
