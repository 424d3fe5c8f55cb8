//! In-memory tracee for unit tests.
//!
//! Emulates just enough of an x86-64 process for the breakpoint and
//! remote-call state machines: sparse byte memory, a register file, `int3`,
//! and the `syscall`/`int 0x80` instructions (handled by a callback).

use std::collections::BTreeMap;

use crate::debugger::Debugger;
use crate::error::{GrapnelError, Result};
use crate::types::{Address, Architecture, ProcessId, Registers, StopReason, TraceeState, Word, WORD_SIZE};

const EIO: i32 = 5;

pub(crate) struct MockTracee
{
    pid: ProcessId,
    state: TraceeState,
    pending: Option<StopReason>,
    pub regs: Registers,
    pub memory: BTreeMap<u64, u8>,
    pub on_syscall: fn(&mut Registers),
    pub stop_override: Option<StopReason>,
    pub steps: usize,
    pub register_writes: usize,
    /// Target of the next single-stepped instruction, as if it branched.
    pub branch_to: Option<u64>,
    /// Stop reported for the next single-step only.
    pub step_override: Option<StopReason>,
}

impl MockTracee
{
    /// Attached, stopped tracee with no memory.
    pub fn stopped(pid: u32) -> Self
    {
        Self {
            pid: ProcessId(pid),
            state: TraceeState::Stopped,
            pending: None,
            regs: Registers::default(),
            memory: BTreeMap::new(),
            on_syscall: |regs| regs.rax = 0,
            stop_override: None,
            steps: 0,
            register_writes: 0,
            branch_to: None,
            step_override: None,
        }
    }

    /// Map `bytes` at `addr`.
    pub fn map(&mut self, addr: u64, bytes: &[u8])
    {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *byte);
        }
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8>
    {
        (0..len as u64).map(|i| self.memory[&(addr + i)]).collect()
    }

    fn byte_at(&self, addr: u64) -> Option<u8>
    {
        self.memory.get(&addr).copied()
    }

    fn resume(&mut self, reason: StopReason)
    {
        self.pending = Some(self.stop_override.take().unwrap_or(reason));
        self.state = TraceeState::Running;
    }
}

impl Debugger for MockTracee
{
    fn pid(&self) -> Option<ProcessId>
    {
        Some(self.pid)
    }

    fn state(&self) -> TraceeState
    {
        self.state
    }

    fn architecture(&self) -> Option<Architecture>
    {
        Some(Architecture::X86_64)
    }

    fn attach(&mut self, pid: ProcessId) -> Result<()>
    {
        self.pid = pid;
        self.state = TraceeState::Stopped;
        Ok(())
    }

    fn detach(&mut self) -> Result<()>
    {
        self.ensure_stopped()?;
        self.state = TraceeState::Detached;
        Ok(())
    }

    fn read_registers(&self) -> Result<Registers>
    {
        self.ensure_stopped()?;
        Ok(self.regs)
    }

    fn write_registers(&mut self, regs: &Registers) -> Result<()>
    {
        self.ensure_stopped()?;
        self.regs = *regs;
        self.register_writes += 1;
        Ok(())
    }

    fn read_word(&self, addr: Address) -> Result<Word>
    {
        self.ensure_stopped()?;
        let mut bytes = [0u8; WORD_SIZE];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = self.byte_at(addr.value() + i as u64).ok_or(GrapnelError::Ptrace {
                operation: "PEEKDATA",
                errno: EIO,
            })?;
        }
        Ok(Word::from_ne_bytes(bytes))
    }

    fn write_word(&mut self, addr: Address, word: Word) -> Result<()>
    {
        self.ensure_stopped()?;
        for i in 0..WORD_SIZE as u64 {
            if self.byte_at(addr.value() + i).is_none() {
                return Err(GrapnelError::Ptrace {
                    operation: "POKEDATA",
                    errno: EIO,
                });
            }
        }
        self.map(addr.value(), &word.to_ne_bytes());
        Ok(())
    }

    fn continue_execution(&mut self, _signal: Option<i32>) -> Result<()>
    {
        self.ensure_stopped()?;
        if self.byte_at(self.regs.rip) == Some(0xCC) {
            self.regs.rip += 1;
            self.resume(StopReason::Trap);
        } else {
            self.resume(StopReason::Exited(0));
        }
        Ok(())
    }

    fn single_step(&mut self, _signal: Option<i32>) -> Result<()>
    {
        self.ensure_stopped()?;
        self.steps += 1;
        let pc = self.regs.rip;
        if let Some(target) = self.branch_to.take() {
            self.regs.rip = target;
            self.resume(StopReason::Trap);
            return Ok(());
        }
        match (self.byte_at(pc), self.byte_at(pc + 1)) {
            (Some(0x0f), Some(0x05)) | (Some(0xcd), Some(0x80)) => {
                (self.on_syscall)(&mut self.regs);
                self.regs.rip = pc + 2;
            }
            _ => self.regs.rip = pc + 1,
        }
        let reason = self.step_override.take().unwrap_or(StopReason::Trap);
        self.resume(reason);
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<StopReason>
    {
        if self.state != TraceeState::Running {
            return Err(GrapnelError::InvalidArgument("tracee is not running".to_string()));
        }
        let reason = self.pending.take().unwrap_or(StopReason::Trap);
        self.state = if reason.is_terminal() { TraceeState::Exited } else { TraceeState::Stopped };
        Ok(reason)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_memory_round_trip_and_alignment()
    {
        let mut tracee = MockTracee::stopped(1);
        tracee.map(0x1000, &[0u8; 32]);
        let data: Vec<u8> = (1..=16).collect();
        tracee.write_memory(Address::new(0x1000), &data).unwrap();
        assert_eq!(tracee.read_memory(Address::new(0x1000), 16).unwrap(), data);

        let err = tracee.read_memory(Address::new(0x1000), 12).unwrap_err();
        assert!(matches!(err, GrapnelError::MisalignedLength { len: 12, .. }));
    }

    #[test]
    fn test_swap_memory_returns_old_bytes()
    {
        let mut tracee = MockTracee::stopped(1);
        tracee.map(0x2000, &[0xAA; 8]);
        let old = tracee.swap_memory(Address::new(0x2000), &[0x55; 8]).unwrap();
        assert_eq!(old, vec![0xAA; 8]);
        assert_eq!(tracee.bytes(0x2000, 8), vec![0x55; 8]);
    }

    #[test]
    fn test_read_cstring_bounds()
    {
        let mut tracee = MockTracee::stopped(1);
        tracee.map(0x3000, b"grapnel\0padding!");
        let s = tracee.read_cstring(Address::new(0x3000), 64).unwrap();
        assert_eq!(s.to_str().unwrap(), "grapnel");

        // exactly max bytes before the terminator is still complete
        assert_eq!(tracee.read_cstring(Address::new(0x3000), 7).unwrap().as_bytes(), b"grapnel");

        let err = tracee.read_cstring(Address::new(0x3000), 4).unwrap_err();
        assert!(matches!(err, GrapnelError::UnterminatedString { max: 4, .. }));
    }

    #[test]
    fn test_read_cstring_terminator_in_next_word()
    {
        let mut tracee = MockTracee::stopped(1);
        tracee.map(0x3000, b"grapneli\0.......");
        let s = tracee.read_cstring(Address::new(0x3000), 8).unwrap();
        assert_eq!(s.as_bytes(), b"grapneli");
        assert_eq!(tracee.read_cstring(Address::new(0x3000), 9).unwrap().as_bytes(), b"grapneli");

        let err = tracee.read_cstring(Address::new(0x3000), 7).unwrap_err();
        assert!(matches!(err, GrapnelError::UnterminatedString { max: 7, .. }));

        // nothing mapped past the first word and no terminator in it
        tracee.map(0x4000, b"unending");
        assert!(tracee.read_cstring(Address::new(0x4000), 8).is_err());
    }

    #[test]
    fn test_running_tracee_refuses_access()
    {
        let mut tracee = MockTracee::stopped(1);
        tracee.map(0x1000, &[0x90; 8]);
        tracee.regs.rip = 0x1000;
        tracee.continue_execution(None).unwrap();
        assert!(matches!(tracee.read_word(Address::new(0x1000)), Err(GrapnelError::NotStopped)));
        assert_eq!(tracee.wait_for_stop().unwrap(), StopReason::Exited(0));
        assert!(matches!(tracee.read_word(Address::new(0x1000)), Err(GrapnelError::ProcessExited(1))));
    }
}
