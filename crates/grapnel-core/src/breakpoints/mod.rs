//! Software breakpoint bookkeeping.
//!
//! A breakpoint replaces one byte of tracee text with the x86 `int3` trap
//! (`0xCC`) and remembers the byte it replaced. The manager owns one
//! [`Breakpoint`] per distinct address and drives the patching through any
//! [`Debugger`]; it never interprets trap events itself. After
//! [`Debugger::wait_for_stop`] reports a trap, the caller asks
//! [`BreakpointManager::hit_at`] whether the stop belongs to one of ours.
//!
//! ## State machine
//!
//! ```text
//! Disabled --enable (save byte, write 0xCC)--> Enabled --disable (restore byte)--> Disabled
//! ```
//!
//! Enabling an enabled breakpoint is rejected: the saved byte would become the
//! trap byte and the original instruction would be lost for good. So is
//! enabling one in a tracee that is not known to run x86 code, where `0xCC`
//! is not a trap.

use std::collections::BTreeMap;

use tracing::debug;

use crate::debugger::Debugger;
use crate::error::{GrapnelError, Result};
use crate::types::{Address, Architecture, ProcessId, Registers, Word};

/// The x86 `int3` instruction.
pub const TRAP_BYTE: u8 = 0xCC;

/// Unique identifier for a breakpoint within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u64);

impl BreakpointId
{
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

/// One trap site in the tracee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint
{
    id: BreakpointId,
    pid: ProcessId,
    address: Address,
    arch: Option<Architecture>,
    saved: Option<u8>,
    enabled: bool,
    hit_count: u64,
}

impl Breakpoint
{
    fn new(id: BreakpointId, pid: ProcessId, address: Address, arch: Option<Architecture>) -> Self
    {
        Self {
            id,
            pid,
            address,
            arch,
            saved: None,
            enabled: false,
            hit_count: 0,
        }
    }

    pub fn id(&self) -> BreakpointId
    {
        self.id
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    pub fn address(&self) -> Address
    {
        self.address
    }

    pub fn is_enabled(&self) -> bool
    {
        self.enabled
    }

    /// Original byte at the address, recorded by the last enable.
    pub fn saved_byte(&self) -> Option<u8>
    {
        self.saved
    }

    /// Number of stops attributed to this breakpoint by [`BreakpointManager::record_hit`].
    pub fn hit_count(&self) -> u64
    {
        self.hit_count
    }

    /// Write the trap byte, keeping the byte it replaces.
    ///
    /// ## Errors
    ///
    /// `BreakpointAlreadyEnabled` if called twice without a disable;
    /// `UnsupportedArchitecture` unless the tracee runs x86 code; memory
    /// access errors from the debugger.
    pub fn enable<D: Debugger + ?Sized>(&mut self, debugger: &mut D) -> Result<()>
    {
        if self.enabled {
            return Err(GrapnelError::BreakpointAlreadyEnabled(self.address.value()));
        }
        if !self.arch.is_some_and(Architecture::is_x86) {
            let arch = self.arch.map_or_else(|| "an unknown architecture".to_string(), |arch| arch.to_string());
            return Err(GrapnelError::UnsupportedArchitecture(format!("int3 breakpoints on {arch}")));
        }

        let word = debugger.read_word(self.address)?;
        let mut bytes = word.to_le_bytes();
        let original = bytes[0];
        bytes[0] = TRAP_BYTE;
        debugger.write_word(self.address, Word::from_le_bytes(bytes))?;

        self.saved = Some(original);
        self.enabled = true;
        debug!(address = %self.address, original, "breakpoint enabled");
        Ok(())
    }

    /// Put the saved byte back.
    ///
    /// ## Errors
    ///
    /// `BreakpointNotEnabled` if the trap is not currently installed.
    pub fn disable<D: Debugger + ?Sized>(&mut self, debugger: &mut D) -> Result<()>
    {
        let original = match (self.enabled, self.saved) {
            (true, Some(byte)) => byte,
            _ => return Err(GrapnelError::BreakpointNotEnabled(self.address.value())),
        };

        let word = debugger.read_word(self.address)?;
        let mut bytes = word.to_le_bytes();
        bytes[0] = original;
        debugger.write_word(self.address, Word::from_le_bytes(bytes))?;

        self.enabled = false;
        debug!(address = %self.address, "breakpoint disabled");
        Ok(())
    }
}

/// The breakpoint set of one tracee, keyed by address.
#[derive(Debug)]
pub struct BreakpointManager
{
    pid: ProcessId,
    arch: Option<Architecture>,
    next_id: u64,
    by_address: BTreeMap<Address, Breakpoint>,
}

impl BreakpointManager
{
    /// Manager for a tracee of the tracer's own architecture.
    #[must_use]
    pub fn new(pid: ProcessId) -> Self
    {
        Self {
            pid,
            arch: Architecture::host(),
            next_id: 0,
            by_address: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_architecture(mut self, arch: Option<Architecture>) -> Self
    {
        self.set_architecture(arch);
        self
    }

    /// Record what the tracee runs, e.g. once its C library is classified.
    pub fn set_architecture(&mut self, arch: Option<Architecture>)
    {
        self.arch = arch;
        for bp in self.by_address.values_mut() {
            bp.arch = arch;
        }
    }

    pub fn architecture(&self) -> Option<Architecture>
    {
        self.arch
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    /// Register a disabled breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// `BreakpointExists` if the address already has one.
    pub fn insert(&mut self, address: Address) -> Result<BreakpointId>
    {
        if self.by_address.contains_key(&address) {
            return Err(GrapnelError::BreakpointExists(address.value()));
        }
        self.next_id += 1;
        let id = BreakpointId(self.next_id);
        self.by_address.insert(address, Breakpoint::new(id, self.pid, address, self.arch));
        Ok(id)
    }

    /// Install the trap at `address`.
    pub fn enable<D: Debugger + ?Sized>(&mut self, debugger: &mut D, address: Address) -> Result<()>
    {
        self.get_mut(address)?.enable(debugger)
    }

    /// Restore the original byte at `address`.
    pub fn disable<D: Debugger + ?Sized>(&mut self, debugger: &mut D, address: Address) -> Result<()>
    {
        self.get_mut(address)?.disable(debugger)
    }

    /// Forget the breakpoint at `address`, disabling it first if needed.
    ///
    /// If the disable fails the breakpoint stays registered.
    pub fn remove<D: Debugger + ?Sized>(&mut self, debugger: &mut D, address: Address) -> Result<Breakpoint>
    {
        let bp = self.get_mut(address)?;
        if bp.is_enabled() {
            bp.disable(debugger)?;
        }
        self.by_address
            .remove(&address)
            .ok_or(GrapnelError::NoBreakpoint(address.value()))
    }

    /// Disable every enabled breakpoint, stopping at the first failure.
    pub fn disable_all<D: Debugger + ?Sized>(&mut self, debugger: &mut D) -> Result<()>
    {
        for bp in self.by_address.values_mut().filter(|bp| bp.is_enabled()) {
            bp.disable(debugger)?;
        }
        Ok(())
    }

    pub fn get(&self, address: Address) -> Option<&Breakpoint>
    {
        self.by_address.get(&address)
    }

    fn get_mut(&mut self, address: Address) -> Result<&mut Breakpoint>
    {
        self.by_address
            .get_mut(&address)
            .ok_or(GrapnelError::NoBreakpoint(address.value()))
    }

    /// Breakpoints in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint>
    {
        self.by_address.values()
    }

    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }

    pub fn enabled_count(&self) -> usize
    {
        self.iter().filter(|bp| bp.is_enabled()).count()
    }

    /// The enabled breakpoint whose trap leaves the program counter at `pc`.
    pub fn hit_at(&self, pc: Address) -> Option<&Breakpoint>
    {
        let trap = pc.checked_sub(Registers::TRAP_LEN)?;
        self.by_address.get(&trap).filter(|bp| bp.is_enabled())
    }

    /// [`BreakpointManager::hit_at`] for a register snapshot.
    pub fn hit_by(&self, regs: &Registers) -> Option<&Breakpoint>
    {
        self.hit_at(regs.pc())
    }

    /// Count a stop against the breakpoint at `pc`, if it is one of ours.
    pub fn record_hit(&mut self, pc: Address) -> Option<&Breakpoint>
    {
        let trap = pc.checked_sub(Registers::TRAP_LEN)?;
        let bp = self.by_address.get_mut(&trap).filter(|bp| bp.is_enabled())?;
        bp.hit_count = bp.hit_count.saturating_add(1);
        Some(&*bp)
    }

    /// Drop all bookkeeping without touching tracee memory.
    ///
    /// Used when the image the traps were written into is gone (exit, exec).
    pub fn clear(&mut self)
    {
        self.by_address.clear();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testing::MockTracee;

    const TEXT: u64 = 0x40_1000;

    fn manager() -> BreakpointManager
    {
        BreakpointManager::new(ProcessId(42)).with_architecture(Some(Architecture::X86_64))
    }

    fn tracee() -> MockTracee
    {
        let mut tracee = MockTracee::stopped(42);
        tracee.map(TEXT, &[0x55, 0x48, 0x89, 0xe5, 0x90, 0x90, 0xc3, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
        tracee
    }

    #[test]
    fn test_enable_disable_restores_original_byte()
    {
        let mut tracee = tracee();
        let before = tracee.bytes(TEXT, 16);
        let mut bps = manager();
        let addr = Address::new(TEXT + 4);

        bps.insert(addr).unwrap();
        bps.enable(&mut tracee, addr).unwrap();
        assert_eq!(tracee.bytes(TEXT + 4, 1), vec![TRAP_BYTE]);
        // neighbours untouched
        assert_eq!(tracee.bytes(TEXT + 5, 3), before[5..8].to_vec());
        assert_eq!(bps.get(addr).unwrap().saved_byte(), Some(0x90));

        bps.disable(&mut tracee, addr).unwrap();
        assert_eq!(tracee.bytes(TEXT, 16), before);
        assert!(!bps.get(addr).unwrap().is_enabled());
    }

    #[test]
    fn test_double_enable_is_rejected()
    {
        let mut tracee = tracee();
        let mut bps = manager();
        let addr = Address::new(TEXT);
        bps.insert(addr).unwrap();
        bps.enable(&mut tracee, addr).unwrap();

        let err = bps.enable(&mut tracee, addr).unwrap_err();
        assert!(matches!(err, GrapnelError::BreakpointAlreadyEnabled(a) if a == TEXT));
        assert_eq!(bps.get(addr).unwrap().saved_byte(), Some(0x55));

        bps.disable(&mut tracee, addr).unwrap();
        assert_eq!(tracee.bytes(TEXT, 1), vec![0x55]);
    }

    #[test]
    fn test_disable_without_enable_and_duplicates()
    {
        let mut tracee = tracee();
        let mut bps = manager();
        let addr = Address::new(TEXT + 1);
        bps.insert(addr).unwrap();

        assert!(matches!(
            bps.disable(&mut tracee, addr),
            Err(GrapnelError::BreakpointNotEnabled(_))
        ));
        assert!(matches!(bps.insert(addr), Err(GrapnelError::BreakpointExists(_))));
        assert!(matches!(
            bps.enable(&mut tracee, Address::new(TEXT + 2)),
            Err(GrapnelError::NoBreakpoint(_))
        ));
    }

    #[test]
    fn test_remove_disables_first()
    {
        let mut tracee = tracee();
        let mut bps = manager();
        let addr = Address::new(TEXT + 6);
        bps.insert(addr).unwrap();
        bps.enable(&mut tracee, addr).unwrap();

        let removed = bps.remove(&mut tracee, addr).unwrap();
        assert!(!removed.is_enabled());
        assert_eq!(tracee.bytes(TEXT + 6, 1), vec![0xc3]);
        assert!(bps.is_empty());
    }

    #[test]
    fn test_trap_is_attributed_after_continue()
    {
        let mut tracee = tracee();
        let mut bps = manager();
        let addr = Address::new(TEXT + 4);
        bps.insert(addr).unwrap();
        bps.enable(&mut tracee, addr).unwrap();

        tracee.regs.rip = TEXT + 4;
        tracee.continue_execution(None).unwrap();
        assert_eq!(tracee.wait_for_stop().unwrap(), crate::types::StopReason::Trap);

        let regs = tracee.read_registers().unwrap();
        assert_eq!(bps.hit_by(&regs).map(Breakpoint::address), Some(addr));
        assert_eq!(bps.record_hit(regs.pc()).unwrap().hit_count(), 1);

        // rewind onto the original instruction and run to completion
        bps.disable(&mut tracee, addr).unwrap();
        let mut regs = regs;
        regs.set_pc(regs.trap_address());
        tracee.write_registers(&regs).unwrap();
        tracee.continue_execution(None).unwrap();
        assert_eq!(tracee.wait_for_stop().unwrap(), crate::types::StopReason::Exited(0));
        assert!(bps.hit_at(Address::new(TEXT + 5)).is_none());
    }

    #[test]
    fn test_disable_all()
    {
        let mut tracee = tracee();
        let before = tracee.bytes(TEXT, 16);
        let mut bps = manager();
        for offset in [0, 4, 6] {
            let addr = Address::new(TEXT + offset);
            bps.insert(addr).unwrap();
            bps.enable(&mut tracee, addr).unwrap();
        }
        assert_eq!(bps.enabled_count(), 3);
        bps.disable_all(&mut tracee).unwrap();
        assert_eq!(bps.enabled_count(), 0);
        assert_eq!(tracee.bytes(TEXT, 16), before);
    }

    #[test]
    fn test_non_x86_tracee_is_refused()
    {
        let mut tracee = tracee();
        let before = tracee.bytes(TEXT, 16);
        let mut bps = BreakpointManager::new(ProcessId(42)).with_architecture(Some(Architecture::Arm64));
        let addr = Address::new(TEXT);
        bps.insert(addr).unwrap();

        let err = bps.enable(&mut tracee, addr).unwrap_err();
        assert!(matches!(err, GrapnelError::UnsupportedArchitecture(ref msg) if msg.contains("aarch64")));
        assert!(!bps.get(addr).unwrap().is_enabled());
        assert_eq!(tracee.bytes(TEXT, 16), before);

        // learning the real architecture later re-arms existing entries
        bps.set_architecture(Some(Architecture::I386));
        bps.enable(&mut tracee, addr).unwrap();
        assert_eq!(tracee.bytes(TEXT, 1), vec![TRAP_BYTE]);

        let mut unknown = BreakpointManager::new(ProcessId(42)).with_architecture(None);
        unknown.insert(addr).unwrap();
        assert!(matches!(
            unknown.enable(&mut tracee, addr),
            Err(GrapnelError::UnsupportedArchitecture(_))
        ));
    }
}
