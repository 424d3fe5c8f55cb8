//! Register file snapshot and word-size constants.

use super::Address;

/// A machine word as transferred by a single ptrace peek/poke.
pub type Word = libc::c_long;

/// Size in bytes of [`Word`].
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// x86-64 register identifier
///
/// Covers every slot of the kernel's `user_regs_struct`, which is also what
/// a 32-bit tracee's registers are reported through on a 64-bit host
/// (`ebx` lives in `Rbx`, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86_64Register
{
    R15,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    /// Syscall number at syscall entry; -1 suppresses syscall restart.
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

/// Full general-purpose register snapshot of a stopped tracee
///
/// Field order matches the kernel's `user_regs_struct` so conversion to and
/// from the ptrace representation is a straight field copy. The struct is
/// `Copy`: take a snapshot, mutate a clone, and write the snapshot back to
/// undo.
///
/// ## Example
///
/// ```rust
/// use grapnel_core::types::{Address, Registers, X86_64Register};
///
/// let mut regs = Registers::default();
/// regs.set_pc(Address::new(0x401000));
/// regs.set(X86_64Register::Rax, 9);
/// assert_eq!(regs.get(X86_64Register::Rip), 0x401000);
/// assert_eq!(regs.rax, 9);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers
{
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Registers
{
    /// Length of the x86 trap instruction (`int3`).
    pub const TRAP_LEN: u64 = 1;

    /// Program counter.
    pub fn pc(&self) -> Address
    {
        Address::new(self.rip)
    }

    pub fn set_pc(&mut self, pc: Address)
    {
        self.rip = pc.value();
    }

    /// Stack pointer.
    pub fn sp(&self) -> Address
    {
        Address::new(self.rsp)
    }

    /// Address of the trap that was just executed.
    ///
    /// After an `int3` the reported program counter already points past the
    /// trap byte, so the breakpoint address is one below it. A program
    /// counter of zero yields zero.
    pub fn trap_address(&self) -> Address
    {
        self.pc().checked_sub(Self::TRAP_LEN).unwrap_or(Address::ZERO)
    }

    /// Read a register by name.
    pub fn get(&self, reg: X86_64Register) -> u64
    {
        *self.slot(reg)
    }

    /// Overwrite a register by name.
    pub fn set(&mut self, reg: X86_64Register, value: u64)
    {
        *self.slot_mut(reg) = value;
    }

    fn slot(&self, reg: X86_64Register) -> &u64
    {
        match reg {
            X86_64Register::R15 => &self.r15,
            X86_64Register::R14 => &self.r14,
            X86_64Register::R13 => &self.r13,
            X86_64Register::R12 => &self.r12,
            X86_64Register::Rbp => &self.rbp,
            X86_64Register::Rbx => &self.rbx,
            X86_64Register::R11 => &self.r11,
            X86_64Register::R10 => &self.r10,
            X86_64Register::R9 => &self.r9,
            X86_64Register::R8 => &self.r8,
            X86_64Register::Rax => &self.rax,
            X86_64Register::Rcx => &self.rcx,
            X86_64Register::Rdx => &self.rdx,
            X86_64Register::Rsi => &self.rsi,
            X86_64Register::Rdi => &self.rdi,
            X86_64Register::OrigRax => &self.orig_rax,
            X86_64Register::Rip => &self.rip,
            X86_64Register::Cs => &self.cs,
            X86_64Register::Eflags => &self.eflags,
            X86_64Register::Rsp => &self.rsp,
            X86_64Register::Ss => &self.ss,
            X86_64Register::FsBase => &self.fs_base,
            X86_64Register::GsBase => &self.gs_base,
            X86_64Register::Ds => &self.ds,
            X86_64Register::Es => &self.es,
            X86_64Register::Fs => &self.fs,
            X86_64Register::Gs => &self.gs,
        }
    }

    fn slot_mut(&mut self, reg: X86_64Register) -> &mut u64
    {
        match reg {
            X86_64Register::R15 => &mut self.r15,
            X86_64Register::R14 => &mut self.r14,
            X86_64Register::R13 => &mut self.r13,
            X86_64Register::R12 => &mut self.r12,
            X86_64Register::Rbp => &mut self.rbp,
            X86_64Register::Rbx => &mut self.rbx,
            X86_64Register::R11 => &mut self.r11,
            X86_64Register::R10 => &mut self.r10,
            X86_64Register::R9 => &mut self.r9,
            X86_64Register::R8 => &mut self.r8,
            X86_64Register::Rax => &mut self.rax,
            X86_64Register::Rcx => &mut self.rcx,
            X86_64Register::Rdx => &mut self.rdx,
            X86_64Register::Rsi => &mut self.rsi,
            X86_64Register::Rdi => &mut self.rdi,
            X86_64Register::OrigRax => &mut self.orig_rax,
            X86_64Register::Rip => &mut self.rip,
            X86_64Register::Cs => &mut self.cs,
            X86_64Register::Eflags => &mut self.eflags,
            X86_64Register::Rsp => &mut self.rsp,
            X86_64Register::Ss => &mut self.ss,
            X86_64Register::FsBase => &mut self.fs_base,
            X86_64Register::GsBase => &mut self.gs_base,
            X86_64Register::Ds => &mut self.ds,
            X86_64Register::Es => &mut self.es,
            X86_64Register::Fs => &mut self.fs,
            X86_64Register::Gs => &mut self.gs,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_trap_address_is_one_below_pc()
    {
        let mut regs = Registers::default();
        regs.set_pc(Address::new(0x401001));
        assert_eq!(regs.trap_address(), Address::new(0x401000));

        regs.set_pc(Address::ZERO);
        assert_eq!(regs.trap_address(), Address::ZERO);
    }

    #[test]
    fn test_named_access_matches_fields()
    {
        let mut regs = Registers::default();
        regs.set(X86_64Register::R10, 0x22);
        regs.set(X86_64Register::OrigRax, u64::MAX);
        assert_eq!(regs.r10, 0x22);
        assert_eq!(regs.get(X86_64Register::OrigRax), u64::MAX);
        assert_eq!(regs.get(X86_64Register::Rax), 0);
    }
}
