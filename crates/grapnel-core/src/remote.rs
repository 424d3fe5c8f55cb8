//! # Remote Syscalls
//!
//! Runs a single system call inside a stopped tracee without loading any code
//! into it.
//!
//! The call borrows the tracee's own C library entry address
//! ([`LibcInfo::code_addr`]) as the instruction site:
//!
//! 1. snapshot the registers
//! 2. make sure the syscall instruction is at the site (patching it in and
//!    keeping the replaced word in [`LibcInfo::saved_code`] if it isn't)
//! 3. load the syscall number and arguments, point the program counter at
//!    the site, and single-step exactly one instruction
//! 4. read the return register
//! 5. restore the code and the register snapshot, whatever happened in 3-4
//!
//! Afterwards the tracee is back where it was, apart from the side effect the
//! syscall itself had (a new mapping, changed protection).
//!
//! Register conventions are only modelled for x86 tracees; other
//! architectures report `UnsupportedArchitecture`.

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::debugger::Debugger;
use crate::error::{GrapnelError, Result};
use crate::libc::{LibcInfo, SavedCode, SyscallKind};
use crate::types::{Address, Architecture, Registers, StopReason, Word, X86_64Register, WORD_SIZE};

const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Largest errno the kernel returns as `-errno` from a syscall.
const MAX_ERRNO: i64 = 4095;

static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    #[cfg(target_os = "linux")]
    {
        use nix::unistd::{sysconf, SysconfVar};
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| u64::try_from(size).ok())
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        DEFAULT_PAGE_SIZE
    }
});

/// Page size of the host, which is also the tracee's.
pub fn page_size() -> u64
{
    *PAGE_SIZE
}

/// Register convention of a syscall instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallAbi
{
    pub number: X86_64Register,
    pub args: [X86_64Register; 6],
    pub result: X86_64Register,
    /// Encoding of the trapping instruction.
    pub instruction: &'static [u8],
    /// The result is a 32-bit value in the low half of `result`.
    pub narrow_result: bool,
}

/// `syscall`, shared by the LP64 and x32 ABIs.
pub const X86_64_SYSCALL_ABI: SyscallAbi = SyscallAbi {
    number: X86_64Register::Rax,
    args: [
        X86_64Register::Rdi,
        X86_64Register::Rsi,
        X86_64Register::Rdx,
        X86_64Register::R10,
        X86_64Register::R8,
        X86_64Register::R9,
    ],
    result: X86_64Register::Rax,
    instruction: &[0x0f, 0x05],
    narrow_result: false,
};

/// `int 0x80` for 32-bit x86 tracees.
pub const I386_SYSCALL_ABI: SyscallAbi = SyscallAbi {
    number: X86_64Register::Rax,
    args: [
        X86_64Register::Rbx,
        X86_64Register::Rcx,
        X86_64Register::Rdx,
        X86_64Register::Rsi,
        X86_64Register::Rdi,
        X86_64Register::Rbp,
    ],
    result: X86_64Register::Rax,
    instruction: &[0xcd, 0x80],
    narrow_result: true,
};

impl SyscallAbi
{
    pub fn for_arch(arch: Architecture) -> Result<&'static SyscallAbi>
    {
        match arch {
            Architecture::X86_64 | Architecture::X32 => Ok(&X86_64_SYSCALL_ABI),
            Architecture::I386 => Ok(&I386_SYSCALL_ABI),
            other => Err(GrapnelError::UnsupportedArchitecture(format!(
                "remote syscalls are not implemented for {other}"
            ))),
        }
    }

    /// Interpret the raw result register.
    fn decode_result(&self, raw: u64) -> i64
    {
        if self.narrow_result {
            i64::from(raw as u32 as i32)
        } else {
            raw as i64
        }
    }
}

/// One remote syscall session over an attached, stopped tracee
pub struct RemoteCall<'a, D: Debugger + ?Sized>
{
    debugger: &'a mut D,
    libc: &'a mut LibcInfo,
}

impl<'a, D: Debugger + ?Sized> RemoteCall<'a, D>
{
    pub fn new(debugger: &'a mut D, libc: &'a mut LibcInfo) -> Self
    {
        Self { debugger, libc }
    }

    /// Execute `kind` with `args` and return the raw result.
    ///
    /// Unused trailing arguments should be zero.
    ///
    /// ## Errors
    ///
    /// - `SyscallFailed`: the kernel returned `-errno` (or, for `mprotect` and
    ///   `munmap`, anything other than zero)
    /// - `UnexpectedStop`: the step ended in something other than a trap; the
    ///   tracee state is still restored when it is still alive
    /// - debugger errors from the snapshot, patch, step, or restore
    pub fn syscall(&mut self, kind: SyscallKind, args: [u64; 6]) -> Result<u64>
    {
        let abi = SyscallAbi::for_arch(self.libc.arch)?;
        self.debugger.ensure_stopped()?;

        let number = self.libc.syscalls.number(kind);
        let saved_regs = self.debugger.read_registers()?;
        let site = self.libc.code_addr;
        debug!(syscall = kind.name(), number, site = %site, ?args, "remote syscall");

        self.prepare_site(abi, site)?;
        let outcome = self.execute(abi, &saved_regs, site, number, args);
        let restored_code = self.restore_site();
        let restored_regs = if self.debugger.is_stopped() {
            self.debugger.write_registers(&saved_regs)
        } else {
            Ok(())
        };

        let raw = outcome?;
        restored_code?;
        restored_regs?;

        let value = abi.decode_result(raw);
        let failed = (-MAX_ERRNO..0).contains(&value) || (kind != SyscallKind::Mmap && value != 0);
        if failed {
            let errno = i32::try_from(-value).unwrap_or(0);
            warn!(syscall = kind.name(), errno, "remote syscall failed");
            return Err(GrapnelError::SyscallFailed {
                syscall: kind.name(),
                errno,
            });
        }

        debug!(syscall = kind.name(), result = raw, "remote syscall returned");
        Ok(raw)
    }

    /// Ensure the syscall instruction sits at `site`.
    fn prepare_site(&mut self, abi: &SyscallAbi, site: Address) -> Result<()>
    {
        let word = self.debugger.read_word(site)?;
        let mut bytes = word.to_le_bytes();
        if bytes.starts_with(abi.instruction) {
            return Ok(());
        }

        let original = bytes.to_vec();
        bytes[..abi.instruction.len()].copy_from_slice(abi.instruction);
        self.debugger.write_word(site, Word::from_le_bytes(bytes))?;
        self.libc.saved_code = Some(SavedCode {
            address: site,
            bytes: original,
        });
        debug!(site = %site, "patched syscall instruction in");
        Ok(())
    }

    fn execute(&mut self, abi: &SyscallAbi, saved: &Registers, site: Address, number: u64, args: [u64; 6]) -> Result<u64>
    {
        let mut regs = *saved;
        regs.set(abi.number, number);
        for (reg, value) in abi.args.iter().zip(args) {
            regs.set(*reg, value);
        }
        // keep the kernel from restarting a syscall the tracee was stopped in
        regs.orig_rax = u64::MAX;
        regs.set_pc(site);
        self.debugger.write_registers(&regs)?;

        self.debugger.single_step(None)?;
        match self.debugger.wait_for_stop()? {
            StopReason::Trap => {}
            other => return Err(GrapnelError::UnexpectedStop(other)),
        }

        let after = self.debugger.read_registers()?;
        Ok(after.get(abi.result))
    }

    fn restore_site(&mut self) -> Result<()>
    {
        let Some(saved) = self.libc.saved_code.take() else {
            return Ok(());
        };
        if !self.debugger.is_stopped() {
            return Ok(());
        }

        let bytes: [u8; WORD_SIZE] = saved
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| GrapnelError::InvalidArgument(format!("saved code at {} is not one word", saved.address)))?;
        self.debugger.write_word(saved.address, Word::from_le_bytes(bytes))
    }

    /// Map one anonymous private page readable and executable.
    pub fn allocate_exec_page(&mut self) -> Result<Address>
    {
        let len = page_size();
        let prot = (::libc::PROT_READ | ::libc::PROT_EXEC) as u64;
        let flags = (::libc::MAP_PRIVATE | ::libc::MAP_ANONYMOUS) as u64;
        let addr = self.syscall(SyscallKind::Mmap, [0, len, prot, flags, u64::MAX, 0])?;
        let addr = Address::new(addr);
        info!(address = %addr, len, "allocated executable page in tracee");
        Ok(addr)
    }

    /// Change the protection of `[addr, addr + len)`.
    ///
    /// `prot` takes the `PROT_*` bits.
    pub fn protect_page(&mut self, addr: Address, len: u64, prot: i32) -> Result<()>
    {
        if !addr.is_aligned(page_size()) {
            return Err(GrapnelError::InvalidArgument(format!("{addr} is not page aligned")));
        }
        self.syscall(SyscallKind::Mprotect, [addr.value(), len, prot as u64, 0, 0, 0])?;
        info!(address = %addr, len, prot, "changed protection in tracee");
        Ok(())
    }

    /// Unmap `[addr, addr + len)`.
    pub fn unmap_page(&mut self, addr: Address, len: u64) -> Result<()>
    {
        if !addr.is_aligned(page_size()) {
            return Err(GrapnelError::InvalidArgument(format!("{addr} is not page aligned")));
        }
        self.syscall(SyscallKind::Munmap, [addr.value(), len, 0, 0, 0, 0])?;
        info!(address = %addr, len, "unmapped range in tracee");
        Ok(())
    }
}

/// [`RemoteCall::allocate_exec_page`] as a free function.
pub fn allocate_exec_page<D: Debugger + ?Sized>(debugger: &mut D, libc: &mut LibcInfo) -> Result<Address>
{
    RemoteCall::new(debugger, libc).allocate_exec_page()
}

/// [`RemoteCall::protect_page`] as a free function.
pub fn protect_page<D: Debugger + ?Sized>(debugger: &mut D, libc: &mut LibcInfo, addr: Address, len: u64, prot: i32) -> Result<()>
{
    RemoteCall::new(debugger, libc).protect_page(addr, len, prot)
}

/// [`RemoteCall::unmap_page`] as a free function.
pub fn unmap_page<D: Debugger + ?Sized>(debugger: &mut D, libc: &mut LibcInfo, addr: Address, len: u64) -> Result<()>
{
    RemoteCall::new(debugger, libc).unmap_page(addr, len)
}
