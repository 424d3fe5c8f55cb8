//! Instruction-set architecture of a tracee image.

use std::fmt;

/// Target instruction set, as classified from an ELF header
///
/// The variants distinguish ABIs that share a machine type but use different
/// syscall numbering or instruction encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// x86-64, LP64 ABI.
    X86_64,
    /// x86-64 machine running the ILP32 (x32) ABI.
    X32,
    /// 32-bit x86.
    I386,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit ARM, EABI, ARM instruction set.
    ArmEabi,
    /// 32-bit ARM, EABI, entry point in Thumb mode.
    ArmThumb,
}

impl Architecture
{
    /// Architecture this crate was compiled for, if it is one we model.
    pub const fn host() -> Option<Self>
    {
        #[cfg(target_arch = "x86_64")]
        {
            Some(Architecture::X86_64)
        }
        #[cfg(target_arch = "x86")]
        {
            Some(Architecture::I386)
        }
        #[cfg(target_arch = "aarch64")]
        {
            Some(Architecture::Arm64)
        }
        #[cfg(target_arch = "arm")]
        {
            Some(Architecture::ArmEabi)
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64", target_arch = "arm")))]
        {
            None
        }
    }

    /// Whether `0xCC` is the breakpoint encoding.
    pub const fn is_x86(self) -> bool
    {
        matches!(self, Architecture::X86_64 | Architecture::X32 | Architecture::I386)
    }

    /// Short lowercase name.
    pub const fn as_str(self) -> &'static str
    {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::X32 => "x32",
            Architecture::I386 => "i386",
            Architecture::Arm64 => "aarch64",
            Architecture::ArmEabi => "arm",
            Architecture::ArmThumb => "thumb",
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}
