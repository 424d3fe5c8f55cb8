//! # C Library Resolution
//!
//! Finds the C library mapped into a tracee, opens the same file locally, and
//! turns its dynamic symbols into absolute in-tracee addresses.
//!
//! The result, [`LibcInfo`], also carries the architecture of the image and
//! the matching syscall numbers, which is everything
//! [`RemoteCall`](crate::remote::RemoteCall) needs to run a syscall inside
//! the tracee.
//!
//! ## Container fallback
//!
//! The path in `/proc/<pid>/maps` is the path inside the tracee's mount
//! namespace. When it cannot be opened directly, the resolver retries the
//! part after the configured container-root marker (`/rootfs/` by default)
//! and finally the path below `/proc/<pid>/root`.

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use object::elf;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::elf::{ElfClass, ElfFile, ElfHeader, TableKind};
use crate::error::{GrapnelError, Result};
use crate::maps::MemoryMap;
use crate::types::{Address, Architecture, MemoryRegion, ProcessId};

/// Offset added to x86-64 syscall numbers by the x32 ABI.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// Syscalls the remote-call layer knows how to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallKind
{
    Mmap,
    Mprotect,
    Munmap,
}

impl SyscallKind
{
    pub const fn name(self) -> &'static str
    {
        match self {
            SyscallKind::Mmap => "mmap",
            SyscallKind::Mprotect => "mprotect",
            SyscallKind::Munmap => "munmap",
        }
    }
}

/// Syscall numbers for one architecture/ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallTable
{
    pub mmap: u64,
    pub mprotect: u64,
    pub munmap: u64,
}

impl SyscallTable
{
    /// Number for `kind`.
    pub const fn number(&self, kind: SyscallKind) -> u64
    {
        match kind {
            SyscallKind::Mmap => self.mmap,
            SyscallKind::Mprotect => self.mprotect,
            SyscallKind::Munmap => self.munmap,
        }
    }

    /// Classify an image and pick its syscall numbers.
    ///
    /// The lookup is keyed by machine type, word size and ABI variant. There
    /// is no default row: an unlisted machine is `UnknownMachine`, a listed
    /// machine with an unlisted class or ABI is `UnsupportedAbi`.
    ///
    /// For 32-bit ARM the returned architecture is
    /// [`Architecture::ArmThumb`] when the entry address has its low bit set.
    ///
    /// ## Example
    ///
    /// ```rust
    /// # use grapnel_core::elf::{ElfClass, ElfHeader};
    /// use grapnel_core::libc::SyscallTable;
    /// use grapnel_core::types::Architecture;
    /// # let header = ElfHeader {
    /// #     class: ElfClass::Elf64, endian: object::Endianness::Little, kind: 3,
    /// #     machine: object::elf::EM_AARCH64, flags: 0, entry: 0x1000,
    /// #     section_offset: 0, section_entry_size: 64, section_count: 0, string_table_index: 0,
    /// # };
    ///
    /// let (arch, table) = SyscallTable::for_header(&header)?;
    /// assert_eq!(arch, Architecture::Arm64);
    /// assert_eq!((table.mmap, table.mprotect, table.munmap), (222, 226, 215));
    /// # Ok::<(), grapnel_core::error::GrapnelError>(())
    /// ```
    pub fn for_header(header: &ElfHeader) -> Result<(Architecture, SyscallTable)>
    {
        let variant = AbiVariant::of(header)?;

        let row = ABI_TABLE
            .iter()
            .find(|row| row.machine == header.machine && row.class == header.class && row.variant == variant);

        let Some(row) = row else {
            if ABI_TABLE.iter().any(|row| row.machine == header.machine) {
                return Err(GrapnelError::UnsupportedAbi(format!(
                    "machine {} with {:?} {:?}",
                    header.machine, header.class, variant
                )));
            }
            return Err(GrapnelError::UnknownMachine(header.machine));
        };

        let arch = if row.arch == Architecture::ArmEabi && header.entry & 1 == 1 {
            Architecture::ArmThumb
        } else {
            row.arch
        };
        Ok((arch, row.syscalls))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbiVariant
{
    Native,
    ArmEabi,
}

impl AbiVariant
{
    fn of(header: &ElfHeader) -> Result<Self>
    {
        if header.machine != elf::EM_ARM {
            return Ok(AbiVariant::Native);
        }
        // EF_ARM_EABI_VERSION(flags); zero means the legacy OABI
        if header.flags & elf::EF_ARM_EABIMASK == 0 {
            return Err(GrapnelError::UnsupportedAbi("ARM OABI".to_string()));
        }
        Ok(AbiVariant::ArmEabi)
    }
}

struct AbiRow
{
    machine: u16,
    class: ElfClass,
    variant: AbiVariant,
    arch: Architecture,
    syscalls: SyscallTable,
}

const ABI_TABLE: &[AbiRow] = &[
    AbiRow {
        machine: elf::EM_X86_64,
        class: ElfClass::Elf64,
        variant: AbiVariant::Native,
        arch: Architecture::X86_64,
        syscalls: SyscallTable {
            mmap: 9,
            mprotect: 10,
            munmap: 11,
        },
    },
    AbiRow {
        machine: elf::EM_X86_64,
        class: ElfClass::Elf32,
        variant: AbiVariant::Native,
        arch: Architecture::X32,
        syscalls: SyscallTable {
            mmap: X32_SYSCALL_BIT + 9,
            mprotect: X32_SYSCALL_BIT + 10,
            munmap: X32_SYSCALL_BIT + 11,
        },
    },
    AbiRow {
        machine: elf::EM_386,
        class: ElfClass::Elf32,
        variant: AbiVariant::Native,
        arch: Architecture::I386,
        // mmap2
        syscalls: SyscallTable {
            mmap: 192,
            mprotect: 125,
            munmap: 91,
        },
    },
    AbiRow {
        machine: elf::EM_AARCH64,
        class: ElfClass::Elf64,
        variant: AbiVariant::Native,
        arch: Architecture::Arm64,
        syscalls: SyscallTable {
            mmap: 222,
            mprotect: 226,
            munmap: 215,
        },
    },
    AbiRow {
        machine: elf::EM_ARM,
        class: ElfClass::Elf32,
        variant: AbiVariant::ArmEabi,
        arch: Architecture::ArmEabi,
        // mmap2
        syscalls: SyscallTable {
            mmap: 192,
            mprotect: 125,
            munmap: 91,
        },
    },
];

/// Names tried, in order, for each fixed entry point.
pub const DLOPEN_NAMES: &[&str] = &["__libc_dlopen_mode", "dlopen"];
pub const DLCLOSE_NAMES: &[&str] = &["__libc_dlclose", "dlclose"];
pub const DLSYM_NAMES: &[&str] = &["__libc_dlsym", "dlsym"];
pub const START_MAIN_NAMES: &[&str] = &["__libc_start_main"];

/// Absolute in-tracee addresses of the fixed entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints
{
    pub dlopen: Address,
    pub dlclose: Address,
    pub dlsym: Address,
    pub start_main: Address,
}

/// Code bytes temporarily replaced in the tracee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCode
{
    pub address: Address,
    pub bytes: Vec<u8>,
}

/// What we know about the tracee's C library
///
/// Computed once per attach. Owned by the session and dropped when the tracee
/// detaches, exits, or execs a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibcInfo
{
    pub pid: ProcessId,
    pub arch: Architecture,
    /// Path as it appears in the tracee's memory map.
    pub mapped_path: String,
    /// Path that was actually opened on this host.
    pub local_path: PathBuf,
    /// Load bias of the library.
    pub base: Address,
    pub entry_points: EntryPoints,
    /// Library entry address (`base + e_entry`, Thumb bit cleared); the
    /// remote-call site.
    pub code_addr: Address,
    pub syscalls: SyscallTable,
    /// Original bytes at `code_addr` while a remote call has them patched.
    pub saved_code: Option<SavedCode>,
}

impl LibcInfo
{
    /// Resolve everything from an already opened image mapped at `base`.
    ///
    /// ## Errors
    ///
    /// Architecture errors from [`SyscallTable::for_header`], `SectionNotFound`
    /// when the image has no dynamic symbols, and `SymbolNotFound` naming the
    /// first entry point none of whose names resolve.
    pub fn from_image<R: Read + Seek>(
        pid: ProcessId,
        mapped_path: impl Into<String>,
        base: Address,
        elf: &mut ElfFile<R>,
    ) -> Result<Self>
    {
        let header = *elf.header();
        let (arch, syscalls) = SyscallTable::for_header(&header)?;

        let tables = elf.find_symbol_tables(TableKind::Dynamic)?;
        let mut resolve = |names: &[&str]| -> Result<Address> {
            for name in names {
                match elf.lookup_symbol(&tables, name) {
                    Ok(sym) => return relocate(base, sym.value),
                    Err(GrapnelError::SymbolNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(GrapnelError::SymbolNotFound(names.join(" | ")))
        };

        let entry_points = EntryPoints {
            dlopen: resolve(DLOPEN_NAMES)?,
            dlclose: resolve(DLCLOSE_NAMES)?,
            dlsym: resolve(DLSYM_NAMES)?,
            start_main: resolve(START_MAIN_NAMES)?,
        };

        let mut code_addr = relocate(base, header.entry)?;
        if arch == Architecture::ArmThumb {
            code_addr = Address::new(code_addr.value() & !1);
        }

        Ok(Self {
            pid,
            arch,
            mapped_path: mapped_path.into(),
            local_path: elf.path().map(Path::to_path_buf).unwrap_or_default(),
            base,
            entry_points,
            code_addr,
            syscalls,
            saved_code: None,
        })
    }
}

/// `base + offset`, for offsets taken from the image.
fn relocate(base: Address, offset: u64) -> Result<Address>
{
    base.checked_add(offset)
        .ok_or_else(|| GrapnelError::MalformedElf(format!("offset {offset:#x} overflows from base {base}")))
}

/// Locates and resolves the C library of a process
#[derive(Debug, Clone, Default)]
pub struct LibcResolver
{
    config: SessionConfig,
}

impl LibcResolver
{
    pub fn new(config: SessionConfig) -> Self
    {
        Self { config }
    }

    /// Resolve the C library of `pid` from its live memory map.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the process is gone
    /// - `LibraryNotFound`: no executable mapping has a C library file name
    /// - `LibraryDeleted`: the mapped file was unlinked
    /// - `FileOpen`: the file could not be opened by any candidate path
    /// - anything [`LibcInfo::from_image`] reports
    pub fn resolve(&self, pid: ProcessId) -> Result<LibcInfo>
    {
        let map = MemoryMap::read(pid)?;
        self.resolve_in(pid, &map)
    }

    /// Same as [`LibcResolver::resolve`] with an already read map.
    pub fn resolve_in(&self, pid: ProcessId, map: &MemoryMap) -> Result<LibcInfo>
    {
        let region = self.find_region(map).ok_or(GrapnelError::LibraryNotFound(pid.0))?;
        let mapped_path = region.path.clone().unwrap_or_default();
        if region.is_deleted() {
            return Err(GrapnelError::LibraryDeleted(mapped_path));
        }

        let base = region.load_bias().ok_or_else(|| {
            GrapnelError::InvalidArgument(format!(
                "{mapped_path} is mapped at {} below its file offset {:#x}",
                region.start, region.offset
            ))
        })?;
        let mut elf = self.open_image(pid, &mapped_path)?;
        let info = LibcInfo::from_image(pid, mapped_path, base, &mut elf)?;

        info!(
            pid = pid.0,
            arch = %info.arch,
            base = %info.base,
            path = %info.local_path.display(),
            "resolved C library"
        );
        debug!(entry_points = ?info.entry_points, code_addr = %info.code_addr, "C library entry points");
        Ok(info)
    }

    /// The executable mapping of the C library, if mapped.
    pub fn find_region<'m>(&self, map: &'m MemoryMap) -> Option<&'m MemoryRegion>
    {
        map.find_by(|region| {
            region.is_executable()
                && region
                    .path
                    .as_deref()
                    .and_then(|p| p.rsplit('/').next())
                    .is_some_and(|name| self.config.is_libc_file_name(name))
        })
    }

    /// Open a mapped path on this host, trying the container fallbacks.
    pub fn open_image(&self, pid: ProcessId, mapped_path: &str) -> Result<ElfFile<std::io::BufReader<std::fs::File>>>
    {
        let candidates = self.candidate_paths(pid, mapped_path);
        let mut last_err = None;

        for (attempt, path) in candidates.iter().enumerate() {
            match ElfFile::open(path) {
                Ok(elf) => {
                    if attempt > 0 {
                        warn!(mapped = mapped_path, opened = %path.display(), "opened C library through container fallback");
                    }
                    return Ok(elf);
                }
                Err(err @ GrapnelError::FileOpen { .. }) => {
                    debug!(path = %path.display(), error = %err, "C library candidate not usable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| GrapnelError::LibraryNotFound(pid.0)))
    }

    /// Paths tried by [`LibcResolver::open_image`], in order.
    pub fn candidate_paths(&self, pid: ProcessId, mapped_path: &str) -> Vec<PathBuf>
    {
        let mut paths = vec![PathBuf::from(mapped_path)];

        let marker = self.config.container_root_marker.as_str();
        if let Some(idx) = mapped_path.find(marker) {
            // keep the marker's trailing slash so the result stays absolute
            let inner = &mapped_path[idx + marker.len().saturating_sub(1)..];
            paths.push(PathBuf::from(inner));
        }

        let relative = mapped_path.trim_start_matches('/');
        paths.push(PathBuf::from(format!("/proc/{}/root", pid.0)).join(relative));
        paths
    }
}
