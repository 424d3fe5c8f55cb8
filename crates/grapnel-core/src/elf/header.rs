//! ELF file header decoding.

use object::elf::{self, FileHeader32, FileHeader64};
use object::pod;
use object::Endianness;

use crate::error::{GrapnelError, Result};

/// Index of the class byte in `e_ident`.
const EI_CLASS: usize = 4;
/// Index of the data-encoding byte in `e_ident`.
const EI_DATA: usize = 5;

/// Word size of an ELF image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfClass
{
    Elf32,
    Elf64,
}

impl ElfClass
{
    /// Size of one file header record.
    pub const fn header_size(self) -> usize
    {
        match self {
            ElfClass::Elf32 => std::mem::size_of::<FileHeader32<Endianness>>(),
            ElfClass::Elf64 => std::mem::size_of::<FileHeader64<Endianness>>(),
        }
    }

    /// Size of one section header record.
    pub const fn section_header_size(self) -> usize
    {
        match self {
            ElfClass::Elf32 => std::mem::size_of::<elf::SectionHeader32<Endianness>>(),
            ElfClass::Elf64 => std::mem::size_of::<elf::SectionHeader64<Endianness>>(),
        }
    }

    /// Size of one symbol record.
    pub const fn symbol_size(self) -> usize
    {
        match self {
            ElfClass::Elf32 => std::mem::size_of::<elf::Sym32<Endianness>>(),
            ElfClass::Elf64 => std::mem::size_of::<elf::Sym64<Endianness>>(),
        }
    }
}

/// Class-independent view of the file header
///
/// Both 32- and 64-bit headers decode into this one struct; fields that are
/// narrower in the 32-bit layout are widened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader
{
    pub class: ElfClass,
    pub endian: Endianness,
    /// `e_type`
    pub kind: u16,
    /// `e_machine`
    pub machine: u16,
    /// `e_flags` (ARM keeps its EABI version here)
    pub flags: u32,
    /// `e_entry`
    pub entry: u64,
    /// `e_shoff`
    pub section_offset: u64,
    /// `e_shentsize`
    pub section_entry_size: u16,
    /// Number of section headers, after resolving the `e_shnum == 0` escape.
    pub section_count: u32,
    /// Index of the section-name string table, after resolving `SHN_XINDEX`.
    pub string_table_index: u32,
}

/// Raw header values before the section-count escapes are resolved
pub(crate) struct RawHeader
{
    pub header: ElfHeader,
    pub raw_shnum: u16,
    pub raw_shstrndx: u16,
}

/// Check magic, class and data encoding; returns the class and byte order
/// the rest of the file must be decoded with.
pub(crate) fn identify(ident: &[u8]) -> Result<(ElfClass, Endianness)>
{
    let magic: [u8; 4] = ident
        .get(..4)
        .and_then(|m| m.try_into().ok())
        .ok_or(GrapnelError::Truncated { what: "ELF identification", offset: 0 })?;
    if magic != elf::ELFMAG {
        return Err(GrapnelError::BadMagic(magic));
    }

    let class = match ident.get(EI_CLASS).copied() {
        Some(elf::ELFCLASS32) => ElfClass::Elf32,
        Some(elf::ELFCLASS64) => ElfClass::Elf64,
        Some(other) => return Err(GrapnelError::UnsupportedClass(other)),
        None => return Err(GrapnelError::Truncated { what: "ELF identification", offset: 0 }),
    };

    let endian = match ident.get(EI_DATA).copied() {
        Some(elf::ELFDATA2LSB) => Endianness::Little,
        Some(elf::ELFDATA2MSB) => Endianness::Big,
        Some(other) => return Err(GrapnelError::UnsupportedEncoding(other)),
        None => return Err(GrapnelError::Truncated { what: "ELF identification", offset: 0 }),
    };

    Ok((class, endian))
}

/// Decode a complete file header from `bytes` (which starts at offset 0).
pub(crate) fn decode(bytes: &[u8]) -> Result<RawHeader>
{
    let (class, endian) = identify(bytes)?;
    let truncated = || GrapnelError::Truncated { what: "ELF header", offset: 0 };

    let raw = match class {
        ElfClass::Elf32 => {
            let (h, _) = pod::from_bytes::<FileHeader32<Endianness>>(bytes).map_err(|()| truncated())?;
            RawHeader {
                header: ElfHeader {
                    class,
                    endian,
                    kind: h.e_type.get(endian),
                    machine: h.e_machine.get(endian),
                    flags: h.e_flags.get(endian),
                    entry: u64::from(h.e_entry.get(endian)),
                    section_offset: u64::from(h.e_shoff.get(endian)),
                    section_entry_size: h.e_shentsize.get(endian),
                    section_count: u32::from(h.e_shnum.get(endian)),
                    string_table_index: u32::from(h.e_shstrndx.get(endian)),
                },
                raw_shnum: h.e_shnum.get(endian),
                raw_shstrndx: h.e_shstrndx.get(endian),
            }
        }
        ElfClass::Elf64 => {
            let (h, _) = pod::from_bytes::<FileHeader64<Endianness>>(bytes).map_err(|()| truncated())?;
            RawHeader {
                header: ElfHeader {
                    class,
                    endian,
                    kind: h.e_type.get(endian),
                    machine: h.e_machine.get(endian),
                    flags: h.e_flags.get(endian),
                    entry: h.e_entry.get(endian),
                    section_offset: h.e_shoff.get(endian),
                    section_entry_size: h.e_shentsize.get(endian),
                    section_count: u32::from(h.e_shnum.get(endian)),
                    string_table_index: u32::from(h.e_shstrndx.get(endian)),
                },
                raw_shnum: h.e_shnum.get(endian),
                raw_shstrndx: h.e_shstrndx.get(endian),
            }
        }
    };

    let min_entry = class.section_header_size();
    let header = &raw.header;
    if header.section_offset != 0 && usize::from(header.section_entry_size) < min_entry {
        return Err(GrapnelError::MalformedElf(format!(
            "section header entry size {} is smaller than {min_entry}",
            header.section_entry_size
        )));
    }

    Ok(raw)
}
