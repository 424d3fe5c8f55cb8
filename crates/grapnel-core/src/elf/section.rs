//! Section headers and symbol-table section pairs.

use object::elf::{self, SectionHeader32, SectionHeader64};
use object::pod;
use object::Endianness;

use super::header::ElfClass;
use crate::error::{GrapnelError, Result};

/// Class-independent section header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader
{
    /// Position in the section header table.
    pub index: u32,
    /// `sh_name`: offset of the name in the section-name string table.
    pub name_offset: u32,
    /// `sh_type`
    pub kind: u32,
    pub flags: u64,
    pub addr: u64,
    /// `sh_offset`: where the content starts in the file.
    pub offset: u64,
    /// `sh_size`
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    /// `sh_entsize`
    pub entry_size: u64,
}

impl SectionHeader
{
    /// Decode one record in the given class and byte order.
    pub(crate) fn decode(index: u32, bytes: &[u8], class: ElfClass, endian: Endianness, offset: u64) -> Result<Self>
    {
        let truncated = || GrapnelError::Truncated { what: "section header", offset };

        Ok(match class {
            ElfClass::Elf32 => {
                let (sh, _) = pod::from_bytes::<SectionHeader32<Endianness>>(bytes).map_err(|()| truncated())?;
                Self {
                    index,
                    name_offset: sh.sh_name.get(endian),
                    kind: sh.sh_type.get(endian),
                    flags: u64::from(sh.sh_flags.get(endian)),
                    addr: u64::from(sh.sh_addr.get(endian)),
                    offset: u64::from(sh.sh_offset.get(endian)),
                    size: u64::from(sh.sh_size.get(endian)),
                    link: sh.sh_link.get(endian),
                    info: sh.sh_info.get(endian),
                    addralign: u64::from(sh.sh_addralign.get(endian)),
                    entry_size: u64::from(sh.sh_entsize.get(endian)),
                }
            }
            ElfClass::Elf64 => {
                let (sh, _) = pod::from_bytes::<SectionHeader64<Endianness>>(bytes).map_err(|()| truncated())?;
                Self {
                    index,
                    name_offset: sh.sh_name.get(endian),
                    kind: sh.sh_type.get(endian),
                    flags: sh.sh_flags.get(endian),
                    addr: sh.sh_addr.get(endian),
                    offset: sh.sh_offset.get(endian),
                    size: sh.sh_size.get(endian),
                    link: sh.sh_link.get(endian),
                    info: sh.sh_info.get(endian),
                    addralign: sh.sh_addralign.get(endian),
                    entry_size: sh.sh_entsize.get(endian),
                }
            }
        })
    }

    /// `SHT_NOBITS` sections occupy no file space.
    pub fn has_file_data(&self) -> bool
    {
        self.kind != elf::SHT_NOBITS
    }
}

/// Which symbol table to look in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind
{
    /// `.dynsym` + `.dynstr`: exported symbols, present in shared objects.
    Dynamic,
    /// `.symtab` + `.strtab`: full static table, often stripped.
    Static,
}

impl TableKind
{
    /// Section name of the symbol records.
    pub const fn symbols_name(self) -> &'static str
    {
        match self {
            TableKind::Dynamic => ".dynsym",
            TableKind::Static => ".symtab",
        }
    }

    /// Section name of the associated string table.
    pub const fn strings_name(self) -> &'static str
    {
        match self {
            TableKind::Dynamic => ".dynstr",
            TableKind::Static => ".strtab",
        }
    }

    /// Expected `sh_type` of the symbol section.
    pub const fn symbols_type(self) -> u32
    {
        match self {
            TableKind::Dynamic => elf::SHT_DYNSYM,
            TableKind::Static => elf::SHT_SYMTAB,
        }
    }
}

/// A symbol section and the string table its names point into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTables
{
    pub kind: TableKind,
    pub symbols: SectionHeader,
    pub strings: SectionHeader,
    /// Effective record size (falls back to the class size when `sh_entsize` is 0).
    pub entry_size: u64,
}

impl SymbolTables
{
    /// Number of symbol records.
    pub fn len(&self) -> u64
    {
        self.symbols.size / self.entry_size
    }

    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}
