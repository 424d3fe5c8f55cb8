//! Symbol records and the name-to-value table built from them.

use std::collections::HashMap;

use object::elf::{self, Sym32, Sym64};
use object::pod;
use object::Endianness;

use super::header::ElfClass;
use crate::error::{GrapnelError, Result};

/// Class-independent symbol record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    /// Position in its table.
    pub index: u64,
    /// `st_name`: offset of the name in the associated string table.
    pub name_offset: u32,
    /// Resolved name, when it was looked up.
    pub name: Option<String>,
    /// `st_value`: for shared objects, the offset from the load bias.
    pub value: u64,
    pub size: u64,
    pub info: u8,
    pub other: u8,
    /// `st_shndx`
    pub section_index: u16,
}

impl Symbol
{
    pub(crate) fn decode(index: u64, bytes: &[u8], class: ElfClass, endian: Endianness, offset: u64) -> Result<Self>
    {
        let truncated = || GrapnelError::Truncated { what: "symbol", offset };

        Ok(match class {
            ElfClass::Elf32 => {
                let (sym, _) = pod::from_bytes::<Sym32<Endianness>>(bytes).map_err(|()| truncated())?;
                Self {
                    index,
                    name_offset: sym.st_name.get(endian),
                    name: None,
                    value: u64::from(sym.st_value.get(endian)),
                    size: u64::from(sym.st_size.get(endian)),
                    info: sym.st_info,
                    other: sym.st_other,
                    section_index: sym.st_shndx.get(endian),
                }
            }
            ElfClass::Elf64 => {
                let (sym, _) = pod::from_bytes::<Sym64<Endianness>>(bytes).map_err(|()| truncated())?;
                Self {
                    index,
                    name_offset: sym.st_name.get(endian),
                    name: None,
                    value: sym.st_value.get(endian),
                    size: sym.st_size.get(endian),
                    info: sym.st_info,
                    other: sym.st_other,
                    section_index: sym.st_shndx.get(endian),
                }
            }
        })
    }

    /// Defined in this image (not an import).
    pub fn is_defined(&self) -> bool
    {
        self.section_index != elf::SHN_UNDEF
    }
}

/// Value and size of a named symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry
{
    pub value: u64,
    pub size: u64,
}

/// Map from symbol name to value and size
///
/// Built from one symbol section joined with its string table. Only defined,
/// named symbols are included; if a name occurs more than once the first
/// record wins, matching what [`super::ElfFile::lookup_symbol`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable
{
    entries: HashMap<String, SymbolEntry>,
}

impl SymbolTable
{
    pub(crate) fn insert_first(&mut self, name: String, entry: SymbolEntry)
    {
        self.entries.entry(name).or_insert(entry);
    }

    pub fn get(&self, name: &str) -> Option<SymbolEntry>
    {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SymbolEntry)>
    {
        self.entries.iter().map(|(name, entry)| (name.as_str(), *entry))
    }
}
