//! # ELF Parsing
//!
//! Streaming reader for the parts of an ELF image needed to resolve symbols:
//! the file header, section headers, and symbol tables.
//!
//! Nothing is mapped or read in bulk up front. Each record is read from the
//! underlying `Read + Seek` source when asked for, so probing a large shared
//! library only touches the header table, the section-name string table, and
//! the one symbol/string section pair that is being searched.
//!
//! 32-bit and 64-bit images go through separate decoding paths (the raw
//! record layouts from [`object::elf`]) that feed the same canonical structs,
//! so callers never see the class of the file.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grapnel_core::elf::{ElfFile, TableKind};
//!
//! let mut elf = ElfFile::open("/usr/lib/x86_64-linux-gnu/libc.so.6")?;
//! let tables = elf.find_symbol_tables(TableKind::Dynamic)?;
//! let sym = elf.lookup_symbol(&tables, "dlopen")?;
//! println!("dlopen at +0x{:x}", sym.value);
//! # Ok::<(), grapnel_core::error::GrapnelError>(())
//! ```

mod header;
mod section;
mod symbol;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub use header::{ElfClass, ElfHeader};
use object::elf as raw;
pub use section::{SectionHeader, SymbolTables, TableKind};
pub use symbol::{Symbol, SymbolEntry, SymbolTable};
use tracing::{debug, trace};

use crate::error::{GrapnelError, Result};

/// Bytes of `e_ident` read before the class is known.
const IDENT_LEN: u64 = 16;

/// Chunk size used when scanning for a string terminator.
const NAME_CHUNK: usize = 64;

/// An ELF image opened for symbol lookup
#[derive(Debug)]
pub struct ElfFile<R>
{
    reader: R,
    header: ElfHeader,
    file_len: u64,
    names: Option<SectionHeader>,
    path: Option<PathBuf>,
}

impl ElfFile<BufReader<File>>
{
    /// Open and validate an ELF file on the local filesystem.
    ///
    /// ## Errors
    ///
    /// - `FileOpen`: the file cannot be opened
    /// - `BadMagic` / `UnsupportedClass` / `UnsupportedEncoding` / `Truncated`: not a usable ELF image
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| GrapnelError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut elf = Self::parse(BufReader::new(file))?;
        elf.path = Some(path.to_path_buf());
        Ok(elf)
    }
}

impl<R: Read + Seek> ElfFile<R>
{
    /// Validate the header of an image held by any random-access source.
    pub fn parse(mut reader: R) -> Result<Self>
    {
        let file_len = reader.seek(SeekFrom::End(0))?;

        let ident = read_exact_at(&mut reader, file_len, 0, IDENT_LEN.min(file_len), "ELF identification")?;
        let (class, _) = header::identify(&ident)?;

        let bytes = read_exact_at(&mut reader, file_len, 0, class.header_size() as u64, "ELF header")?;
        let raw_header = header::decode(&bytes)?;

        let mut elf = Self {
            reader,
            header: raw_header.header,
            file_len,
            names: None,
            path: None,
        };

        // Counts that do not fit the header live in section 0
        if elf.header.section_offset != 0
            && (raw_header.raw_shnum == 0 || raw_header.raw_shstrndx == raw::SHN_XINDEX)
        {
            let first = elf.read_section_header(0)?;
            if raw_header.raw_shnum == 0 {
                elf.header.section_count = u32::try_from(first.size)
                    .map_err(|_| GrapnelError::MalformedElf(format!("section count {} too large", first.size)))?;
            }
            if raw_header.raw_shstrndx == raw::SHN_XINDEX {
                elf.header.string_table_index = first.link;
            }
        }

        if elf.header.section_offset != 0 && elf.header.string_table_index != u32::from(raw::SHN_UNDEF) {
            let names = elf.section_header(elf.header.string_table_index)?;
            if names.kind != raw::SHT_STRTAB {
                return Err(GrapnelError::MalformedElf(format!(
                    "section-name table {} has type {}",
                    names.index, names.kind
                )));
            }
            elf.names = Some(names);
        }

        debug!(
            class = ?elf.header.class,
            machine = elf.header.machine,
            sections = elf.header.section_count,
            "parsed ELF header"
        );
        Ok(elf)
    }

    /// The decoded file header.
    pub fn header(&self) -> &ElfHeader
    {
        &self.header
    }

    /// Size of the underlying file in bytes.
    pub fn file_len(&self) -> u64
    {
        self.file_len
    }

    /// Path this image was opened from, if it came from [`ElfFile::open`].
    pub fn path(&self) -> Option<&Path>
    {
        self.path.as_deref()
    }

    /// Decode section header `index`.
    pub fn section_header(&mut self, index: u32) -> Result<SectionHeader>
    {
        if index >= self.header.section_count {
            return Err(GrapnelError::MalformedElf(format!(
                "section index {index} out of range (count {})",
                self.header.section_count
            )));
        }
        self.read_section_header(index)
    }

    fn read_section_header(&mut self, index: u32) -> Result<SectionHeader>
    {
        let offset = u64::from(index)
            .checked_mul(u64::from(self.header.section_entry_size))
            .and_then(|rel| rel.checked_add(self.header.section_offset))
            .ok_or(GrapnelError::Truncated {
                what: "section header",
                offset: self.header.section_offset,
            })?;
        let len = self.header.class.section_header_size() as u64;
        let bytes = read_exact_at(&mut self.reader, self.file_len, offset, len, "section header")?;
        SectionHeader::decode(index, &bytes, self.header.class, self.header.endian, offset)
    }

    /// Name of a section, read from the section-name string table.
    pub fn section_name(&mut self, section: &SectionHeader) -> Result<String>
    {
        let names = self
            .names
            .ok_or_else(|| GrapnelError::SectionNotFound(".shstrtab".to_string()))?;
        self.string_in(&names, section.name_offset)
    }

    /// All section headers in table order.
    pub fn sections(&mut self) -> Result<Vec<SectionHeader>>
    {
        (0..self.header.section_count).map(|i| self.section_header(i)).collect()
    }

    /// First section called `name`.
    pub fn find_section(&mut self, name: &str) -> Result<SectionHeader>
    {
        for index in 0..self.header.section_count {
            let section = self.section_header(index)?;
            if self.section_name(&section)? == name {
                return Ok(section);
            }
        }
        Err(GrapnelError::SectionNotFound(name.to_string()))
    }

    /// Raw file content of a section (empty for `SHT_NOBITS`).
    pub fn section_data(&mut self, section: &SectionHeader) -> Result<Vec<u8>>
    {
        if !section.has_file_data() {
            return Ok(Vec::new());
        }
        read_exact_at(&mut self.reader, self.file_len, section.offset, section.size, "section data")
    }

    /// Locate the symbol section and string table for `kind`.
    ///
    /// Sections are matched by name; each candidate costs one read of its
    /// name and none of its content.
    ///
    /// ## Errors
    ///
    /// `SectionNotFound` naming whichever of the pair is missing.
    pub fn find_symbol_tables(&mut self, kind: TableKind) -> Result<SymbolTables>
    {
        let mut symbols = None;
        let mut strings = None;

        for index in 0..self.header.section_count {
            let section = self.section_header(index)?;
            let wanted_symbols = symbols.is_none() && section.kind == kind.symbols_type();
            let wanted_strings = strings.is_none() && section.kind == raw::SHT_STRTAB;
            if !wanted_symbols && !wanted_strings {
                continue;
            }

            let name = self.section_name(&section)?;
            trace!(index, name = %name, "probing section");
            if wanted_symbols && name == kind.symbols_name() {
                symbols = Some(section);
            } else if wanted_strings && name == kind.strings_name() {
                strings = Some(section);
            }

            if symbols.is_some() && strings.is_some() {
                break;
            }
        }

        let symbols = symbols.ok_or_else(|| GrapnelError::SectionNotFound(kind.symbols_name().to_string()))?;
        let strings = strings.ok_or_else(|| GrapnelError::SectionNotFound(kind.strings_name().to_string()))?;

        let min_entry = self.header.class.symbol_size() as u64;
        let entry_size = if symbols.entry_size == 0 { min_entry } else { symbols.entry_size };
        if entry_size < min_entry {
            return Err(GrapnelError::MalformedElf(format!(
                "{} entry size {entry_size} is smaller than {min_entry}",
                kind.symbols_name()
            )));
        }

        Ok(SymbolTables {
            kind,
            symbols,
            strings,
            entry_size,
        })
    }

    /// Every offset in `strings` at which `name` occurs NUL-terminated.
    ///
    /// String tables share suffixes, so `name` may appear as the tail of a
    /// longer string; those positions are valid name offsets too.
    pub fn find_string(&mut self, strings: &SectionHeader, name: &str) -> Result<Vec<u32>>
    {
        let blob = self.section_data(strings)?;
        Ok(string_offsets(&blob, name.as_bytes()))
    }

    /// Decode symbol record `index` (name left unresolved).
    pub fn symbol(&mut self, tables: &SymbolTables, index: u64) -> Result<Symbol>
    {
        if index >= tables.len() {
            return Err(GrapnelError::MalformedElf(format!(
                "symbol index {index} out of range (count {})",
                tables.len()
            )));
        }
        let offset = index
            .checked_mul(tables.entry_size)
            .and_then(|rel| rel.checked_add(tables.symbols.offset))
            .ok_or_else(|| GrapnelError::MalformedElf(format!("symbol {index} lies beyond the addressable file")))?;
        let len = self.header.class.symbol_size() as u64;
        let bytes = read_exact_at(&mut self.reader, self.file_len, offset, len, "symbol")?;
        Symbol::decode(index, &bytes, self.header.class, self.header.endian, offset)
    }

    /// Decode every record of a symbol section in one read.
    pub fn symbols(&mut self, tables: &SymbolTables) -> Result<Vec<Symbol>>
    {
        let blob = self.section_data(&tables.symbols)?;
        let class = self.header.class;
        let endian = self.header.endian;
        let stride = usize::try_from(tables.entry_size)
            .map_err(|_| GrapnelError::MalformedElf("symbol entry size overflows".to_string()))?;

        blob.chunks_exact(stride)
            .enumerate()
            .map(|(i, record)| {
                let offset = (i as u64)
                    .checked_mul(tables.entry_size)
                    .and_then(|rel| rel.checked_add(tables.symbols.offset))
                    .ok_or_else(|| GrapnelError::MalformedElf(format!("symbol {i} lies beyond the addressable file")))?;
                Symbol::decode(i as u64, record, class, endian, offset)
            })
            .collect()
    }

    /// First defined symbol named `name`.
    ///
    /// The name must occur in the string table *and* some record's `st_name`
    /// must point at one of its occurrences. Undefined (imported) records are
    /// skipped.
    ///
    /// ## Errors
    ///
    /// `SymbolNotFound` if either half of that match fails.
    pub fn lookup_symbol(&mut self, tables: &SymbolTables, name: &str) -> Result<Symbol>
    {
        let offsets = self.find_string(&tables.strings, name)?;
        if offsets.is_empty() {
            return Err(GrapnelError::SymbolNotFound(name.to_string()));
        }

        let found = self
            .symbols(tables)?
            .into_iter()
            .find(|sym| sym.is_defined() && offsets.contains(&sym.name_offset));

        match found {
            Some(mut sym) => {
                sym.name = Some(name.to_string());
                trace!(name, value = sym.value, "resolved symbol");
                Ok(sym)
            }
            None => Err(GrapnelError::SymbolNotFound(name.to_string())),
        }
    }

    /// Name-to-value map of every defined, named symbol in `tables`.
    pub fn symbol_table(&mut self, tables: &SymbolTables) -> Result<SymbolTable>
    {
        let strings = self.section_data(&tables.strings)?;
        let mut table = SymbolTable::default();

        for sym in self.symbols(tables)? {
            if !sym.is_defined() || sym.name_offset == 0 {
                continue;
            }
            let Some(name) = cstr_at(&strings, sym.name_offset as usize) else {
                continue;
            };
            table.insert_first(
                name,
                SymbolEntry {
                    value: sym.value,
                    size: sym.size,
                },
            );
        }
        Ok(table)
    }

    fn string_in(&mut self, table: &SectionHeader, offset: u32) -> Result<String>
    {
        let offset = u64::from(offset);
        if offset >= table.size {
            return Err(GrapnelError::MalformedElf(format!(
                "string offset {offset} outside table of {} bytes",
                table.size
            )));
        }

        let mut remaining = table.size - offset;
        let mut position = table
            .offset
            .checked_add(offset)
            .ok_or_else(|| GrapnelError::MalformedElf(format!("string table {} overflows", table.index)))?;
        let mut out = Vec::new();
        while remaining > 0 {
            let take = remaining.min(NAME_CHUNK as u64);
            let chunk = read_exact_at(&mut self.reader, self.file_len, position, take, "string table")?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk);
            position += take;
            remaining -= take;
        }

        Err(GrapnelError::MalformedElf(format!(
            "unterminated string at offset {offset} of table {}",
            table.index
        )))
    }
}

/// Offset of `main` in the static symbol table of an executable.
///
/// Add the load bias of the image (see [`crate::maps::MemoryMap::image_base`])
/// to get the runtime address for a PIE binary.
pub fn resolve_main_offset(path: impl AsRef<Path>) -> Result<u64>
{
    let mut elf = ElfFile::open(path)?;
    let tables = elf.find_symbol_tables(TableKind::Static)?;
    Ok(elf.lookup_symbol(&tables, "main")?.value)
}

fn read_exact_at<R: Read + Seek>(reader: &mut R, file_len: u64, offset: u64, len: u64, what: &'static str) -> Result<Vec<u8>>
{
    let in_bounds = offset.checked_add(len).is_some_and(|end| end <= file_len);
    if !in_bounds {
        return Err(GrapnelError::Truncated { what, offset });
    }
    let len = usize::try_from(len).map_err(|_| GrapnelError::Truncated { what, offset })?;

    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn string_offsets(blob: &[u8], name: &[u8]) -> Vec<u32>
{
    if name.is_empty() || blob.len() <= name.len() {
        return Vec::new();
    }

    (0..blob.len() - name.len())
        .filter(|&i| &blob[i..i + name.len()] == name && blob[i + name.len()] == 0)
        .filter_map(|i| u32::try_from(i).ok())
        .collect()
}

fn cstr_at(blob: &[u8], offset: usize) -> Option<String>
{
    let tail = blob.get(offset..)?;
    let nul = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..nul]).into_owned())
}
