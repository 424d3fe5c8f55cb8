//! Synthetic ELF images for the parser and resolver tests.
//!
//! Images are laid out as: file header, section contents, then the section
//! header table. Both classes are produced from the same logical description
//! through `object`'s raw ELF structs.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use object::elf::{
    FileHeader32, FileHeader64, Ident, SectionHeader32, SectionHeader64, Sym32, Sym64, ELFCLASS32, ELFCLASS64,
    ELFDATA2LSB, ELFMAG, ELFOSABI_NONE, EM_X86_64, ET_DYN, EV_CURRENT, SHN_UNDEF, SHT_DYNSYM, SHT_NULL,
    SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STT_FUNC,
};
use object::endian::{Endianness, U16, U32, U64};
use object::pod::bytes_of;

const E: Endianness = Endianness::Little;

/// Section index given to defined symbols (any non-zero index will do).
const TEXT_INDEX: u16 = 7;

#[derive(Debug, Clone)]
pub struct SymbolSpec
{
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub defined: bool,
}

pub fn defined(name: &str, value: u64, size: u64) -> SymbolSpec
{
    SymbolSpec {
        name: name.to_string(),
        value,
        size,
        defined: true,
    }
}

pub fn undefined(name: &str) -> SymbolSpec
{
    SymbolSpec {
        name: name.to_string(),
        value: 0,
        size: 0,
        defined: false,
    }
}

/// Logical description of a small shared object
#[derive(Debug, Clone)]
pub struct ElfSpec
{
    pub is_64: bool,
    pub machine: u16,
    pub flags: u32,
    pub entry: u64,
    pub kind: u16,
    pub dynamic: Vec<SymbolSpec>,
    /// `.symtab`/`.strtab` contents; omitted from the image when `None`.
    pub statics: Option<Vec<SymbolSpec>>,
    pub with_dynstr: bool,
    pub with_dynsym: bool,
    /// Extra strings placed in `.dynstr` ahead of the symbol names.
    pub extra_dynstr: Vec<String>,
}

impl ElfSpec
{
    pub fn new(is_64: bool) -> Self
    {
        Self {
            is_64,
            machine: EM_X86_64,
            flags: 0,
            entry: 0x2_9dc0,
            kind: ET_DYN,
            dynamic: Vec::new(),
            statics: None,
            with_dynstr: true,
            with_dynsym: true,
            extra_dynstr: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self
    {
        self.machine = machine;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self
    {
        self.flags = flags;
        self
    }

    pub fn entry(mut self, entry: u64) -> Self
    {
        self.entry = entry;
        self
    }

    pub fn symbols(mut self, symbols: Vec<SymbolSpec>) -> Self
    {
        self.dynamic = symbols;
        self
    }

    pub fn statics(mut self, symbols: Vec<SymbolSpec>) -> Self
    {
        self.statics = Some(symbols);
        self
    }

    pub fn without_dynstr(mut self) -> Self
    {
        self.with_dynstr = false;
        self
    }

    pub fn without_dynsym(mut self) -> Self
    {
        self.with_dynsym = false;
        self
    }

    pub fn extra_string(mut self, s: &str) -> Self
    {
        self.extra_dynstr.push(s.to_string());
        self
    }

    /// The C library entry points plus a couple of ordinary functions.
    pub fn libc_like(is_64: bool) -> Self
    {
        Self::new(is_64).symbols(vec![
            undefined("_dl_argv"),
            defined("malloc", 0x9_a0e0, 0x2a0),
            defined("__libc_dlopen_mode", 0x16_f7d0, 0x90),
            defined("__libc_dlclose", 0x16_f8a0, 0x60),
            defined("__libc_dlsym", 0x16_f900, 0x80),
            defined("__libc_start_main", 0x2_9dc0, 0x1c0),
            defined("free", 0x9_a800, 0x120),
        ])
    }

    pub fn build(&self) -> Vec<u8>
    {
        let mut sections = vec![Section::null()];
        let mut shstrtab = StringTable::new();

        let shstrtab_index = sections.len();
        sections.push(Section::new(shstrtab.add(".shstrtab"), SHT_STRTAB));

        let (dynstr, dynsym) = self.symbol_pair(&self.dynamic, &self.extra_dynstr);
        let mut dynstr_index = 0;
        if self.with_dynstr {
            dynstr_index = sections.len();
            let mut section = Section::new(shstrtab.add(".dynstr"), SHT_STRTAB);
            section.data = dynstr;
            sections.push(section);
        }
        if self.with_dynsym {
            let mut section = Section::new(shstrtab.add(".dynsym"), SHT_DYNSYM);
            section.data = dynsym;
            section.link = dynstr_index as u32;
            section.entry_size = self.symbol_size();
            sections.push(section);
        }

        if let Some(statics) = &self.statics {
            let (strtab, symtab) = self.symbol_pair(statics, &[]);
            let strtab_index = sections.len();
            let mut section = Section::new(shstrtab.add(".strtab"), SHT_STRTAB);
            section.data = strtab;
            sections.push(section);
            let mut section = Section::new(shstrtab.add(".symtab"), SHT_SYMTAB);
            section.data = symtab;
            section.link = strtab_index as u32;
            section.entry_size = self.symbol_size();
            sections.push(section);
        }

        sections[shstrtab_index].data = shstrtab.bytes;

        // lay out contents after the header, then the header table
        let mut image = vec![0u8; self.header_size()];
        for section in sections.iter_mut().skip(1) {
            while image.len() % 8 != 0 {
                image.push(0);
            }
            section.offset = image.len() as u64;
            image.extend_from_slice(&section.data);
        }
        while image.len() % 8 != 0 {
            image.push(0);
        }
        let shoff = image.len() as u64;
        for section in &sections {
            image.extend_from_slice(&self.section_header(section));
        }

        let header = self.file_header(shoff, sections.len() as u16, shstrtab_index as u16);
        image[..header.len()].copy_from_slice(&header);
        image
    }

    fn symbol_pair(&self, symbols: &[SymbolSpec], extra: &[String]) -> (Vec<u8>, Vec<u8>)
    {
        let mut strings = StringTable::new();
        for s in extra {
            strings.add(s);
        }

        // record 0 is the null symbol
        let mut records = self.symbol_record(0, 0, 0, SHN_UNDEF, 0);
        for sym in symbols {
            let name = strings.add(&sym.name);
            let shndx = if sym.defined { TEXT_INDEX } else { SHN_UNDEF };
            let info = (STB_GLOBAL << 4) | STT_FUNC;
            records.extend(self.symbol_record(name, sym.value, sym.size, shndx, info));
        }
        (strings.bytes, records)
    }

    fn header_size(&self) -> usize
    {
        if self.is_64 { 64 } else { 52 }
    }

    fn symbol_size(&self) -> u64
    {
        if self.is_64 { 24 } else { 16 }
    }

    fn ident(&self) -> Ident
    {
        Ident {
            magic: ELFMAG,
            class: if self.is_64 { ELFCLASS64 } else { ELFCLASS32 },
            data: ELFDATA2LSB,
            version: EV_CURRENT,
            os_abi: ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        }
    }

    fn file_header(&self, shoff: u64, shnum: u16, shstrndx: u16) -> Vec<u8>
    {
        if self.is_64 {
            let header = FileHeader64::<Endianness> {
                e_ident: self.ident(),
                e_type: U16::new(E, self.kind),
                e_machine: U16::new(E, self.machine),
                e_version: U32::new(E, u32::from(EV_CURRENT)),
                e_entry: U64::new(E, self.entry),
                e_phoff: U64::new(E, 0),
                e_shoff: U64::new(E, shoff),
                e_flags: U32::new(E, self.flags),
                e_ehsize: U16::new(E, 64),
                e_phentsize: U16::new(E, 0),
                e_phnum: U16::new(E, 0),
                e_shentsize: U16::new(E, 64),
                e_shnum: U16::new(E, shnum),
                e_shstrndx: U16::new(E, shstrndx),
            };
            bytes_of(&header).to_vec()
        } else {
            let header = FileHeader32::<Endianness> {
                e_ident: self.ident(),
                e_type: U16::new(E, self.kind),
                e_machine: U16::new(E, self.machine),
                e_version: U32::new(E, u32::from(EV_CURRENT)),
                e_entry: U32::new(E, self.entry as u32),
                e_phoff: U32::new(E, 0),
                e_shoff: U32::new(E, shoff as u32),
                e_flags: U32::new(E, self.flags),
                e_ehsize: U16::new(E, 52),
                e_phentsize: U16::new(E, 0),
                e_phnum: U16::new(E, 0),
                e_shentsize: U16::new(E, 40),
                e_shnum: U16::new(E, shnum),
                e_shstrndx: U16::new(E, shstrndx),
            };
            bytes_of(&header).to_vec()
        }
    }

    fn section_header(&self, section: &Section) -> Vec<u8>
    {
        let size = section.data.len() as u64;
        if self.is_64 {
            let header = SectionHeader64::<Endianness> {
                sh_name: U32::new(E, section.name),
                sh_type: U32::new(E, section.kind),
                sh_flags: U64::new(E, 0),
                sh_addr: U64::new(E, 0),
                sh_offset: U64::new(E, section.offset),
                sh_size: U64::new(E, size),
                sh_link: U32::new(E, section.link),
                sh_info: U32::new(E, 0),
                sh_addralign: U64::new(E, 8),
                sh_entsize: U64::new(E, section.entry_size),
            };
            bytes_of(&header).to_vec()
        } else {
            let header = SectionHeader32::<Endianness> {
                sh_name: U32::new(E, section.name),
                sh_type: U32::new(E, section.kind),
                sh_flags: U32::new(E, 0),
                sh_addr: U32::new(E, 0),
                sh_offset: U32::new(E, section.offset as u32),
                sh_size: U32::new(E, size as u32),
                sh_link: U32::new(E, section.link),
                sh_info: U32::new(E, 0),
                sh_addralign: U32::new(E, 4),
                sh_entsize: U32::new(E, section.entry_size as u32),
            };
            bytes_of(&header).to_vec()
        }
    }

    fn symbol_record(&self, name: u32, value: u64, size: u64, shndx: u16, info: u8) -> Vec<u8>
    {
        if self.is_64 {
            let sym = Sym64::<Endianness> {
                st_name: U32::new(E, name),
                st_info: info,
                st_other: 0,
                st_shndx: U16::new(E, shndx),
                st_value: U64::new(E, value),
                st_size: U64::new(E, size),
            };
            bytes_of(&sym).to_vec()
        } else {
            let sym = Sym32::<Endianness> {
                st_name: U32::new(E, name),
                st_value: U32::new(E, value as u32),
                st_size: U32::new(E, size as u32),
                st_info: info,
                st_other: 0,
                st_shndx: U16::new(E, shndx),
            };
            bytes_of(&sym).to_vec()
        }
    }
}

struct Section
{
    name: u32,
    kind: u32,
    data: Vec<u8>,
    offset: u64,
    link: u32,
    entry_size: u64,
}

impl Section
{
    fn null() -> Self
    {
        Self::new(0, SHT_NULL)
    }

    fn new(name: u32, kind: u32) -> Self
    {
        Self {
            name,
            kind,
            data: Vec::new(),
            offset: 0,
            link: 0,
            entry_size: 0,
        }
    }
}

struct StringTable
{
    bytes: Vec<u8>,
}

impl StringTable
{
    fn new() -> Self
    {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32
    {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }
}

/// Write `bytes` to `name` inside a fresh directory under the system temp
/// directory; the file keeps its exact name.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf
{
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("grapnel-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Remove a file created by [`write_temp`] together with its directory.
pub fn remove_temp(path: &std::path::Path)
{
    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}
