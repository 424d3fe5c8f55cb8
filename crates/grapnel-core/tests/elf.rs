//! Tests for ELF header, section and symbol decoding

mod common;

use std::io::Cursor;

use common::{defined, undefined, write_temp, ElfSpec};
use grapnel_core::elf::{self, ElfClass, ElfFile, TableKind};
use grapnel_core::error::GrapnelError;

fn parse(bytes: Vec<u8>) -> ElfFile<Cursor<Vec<u8>>>
{
    ElfFile::parse(Cursor::new(bytes)).unwrap()
}

#[test]
fn test_header_fields_for_both_classes()
{
    for is_64 in [false, true] {
        let elf = parse(ElfSpec::libc_like(is_64).entry(0x1234).build());
        let header = elf.header();
        assert_eq!(header.class, if is_64 { ElfClass::Elf64 } else { ElfClass::Elf32 });
        assert_eq!(header.machine, object::elf::EM_X86_64);
        assert_eq!(header.entry, 0x1234);
        assert_eq!(header.kind, object::elf::ET_DYN);
        assert_eq!(header.string_table_index, 1);
    }
}

#[test]
fn test_class_agnostic_symbol_values()
{
    let names = ["__libc_dlopen_mode", "__libc_dlclose", "__libc_dlsym", "__libc_start_main", "malloc"];

    let mut resolved = Vec::new();
    for is_64 in [false, true] {
        let mut elf = parse(ElfSpec::libc_like(is_64).build());
        let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
        let values: Vec<(u64, u64)> = names
            .iter()
            .map(|name| {
                let sym = elf.lookup_symbol(&tables, name).unwrap();
                (sym.value, sym.size)
            })
            .collect();
        resolved.push(values);
    }

    assert_eq!(resolved[0], resolved[1]);
    assert_eq!(resolved[0][0], (0x16_f7d0, 0x90));
}

#[test]
fn test_symbol_table_matches_lookup()
{
    let mut elf = parse(ElfSpec::libc_like(true).build());
    let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
    let table = elf.symbol_table(&tables).unwrap();

    // undefined imports are left out
    assert!(table.get("_dl_argv").is_none());
    assert_eq!(table.get("free").unwrap().value, 0x9_a800);
    assert_eq!(table.len(), 6);
    assert_eq!(tables.len(), 8);
}

#[test]
fn test_first_defined_symbol_wins()
{
    let spec = ElfSpec::new(true).symbols(vec![
        undefined("dlopen"),
        defined("dlopen", 0x1000, 8),
        defined("dlopen", 0x2000, 8),
    ]);
    let mut elf = parse(spec.build());
    let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
    assert_eq!(elf.lookup_symbol(&tables, "dlopen").unwrap().value, 0x1000);
}

#[test]
fn test_string_present_without_symbol_is_not_found()
{
    let spec = ElfSpec::new(false)
        .extra_string("GLIBC_PRIVATE")
        .symbols(vec![defined("malloc", 0x100, 4)]);
    let mut elf = parse(spec.build());
    let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();

    assert_eq!(elf.find_string(&tables.strings, "GLIBC_PRIVATE").unwrap().len(), 1);
    assert!(matches!(
        elf.lookup_symbol(&tables, "GLIBC_PRIVATE"),
        Err(GrapnelError::SymbolNotFound(name)) if name == "GLIBC_PRIVATE"
    ));
    assert!(matches!(
        elf.lookup_symbol(&tables, "calloc"),
        Err(GrapnelError::SymbolNotFound(_))
    ));
}

#[test]
fn test_suffix_of_longer_name_is_a_valid_offset()
{
    // "open" is stored only as the tail of "dlopen"
    let spec = ElfSpec::new(true).symbols(vec![defined("dlopen", 0x4000, 16)]);
    let mut elf = parse(spec.build());
    let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
    let offsets = elf.find_string(&tables.strings, "open").unwrap();
    assert_eq!(offsets, vec![3]);
    // no record points at the suffix
    assert!(elf.lookup_symbol(&tables, "open").is_err());
}

#[test]
fn test_distinct_failures()
{
    let mut bad_magic = ElfSpec::libc_like(true).build();
    bad_magic[..4].copy_from_slice(b"\x7fELV");
    assert!(matches!(
        ElfFile::parse(Cursor::new(bad_magic)),
        Err(GrapnelError::BadMagic(m)) if &m == b"\x7fELV"
    ));

    let mut bad_class = ElfSpec::libc_like(true).build();
    bad_class[4] = 9;
    assert!(matches!(
        ElfFile::parse(Cursor::new(bad_class)),
        Err(GrapnelError::UnsupportedClass(9))
    ));

    let mut no_dynsym = parse(ElfSpec::libc_like(true).without_dynsym().build());
    assert!(matches!(
        no_dynsym.find_symbol_tables(TableKind::Dynamic),
        Err(GrapnelError::SectionNotFound(name)) if name == ".dynsym"
    ));

    let mut no_dynstr = parse(ElfSpec::libc_like(false).without_dynstr().build());
    assert!(matches!(
        no_dynstr.find_symbol_tables(TableKind::Dynamic),
        Err(GrapnelError::SectionNotFound(name)) if name == ".dynstr"
    ));

    let mut elf = parse(ElfSpec::libc_like(true).build());
    let tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
    assert!(matches!(
        elf.lookup_symbol(&tables, "no_such_symbol"),
        Err(GrapnelError::SymbolNotFound(_))
    ));
}

#[test]
fn test_truncated_image_is_reported()
{
    let full = ElfSpec::libc_like(true).build();

    let header_only = full[..40].to_vec();
    assert!(matches!(
        ElfFile::parse(Cursor::new(header_only)),
        Err(GrapnelError::Truncated { .. })
    ));

    // header intact, last section header cut off
    let mut cut = parse(full[..full.len() - 10].to_vec());
    assert!(matches!(
        cut.find_symbol_tables(TableKind::Dynamic),
        Err(GrapnelError::Truncated { what: "section header", .. })
    ));
}

#[test]
fn test_symbol_offset_overflow_is_malformed()
{
    let mut elf = parse(ElfSpec::libc_like(true).build());
    let mut tables = elf.find_symbol_tables(TableKind::Dynamic).unwrap();
    tables.symbols.offset = u64::MAX - 4;

    assert!(matches!(elf.symbol(&tables, 1), Err(GrapnelError::MalformedElf(_))));
    // the first record does not overflow but lies past the end of the file
    assert!(matches!(elf.symbol(&tables, 0), Err(GrapnelError::Truncated { .. })));
}

#[test]
fn test_section_names_and_data()
{
    let mut elf = parse(ElfSpec::libc_like(false).build());
    let names: Vec<String> = elf
        .sections()
        .unwrap()
        .iter()
        .map(|s| elf_name(&mut elf, s))
        .collect();
    assert_eq!(names, vec!["", ".shstrtab", ".dynstr", ".dynsym"]);

    let dynstr = elf.find_section(".dynstr").unwrap();
    let data = elf.section_data(&dynstr).unwrap();
    assert_eq!(data[0], 0);
    assert!(data.ends_with(b"free\0"));
}

fn elf_name(elf: &mut ElfFile<Cursor<Vec<u8>>>, section: &elf::SectionHeader) -> String
{
    elf.section_name(section).unwrap()
}

#[test]
fn test_main_offset_from_static_table()
{
    let spec = ElfSpec::new(true)
        .symbols(vec![defined("puts", 0x1030, 6)])
        .statics(vec![defined("_start", 0x1040, 0x26), defined("main", 0x1139, 0x1e)]);
    let path = write_temp("main", &spec.build());

    assert_eq!(elf::resolve_main_offset(&path).unwrap(), 0x1139);

    let stripped = write_temp("stripped", &ElfSpec::new(true).symbols(vec![defined("main", 1, 1)]).build());
    assert!(matches!(
        elf::resolve_main_offset(&stripped),
        Err(GrapnelError::SectionNotFound(name)) if name == ".symtab"
    ));

    common::remove_temp(&path);
    common::remove_temp(&stripped);
}

#[test]
fn test_open_missing_file()
{
    let err = ElfFile::open("/nonexistent/grapnel/libc.so.6").unwrap_err();
    assert!(matches!(err, GrapnelError::FileOpen { .. }));
}
