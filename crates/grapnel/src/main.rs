//! `grapnel` command-line tool.
//!
//! Commands that only read `/proc` or ELF files run in-process; commands that
//! touch tracee memory attach from a dedicated tracer thread and detach when
//! done. Linux only.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use grapnel_core::elf::{self, ElfFile, TableKind};
use grapnel_core::libc::LibcResolver;
use grapnel_core::maps::MemoryMap;
use grapnel_core::patch;
use grapnel_core::types::{Address, ProcessId};
use grapnel_core::{LinuxDebugger, Result as GrapnelResult, RunOutcome, Session, SessionConfig, TraceeWorker};
use grapnel_utils::{LogFormat, LogLevel, LoggingConfig, info, init_logging};

/// Attach to a Linux process, resolve its libc, and run syscalls inside it.
#[derive(Parser, Debug)]
#[command(name = "grapnel")]
#[command(version)]
#[command(about = "Attach to a Linux process, resolve its libc, and run syscalls inside it", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format: pretty or json (overrides GRAPNEL_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    /// Copy log events into this file or directory (overrides GRAPNEL_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Extra C library file-name stem, e.g. `ld-musl-x86_64`
    #[arg(long = "libc-stem", global = true)]
    libc_stems: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the memory mappings of a process
    Maps
    {
        /// Process ID (PID) to inspect
        pid: u32,
    },
    /// Look for an anonymous executable mapping to place code in
    Cave
    {
        pid: u32,
    },
    /// Show where a process's C library is loaded and its entry points
    Libc
    {
        pid: u32,
    },
    /// List the symbols of an ELF file
    Symbols
    {
        /// Path to the ELF file
        path: PathBuf,
        /// Read `.symtab` instead of `.dynsym`
        #[arg(long = "static", default_value_t = false)]
        static_table: bool,
        /// Only print the offset of `main`
        #[arg(long, default_value_t = false, conflicts_with = "static_table")]
        main: bool,
    },
    /// Encode a 5-byte relative jump (or call) between two addresses
    Jump
    {
        /// Address of the branch instruction
        from: Address,
        /// Branch target
        to: Address,
        /// Encode `call rel32` instead of `jmp rel32`
        #[arg(long, default_value_t = false)]
        call: bool,
    },
    /// Read memory from a process
    Peek
    {
        pid: u32,
        /// Start address (hex format: 0x1000 or decimal)
        address: Address,
        /// Number of bytes to read; a multiple of the word size
        #[arg(short, long, default_value_t = 64)]
        length: usize,
    },
    /// Read a NUL-terminated string from a process
    Cstring
    {
        pid: u32,
        address: Address,
        /// Give up after this many bytes
        #[arg(long)]
        max: Option<usize>,
    },
    /// Map a fresh read+execute page inside a process
    Alloc
    {
        pid: u32,
    },
    /// Change the protection of pages inside a process
    Protect
    {
        pid: u32,
        /// Page-aligned start address
        address: Address,
        /// Protection as `rwx` flags, e.g. `r-x` or `rw-`
        prot: String,
        /// Length in bytes (default: one page)
        #[arg(short, long)]
        length: Option<u64>,
    },
    /// Unmap pages inside a process
    Unmap
    {
        pid: u32,
        address: Address,
        #[arg(short, long)]
        length: Option<u64>,
    },
    /// Set a breakpoint, wait until it is hit, then let the process go
    Break
    {
        pid: u32,
        address: Address,
    },
    /// Print the runtime address of `main` in a process
    Main
    {
        pid: u32,
    },
}

fn main()
{
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    if let Some(level) = cli.log_level {
        logging = logging.with_level(level);
    }
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    if let Some(file) = &cli.log_file {
        logging = logging.with_file(file);
    }
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let config = cli
        .libc_stems
        .iter()
        .fold(SessionConfig::default(), |config, stem| config.with_libc_stem(stem.clone()));

    match cli.command {
        Commands::Maps { pid } => {
            for region in MemoryMap::read(ProcessId(pid))?.iter() {
                println!("{region}");
            }
        }
        Commands::Cave { pid } => {
            let map = MemoryMap::read(ProcessId(pid))?;
            match patch::find_cave(&map) {
                Some(cave) => println!("{cave}"),
                None => println!("No candidate found"),
            }
        }
        Commands::Libc { pid } => {
            let libc = LibcResolver::new(config).resolve(ProcessId(pid))?;
            println!("Path:         {}", libc.mapped_path);
            if libc.local_path.as_os_str() != libc.mapped_path.as_str() {
                println!("Opened as:    {}", libc.local_path.display());
            }
            println!("Architecture: {}", libc.arch);
            println!("Base:         {}", libc.base);
            println!("dlopen:       {}", libc.entry_points.dlopen);
            println!("dlclose:      {}", libc.entry_points.dlclose);
            println!("dlsym:        {}", libc.entry_points.dlsym);
            println!("start_main:   {}", libc.entry_points.start_main);
            println!(
                "Syscalls:     mmap={} mprotect={} munmap={}",
                libc.syscalls.mmap, libc.syscalls.mprotect, libc.syscalls.munmap
            );
        }
        Commands::Symbols {
            path,
            static_table,
            main,
        } => {
            if main {
                println!("main: {:#x}", elf::resolve_main_offset(&path)?);
                return Ok(());
            }
            let kind = if static_table { TableKind::Static } else { TableKind::Dynamic };
            let mut file = ElfFile::open(&path)?;
            let tables = file.find_symbol_tables(kind)?;
            let table = file.symbol_table(&tables)?;
            let mut entries: Vec<_> = table.iter().collect();
            entries.sort_by_key(|(name, entry)| (entry.value, *name));
            for (name, entry) in entries {
                println!("{:016x} {:6} {name}", entry.value, entry.size);
            }
        }
        Commands::Jump { from, to, call } => {
            let bytes = if call {
                patch::encode_call(from, to)?
            } else {
                patch::encode_jump(from, to)?
            };
            println!("{}", hex_bytes(&bytes));
        }
        Commands::Peek { pid, address, length } => {
            let bytes = attached(pid, config, move |session| session.peek(address, length))?;
            print!("{}", hexdump(address, &bytes));
        }
        Commands::Cstring { pid, address, max } => {
            let config = match max {
                Some(max) => config.with_max_cstring_len(max),
                None => config,
            };
            let s = attached(pid, config, move |session| session.read_cstring(address))?;
            println!("{s:?}");
        }
        Commands::Alloc { pid } => {
            let page = attached(pid, config, |session| session.allocate_exec_page())?;
            println!("Mapped r-x page at {page}");
        }
        Commands::Protect {
            pid,
            address,
            prot,
            length,
        } => {
            let bits = parse_prot(&prot)?;
            let len = length.unwrap_or_else(grapnel_core::remote::page_size);
            attached(pid, config, move |session| session.protect(address, len, bits))?;
            println!("{address}: {len:#x} bytes now {prot}");
        }
        Commands::Unmap { pid, address, length } => {
            let len = length.unwrap_or_else(grapnel_core::remote::page_size);
            attached(pid, config, move |session| session.unmap(address, len))?;
            println!("Unmapped {len:#x} bytes at {address}");
        }
        Commands::Break { pid, address } => {
            let outcome = attached(pid, config, move |session| {
                info!(%address, "waiting for breakpoint");
                session.run_to(address)
            })?;
            match outcome {
                RunOutcome::Hit { regs, after } => {
                    println!("Hit {address} (sp {})", regs.sp());
                    if after.is_terminal() {
                        println!("Process ended while stepping past the breakpoint: {after}");
                    }
                }
                RunOutcome::Stopped(reason) if reason.is_terminal() => {
                    println!("Process ended before the breakpoint was hit: {reason}");
                }
                RunOutcome::Stopped(reason) => println!("Stopped before the breakpoint: {reason}"),
            }
        }
        Commands::Main { pid } => {
            let main = attached(pid, config, |session| session.main_address())?;
            println!("main: {main}");
        }
    }
    Ok(())
}

/// Run `job` against `pid` on a dedicated tracer thread, then detach.
fn attached<T, F>(pid: u32, config: SessionConfig, job: F) -> GrapnelResult<T>
where
    F: FnOnce(&mut Session<LinuxDebugger>) -> GrapnelResult<T> + Send + 'static,
    T: Send + 'static,
{
    let worker = TraceeWorker::spawn(ProcessId(pid), config)?;
    worker.run(job)
}

/// `rwx`-style flags to `PROT_*` bits.
fn parse_prot(s: &str) -> Result<i32, String>
{
    let flags = s.as_bytes();
    if flags.len() != 3 {
        return Err(format!("protection must look like 'r-x', got '{s}'"));
    }
    let mut prot = libc::PROT_NONE;
    for (flag, (letter, bit)) in flags.iter().zip([(b'r', libc::PROT_READ), (b'w', libc::PROT_WRITE), (b'x', libc::PROT_EXEC)]) {
        match *flag {
            b'-' => {}
            f if f == letter => prot |= bit,
            _ => return Err(format!("protection must look like 'r-x', got '{s}'")),
        }
    }
    Ok(prot)
}

fn hex_bytes(bytes: &[u8]) -> String
{
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn hexdump(start: Address, bytes: &[u8]) -> String
{
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{:016x}  {:<47}  |{ascii}|\n",
            start.value().wrapping_add((row as u64) * 16),
            hex_bytes(chunk)
        ));
    }
    out
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_prot()
    {
        assert_eq!(parse_prot("r-x").unwrap(), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(parse_prot("rw-").unwrap(), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(parse_prot("---").unwrap(), libc::PROT_NONE);
        assert!(parse_prot("x-r").is_err());
        assert!(parse_prot("rwxp").is_err());
    }

    #[test]
    fn test_hexdump_rows()
    {
        let bytes: Vec<u8> = (0x41..0x41 + 20).collect();
        let dump = hexdump(Address::new(0x1000), &bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000000001000  41 42"));
        assert!(lines[0].ends_with("|ABCDEFGHIJKLMNOP|"));
        assert!(lines[1].starts_with("0000000000001010  51 52 53 54"));
        assert!(lines[1].ends_with("|QRST|"));
    }

    #[test]
    fn test_cli_parses_addresses()
    {
        let cli = Cli::try_parse_from(["grapnel", "jump", "0x1000", "0x2000", "--call"]).unwrap();
        match cli.command {
            Commands::Jump { from, to, call } => {
                assert_eq!(from, Address::new(0x1000));
                assert_eq!(to, Address::new(0x2000));
                assert!(call);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["grapnel", "--log-level", "debug", "peek", "42", "4096", "-l", "16"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert!(matches!(cli.command, Commands::Peek { pid: 42, length: 16, .. }));
    }

    #[test]
    fn test_jump_bytes()
    {
        let bytes = patch::encode_jump(Address::new(0x1000), Address::new(0x2000)).unwrap();
        assert_eq!(hex_bytes(&bytes), "e9 fb 0f 00 00");
    }
}
