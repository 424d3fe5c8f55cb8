//! Build script for grapnel-core
//!
//! Checks system requirements before compilation:
//! - Minimum Rust version (Edition 2021 = Rust 1.56.0+)
//! - Target operating system (the tracing backend is Linux-only)
//!
//! ## Requirements
//!
//! - **Rust**: Edition 2021 (Rust 1.56.0 or newer)
//! - **Linux**: any kernel with `ptrace(2)` and `/proc/<pid>/maps`

use std::env;

fn main()
{
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 56, 0);

        if rustc_version < min_rust_version {
            panic!(
                "grapnel-core requires Rust {} or newer (Edition 2021), found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        println!("cargo:warning=could not verify Rust version");
    }

    // CARGO_CFG_* describes the target, not the host running this script
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!(
            "cargo:warning=grapnel-core targets Linux; building for '{target_os}' leaves only the ELF and patch utilities usable"
        );
    }

    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_os == "linux" && target_arch != "x86_64" {
        println!("cargo:warning=remote syscalls and breakpoints are only implemented for x86_64 hosts (found '{target_arch}')");
    }
}
