//! # grapnel-core
//!
//! A small ptrace-based process instrumentation engine for Linux.
//!
//! This crate provides:
//! - Memory map parsing (`/proc/<pid>/maps`) and code cave search
//! - ELF header, section, and symbol decoding for 32- and 64-bit images
//! - Resolution of a tracee's C library: load bias, entry points, syscall numbers
//! - Process attachment, register and word-granular memory access
//! - Software breakpoints
//! - Remote syscalls (`mmap`, `mprotect`, `munmap`) executed inside the tracee
//! - Relative branch encoding for code patching
//!
//! ## Layering
//!
//! ```text
//! maps, elf  ->  libc  ->  debugger (platform::linux)  ->  breakpoints, remote, patch  ->  session
//! ```
//!
//! Nothing depends on a layer to its right.
//!
//! ## Threading
//!
//! The kernel binds a tracee to the thread that attached to it.
//! [`LinuxDebugger`] is therefore `!Send` and rejects calls from other
//! threads; [`TraceeWorker`] runs a [`Session`] on a dedicated thread for
//! callers that need to drive it from elsewhere.
//!
//! All kernel access goes through `nix`'s safe wrappers, so the crate itself
//! contains no `unsafe` code.

#![forbid(unsafe_code)]

pub mod breakpoints;
pub mod config;
pub mod debugger;
pub mod elf;
pub mod error;
pub mod libc;
pub mod maps;
pub mod patch;
pub mod platform;
pub mod remote;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use debugger::Debugger;
pub use error::{GrapnelError, Result};
#[cfg(target_os = "linux")]
pub use platform::linux::LinuxDebugger;
pub use session::{RunOutcome, Session};
#[cfg(target_os = "linux")]
pub use session::TraceeWorker;
pub use types::{Address, ProcessId, Registers, StopReason};
