//! # Platform-Specific Implementations
//!
//! Backends implementing the [`Debugger`](crate::Debugger) trait with a
//! platform's native tracing interface.
//!
//! - **Linux**: `ptrace(2)` and `waitpid(2)` through `nix`
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! Everything above this module (maps parsing aside) is platform-neutral and
//! only talks to the trait.

#[cfg(target_os = "linux")]
pub mod linux;
