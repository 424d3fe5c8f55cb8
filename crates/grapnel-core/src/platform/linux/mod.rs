//! Linux implementation of the [`Debugger`](crate::Debugger) trait.
//!
//! - [`ptrace`]: the `ptrace(2)`/`waitpid(2)` backed [`LinuxDebugger`]
//! - [`wait`]: wait-status decoding and reporting
//! - [`yama`]: the Yama LSM scope, used to explain refused attaches

pub mod ptrace;
pub mod wait;
pub mod yama;

pub use ptrace::LinuxDebugger;
pub use yama::{ptrace_scope, PtraceScope};
