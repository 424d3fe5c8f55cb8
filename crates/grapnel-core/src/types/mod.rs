//! # Types
//!
//! Value types shared by every layer: addresses, process identity, tracee
//! state, register snapshots, mapping entries, and architecture tags.

pub mod address;
pub mod arch;
pub mod process;
pub mod region;
pub mod registers;

pub use address::Address;
pub use arch::Architecture;
pub use process::{ProcessId, StopReason, TraceeState};
pub use region::{MemoryRegion, MemoryRegionId, Permissions};
pub use registers::{Registers, Word, X86_64Register, WORD_SIZE};
