//! # Patch Helpers
//!
//! Encoding of 5-byte relative `jmp`/`call` instructions and the search for
//! code caves, for callers that inject code into a tracee.
//!
//! A relative branch stores a signed 32-bit displacement measured from the
//! address right after the instruction:
//!
//! ```text
//! from:      E9 xx xx xx xx      ; jmp rel32
//! from + 5:  ...                 ; displacement origin
//! ```

use std::fmt;

use crate::error::{GrapnelError, Result};
use crate::maps::MemoryMap;
use crate::types::Address;

/// Length of a `jmp rel32` / `call rel32` instruction.
pub const RELATIVE_BRANCH_LEN: u64 = 5;

const JMP_REL32: u8 = 0xE9;
const CALL_REL32: u8 = 0xE8;

/// Displacement for a 5-byte relative branch at `from` targeting `to`.
///
/// ## Errors
///
/// `DisplacementOutOfRange` when `to - from - 5` does not fit in an `i32`;
/// the value is never truncated.
///
/// ## Example
///
/// ```rust
/// use grapnel_core::patch::compute_relative_jump;
/// use grapnel_core::types::Address;
///
/// assert_eq!(compute_relative_jump(Address::new(0x1000), Address::new(0x2000))?, 0xFFB);
/// assert!(compute_relative_jump(Address::new(0), Address::new(0x7FFF_FFFF + 10)).is_err());
/// # Ok::<(), grapnel_core::error::GrapnelError>(())
/// ```
pub fn compute_relative_jump(from: Address, to: Address) -> Result<i32>
{
    let displacement = i128::from(to.value()) - i128::from(from.value()) - i128::from(RELATIVE_BRANCH_LEN);
    i32::try_from(displacement).map_err(|_| GrapnelError::DisplacementOutOfRange {
        from: from.value(),
        to: to.value(),
    })
}

/// `jmp rel32` placed at `from`, landing on `to`.
pub fn encode_jump(from: Address, to: Address) -> Result<[u8; 5]>
{
    encode(JMP_REL32, from, to)
}

/// `call rel32` placed at `from`, calling `to`.
pub fn encode_call(from: Address, to: Address) -> Result<[u8; 5]>
{
    encode(CALL_REL32, from, to)
}

fn encode(opcode: u8, from: Address, to: Address) -> Result<[u8; 5]>
{
    let rel = compute_relative_jump(from, to)?.to_le_bytes();
    Ok([opcode, rel[0], rel[1], rel[2], rel[3]])
}

/// An executable, file-less mapping that *may* be unused
///
/// Produced by a heuristic (see [`find_cave`]); nothing guarantees the
/// region is free. Verify before writing into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveCandidate
{
    pub start: Address,
    pub end: Address,
}

impl CaveCandidate
{
    pub fn size(&self) -> u64
    {
        self.end - self.start
    }
}

impl fmt::Display for CaveCandidate
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}-{} ({} bytes, unverified)", self.start, self.end, self.size())
    }
}

/// Look for a code cave in `map`.
///
/// Delegates to [`MemoryMap::find_cave`]: the first private `r-x` mapping
/// with no pathname whose device reads `00:00`. The device test is a proxy
/// for "anonymous"; kernels are not obliged to report anonymous memory that
/// way, and a match may still be in use (JIT output, for instance). Treat the
/// result as a candidate only.
pub fn find_cave(map: &MemoryMap) -> Option<CaveCandidate>
{
    map.find_cave().map(|region| CaveCandidate {
        start: region.start,
        end: region.end,
    })
}
