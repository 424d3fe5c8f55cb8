//! Tracee address type.

use std::fmt;
use std::num::ParseIntError;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// An address inside the tracee's virtual address space
///
/// Addresses handed out by this crate always refer to the *remote* process,
/// never to the host. Keeping them in a newtype stops them from being mixed
/// up with sizes, offsets, or host pointers.
///
/// The `+` and `-` operators overflow like the integer operators do (a
/// panic in debug builds). Offsets read from a file or another process go
/// through [`Address::checked_add`] instead.
///
/// ## Example
///
/// ```rust
/// use grapnel_core::types::Address;
///
/// let base = Address::new(0x7f00_0000_0000);
/// let sym = base + 0x1234;
/// assert_eq!(sym.value(), 0x7f00_0000_1234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address.
    pub const ZERO: Self = Address(0);

    /// Create an address from a raw value (usable in const contexts).
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw numeric value.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, returning `None` on overflow.
    ///
    /// ```rust
    /// use grapnel_core::types::Address;
    ///
    /// assert_eq!(Address::new(0x1000).checked_add(0x10), Some(Address::new(0x1010)));
    /// assert_eq!(Address::new(1).checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, returning `None` on underflow.
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Round down to a multiple of `align` (which must be a power of two).
    pub const fn align_down(self, align: u64) -> Self
    {
        Address(self.0 & !(align - 1))
    }

    /// Whether the address is a multiple of `align` (a power of two).
    pub const fn is_aligned(self, align: u64) -> bool
    {
        self.0 & (align - 1) == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl FromStr for Address
{
    type Err = ParseIntError;

    /// Parses `0x`-prefixed hex or plain decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).map(Address),
            None => s.parse::<u64>().map(Address),
        }
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0 + rhs)
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0 - rhs)
    }
}

impl Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, rhs: Address) -> Self::Output
    {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_hex_and_decimal()
    {
        assert_eq!("0x1000".parse::<Address>().unwrap(), Address::new(0x1000));
        assert_eq!("4096".parse::<Address>().unwrap(), Address::new(0x1000));
        assert!("0xzz".parse::<Address>().is_err());
    }

    #[test]
    fn test_checked_offsets()
    {
        let top = Address::new(u64::MAX - 7);
        assert_eq!(top.checked_add(7), Some(Address::new(u64::MAX)));
        assert_eq!(top.checked_add(8), None);
        assert_eq!(Address::new(4).checked_sub(5), None);
        assert_eq!(Address::new(0x1010) - Address::new(0x1000), 0x10);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_operator_overflow_is_not_silent()
    {
        let _ = Address::new(u64::MAX) + 1;
    }

    #[test]
    fn test_alignment()
    {
        let addr = Address::new(0x7f12_3456_7abc);
        assert_eq!(addr.align_down(0x1000), Address::new(0x7f12_3456_7000));
        assert!(!addr.is_aligned(0x1000));
        assert!(addr.align_down(0x1000).is_aligned(0x1000));
    }

    #[test]
    fn test_display_is_zero_padded()
    {
        assert_eq!(Address::new(0xdead).to_string(), "0x000000000000dead");
    }
}
