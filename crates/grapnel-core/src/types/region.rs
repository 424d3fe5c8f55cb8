//! Memory mapping entries as reported by `/proc/<pid>/maps`.

use std::fmt;

use super::Address;

/// Index of a region within the map it was parsed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegionId(pub usize);

impl MemoryRegionId
{
    /// Raw index value.
    pub fn value(self) -> usize
    {
        self.0
    }
}

/// Access bits of a mapping (the `rwxp` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions
{
    /// `r`
    pub read: bool,
    /// `w`
    pub write: bool,
    /// `x`
    pub execute: bool,
    /// `p` (copy-on-write) as opposed to `s` (shared)
    pub private: bool,
}

impl Permissions
{
    /// Parse the four-character permission field.
    ///
    /// Returns `None` unless the field is exactly four characters drawn from
    /// the positions `r`/`-`, `w`/`-`, `x`/`-`, `p`/`s`.
    ///
    /// ```rust
    /// use grapnel_core::types::Permissions;
    ///
    /// let perms = Permissions::parse("r-xp").unwrap();
    /// assert!(perms.read && perms.execute && perms.private && !perms.write);
    /// assert!(Permissions::parse("rw").is_none());
    /// ```
    pub fn parse(field: &str) -> Option<Self>
    {
        let bytes = field.as_bytes();
        if bytes.len() != 4 {
            return None;
        }

        let flag = |byte: u8, set: u8| match byte {
            b if b == set => Some(true),
            b'-' => Some(false),
            _ => None,
        };

        let private = match bytes[3] {
            b'p' => true,
            b's' => false,
            _ => return None,
        };

        Some(Self {
            read: flag(bytes[0], b'r')?,
            write: flag(bytes[1], b'w')?,
            execute: flag(bytes[2], b'x')?,
            private,
        })
    }
}

impl fmt::Display for Permissions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
        )
    }
}

/// One line of a process's memory map
///
/// Covers `[start, end)`. `offset` is the file offset the mapping starts at,
/// which is what turns a segment's start address into the image's load bias.
///
/// ```rust
/// use grapnel_core::types::{Address, MemoryRegion, MemoryRegionId, Permissions};
///
/// let text = MemoryRegion {
///     id: MemoryRegionId(0),
///     start: Address::new(0x7f00_0002_8000),
///     end: Address::new(0x7f00_001b_d000),
///     permissions: Permissions::parse("r-xp").unwrap(),
///     offset: 0x28000,
///     device: "08:01".to_string(),
///     inode: 1_234_567,
///     path: Some("/usr/lib/x86_64-linux-gnu/libc.so.6".to_string()),
/// };
/// assert_eq!(text.load_bias(), Some(Address::new(0x7f00_0000_0000)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Position in the parsed map.
    pub id: MemoryRegionId,
    /// First address (inclusive).
    pub start: Address,
    /// End address (exclusive).
    pub end: Address,
    /// Access bits.
    pub permissions: Permissions,
    /// Offset into the backing file.
    pub offset: u64,
    /// `major:minor` of the backing device; `00:00` for anonymous mappings.
    pub device: String,
    /// Inode of the backing file, 0 when anonymous.
    pub inode: u64,
    /// Backing path or pseudo-name (`[heap]`, `[stack]`, ...), if any.
    pub path: Option<String>,
}

impl MemoryRegion
{
    /// Size in bytes.
    pub fn size(&self) -> u64
    {
        self.end - self.start
    }

    /// Whether `addr` falls inside `[start, end)`.
    pub fn contains(&self, addr: Address) -> bool
    {
        addr >= self.start && addr < self.end
    }

    /// `start - offset`: where file offset 0 of the backing image would sit.
    ///
    /// `None` when the offset exceeds the start address.
    pub fn load_bias(&self) -> Option<Address>
    {
        self.start.checked_sub(self.offset)
    }

    pub fn is_readable(&self) -> bool
    {
        self.permissions.read
    }

    pub fn is_writable(&self) -> bool
    {
        self.permissions.write
    }

    pub fn is_executable(&self) -> bool
    {
        self.permissions.execute
    }

    /// Device field reads `00:00`.
    ///
    /// This is how the kernel usually reports mappings without a backing
    /// file, but some anonymous mappings (e.g. on overlay or DAX setups) can
    /// show a real device. Treat it as a hint only.
    pub fn has_placeholder_device(&self) -> bool
    {
        self.device == "00:00"
    }

    /// The backing file was unlinked after being mapped.
    pub fn is_deleted(&self) -> bool
    {
        self.path.as_deref().is_some_and(|p| p.ends_with(" (deleted)"))
    }
}

impl fmt::Display for MemoryRegion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {} {}",
            self.start,
            self.end,
            self.permissions,
            self.offset,
            self.device,
            self.inode
        )?;
        if let Some(path) = &self.path {
            write!(f, " {path}")?;
        }
        Ok(())
    }
}
