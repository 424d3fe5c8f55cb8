//! Process memory maps from `/proc/<pid>/maps`.
//!
//! A [`MemoryMap`] is a snapshot: it is rebuilt on every [`MemoryMap::read`]
//! and never cached across an exec of the tracee.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::{GrapnelError, Result};
use crate::types::{Address, MemoryRegion, MemoryRegionId, Permissions, ProcessId};

/// Ordered list of a process's mappings, lowest address first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap
{
    regions: Vec<MemoryRegion>,
}

impl MemoryMap
{
    /// Read and parse `/proc/<pid>/maps`.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the proc entry does not exist (process exited)
    /// - `FileOpen`: any other failure to read the file
    pub fn read(pid: ProcessId) -> Result<Self>
    {
        let path = PathBuf::from(format!("/proc/{}/maps", pid.0));
        let content = fs::read_to_string(&path).map_err(|source| proc_error(pid, path, source))?;
        let map = Self::parse(&content);
        debug!(pid = pid.0, regions = map.len(), "read memory map");
        Ok(map)
    }

    /// Parse the text of a maps file. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self
    {
        let regions = content
            .lines()
            .filter_map(|line| {
                let region = parse_line(line);
                if region.is_none() && !line.trim().is_empty() {
                    trace!(line, "skipping unparseable maps line");
                }
                region
            })
            .enumerate()
            .map(|(idx, mut region)| {
                region.id = MemoryRegionId(idx);
                region
            })
            .collect();
        Self { regions }
    }

    pub fn regions(&self) -> &[MemoryRegion]
    {
        &self.regions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRegion>
    {
        self.regions.iter()
    }

    pub fn len(&self) -> usize
    {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.regions.is_empty()
    }

    /// First mapping whose backing path contains `needle`.
    pub fn find_by_path(&self, needle: &str) -> Option<&MemoryRegion>
    {
        self.regions
            .iter()
            .find(|r| r.path.as_deref().is_some_and(|p| p.contains(needle)))
    }

    /// First mapping whose path satisfies `predicate`.
    pub fn find_by(&self, mut predicate: impl FnMut(&MemoryRegion) -> bool) -> Option<&MemoryRegion>
    {
        self.regions.iter().find(|r| predicate(r))
    }

    /// Mapping containing `addr`, if any.
    pub fn region_containing(&self, addr: Address) -> Option<&MemoryRegion>
    {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Whether `addr` is mapped at all.
    pub fn contains(&self, addr: Address) -> bool
    {
        self.region_containing(addr).is_some()
    }

    /// Whether `[addr, addr + len)` is covered by mappings with no gap.
    pub fn contains_range(&self, addr: Address, len: u64) -> bool
    {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cursor = addr;
        while cursor < end {
            match self.region_containing(cursor) {
                Some(region) => cursor = region.end,
                None => return false,
            }
        }
        true
    }

    /// Load bias of the image backed by `file`.
    ///
    /// Uses the first executable mapping whose path contains `file` and
    /// returns `start - offset`, which is where file offset zero is mapped.
    pub fn base_address(&self, file: &str) -> Option<Address>
    {
        self.regions
            .iter()
            .find(|r| r.is_executable() && r.path.as_deref().is_some_and(|p| p.contains(file)))
            .and_then(MemoryRegion::load_bias)
    }

    /// Start of the main image: the first read-only private mapping.
    pub fn image_base(&self) -> Option<Address>
    {
        self.regions
            .iter()
            .find(|r| {
                let p = r.permissions;
                p.read && !p.write && !p.execute && p.private
            })
            .map(|r| r.start)
    }

    /// Heuristic search for unused executable space.
    ///
    /// Returns the first readable, executable, private mapping that has no
    /// path and whose device reads `00:00`. This is a proxy for "anonymous";
    /// some kernels report anonymous memory with a real device, and nothing
    /// here proves the region is unused. Callers must treat the result as a
    /// candidate only.
    pub fn find_cave(&self) -> Option<&MemoryRegion>
    {
        self.regions.iter().find(|r| {
            let p = r.permissions;
            p.read && p.execute && p.private && r.path.is_none() && r.has_placeholder_device()
        })
    }
}

impl<'a> IntoIterator for &'a MemoryMap
{
    type Item = &'a MemoryRegion;
    type IntoIter = std::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.regions.iter()
    }
}

/// Path of the executable behind `/proc/<pid>/exe`.
pub fn exe_path(pid: ProcessId) -> Result<PathBuf>
{
    let link = PathBuf::from(format!("/proc/{}/exe", pid.0));
    fs::read_link(&link).map_err(|source| proc_error(pid, link, source))
}

fn proc_error(pid: ProcessId, path: PathBuf, source: io::Error) -> GrapnelError
{
    if source.kind() == io::ErrorKind::NotFound {
        GrapnelError::ProcessNotFound(pid.0)
    } else {
        GrapnelError::FileOpen { path, source }
    }
}

fn parse_line(line: &str) -> Option<MemoryRegion>
{
    // 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345      /lib/libc.so.6
    let mut parts = line.splitn(6, ' ');

    let (start, end) = parts.next()?.split_once('-')?;
    let permissions = Permissions::parse(parts.next()?)?;
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let device = parts.next()?.to_string();
    let inode = parts.next()?.parse::<u64>().ok()?;
    let path = parts
        .next()
        .map(str::trim_start)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string);

    let start = Address::new(u64::from_str_radix(start, 16).ok()?);
    let end = Address::new(u64::from_str_radix(end, 16).ok()?);
    if end < start {
        return None;
    }

    Some(MemoryRegion {
        id: MemoryRegionId(0),
        start,
        end,
        permissions,
        offset,
        device,
        inode,
        path,
    })
}
