//! Per-session configuration.
//!
//! Everything that would otherwise be a process-wide setting lives here and is
//! passed to the session at construction, so several sessions with different
//! settings can coexist in one host process.

/// Knobs for one tracing session
///
/// ## Example
///
/// ```rust
/// use grapnel_core::config::SessionConfig;
///
/// let config = SessionConfig::default()
///     .with_max_cstring_len(256)
///     .with_libc_stem("ld-musl-x86_64");
/// assert!(config.is_libc_file_name("libc.so.6"));
/// assert!(config.is_libc_file_name("ld-musl-x86_64.so.1"));
/// assert!(!config.is_libc_file_name("libcrypto.so.3"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// File-name stems that identify the C library (`libc` matches
    /// `libc.so`, `libc.so.6`, and `libc-2.31.so`).
    pub libc_stems: Vec<String>,
    /// Path component used to retry a library path relative to a container
    /// root when the direct path cannot be opened.
    pub container_root_marker: String,
    /// Default upper bound for C string reads, in bytes.
    pub max_cstring_len: usize,
    /// Ask the kernel to report `execve` in the tracee as a distinct stop.
    pub trace_exec: bool,
    /// Check addresses against the live memory map before session-level
    /// peeks and pokes.
    pub check_mappings: bool,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            libc_stems: vec!["libc".to_string()],
            container_root_marker: "/rootfs/".to_string(),
            max_cstring_len: 4096,
            trace_exec: true,
            check_mappings: true,
        }
    }
}

impl SessionConfig
{
    /// Add another C library file-name stem.
    #[must_use]
    pub fn with_libc_stem(mut self, stem: impl Into<String>) -> Self
    {
        self.libc_stems.push(stem.into());
        self
    }

    #[must_use]
    pub fn with_container_root_marker(mut self, marker: impl Into<String>) -> Self
    {
        self.container_root_marker = marker.into();
        self
    }

    #[must_use]
    pub fn with_max_cstring_len(mut self, max: usize) -> Self
    {
        self.max_cstring_len = max;
        self
    }

    #[must_use]
    pub fn with_trace_exec(mut self, enabled: bool) -> Self
    {
        self.trace_exec = enabled;
        self
    }

    #[must_use]
    pub fn with_check_mappings(mut self, enabled: bool) -> Self
    {
        self.check_mappings = enabled;
        self
    }

    /// Whether a mapping's file name names the C library.
    ///
    /// `name` is the last path component; a trailing ` (deleted)` marker is
    /// ignored so that deleted libraries are still recognised (and reported
    /// as such by the resolver).
    pub fn is_libc_file_name(&self, name: &str) -> bool
    {
        let name = name.strip_suffix(" (deleted)").unwrap_or(name);
        self.libc_stems.iter().any(|stem| matches_stem(name, stem))
    }
}

fn is_version(s: &str) -> bool
{
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

fn matches_stem(name: &str, stem: &str) -> bool
{
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };

    // libc.so / libc.so.6
    if let Some(after) = rest.strip_prefix(".so") {
        return after.is_empty() || after.strip_prefix('.').is_some_and(is_version);
    }

    // libc-2.31.so
    rest.strip_prefix('-')
        .and_then(|r| r.strip_suffix(".so"))
        .is_some_and(is_version)
}
