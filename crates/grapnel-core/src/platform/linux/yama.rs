//! Yama LSM ptrace restrictions.
//!
//! When Yama is built in, `/proc/sys/kernel/yama/ptrace_scope` decides who
//! may attach to whom. Scope 1 (the common distribution default) only allows
//! tracing descendants, which is the usual reason attaching to an unrelated
//! process fails with `EPERM`.

use std::fmt;
use std::fs;

use tracing::debug;

/// Location of the Yama sysctl.
pub const PTRACE_SCOPE_PATH: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Value of `kernel.yama.ptrace_scope`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtraceScope
{
    /// 0: any process with the same uid may be traced.
    Classic,
    /// 1: only descendants (or processes that opted in via `PR_SET_PTRACER`).
    Restricted,
    /// 2: only with `CAP_SYS_PTRACE`.
    AdminOnly,
    /// 3: attaching is disabled until reboot.
    NoAttach,
}

impl PtraceScope
{
    /// Parse the sysctl content.
    pub fn parse(content: &str) -> Option<Self>
    {
        match content.trim() {
            "0" => Some(PtraceScope::Classic),
            "1" => Some(PtraceScope::Restricted),
            "2" => Some(PtraceScope::AdminOnly),
            "3" => Some(PtraceScope::NoAttach),
            _ => None,
        }
    }

    /// What the scope requires of a tracer attaching with `PTRACE_ATTACH`.
    pub const fn requirement(self) -> &'static str
    {
        match self {
            PtraceScope::Classic => "same uid",
            PtraceScope::Restricted => "tracee must be a descendant or set PR_SET_PTRACER",
            PtraceScope::AdminOnly => "CAP_SYS_PTRACE required",
            PtraceScope::NoAttach => "attaching disabled until reboot",
        }
    }

    const fn value(self) -> u8
    {
        match self {
            PtraceScope::Classic => 0,
            PtraceScope::Restricted => 1,
            PtraceScope::AdminOnly => 2,
            PtraceScope::NoAttach => 3,
        }
    }
}

impl fmt::Display for PtraceScope
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "yama ptrace_scope={} ({})", self.value(), self.requirement())
    }
}

/// Current Yama scope, or `None` when Yama is not active.
pub fn ptrace_scope() -> Option<PtraceScope>
{
    match fs::read_to_string(PTRACE_SCOPE_PATH) {
        Ok(content) => PtraceScope::parse(&content),
        Err(err) => {
            debug!(error = %err, "yama ptrace_scope unavailable");
            None
        }
    }
}
