//! Helper process for the live tracing tests.
//!
//! Prints its pid and a few addresses, one `key=value` per line, then
//! `ready`. It then blocks until a line arrives on stdin, calls
//! `grapnel_tracee_marker`, and exits with status 0.

#![forbid(unsafe_code)]

use std::hint::black_box;
use std::io::{self, BufRead, Write};

static GREETING: &[u8] = b"hello from grapnel-tracee\0";

#[inline(never)]
fn grapnel_tracee_marker(value: u64) -> u64
{
    black_box(value.wrapping_add(1))
}

fn main() -> io::Result<()>
{
    let buffer = black_box(vec![0u8; 64]);
    let marker: fn(u64) -> u64 = grapnel_tracee_marker;

    {
        let mut out = io::stdout().lock();
        writeln!(out, "pid={}", std::process::id())?;
        writeln!(out, "marker={:#x}", marker as usize)?;
        writeln!(out, "buffer={:#x}", buffer.as_ptr() as usize)?;
        writeln!(out, "cstring={:#x}", GREETING.as_ptr() as usize)?;
        writeln!(out, "ready")?;
        out.flush()?;
    }

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let result = black_box(marker)(black_box(41));
    black_box(&buffer);
    if result == 42 {
        Ok(())
    } else {
        std::process::exit(1)
    }
}
