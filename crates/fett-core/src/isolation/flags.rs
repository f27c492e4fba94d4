//! Clone and mount flag vocabulary
//!
//! The bit values are the host kernel's; this module only adds the checks
//! needed at the raw-integer boundary.
//!
//! `nix` leaves `CLONE_SETTLS`, `CLONE_PARENT_SETTID`, `CLONE_CHILD_SETTID`
//! and `CLONE_CHILD_CLEARTID` out of [`CloneFlags`]. A raw word carrying one
//! of them is therefore refused by [`decode_clone_flags`] as unknown bits;
//! [`POINTER_FLAGS`] catches typed sets built with `from_bits_retain`.

use crate::{FettError, Result};
use libc::c_int;

pub use nix::mount::{MntFlags, MsFlags};
pub use nix::sched::CloneFlags;
pub use nix::sys::signal::Signal;

/// Low byte of a raw clone flag word, holding the exit signal (`CSIGNAL`)
pub const EXIT_SIGNAL_MASK: c_int = 0xff;

/// Flags whose kernel semantics need pointer arguments `spawn` never passes
pub const POINTER_FLAGS: CloneFlags = CloneFlags::from_bits_retain(
    libc::CLONE_SETTLS
        | libc::CLONE_PARENT_SETTID
        | libc::CLONE_CHILD_SETTID
        | libc::CLONE_CHILD_CLEARTID,
);

/// Split a raw `clone(2)` flag word into typed flags and the exit signal.
///
/// Every bit above the signal byte must be a known clone flag. The signal is
/// returned as a raw number (0 for none) so real-time signals survive.
pub fn decode_clone_flags(raw: c_int) -> Result<(CloneFlags, c_int)> {
    let flag_bits = raw & !EXIT_SIGNAL_MASK;
    let flags = CloneFlags::from_bits(flag_bits).ok_or_else(|| {
        FettError::argument(
            "clone",
            format!("unknown clone flag bits {:#x}", flag_bits & !CloneFlags::all().bits()),
        )
    })?;

    let signal = raw & EXIT_SIGNAL_MASK;
    check_exit_signal(signal)?;
    Ok((flags, signal))
}

/// Accept 0 (no signal) or any signal number up to `SIGRTMAX`
pub fn check_exit_signal(signo: c_int) -> Result<()> {
    if signo == 0 || (1..=libc::SIGRTMAX()).contains(&signo) {
        Ok(())
    } else {
        Err(FettError::argument("clone", format!("invalid exit signal {signo}")))
    }
}

/// Combine typed flags and a raw exit signal into the word `clone(2)` expects
#[must_use]
pub fn encode_clone_flags(flags: CloneFlags, exit_signal: c_int) -> c_int {
    flags.bits() | (exit_signal & EXIT_SIGNAL_MASK)
}

/// Reject flag sets `spawn` cannot honour without extra arguments
pub(crate) fn check_spawn_flags(flags: CloneFlags) -> Result<()> {
    let unsupported = flags & POINTER_FLAGS;
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(FettError::argument(
            "clone",
            format!("{unsupported:?} require tid/tls pointers, which spawn does not take"),
        ))
    }
}

/// Parse raw `unshare(2)` flags; no signal byte is allowed here
pub fn decode_unshare_flags(raw: c_int) -> Result<CloneFlags> {
    CloneFlags::from_bits(raw).ok_or_else(|| {
        FettError::argument("unshare", format!("unknown flag bits in {raw:#x}"))
    })
}

/// Parse raw `mount(2)` flags
pub fn decode_mount_flags(raw: libc::c_ulong) -> Result<MsFlags> {
    MsFlags::from_bits(raw).ok_or_else(|| {
        FettError::argument("mount", format!("unknown mount flag bits in {raw:#x}"))
    })
}
