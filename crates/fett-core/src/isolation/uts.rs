//! Hostname inside the UTS namespace

use crate::{FettError, Result};
use std::ffi::{OsStr, OsString};

/// Set the hostname seen by the caller's UTS namespace.
///
/// The name is passed byte for byte with its exact length; the kernel
/// enforces the maximum (64 bytes on Linux) and the privilege check.
pub fn set_hostname(name: impl AsRef<OsStr>) -> Result<()> {
    let name = name.as_ref();
    tracing::debug!(hostname = ?name, "setting hostname");
    nix::unistd::sethostname(name)
        .map_err(|errno| FettError::os_at("sethostname", name.to_string_lossy(), errno))
}

/// Current hostname of the caller's UTS namespace
pub fn hostname() -> Result<OsString> {
    nix::unistd::gethostname().map_err(|errno| FettError::os("gethostname", errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_current_hostname() {
        let name = hostname().unwrap();
        assert!(name.len() <= 64);
    }
}
