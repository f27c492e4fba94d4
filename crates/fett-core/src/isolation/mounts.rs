//! Filesystem mounting and unmounting

use crate::{FettError, Result};
use nix::mount::{MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Everything `mount(2)` needs for one attach.
///
/// Descriptors are transient: nothing records what has been mounted, so the
/// caller keeps the target around to unmount it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Source device, directory or pseudo name (`overlay`, `tmpfs`)
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Existing directory to mount on
    pub target: PathBuf,
    /// Filesystem type tag
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Mount flags, stored as the kernel bit value
    #[serde(default = "MsFlags::empty", with = "ms_flags_bits")]
    pub flags: MsFlags,
    /// Filesystem specific option string
    #[serde(default)]
    pub data: Option<String>,
}

impl MountDescriptor {
    /// Overlay of `lowerdirs` (topmost first) under a writable `upperdir`
    pub fn overlay(
        lowerdirs: &[impl AsRef<Path>],
        upperdir: impl AsRef<Path>,
        workdir: impl AsRef<Path>,
        target: impl Into<PathBuf>,
    ) -> Result<Self> {
        if lowerdirs.is_empty() {
            return Err(FettError::argument("mount", "overlay needs at least one lowerdir"));
        }

        let mut lowers = Vec::with_capacity(lowerdirs.len());
        for dir in lowerdirs {
            lowers.push(overlay_option_path(dir.as_ref())?);
        }
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            overlay_option_path(upperdir.as_ref())?,
            overlay_option_path(workdir.as_ref())?,
        );

        Ok(Self {
            source: Some(PathBuf::from("overlay")),
            target: target.into(),
            fs_type: Some("overlay".into()),
            flags: MsFlags::empty(),
            data: Some(data),
        })
    }

    /// Recursive bind mount of `source` onto `target`
    #[must_use]
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            target: target.into(),
            fs_type: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_REC,
            data: None,
        }
    }

    /// Remount an existing bind mount read-only
    #[must_use]
    pub fn remount_read_only(target: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            target: target.into(),
            fs_type: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            data: None,
        }
    }

    /// tmpfs limited to `size_bytes`
    #[must_use]
    pub fn tmpfs(target: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            source: Some(PathBuf::from("tmpfs")),
            target: target.into(),
            fs_type: Some("tmpfs".into()),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: Some(format!("size={size_bytes}")),
        }
    }

    /// Add flags to the descriptor
    #[must_use]
    pub fn with_flags(mut self, flags: MsFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Attach this filesystem
    pub fn mount(&self) -> Result<()> {
        mount(
            self.source.as_deref(),
            &self.target,
            self.fs_type.as_deref().map(OsStr::new),
            self.flags,
            self.data.as_deref().map(OsStr::new),
        )
    }

    /// Detach whatever is mounted on this descriptor's target
    pub fn unmount(&self) -> Result<()> {
        umount(&self.target)
    }
}

/// Attach a filesystem at `target` in the caller's mount namespace.
///
/// `target` must already exist. No mount state is tracked: pair every
/// successful call with exactly one [`umount`] of the same target.
/// `fs_type` and `data` are passed to the kernel as raw bytes.
pub fn mount(
    source: Option<&Path>,
    target: impl AsRef<Path>,
    fs_type: Option<&OsStr>,
    flags: MsFlags,
    data: Option<&OsStr>,
) -> Result<()> {
    let target = target.as_ref();

    if let Some(source) = source {
        check_nul("mount", "source", source.as_os_str())?;
    }
    check_nul("mount", "target", target.as_os_str())?;
    if let Some(fs_type) = fs_type {
        check_nul("mount", "fs_type", fs_type)?;
    }
    if let Some(data) = data {
        check_nul("mount", "data", data)?;
    }

    tracing::debug!(?source, ?target, ?fs_type, ?flags, ?data, "mount");

    nix::mount::mount(source, target, fs_type, flags, data)
        .map_err(|errno| FettError::os_at("mount", target.display().to_string(), errno))
}

/// Detach the filesystem mounted at `target`
pub fn umount(target: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    check_nul("umount", "target", target.as_os_str())?;

    tracing::debug!(?target, "umount");

    nix::mount::umount(target)
        .map_err(|errno| FettError::os_at("umount", target.display().to_string(), errno))
}

/// Detach with `umount2(2)` flags such as `MNT_DETACH` or `MNT_FORCE`
pub fn umount2(target: impl AsRef<Path>, flags: MntFlags) -> Result<()> {
    let target = target.as_ref();
    check_nul("umount2", "target", target.as_os_str())?;

    tracing::debug!(?target, ?flags, "umount2");

    nix::mount::umount2(target, flags)
        .map_err(|errno| FettError::os_at("umount2", target.display().to_string(), errno))
}

fn check_nul(op: &'static str, what: &str, value: &OsStr) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(FettError::argument(
            op,
            format!("{what} {value:?} contains a NUL byte"),
        ));
    }
    Ok(())
}

// Overlay options are split on ',' and lowerdir on ':'
fn overlay_option_path(path: &Path) -> Result<String> {
    let s = path.to_str().ok_or_else(|| {
        FettError::argument("mount", format!("overlay path {} is not UTF-8", path.display()))
    })?;
    if s.is_empty() || s.contains([',', ':', '\0']) {
        return Err(FettError::argument(
            "mount",
            format!("overlay path {s:?} is empty or contains ',', ':' or NUL"),
        ));
    }
    Ok(s.to_owned())
}

mod ms_flags_bits {
    use nix::mount::MsFlags;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(flags: &MsFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::from(flags.bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MsFlags, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        libc::c_ulong::try_from(bits)
            .ok()
            .and_then(MsFlags::from_bits)
            .ok_or_else(|| D::Error::custom(format!("unknown mount flag bits {bits:#x}")))
    }
}
