//! Linux namespace kinds and `unshare(2)`

use crate::{FettError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// A single namespace kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Mount,
    Network,
    Pid,
    Ipc,
    Uts,
    User,
}

impl Namespace {
    /// Every namespace kind this layer knows about
    pub const ALL: [Self; 6] = [
        Self::Mount,
        Self::Network,
        Self::Pid,
        Self::Ipc,
        Self::Uts,
        Self::User,
    ];

    /// The `CLONE_NEW*` flag creating this kind
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::User => CloneFlags::CLONE_NEWUSER,
        }
    }
}

/// Configuration for namespace isolation
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Create new mount namespace
    pub mount: bool,
    /// Create new network namespace
    pub net: bool,
    /// Create new PID namespace
    pub pid: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
    /// Create new user namespace
    pub user: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            net: true,
            pid: true,
            ipc: true,
            uts: true,
            user: false,
        }
    }
}

impl NamespaceConfig {
    /// No new namespaces at all
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mount: false,
            net: false,
            pid: false,
            ipc: false,
            uts: false,
            user: false,
        }
    }

    /// Builder-style toggle for one namespace kind
    #[must_use]
    pub const fn with(mut self, ns: Namespace, enabled: bool) -> Self {
        match ns {
            Namespace::Mount => self.mount = enabled,
            Namespace::Network => self.net = enabled,
            Namespace::Pid => self.pid = enabled,
            Namespace::Ipc => self.ipc = enabled,
            Namespace::Uts => self.uts = enabled,
            Namespace::User => self.user = enabled,
        }
        self
    }

    /// Whether a namespace kind is requested
    #[must_use]
    pub const fn contains(&self, ns: Namespace) -> bool {
        match ns {
            Namespace::Mount => self.mount,
            Namespace::Network => self.net,
            Namespace::Pid => self.pid,
            Namespace::Ipc => self.ipc,
            Namespace::Uts => self.uts,
            Namespace::User => self.user,
        }
    }

    /// Convert to nix `CloneFlags`
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        Namespace::ALL
            .into_iter()
            .filter(|ns| self.contains(*ns))
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.clone_flag())
    }

    /// Namespace part of a flag set; behaviour modifiers are ignored
    #[must_use]
    pub fn from_clone_flags(flags: CloneFlags) -> Self {
        Namespace::ALL.into_iter().fold(Self::none(), |config, ns| {
            config.with(ns, flags.contains(ns.clone_flag()))
        })
    }

    /// Enter new namespaces using unshare
    pub fn enter(&self) -> Result<()> {
        unshare(self.to_clone_flags())
    }
}

/// Move the calling process into fresh namespaces named by `flags`.
///
/// Only the caller changes; no process is created. Flag combinations the
/// kernel does not accept for `unshare(2)` come back as [`FettError::Os`].
pub fn unshare(flags: CloneFlags) -> Result<()> {
    tracing::debug!(?flags, "unsharing namespaces");
    nix::sched::unshare(flags).map_err(|errno| FettError::os("unshare", errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_skips_user_namespace() {
        let flags = NamespaceConfig::default().to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn flags_map_back_to_config() {
        let flags = CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_FS;
        let config = NamespaceConfig::from_clone_flags(flags);
        assert_eq!(
            config,
            NamespaceConfig::none()
                .with(Namespace::Uts, true)
                .with(Namespace::Ipc, true)
        );
        assert_eq!(
            config.to_clone_flags(),
            CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC
        );
    }

    #[test]
    fn empty_config_unshares_nothing() {
        assert!(NamespaceConfig::none().to_clone_flags().is_empty());
        // unshare(0) is a no-op the kernel always accepts
        NamespaceConfig::none().enter().unwrap();
    }

    #[test]
    fn deserializes_partial_config() {
        let config: NamespaceConfig =
            serde_json::from_str(r#"{"net": false, "user": true}"#).unwrap();
        assert!(!config.net);
        assert!(config.user);
        assert!(config.mount && config.pid);
    }

    #[test]
    fn namespace_names_are_lowercase() {
        let ns: Vec<Namespace> = serde_json::from_str(r#"["mount", "uts"]"#).unwrap();
        assert_eq!(ns, vec![Namespace::Mount, Namespace::Uts]);
    }
}
