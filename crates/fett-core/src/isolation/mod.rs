//! Linux isolation primitives
//!
//! This module contains the kernel-facing mechanisms:
//! - `clone` - process creation into new namespaces on an owned stack
//! - `stack` - guard-paged stack mappings for cloned children
//! - `namespace` - namespace kinds and `unshare(2)`
//! - `uts` - hostname inside a UTS namespace
//! - `mounts` - `mount(2)` / `umount(2)` and mount descriptors
//! - `flags` - the clone and mount flag vocabulary

pub mod clone;
pub mod flags;
pub mod mounts;
pub mod namespace;
pub mod stack;
pub mod uts;

pub use self::clone::{Child, CloneRequest, spawn};
pub use self::flags::{CloneFlags, MntFlags, MsFlags, Signal};
pub use self::mounts::{MountDescriptor, mount, umount, umount2};
pub use self::namespace::{Namespace, NamespaceConfig, unshare};
pub use self::stack::ChildStack;
pub use self::uts::{hostname, set_hostname};
pub use nix::sys::wait::WaitStatus;
pub use nix::unistd::Pid;
