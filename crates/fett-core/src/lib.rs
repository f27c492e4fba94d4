//! # fett-core
//!
//! Linux process isolation primitives for building lightweight jails.
//!
//! This crate exposes the kernel mechanism only:
//! - `clone(2)` into fresh namespaces on an owned, guard-paged stack
//! - `unshare(2)` of the calling process
//! - `sethostname(2)` inside a UTS namespace
//! - `mount(2)` / `umount(2)` for overlay and bind based root filesystems
//!
//! Deciding what to mount where, tracking running jails and reaping policy
//! belong to the caller.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod isolation;

pub use error::FettError;
pub use isolation::{
    Child, ChildStack, CloneFlags, CloneRequest, MntFlags, MountDescriptor, MsFlags, Namespace,
    NamespaceConfig, Pid, Signal, WaitStatus, hostname, mount, set_hostname, spawn, umount, umount2,
    unshare,
};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, FettError>;
