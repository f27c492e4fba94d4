//! `clone(2)` into new namespaces on an owned stack

use super::flags::{check_exit_signal, check_spawn_flags, encode_clone_flags};
use super::namespace::NamespaceConfig;
use super::stack::ChildStack;
use crate::{FettError, Result, config};
use libc::{c_int, c_void};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::panic::{self, AssertUnwindSafe};

/// Exit status of a child whose entry routine panicked
pub const PANIC_EXIT_STATUS: i32 = 101;

type Entry = Box<dyn FnOnce() -> i32 + Send>;

/// Everything needed to start one child.
///
/// `entry` and `args` are moved into the child; the parent never sees them
/// again.
pub struct CloneRequest {
    entry: Entry,
    flags: CloneFlags,
    exit_signal: c_int,
    stack_size: usize,
}

impl std::fmt::Debug for CloneRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneRequest")
            .field("flags", &self.flags)
            .field("exit_signal", &self.exit_signal)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

impl CloneRequest {
    /// Request running `entry(args)` in a new process.
    ///
    /// Defaults: no new namespaces, `SIGCHLD` on exit, and the configured
    /// default stack size.
    pub fn new<F, A>(entry: F, args: A) -> Self
    where
        F: FnOnce(A) -> i32 + Send + 'static,
        A: Send + 'static,
    {
        Self {
            entry: Box::new(move || entry(args)),
            flags: CloneFlags::empty(),
            exit_signal: Signal::SIGCHLD as c_int,
            stack_size: config::default_stack_size(),
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: CloneFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Add the namespace flags of `config` to the request
    #[must_use]
    pub fn namespaces(mut self, config: &NamespaceConfig) -> Self {
        self.flags |= config.to_clone_flags();
        self
    }

    /// Signal delivered to the parent when the child exits (`None` for none)
    #[must_use]
    pub const fn exit_signal(mut self, signal: Option<Signal>) -> Self {
        self.exit_signal = match signal {
            Some(signal) => signal as c_int,
            None => 0,
        };
        self
    }

    /// Exit signal by number, for signals [`Signal`] cannot name such as
    /// `SIGRTMIN + n`. 0 means none; anything above `SIGRTMAX` fails `spawn`.
    #[must_use]
    pub const fn exit_signal_raw(mut self, signo: c_int) -> Self {
        self.exit_signal = signo;
        self
    }

    #[must_use]
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Create the child and return as soon as the kernel has done so.
    ///
    /// # Safety
    /// Without `CLONE_VM` the child starts on a copy of the caller's memory
    /// with only the calling thread present, exactly like `fork(2)`; locks
    /// held by other threads stay held forever in the child. With `CLONE_VM`
    /// the child shares the caller's memory *and* its thread-local storage,
    /// so unless `CLONE_VFORK` suspends the caller, neither side may touch
    /// thread-local state (the allocator's caches included) concurrently.
    /// Flag combinations such as `CLONE_VFORK` or `CLONE_THREAD` carry their
    /// usual kernel meaning and the caller must be prepared for it.
    pub unsafe fn spawn(self) -> Result<Child> {
        check_spawn_flags(self.flags)?;
        check_exit_signal(self.exit_signal)?;
        let stack = ChildStack::allocate(self.stack_size)?;

        let raw_flags = encode_clone_flags(self.flags, self.exit_signal);
        let shares_memory = self.flags.contains(CloneFlags::CLONE_VM);
        let data = Box::into_raw(Box::new(self.entry));

        tracing::debug!(
            flags = ?self.flags,
            exit_signal = self.exit_signal,
            stack_size = stack.len(),
            "cloning child"
        );

        // SAFETY: the stack top lies inside a live mapping owned by the Child we
        // return, and data stays valid until the trampoline consumes it
        let ret = unsafe { libc::clone(trampoline, stack.top().as_ptr(), raw_flags, data.cast()) };

        if ret == -1 {
            let errno = Errno::last();
            // SAFETY: no child exists, so the box is still ours alone
            drop(unsafe { Box::from_raw(data) });
            return Err(FettError::os("clone", errno));
        }

        if !shares_memory {
            // SAFETY: the child owns a private copy; this one is the parent's
            drop(unsafe { Box::from_raw(data) });
        }

        let pid = Pid::from_raw(ret);
        tracing::info!(%pid, flags = ?self.flags, "child cloned");
        Ok(Child::new(pid, stack))
    }
}

/// Spawn `entry(args)` with `flags` on a `stack_size` byte stack.
///
/// Shorthand for [`CloneRequest`]; `SIGCHLD` is delivered on exit.
///
/// # Safety
/// See [`CloneRequest::spawn`].
pub unsafe fn spawn<F, A>(entry: F, args: A, flags: CloneFlags, stack_size: usize) -> Result<Child>
where
    F: FnOnce(A) -> i32 + Send + 'static,
    A: Send + 'static,
{
    let request = CloneRequest::new(entry, args)
        .flags(flags)
        .stack_size(stack_size);
    // SAFETY: forwarded to the caller
    unsafe { request.spawn() }
}

extern "C" fn trampoline(data: *mut c_void) -> c_int {
    // SAFETY: data is the Box<Entry> leaked by spawn, consumed exactly once here
    let entry = unsafe { Box::from_raw(data.cast::<Entry>()) };
    panic::catch_unwind(AssertUnwindSafe(move || entry())).unwrap_or(PANIC_EXIT_STATUS)
}

/// A spawned process and the stack it runs on.
///
/// The stack is released only after the child has been reaped through
/// [`Child::wait`] or [`Child::try_wait`]. Dropping an unreaped `Child`
/// leaks the stack rather than pull it from under a running process.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    stack: Option<ChildStack>,
    status: Option<WaitStatus>,
}

impl Child {
    const fn new(pid: Pid, stack: ChildStack) -> Self {
        Self {
            pid,
            stack: Some(stack),
            status: None,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the child exits, reap it, then free its stack
    pub fn wait(mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.reaped(status);
                    return Ok(status);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(FettError::os_at("waitpid", self.pid.to_string(), errno));
                }
            }
        }
    }

    /// Reap the child if it has exited, without blocking
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }
        match waitpid(self.pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                self.reaped(status);
                Ok(Some(status))
            }
            Ok(_) => Ok(None),
            Err(errno) => Err(FettError::os_at("waitpid", self.pid.to_string(), errno)),
        }
    }

    /// Give up ownership, leaving the stack to the running process.
    ///
    /// The stack mapping is never freed; the caller takes over reaping.
    #[must_use]
    pub fn into_pid(mut self) -> Pid {
        std::mem::forget(self.stack.take());
        self.pid
    }

    fn reaped(&mut self, status: WaitStatus) {
        tracing::debug!(pid = %self.pid, ?status, "child reaped");
        self.status = Some(status);
        self.stack = None;
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            tracing::warn!(
                pid = %self.pid,
                len = stack.len(),
                "child dropped before being reaped, leaking its stack"
            );
            std::mem::forget(stack);
        }
    }
}
