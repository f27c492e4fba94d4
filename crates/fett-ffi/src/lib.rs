//! C FFI bindings for fett
//!
//! This crate provides the C-compatible primitive surface used by jail
//! orchestration code written in other languages.
//!
//! # Example (C)
//! ```c
//! #include <fett.h>
//!
//! static int jail_main(void *arg) { return 0; }
//!
//! int flags = FETT_CLONE_NEWPID | FETT_CLONE_NEWNS | FETT_CLONE_NEWUTS | FETT_SIGCHLD;
//! FettChild *child = fett_spawn(jail_main, NULL, flags, 1 << 20);
//! int status;
//! if (child == NULL || fett_child_wait(child, &status) != 0)
//!     fprintf(stderr, "%s\n", fett_last_error());
//! ```

#![allow(clippy::missing_safety_doc)]

use fett_core::isolation::flags::{decode_clone_flags, decode_mount_flags, decode_unshare_flags};
use fett_core::{Child, CloneRequest, FettError, Result, WaitStatus};
use libc::{c_char, c_int, c_ulong, c_void, pid_t, size_t};
use once_cell::sync::Lazy;
use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// Entry routine run inside the child; its return value is the exit status
pub type FettEntry = extern "C" fn(arg: *mut c_void) -> c_int;

/// Opaque handle to a spawned child and its stack
pub struct FettChild {
    child: Child,
}

// Thread-local error state
thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
    static LAST_ERRNO: Cell<c_int> = const { Cell::new(0) };
}

fn set_last_error(err: &FettError) {
    tracing::debug!(error = %err, "fett call failed");
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(err.to_string());
    });
    LAST_ERRNO.with(|e| e.set(err.raw_os_error().unwrap_or(0)));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
    LAST_ERRNO.with(|e| e.set(0));
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(err) => {
            set_last_error(&err);
            -1
        }
    }
}

fn null_argument(op: &'static str, what: &str) -> FettError {
    FettError::Argument {
        op,
        reason: format!("{what} is null"),
    }
}

/// Borrow a nullable C string as raw bytes
unsafe fn c_bytes<'a>(ptr: *const c_char) -> Option<&'a [u8]> {
    // SAFETY: caller guarantees ptr is null or a valid C string
    (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) }.to_bytes())
}

unsafe fn c_path<'a>(ptr: *const c_char) -> Option<&'a Path> {
    // SAFETY: forwarded to the caller
    unsafe { c_os_str(ptr) }.map(Path::new)
}

unsafe fn c_os_str<'a>(ptr: *const c_char) -> Option<&'a OsStr> {
    // SAFETY: forwarded to the caller
    unsafe { c_bytes(ptr) }.map(OsStr::from_bytes)
}

struct RawArg(*mut c_void);

// SAFETY: the pointer is handed to the child untouched; the C caller owns
// whatever it points to
unsafe impl Send for RawArg {}

fn clone_request(
    entry: Option<FettEntry>,
    arg: *mut c_void,
    flags: c_int,
    stack_size: size_t,
) -> Result<CloneRequest> {
    let entry = entry.ok_or_else(|| null_argument("clone", "entry"))?;
    let (flags, exit_signal) = decode_clone_flags(flags)?;
    Ok(
        CloneRequest::new(move |arg: RawArg| entry(arg.0), RawArg(arg))
            .flags(flags)
            .exit_signal_raw(exit_signal)
            .stack_size(stack_size),
    )
}

/// Get the last error message
///
/// Returns NULL if no error. The returned string is valid until the next
/// fett call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn fett_last_error() -> *const c_char {
    thread_local! {
        static ERROR_BUF: RefCell<Option<CString>> = const { RefCell::new(None) };
    }

    LAST_ERROR.with(|e| {
        let err = e.borrow();
        match &*err {
            Some(msg) => ERROR_BUF.with(|buf| {
                let cstr = CString::new(msg.replace('\0', "\\0")).unwrap_or_default();
                let ptr = cstr.as_ptr();
                *buf.borrow_mut() = Some(cstr);
                ptr
            }),
            None => ptr::null(),
        }
    })
}

/// Kernel error code of the last failure on this thread (0 if none or if
/// the failure was a rejected argument)
#[unsafe(no_mangle)]
pub extern "C" fn fett_last_errno() -> c_int {
    LAST_ERRNO.with(Cell::get)
}

/// Start `entry(arg)` in a new process, returning its pid
///
/// `flags` is a `clone(2)` flag word: `FETT_CLONE_*` bits ORed with an exit
/// signal such as `FETT_SIGCHLD`. The child's stack is handed to the child
/// and never freed; prefer `fett_spawn` when the caller can reap.
/// Returns -1 on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_clone(
    entry: Option<FettEntry>,
    arg: *mut c_void,
    flags: c_int,
    stack_size: size_t,
) -> pid_t {
    let spawned = clone_request(entry, arg, flags, stack_size).and_then(|request| {
        // SAFETY: the C caller accepts clone(2) semantics for its flags
        unsafe { request.spawn() }
    });
    match spawned {
        Ok(child) => {
            clear_last_error();
            child.into_pid().as_raw()
        }
        Err(err) => {
            set_last_error(&err);
            -1
        }
    }
}

/// Start `entry(arg)` in a new process, keeping its stack with the handle
///
/// Returns NULL on failure. Release the handle with `fett_child_wait` (which
/// frees the stack) or `fett_child_detach`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_spawn(
    entry: Option<FettEntry>,
    arg: *mut c_void,
    flags: c_int,
    stack_size: size_t,
) -> *mut FettChild {
    let spawned = clone_request(entry, arg, flags, stack_size).and_then(|request| {
        // SAFETY: the C caller accepts clone(2) semantics for its flags
        unsafe { request.spawn() }
    });
    match spawned {
        Ok(child) => {
            clear_last_error();
            Box::into_raw(Box::new(FettChild { child }))
        }
        Err(err) => {
            set_last_error(&err);
            ptr::null_mut()
        }
    }
}

/// Process id of a spawned child, or -1 for a null handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_child_pid(child: *const FettChild) -> pid_t {
    if child.is_null() {
        return -1;
    }
    // SAFETY: caller guarantees child came from fett_spawn and is still live
    unsafe { &*child }.child.pid().as_raw()
}

/// Wait for the child, free its stack and the handle
///
/// On success stores a `wait(2)`-style status in `*status` (if non-null) and
/// returns 0. The handle is consumed either way.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_child_wait(child: *mut FettChild, status: *mut c_int) -> c_int {
    if child.is_null() {
        set_last_error(&null_argument("waitpid", "child"));
        return -1;
    }
    // SAFETY: caller guarantees child came from fett_spawn and is not reused
    let handle = unsafe { Box::from_raw(child) };
    match handle.child.wait() {
        Ok(wait_status) => {
            if !status.is_null() {
                // SAFETY: caller guarantees status points to writable memory
                unsafe { *status = encode_wait_status(wait_status) };
            }
            clear_last_error();
            0
        }
        Err(err) => {
            set_last_error(&err);
            -1
        }
    }
}

/// Free the handle without reaping; the child keeps its stack for good
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_child_detach(child: *mut FettChild) -> pid_t {
    if child.is_null() {
        return -1;
    }
    // SAFETY: caller guarantees child came from fett_spawn and is not reused
    let handle = unsafe { Box::from_raw(child) };
    handle.child.into_pid().as_raw()
}

fn encode_wait_status(status: WaitStatus) -> c_int {
    match status {
        WaitStatus::Exited(_, code) => (code & 0xff) << 8,
        WaitStatus::Signaled(_, signal, core_dumped) => {
            (signal as c_int) | if core_dumped { 0x80 } else { 0 }
        }
        _ => 0,
    }
}

/// Move the calling process into new namespaces. Returns 0 or -1.
#[unsafe(no_mangle)]
pub extern "C" fn fett_unshare(flags: c_int) -> c_int {
    status(decode_unshare_flags(flags).and_then(fett_core::unshare))
}

/// Set the UTS hostname from `len` bytes at `name`. Returns 0 or -1.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_sethostname(name: *const c_char, len: size_t) -> c_int {
    if name.is_null() {
        return status(Err(null_argument("sethostname", "name")));
    }
    // SAFETY: caller guarantees name points to len readable bytes
    let bytes = unsafe { std::slice::from_raw_parts(name.cast::<u8>(), len) };
    status(fett_core::set_hostname(OsStr::from_bytes(bytes)))
}

/// Attach a filesystem; `source`, `fstype` and `data` may be NULL.
/// Returns 0 or -1.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_mount(
    source: *const c_char,
    target: *const c_char,
    fstype: *const c_char,
    flags: c_ulong,
    data: *const c_char,
) -> c_int {
    // SAFETY: caller guarantees every non-null pointer is a valid C string
    let result = (|| unsafe {
        let target = c_path(target).ok_or_else(|| null_argument("mount", "target"))?;
        let flags = decode_mount_flags(flags)?;
        fett_core::mount(c_path(source), target, c_os_str(fstype), flags, c_os_str(data))
    })();
    status(result)
}

/// Detach the filesystem mounted at `target`. Returns 0 or -1.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fett_umount(target: *const c_char) -> c_int {
    // SAFETY: caller guarantees target is null or a valid C string
    match unsafe { c_path(target) } {
        Some(target) => status(fett_core::umount(target)),
        None => status(Err(null_argument("umount", "target"))),
    }
}

/// Get library version
#[unsafe(no_mangle)]
pub extern "C" fn fett_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());
    VERSION.as_ptr()
}

// Flag vocabulary, host values re-exported verbatim

#[unsafe(no_mangle)]
pub static FETT_CLONE_CHILD_CLEARTID: c_int = libc::CLONE_CHILD_CLEARTID;
#[unsafe(no_mangle)]
pub static FETT_CLONE_CHILD_SETTID: c_int = libc::CLONE_CHILD_SETTID;
#[unsafe(no_mangle)]
pub static FETT_CLONE_FILES: c_int = libc::CLONE_FILES;
#[unsafe(no_mangle)]
pub static FETT_CLONE_FS: c_int = libc::CLONE_FS;
#[unsafe(no_mangle)]
pub static FETT_CLONE_IO: c_int = libc::CLONE_IO;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWIPC: c_int = libc::CLONE_NEWIPC;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWNET: c_int = libc::CLONE_NEWNET;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWNS: c_int = libc::CLONE_NEWNS;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWPID: c_int = libc::CLONE_NEWPID;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWUSER: c_int = libc::CLONE_NEWUSER;
#[unsafe(no_mangle)]
pub static FETT_CLONE_NEWUTS: c_int = libc::CLONE_NEWUTS;
#[unsafe(no_mangle)]
pub static FETT_CLONE_PARENT: c_int = libc::CLONE_PARENT;
#[unsafe(no_mangle)]
pub static FETT_CLONE_PARENT_SETTID: c_int = libc::CLONE_PARENT_SETTID;
#[unsafe(no_mangle)]
pub static FETT_CLONE_PTRACE: c_int = libc::CLONE_PTRACE;
#[unsafe(no_mangle)]
pub static FETT_CLONE_SETTLS: c_int = libc::CLONE_SETTLS;
#[unsafe(no_mangle)]
pub static FETT_CLONE_SIGHAND: c_int = libc::CLONE_SIGHAND;
#[unsafe(no_mangle)]
pub static FETT_CLONE_SYSVSEM: c_int = libc::CLONE_SYSVSEM;
#[unsafe(no_mangle)]
pub static FETT_CLONE_THREAD: c_int = libc::CLONE_THREAD;
#[unsafe(no_mangle)]
pub static FETT_CLONE_UNTRACED: c_int = libc::CLONE_UNTRACED;
#[unsafe(no_mangle)]
pub static FETT_CLONE_VFORK: c_int = libc::CLONE_VFORK;
#[unsafe(no_mangle)]
pub static FETT_CLONE_VM: c_int = libc::CLONE_VM;

#[unsafe(no_mangle)]
pub static FETT_SIGCHLD: c_int = libc::SIGCHLD;

#[unsafe(no_mangle)]
pub static FETT_MS_BIND: c_ulong = libc::MS_BIND;
#[unsafe(no_mangle)]
pub static FETT_MS_DIRSYNC: c_ulong = libc::MS_DIRSYNC;
#[unsafe(no_mangle)]
pub static FETT_MS_MANDLOCK: c_ulong = libc::MS_MANDLOCK;
#[unsafe(no_mangle)]
pub static FETT_MS_MOVE: c_ulong = libc::MS_MOVE;
#[unsafe(no_mangle)]
pub static FETT_MS_NOATIME: c_ulong = libc::MS_NOATIME;
#[unsafe(no_mangle)]
pub static FETT_MS_NODEV: c_ulong = libc::MS_NODEV;
#[unsafe(no_mangle)]
pub static FETT_MS_NODIRATIME: c_ulong = libc::MS_NODIRATIME;
#[unsafe(no_mangle)]
pub static FETT_MS_NOEXEC: c_ulong = libc::MS_NOEXEC;
#[unsafe(no_mangle)]
pub static FETT_MS_NOSUID: c_ulong = libc::MS_NOSUID;
#[unsafe(no_mangle)]
pub static FETT_MS_RDONLY: c_ulong = libc::MS_RDONLY;
#[unsafe(no_mangle)]
pub static FETT_MS_REC: c_ulong = libc::MS_REC;
#[unsafe(no_mangle)]
pub static FETT_MS_RELATIME: c_ulong = libc::MS_RELATIME;
#[unsafe(no_mangle)]
pub static FETT_MS_REMOUNT: c_ulong = libc::MS_REMOUNT;
#[unsafe(no_mangle)]
pub static FETT_MS_SILENT: c_ulong = libc::MS_SILENT;
#[unsafe(no_mangle)]
pub static FETT_MS_STRICTATIME: c_ulong = libc::MS_STRICTATIME;
#[unsafe(no_mangle)]
pub static FETT_MS_SYNCHRONOUS: c_ulong = libc::MS_SYNCHRONOUS;

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn exit_with_arg(arg: *mut c_void) -> c_int {
        arg as usize as c_int
    }

    fn last_error() -> String {
        let ptr = fett_last_error();
        assert!(!ptr.is_null());
        // SAFETY: fett_last_error returned a live C string
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    #[test]
    fn zero_stack_is_rejected_without_errno() {
        // SAFETY: rejected before clone
        let pid = unsafe {
            fett_clone(
                Some(exit_with_arg),
                ptr::null_mut(),
                FETT_CLONE_NEWPID | FETT_CLONE_NEWNS | FETT_SIGCHLD,
                0,
            )
        };
        assert_eq!(pid, -1);
        assert_eq!(fett_last_errno(), 0);
        assert!(last_error().contains("stack size"));
    }

    #[test]
    fn null_entry_is_rejected() {
        // SAFETY: rejected before clone
        let child = unsafe { fett_spawn(None, ptr::null_mut(), FETT_SIGCHLD, 1 << 16) };
        assert!(child.is_null());
        assert!(last_error().contains("entry is null"));
    }

    #[test]
    fn spawn_and_wait_report_exit_status() {
        // SAFETY: no CLONE_VM; the child only returns its argument
        let child =
            unsafe { fett_spawn(Some(exit_with_arg), 3 as *mut c_void, FETT_SIGCHLD, 1 << 16) };
        assert!(!child.is_null());
        // SAFETY: child is a live handle
        assert!(unsafe { fett_child_pid(child) } > 0);

        let mut wstatus = -1;
        // SAFETY: child is consumed here and not used again
        assert_eq!(unsafe { fett_child_wait(child, &raw mut wstatus) }, 0);
        assert!(libc::WIFEXITED(wstatus));
        assert_eq!(libc::WEXITSTATUS(wstatus), 3);
        assert!(fett_last_error().is_null());
    }

    #[test]
    fn clone_returns_pid_the_caller_reaps() {
        // SAFETY: no CLONE_VM; the child only returns its argument
        let pid = unsafe {
            fett_clone(Some(exit_with_arg), 6 as *mut c_void, FETT_SIGCHLD, 1 << 16)
        };
        assert!(pid > 0);
        assert_eq!(fett_last_errno(), 0);

        let mut wstatus = 0;
        // SAFETY: pid is our own child
        assert_eq!(unsafe { libc::waitpid(pid, &raw mut wstatus, libc::__WALL) }, pid);
        assert!(libc::WIFEXITED(wstatus));
        assert_eq!(libc::WEXITSTATUS(wstatus), 6);
    }

    #[test]
    fn realtime_exit_signal_is_not_an_argument_error() {
        // Rejected for the zero stack, after the flag word was accepted
        // SAFETY: rejected before clone
        let pid = unsafe {
            fett_clone(Some(exit_with_arg), ptr::null_mut(), libc::SIGRTMIN(), 0)
        };
        assert_eq!(pid, -1);
        assert!(last_error().contains("stack size"));
    }

    extern "C" fn rename_host(_arg: *mut c_void) -> c_int {
        if fett_unshare(FETT_CLONE_NEWUTS) != 0 {
            return 1;
        }
        let name = b"ffi-jail";
        // SAFETY: name is a live buffer of name.len() bytes
        if unsafe { fett_sethostname(name.as_ptr().cast(), name.len()) } != 0 {
            return 2;
        }
        let mut buf = [0u8; 65];
        // SAFETY: buf is writable for buf.len() bytes
        if unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) } != 0 {
            return 3;
        }
        c_int::from(!buf.starts_with(b"ffi-jail\0"))
    }

    #[test]
    fn unshare_and_sethostname_succeed_in_a_child() {
        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping: needs root");
            return;
        }
        // SAFETY: no CLONE_VM; the child sets thread-local error state, which
        // can allocate and hang if another test thread held the allocator lock
        let child =
            unsafe { fett_spawn(Some(rename_host), ptr::null_mut(), FETT_SIGCHLD, 1 << 16) };
        assert!(!child.is_null());
        let mut wstatus = -1;
        // SAFETY: child is consumed here and not used again
        assert_eq!(unsafe { fett_child_wait(child, &raw mut wstatus) }, 0);
        assert!(libc::WIFEXITED(wstatus));
        assert_eq!(libc::WEXITSTATUS(wstatus), 0);
    }

    #[test]
    fn unknown_unshare_bits_are_an_argument_error() {
        assert_eq!(fett_unshare(FETT_SIGCHLD), -1);
        assert_eq!(fett_last_errno(), 0);
    }

    #[test]
    fn mount_requires_target() {
        // SAFETY: all pointers are null or valid C strings
        let rc = unsafe {
            fett_mount(ptr::null(), ptr::null(), c"tmpfs".as_ptr(), 0, ptr::null())
        };
        assert_eq!(rc, -1);
        assert!(last_error().contains("target is null"));
    }

    #[test]
    fn mount_on_missing_target_sets_errno() {
        // SAFETY: all pointers are valid C strings
        let rc = unsafe {
            fett_mount(
                c"overlay".as_ptr(),
                c"/nonexistent/fett/jailroot".as_ptr(),
                c"overlay".as_ptr(),
                0,
                c"lowerdir=/base,upperdir=/diff,workdir=/work".as_ptr(),
            )
        };
        assert_eq!(rc, -1);
        assert!(matches!(fett_last_errno(), libc::ENOENT | libc::EPERM));
    }

    #[test]
    fn non_utf8_mount_data_reaches_the_kernel() {
        // SAFETY: all pointers are valid C strings
        let rc = unsafe {
            fett_mount(
                c"overlay".as_ptr(),
                c"/nonexistent/fett/jailroot".as_ptr(),
                c"overlay".as_ptr(),
                0,
                c"lowerdir=/base\xff,upperdir=/diff,workdir=/work".as_ptr(),
            )
        };
        assert_eq!(rc, -1);
        assert!(matches!(fett_last_errno(), libc::ENOENT | libc::EPERM));
    }

    #[test]
    fn version_is_crate_version() {
        // SAFETY: fett_version returns a static C string
        let version = unsafe { CStr::from_ptr(fett_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
