//! Owned execution stacks for cloned children

use crate::{FettError, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Initial stack pointer alignment required by the x86_64 and aarch64 ABIs
pub const STACK_ALIGN: usize = 16;

/// An anonymous, private stack mapping with a guard page at its low end.
///
/// The stack grows down from [`ChildStack::top`]. Dropping the value unmaps
/// the whole region, so it must outlive any process still running on it.
#[derive(Debug)]
pub struct ChildStack {
    base: NonNull<c_void>,
    mapping_len: usize,
    guard_len: usize,
}

// SAFETY: the mapping is plain memory owned by this value alone
unsafe impl Send for ChildStack {}

impl ChildStack {
    /// Map a stack with at least `size` usable bytes.
    ///
    /// `size` is rounded up to whole pages; one extra page below it is left
    /// inaccessible so an overflow faults instead of corrupting memory.
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(FettError::argument("clone", "stack size must be positive"));
        }

        let page = page_size();
        let usable = size
            .checked_next_multiple_of(page)
            .ok_or_else(|| FettError::argument("clone", format!("stack size {size} overflows")))?;
        let mapping_len = usable
            .checked_add(page)
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| FettError::argument("clone", format!("stack size {size} overflows")))?;

        // SAFETY: fresh anonymous mapping, no existing memory is aliased
        let base = unsafe {
            mmap_anonymous(
                None,
                mapping_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK,
            )
        }
        .map_err(|errno| FettError::Allocation {
            op: "clone",
            what: "child stack",
            errno,
        })?;

        let stack = Self {
            base,
            mapping_len: mapping_len.get(),
            guard_len: page,
        };

        // SAFETY: the guard page is the first page of the mapping we own
        unsafe { mprotect(stack.base, stack.guard_len, ProtFlags::PROT_NONE) }.map_err(
            |errno| FettError::Allocation {
                op: "clone",
                what: "stack guard page",
                errno,
            },
        )?;

        tracing::debug!(usable, guard = page, "allocated child stack");
        Ok(stack)
    }

    /// Initial stack pointer: one past the highest byte, aligned down
    #[must_use]
    pub fn top(&self) -> NonNull<c_void> {
        let end = self.base.as_ptr() as usize + self.mapping_len;
        let misalign = end % STACK_ALIGN;
        // SAFETY: misalign < STACK_ALIGN <= usable length, so the result stays in the mapping
        unsafe { self.base.byte_add(self.mapping_len - misalign) }
    }

    /// Usable bytes above the guard page
    #[must_use]
    pub const fn len(&self) -> usize {
        self.mapping_len - self.guard_len
    }

    /// Always false; a zero-sized stack cannot be allocated
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ChildStack {
    fn drop(&mut self) {
        // SAFETY: base/mapping_len describe the mapping created in allocate
        if let Err(errno) = unsafe { munmap(self.base, self.mapping_len) } {
            tracing::warn!(%errno, len = self.mapping_len, "failed to unmap child stack");
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).ok().filter(|&p| p > 0).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_an_argument_error() {
        let err = ChildStack::allocate(0).unwrap_err();
        assert!(matches!(err, FettError::Argument { .. }));
    }

    #[test]
    fn huge_size_is_rejected_without_panicking() {
        assert!(ChildStack::allocate(usize::MAX).is_err());
    }

    #[test]
    fn size_rounds_up_to_pages() {
        let page = page_size();
        let stack = ChildStack::allocate(page + 1).unwrap();
        assert_eq!(stack.len(), 2 * page);
        assert!(!stack.is_empty());
    }

    #[test]
    fn top_is_aligned_and_writable_below() {
        let stack = ChildStack::allocate(64 * 1024).unwrap();
        let top = stack.top().as_ptr() as usize;
        assert_eq!(top % STACK_ALIGN, 0);
        assert!(top > stack.base.as_ptr() as usize + stack.guard_len);

        // The word just under the top is the first one a child would push.
        let slot = (top - std::mem::size_of::<usize>()) as *mut usize;
        // SAFETY: slot lies inside the writable part of the mapping
        unsafe {
            slot.write(0xdead_beef);
            assert_eq!(slot.read(), 0xdead_beef);
        }
    }
}
