//! Error types for fett-core

use nix::errno::Errno;
use thiserror::Error;

/// Every failure surfaced by the primitives.
///
/// No operation retries or recovers locally; the variant tells the caller
/// whether the kernel was ever reached.
#[derive(Error, Debug)]
pub enum FettError {
    /// Malformed input rejected before any kernel call.
    #[error("{op}: invalid argument: {reason}")]
    Argument {
        /// Operation that rejected the input
        op: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Stack or control block allocation failed.
    #[error("{op}: failed to allocate {what}: {errno}")]
    Allocation {
        /// Operation that needed the allocation
        op: &'static str,
        /// Resource being allocated
        what: &'static str,
        /// Error reported by the allocator
        errno: Errno,
    },

    /// The kernel rejected the operation.
    #[error(
        "{op} failed{}: {errno}",
        .target.as_ref().map(|t| format!(" for {t}")).unwrap_or_default()
    )]
    Os {
        /// Operation (syscall) name
        op: &'static str,
        /// Offending argument, when one is known
        target: Option<String>,
        /// Underlying kernel error code
        errno: Errno,
    },
}

impl FettError {
    pub(crate) fn argument(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Argument {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) const fn os(op: &'static str, errno: Errno) -> Self {
        Self::Os {
            op,
            target: None,
            errno,
        }
    }

    pub(crate) fn os_at(op: &'static str, target: impl Into<String>, errno: Errno) -> Self {
        Self::Os {
            op,
            target: Some(target.into()),
            errno,
        }
    }

    /// Underlying error code, if the failure came from the kernel or allocator
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Argument { .. } => None,
            Self::Allocation { errno, .. } | Self::Os { errno, .. } => Some(*errno),
        }
    }

    /// Numeric error code, as `std::io::Error::raw_os_error` would report it
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.errno().map(|e| e as i32)
    }

    /// Name of the operation that failed
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Argument { op, .. } | Self::Allocation { op, .. } | Self::Os { op, .. } => op,
        }
    }
}

impl From<FettError> for std::io::Error {
    fn from(err: FettError) -> Self {
        match err.errno() {
            Some(errno) => Self::from(errno),
            None => Self::new(std::io::ErrorKind::InvalidInput, err.to_string()),
        }
    }
}
