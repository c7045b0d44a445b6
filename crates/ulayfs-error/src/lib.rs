#![forbid(unsafe_code)]
//! Error types for uLayFS.
//!
//! Defines `UlayfsError` and a `Result<T>` alias used throughout the
//! workspace, with errno mappings for the interception surface.
//!
//! Lost CAS races are not errors: the write path always resolves them
//! locally and they never reach this enum. Violated invariants (a bad
//! meta-block signature, an out-of-range locator, a persistence primitive
//! failure) abort the process instead of surfacing here.

use thiserror::Error;

/// Unified error type for all uLayFS operations.
#[derive(Debug, Error)]
pub enum UlayfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on device")]
    OutOfSpace,

    #[error("corrupt file image: {detail}")]
    CorruptImage { detail: String },

    #[error("file descriptor {0} is not registered")]
    NotRegistered(i32),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl UlayfsError {
    /// Convert this error into a POSIX errno for the interception surface.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfSpace => libc::ENOSPC,
            Self::CorruptImage { .. } => libc::EUCLEAN,
            Self::NotRegistered(_) => libc::EBADF,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `UlayfsError`.
pub type Result<T> = std::result::Result<T, UlayfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(UlayfsError::OutOfSpace.to_errno(), libc::ENOSPC);
        assert_eq!(UlayfsError::NotRegistered(3).to_errno(), libc::EBADF);
        assert_eq!(
            UlayfsError::CorruptImage {
                detail: "truncated".to_owned(),
            }
            .to_errno(),
            libc::EUCLEAN
        );
        let io = UlayfsError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.to_errno(), libc::EACCES);
    }
}
