// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the fusegate bridge
//!
//! Two families live here. [`Errno`] is the filesystem-semantic domain that
//! handlers report and that crosses the boundary back to the transport as a
//! negative status. [`BridgeError`] covers conditions internal to the bridge
//! or the transport; those are logged and never shown to a handler.

use std::fmt;
use std::io;
use std::path::PathBuf;

use libc::c_int;

/// A positive OS error number. Statuses on the wire carry it negated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Errno(c_int);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EDEADLK: Errno = Errno(libc::EDEADLK);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const ENODATA: Errno = Errno(libc::ENODATA);

    /// Wrap a positive errno value. Zero and negative inputs collapse to EIO.
    pub const fn from_code(code: c_int) -> Self {
        if code > 0 {
            Errno(code)
        } else {
            Errno::EIO
        }
    }

    /// Interpret a raw status. Only negative statuses carry an errno.
    pub const fn from_status(status: i32) -> Option<Self> {
        if status < 0 {
            // i32::MIN has no positive counterpart
            Some(Errno(status.saturating_neg()))
        } else {
            None
        }
    }

    /// Positive errno value, as `fuser` replies expect.
    pub const fn code(self) -> c_int {
        self.0
    }

    /// Negative status, as dispatch entry points return.
    pub const fn status(self) -> i32 {
        -self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Errno::from_code(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::AlreadyExists => Errno::EEXIST,
            io::ErrorKind::InvalidInput => Errno::EINVAL,
            io::ErrorKind::OutOfMemory => Errno::ENOMEM,
            _ => Errno::EIO,
        }
    }
}

/// Failures inside the bridge or the transport
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("mount point {0} is already served by an active session")]
    AlreadyMounted(PathBuf),
    #[error("mount point {path}: {source}")]
    MountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transport failed to start: {0}")]
    Transport(#[source] io::Error),
    #[error("handler runtime could not be built: {0}")]
    Runtime(#[source] io::Error),
    #[error("init hook failed: {0}")]
    InitFailed(Errno),
    #[error("malformed {op} arguments: {reason}")]
    MalformedArgument { op: &'static str, reason: String },
    #[error("{op} dispatched from the handler runtime thread")]
    ReentrantDispatch { op: &'static str },
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("invalid mount state transition {from} -> {to}")]
    InvalidTransition {
        from: crate::mount::MountState,
        to: crate::mount::MountState,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_negated_code() {
        assert_eq!(Errno::ENOENT.status(), -libc::ENOENT);
        assert_eq!(Errno::ENOENT.code(), libc::ENOENT);
        assert_eq!(Errno::from_status(-libc::EEXIST), Some(Errno::EEXIST));
        assert_eq!(Errno::from_status(0), None);
        assert_eq!(Errno::from_status(17), None);
    }

    #[test]
    fn non_positive_codes_collapse_to_eio() {
        assert_eq!(Errno::from_code(0), Errno::EIO);
        assert_eq!(Errno::from_code(-3), Errno::EIO);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let err = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(Errno::from(err), Errno::ENOTEMPTY);

        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Errno::from(err), Errno::ENOENT);

        let err = io::Error::other("weird");
        assert_eq!(Errno::from(err), Errno::EIO);
    }
}
