// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Copies transport-owned arguments into owned values before they cross threads

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Errno};

/// Largest transfer whose byte count still fits the `i32` status convention
pub const MAX_TRANSFER: usize = i32::MAX as usize;

/// Maximum single path component length
pub const NAME_MAX: usize = 255;

/// Why an argument could not be marshaled. None of these reach a handler.
#[derive(thiserror::Error, Debug)]
pub enum MarshalError {
    #[error(transparent)]
    Malformed(#[from] BridgeError),
    #[error("{op}: cannot allocate {len} bytes")]
    Exhausted { op: &'static str, len: usize },
    #[error("{op}: name of {len} bytes exceeds {NAME_MAX}")]
    NameTooLong { op: &'static str, len: usize },
}

impl MarshalError {
    /// Status reported to the transport in place of a dispatch
    pub fn errno(&self) -> Errno {
        match self {
            MarshalError::Malformed(_) => Errno::EINVAL,
            MarshalError::Exhausted { .. } => Errno::ENOMEM,
            MarshalError::NameTooLong { .. } => Errno::ENAMETOOLONG,
        }
    }

    pub fn is_shape_violation(&self) -> bool {
        matches!(self, MarshalError::Malformed(_))
    }
}

fn malformed(op: &'static str, reason: impl Into<String>) -> MarshalError {
    MarshalError::Malformed(BridgeError::MalformedArgument {
        op,
        reason: reason.into(),
    })
}

/// Owned copy of a path-dialect path
pub fn path(op: &'static str, path: &Path) -> Result<PathBuf, MarshalError> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(malformed(op, "empty path"));
    }
    if bytes.contains(&0) {
        return Err(malformed(op, "path contains NUL"));
    }
    Ok(path.to_path_buf())
}

/// Owned copy of a single path component
pub fn name(op: &'static str, name: &OsStr) -> Result<OsString, MarshalError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(malformed(op, "empty name"));
    }
    if bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(malformed(op, "name is not a single path component"));
    }
    if bytes.len() > NAME_MAX {
        return Err(MarshalError::NameTooLong {
            op,
            len: bytes.len(),
        });
    }
    Ok(name.to_os_string())
}

/// File offsets are signed on the wire; negative ones are malformed
pub fn offset(op: &'static str, offset: i64) -> Result<u64, MarshalError> {
    u64::try_from(offset).map_err(|_| malformed(op, format!("negative offset {offset}")))
}

fn transfer_len(op: &'static str, len: usize) -> Result<usize, MarshalError> {
    if len > MAX_TRANSFER {
        return Err(malformed(op, format!("transfer of {len} bytes exceeds {MAX_TRANSFER}")));
    }
    Ok(len)
}

/// Zero-filled buffer the handler fills for a read of `len` bytes
pub fn read_buffer(op: &'static str, len: usize) -> Result<Vec<u8>, MarshalError> {
    let len = transfer_len(op, len)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| MarshalError::Exhausted { op, len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Owned copy of a write payload; the transport's slice is not valid once
/// the worker thread blocks
pub fn payload(op: &'static str, data: &[u8]) -> Result<Vec<u8>, MarshalError> {
    let len = transfer_len(op, data.len())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| MarshalError::Exhausted { op, len })?;
    buf.extend_from_slice(data);
    Ok(buf)
}
