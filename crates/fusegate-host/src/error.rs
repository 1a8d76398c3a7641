// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Errors of the sample filesystems

use std::io;

use fusegate_core::Errno;

#[derive(thiserror::Error, Debug)]
pub enum SampleError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("name not allowed")]
    InvalidName,
    #[error("no such attribute")]
    NoAttribute,
    #[error("invalid seed document: {0}")]
    InvalidSeed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SampleResult<T> = Result<T, SampleError>;

impl From<SampleError> for Errno {
    fn from(err: SampleError) -> Self {
        match err {
            SampleError::NotFound => Errno::ENOENT,
            SampleError::AlreadyExists => Errno::EEXIST,
            SampleError::NotADirectory => Errno::ENOTDIR,
            SampleError::IsADirectory => Errno::EISDIR,
            SampleError::NotEmpty => Errno::ENOTEMPTY,
            SampleError::InvalidArgument | SampleError::InvalidName => Errno::EINVAL,
            SampleError::NotPermitted => Errno::EPERM,
            SampleError::NoAttribute => Errno::ENODATA,
            SampleError::Io(err) => Errno::from(err),
            SampleError::InvalidSeed(_) | SampleError::Json(_) => Errno::EIO,
        }
    }
}
