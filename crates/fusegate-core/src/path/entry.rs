// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous path-dialect entry points, called on transport worker threads

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{
    CreateArgs, LinkArgs, MkdirArgs, PathCall, PathDialect, PathOp, RenameArgs, SymlinkArgs,
    TruncateArgs, UtimensArgs,
};
use crate::codec;
use crate::dispatcher::Dispatcher;
use crate::marshal;
use crate::registry::{OpenArgs, ReadArgs, ReleaseArgs, WriteArgs, XattrArgs};
use crate::types::{DirEntry, FileStat, OpenReply, StatFs};

impl Dispatcher<PathDialect> {
    /// Attributes of `path`; `out` is written only on success
    pub fn getattr(&self, path: &Path, out: &mut FileStat) -> i32 {
        let envelope = self.invoke(PathOp::Getattr, |op| marshal::path(op, path), PathCall::getattr);
        codec::fill("getattr", envelope, out)
    }

    pub fn readlink(&self, path: &Path, out: &mut PathBuf) -> i32 {
        let envelope = self.invoke(PathOp::Readlink, |op| marshal::path(op, path), PathCall::readlink);
        codec::fill("readlink", envelope, out)
    }

    /// Hands entries to `filler` in handler order until it reports full
    pub fn readdir(&self, path: &Path, filler: &mut dyn FnMut(&DirEntry) -> bool) -> i32 {
        let envelope = self.invoke(PathOp::Readdir, |op| marshal::path(op, path), PathCall::readdir);
        codec::entries("readdir", envelope, filler)
    }

    pub fn open(&self, path: &Path, flags: i32, out: &mut OpenReply) -> i32 {
        let envelope = self.invoke(
            PathOp::Open,
            |op| {
                Ok(OpenArgs {
                    target: marshal::path(op, path)?,
                    flags,
                })
            },
            PathCall::open,
        );
        codec::fill_optional("open", envelope, out)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the byte count
    pub fn read(&self, path: &Path, fh: u64, offset: i64, buf: &mut [u8]) -> i32 {
        let len = buf.len();
        let envelope = self.invoke(
            PathOp::Read,
            |op| {
                Ok(ReadArgs {
                    target: marshal::path(op, path)?,
                    fh,
                    offset: marshal::offset(op, offset)?,
                    buf: marshal::read_buffer(op, len)?,
                })
            },
            PathCall::read,
        );
        codec::read_into("read", envelope, buf)
    }

    /// Write all of `data` at `offset`; returns the byte count
    pub fn write(&self, path: &Path, fh: u64, offset: i64, data: &[u8]) -> i32 {
        let envelope = self.invoke(
            PathOp::Write,
            |op| {
                Ok(WriteArgs {
                    target: marshal::path(op, path)?,
                    fh,
                    offset: marshal::offset(op, offset)?,
                    data: marshal::payload(op, data)?,
                })
            },
            PathCall::write,
        );
        codec::written("write", envelope, data.len())
    }

    pub fn release(&self, path: &Path, fh: u64, flags: i32, flush: bool) -> i32 {
        let envelope = self.invoke(
            PathOp::Release,
            |op| {
                Ok(ReleaseArgs {
                    target: marshal::path(op, path)?,
                    fh,
                    flags,
                    flush,
                })
            },
            PathCall::release,
        );
        codec::status("release", envelope)
    }

    pub fn create(&self, path: &Path, mode: u32, flags: i32, out: &mut OpenReply) -> i32 {
        let envelope = self.invoke(
            PathOp::Create,
            |op| {
                Ok(CreateArgs {
                    path: marshal::path(op, path)?,
                    mode,
                    flags,
                })
            },
            PathCall::create,
        );
        codec::fill_optional("create", envelope, out)
    }

    pub fn unlink(&self, path: &Path) -> i32 {
        let envelope = self.invoke(PathOp::Unlink, |op| marshal::path(op, path), PathCall::unlink);
        codec::status("unlink", envelope)
    }

    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> i32 {
        let envelope = self.invoke(
            PathOp::Rename,
            |op| {
                Ok(RenameArgs {
                    from: marshal::path(op, from)?,
                    to: marshal::path(op, to)?,
                    flags,
                })
            },
            PathCall::rename,
        );
        codec::status("rename", envelope)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> i32 {
        let envelope = self.invoke(
            PathOp::Mkdir,
            |op| {
                Ok(MkdirArgs {
                    path: marshal::path(op, path)?,
                    mode,
                })
            },
            PathCall::mkdir,
        );
        codec::status("mkdir", envelope)
    }

    pub fn rmdir(&self, path: &Path) -> i32 {
        let envelope = self.invoke(PathOp::Rmdir, |op| marshal::path(op, path), PathCall::rmdir);
        codec::status("rmdir", envelope)
    }

    pub fn link(&self, target: &Path, link: &Path) -> i32 {
        let envelope = self.invoke(
            PathOp::Link,
            |op| {
                Ok(LinkArgs {
                    target: marshal::path(op, target)?,
                    link: marshal::path(op, link)?,
                })
            },
            PathCall::link,
        );
        codec::status("link", envelope)
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> i32 {
        let envelope = self.invoke(
            PathOp::Symlink,
            |op| {
                Ok(SymlinkArgs {
                    target: marshal::path(op, target)?,
                    link: marshal::path(op, link)?,
                })
            },
            PathCall::symlink,
        );
        codec::status("symlink", envelope)
    }

    pub fn truncate(&self, path: &Path, size: u64, fh: Option<u64>) -> i32 {
        let envelope = self.invoke(
            PathOp::Truncate,
            |op| {
                Ok(TruncateArgs {
                    path: marshal::path(op, path)?,
                    size,
                    fh,
                })
            },
            PathCall::truncate,
        );
        codec::status("truncate", envelope)
    }

    pub fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> i32 {
        let envelope = self.invoke(
            PathOp::Utimens,
            |op| {
                Ok(UtimensArgs {
                    path: marshal::path(op, path)?,
                    atime,
                    mtime,
                })
            },
            PathCall::utimens,
        );
        codec::status("utimens", envelope)
    }

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> i32 {
        let envelope = self.invoke(
            PathOp::Setxattr,
            |op| {
                Ok(XattrArgs {
                    target: marshal::path(op, path)?,
                    name: marshal::name(op, name)?,
                    value: marshal::payload(op, value)?,
                    flags,
                })
            },
            PathCall::setxattr,
        );
        codec::status("setxattr", envelope)
    }

    pub fn statfs(&self, path: &Path, out: &mut StatFs) -> i32 {
        let envelope = self.invoke(PathOp::Statfs, |op| marshal::path(op, path), PathCall::statfs);
        codec::fill("statfs", envelope, out)
    }
}
