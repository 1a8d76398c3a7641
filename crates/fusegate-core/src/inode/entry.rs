// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous inode-dialect entry points, called on transport worker threads

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::{
    AccessArgs, CreateArgs, FlushArgs, ForgetArgs, InodeCall, InodeDialect, InodeOp, LinkArgs,
    MkdirArgs, MknodArgs, NameArgs, ReaddirArgs, RenameArgs, SetattrArgs, SymlinkArgs,
};
use crate::codec;
use crate::dispatcher::Dispatcher;
use crate::marshal;
use crate::registry::{FsyncArgs, OpenArgs, ReadArgs, ReleaseArgs, WriteArgs, XattrArgs};
use crate::types::{Created, DirEntry, Entry, FileStat, OpenReply, SetAttr, StatFs};

impl Dispatcher<InodeDialect> {
    pub fn lookup(&self, parent: u64, name: &OsStr, out: &mut Entry) -> i32 {
        let envelope = self.invoke(
            InodeOp::Lookup,
            |op| {
                Ok(NameArgs {
                    parent,
                    name: marshal::name(op, name)?,
                })
            },
            InodeCall::lookup,
        );
        codec::fill("lookup", envelope, out)
    }

    /// The kernel expects no reply; the status is only useful to tests
    pub fn forget(&self, ino: u64, nlookup: u64) -> i32 {
        let envelope = self.invoke(InodeOp::Forget, |_| Ok(ForgetArgs { ino, nlookup }), InodeCall::forget);
        codec::status("forget", envelope)
    }

    pub fn getattr(&self, ino: u64, out: &mut FileStat) -> i32 {
        let envelope = self.invoke(InodeOp::Getattr, |_| Ok(ino), InodeCall::getattr);
        codec::fill("getattr", envelope, out)
    }

    /// Apply `attr` and report the resulting attributes
    pub fn setattr(&self, ino: u64, attr: SetAttr, out: &mut FileStat) -> i32 {
        let envelope = self.invoke(InodeOp::Setattr, |_| Ok(SetattrArgs { ino, attr }), InodeCall::setattr);
        codec::fill("setattr", envelope, out)
    }

    pub fn readlink(&self, ino: u64, out: &mut PathBuf) -> i32 {
        let envelope = self.invoke(InodeOp::Readlink, |_| Ok(ino), InodeCall::readlink);
        codec::fill("readlink", envelope, out)
    }

    pub fn mknod(&self, parent: u64, name: &OsStr, mode: u32, umask: u32, rdev: u32, out: &mut Entry) -> i32 {
        let envelope = self.invoke(
            InodeOp::Mknod,
            |op| {
                Ok(MknodArgs {
                    parent,
                    name: marshal::name(op, name)?,
                    mode,
                    umask,
                    rdev,
                })
            },
            InodeCall::mknod,
        );
        codec::fill("mknod", envelope, out)
    }

    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32, out: &mut Entry) -> i32 {
        let envelope = self.invoke(
            InodeOp::Mkdir,
            |op| {
                Ok(MkdirArgs {
                    parent,
                    name: marshal::name(op, name)?,
                    mode,
                    umask,
                })
            },
            InodeCall::mkdir,
        );
        codec::fill("mkdir", envelope, out)
    }

    pub fn unlink(&self, parent: u64, name: &OsStr) -> i32 {
        let envelope = self.invoke(
            InodeOp::Unlink,
            |op| {
                Ok(NameArgs {
                    parent,
                    name: marshal::name(op, name)?,
                })
            },
            InodeCall::unlink,
        );
        codec::status("unlink", envelope)
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr) -> i32 {
        let envelope = self.invoke(
            InodeOp::Rmdir,
            |op| {
                Ok(NameArgs {
                    parent,
                    name: marshal::name(op, name)?,
                })
            },
            InodeCall::rmdir,
        );
        codec::status("rmdir", envelope)
    }

    pub fn symlink(&self, parent: u64, name: &OsStr, target: &Path, out: &mut Entry) -> i32 {
        let envelope = self.invoke(
            InodeOp::Symlink,
            |op| {
                Ok(SymlinkArgs {
                    parent,
                    name: marshal::name(op, name)?,
                    target: marshal::path(op, target)?,
                })
            },
            InodeCall::symlink,
        );
        codec::fill("symlink", envelope, out)
    }

    pub fn rename(&self, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32) -> i32 {
        let envelope = self.invoke(
            InodeOp::Rename,
            |op| {
                Ok(RenameArgs {
                    parent,
                    name: marshal::name(op, name)?,
                    newparent,
                    newname: marshal::name(op, newname)?,
                    flags,
                })
            },
            InodeCall::rename,
        );
        codec::status("rename", envelope)
    }

    pub fn link(&self, ino: u64, newparent: u64, newname: &OsStr, out: &mut Entry) -> i32 {
        let envelope = self.invoke(
            InodeOp::Link,
            |op| {
                Ok(LinkArgs {
                    ino,
                    newparent,
                    newname: marshal::name(op, newname)?,
                })
            },
            InodeCall::link,
        );
        codec::fill("link", envelope, out)
    }

    pub fn open(&self, ino: u64, flags: i32, out: &mut OpenReply) -> i32 {
        let envelope = self.invoke(InodeOp::Open, |_| Ok(OpenArgs { target: ino, flags }), InodeCall::open);
        codec::fill_optional("open", envelope, out)
    }

    pub fn read(&self, ino: u64, fh: u64, offset: i64, buf: &mut [u8]) -> i32 {
        let len = buf.len();
        let envelope = self.invoke(
            InodeOp::Read,
            |op| {
                Ok(ReadArgs {
                    target: ino,
                    fh,
                    offset: marshal::offset(op, offset)?,
                    buf: marshal::read_buffer(op, len)?,
                })
            },
            InodeCall::read,
        );
        codec::read_into("read", envelope, buf)
    }

    pub fn write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> i32 {
        let envelope = self.invoke(
            InodeOp::Write,
            |op| {
                Ok(WriteArgs {
                    target: ino,
                    fh,
                    offset: marshal::offset(op, offset)?,
                    data: marshal::payload(op, data)?,
                })
            },
            InodeCall::write,
        );
        codec::written("write", envelope, data.len())
    }

    pub fn flush(&self, ino: u64, fh: u64, lock_owner: u64) -> i32 {
        let envelope = self.invoke(
            InodeOp::Flush,
            |_| Ok(FlushArgs { ino, fh, lock_owner }),
            InodeCall::flush,
        );
        codec::status("flush", envelope)
    }

    pub fn release(&self, ino: u64, fh: u64, flags: i32, flush: bool) -> i32 {
        let envelope = self.invoke(
            InodeOp::Release,
            |_| {
                Ok(ReleaseArgs {
                    target: ino,
                    fh,
                    flags,
                    flush,
                })
            },
            InodeCall::release,
        );
        codec::status("release", envelope)
    }

    pub fn fsync(&self, ino: u64, fh: u64, datasync: bool) -> i32 {
        let envelope = self.invoke(
            InodeOp::Fsync,
            |_| {
                Ok(FsyncArgs {
                    target: ino,
                    fh,
                    datasync,
                })
            },
            InodeCall::fsync,
        );
        codec::status("fsync", envelope)
    }

    pub fn opendir(&self, ino: u64, flags: i32, out: &mut OpenReply) -> i32 {
        let envelope = self.invoke(InodeOp::Opendir, |_| Ok(OpenArgs { target: ino, flags }), InodeCall::opendir);
        codec::fill_optional("opendir", envelope, out)
    }

    pub fn readdir(&self, ino: u64, fh: u64, filler: &mut dyn FnMut(&DirEntry) -> bool) -> i32 {
        let envelope = self.invoke(InodeOp::Readdir, |_| Ok(ReaddirArgs { ino, fh }), InodeCall::readdir);
        codec::entries("readdir", envelope, filler)
    }

    pub fn releasedir(&self, ino: u64, fh: u64, flags: i32) -> i32 {
        let envelope = self.invoke(
            InodeOp::Releasedir,
            |_| {
                Ok(ReleaseArgs {
                    target: ino,
                    fh,
                    flags,
                    flush: false,
                })
            },
            InodeCall::releasedir,
        );
        codec::status("releasedir", envelope)
    }

    pub fn fsyncdir(&self, ino: u64, fh: u64, datasync: bool) -> i32 {
        let envelope = self.invoke(
            InodeOp::Fsyncdir,
            |_| {
                Ok(FsyncArgs {
                    target: ino,
                    fh,
                    datasync,
                })
            },
            InodeCall::fsyncdir,
        );
        codec::status("fsyncdir", envelope)
    }

    pub fn statfs(&self, ino: u64, out: &mut StatFs) -> i32 {
        let envelope = self.invoke(InodeOp::Statfs, |_| Ok(ino), InodeCall::statfs);
        codec::fill("statfs", envelope, out)
    }

    pub fn setxattr(&self, ino: u64, name: &OsStr, value: &[u8], flags: i32) -> i32 {
        let envelope = self.invoke(
            InodeOp::Setxattr,
            |op| {
                Ok(XattrArgs {
                    target: ino,
                    name: marshal::name(op, name)?,
                    value: marshal::payload(op, value)?,
                    flags,
                })
            },
            InodeCall::setxattr,
        );
        codec::status("setxattr", envelope)
    }

    pub fn access(&self, ino: u64, mask: i32) -> i32 {
        let envelope = self.invoke(InodeOp::Access, |_| Ok(AccessArgs { ino, mask }), InodeCall::access);
        codec::status("access", envelope)
    }

    pub fn create(&self, parent: u64, name: &OsStr, mode: u32, umask: u32, flags: i32, out: &mut Created) -> i32 {
        let envelope = self.invoke(
            InodeOp::Create,
            |op| {
                Ok(CreateArgs {
                    parent,
                    name: marshal::name(op, name)?,
                    mode,
                    umask,
                    flags,
                })
            },
            InodeCall::create,
        );
        codec::fill("create", envelope, out)
    }
}
