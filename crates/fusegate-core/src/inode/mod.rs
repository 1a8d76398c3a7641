// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode-addressed dialect
//!
//! Calls name their targets by inode number, plus a parent inode and a single
//! name component for name-space operations. Handlers own the inode table and
//! the lookup counts the kernel keeps against it.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::registry::{self, FsyncArgs, OpenArgs, ReadArgs, ReleaseArgs, WriteArgs, XattrArgs};
use crate::types::{Created, DirEntry, Entry, FileStat, OpenReply, SetAttr, StatFs};

mod entry;

/// The root directory's inode number
pub const ROOT_INO: u64 = 1;

/// A name inside a parent directory (lookup, unlink, rmdir)
#[derive(Clone, Debug)]
pub struct NameArgs {
    pub parent: u64,
    pub name: OsString,
}

/// The kernel dropped `nlookup` references to `ino`
#[derive(Clone, Copy, Debug)]
pub struct ForgetArgs {
    pub ino: u64,
    pub nlookup: u64,
}

#[derive(Clone, Debug)]
pub struct SetattrArgs {
    pub ino: u64,
    pub attr: SetAttr,
}

#[derive(Clone, Debug)]
pub struct MknodArgs {
    pub parent: u64,
    pub name: OsString,
    pub mode: u32,
    pub umask: u32,
    pub rdev: u32,
}

#[derive(Clone, Debug)]
pub struct MkdirArgs {
    pub parent: u64,
    pub name: OsString,
    pub mode: u32,
    pub umask: u32,
}

#[derive(Clone, Debug)]
pub struct SymlinkArgs {
    pub parent: u64,
    pub name: OsString,
    pub target: PathBuf,
}

#[derive(Clone, Debug)]
pub struct RenameArgs {
    pub parent: u64,
    pub name: OsString,
    pub newparent: u64,
    pub newname: OsString,
    pub flags: u32,
}

/// Hard link: `ino` gains the name `newname` in `newparent`
#[derive(Clone, Debug)]
pub struct LinkArgs {
    pub ino: u64,
    pub newparent: u64,
    pub newname: OsString,
}

#[derive(Clone, Copy, Debug)]
pub struct FlushArgs {
    pub ino: u64,
    pub fh: u64,
    pub lock_owner: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ReaddirArgs {
    pub ino: u64,
    pub fh: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct AccessArgs {
    pub ino: u64,
    pub mask: i32,
}

#[derive(Clone, Debug)]
pub struct CreateArgs {
    pub parent: u64,
    pub name: OsString,
    pub mode: u32,
    pub umask: u32,
    pub flags: i32,
}

dialect! {
    /// Inode-addressed calls, as low-level FUSE filesystems see them
    InodeDialect ("inode") {
        op: InodeOp,
        call: InodeCall,
        handlers: InodeHandlers,
    }
    /// Resolve a name; a successful reply counts as one lookup reference
    Lookup => lookup(NameArgs) -> Entry;
    Forget => forget(ForgetArgs) -> (), missing registry::ignored;
    Getattr => getattr(u64) -> FileStat;
    Setattr => setattr(SetattrArgs) -> FileStat;
    Readlink => readlink(u64) -> PathBuf;
    Mknod => mknod(MknodArgs) -> Entry;
    Mkdir => mkdir(MkdirArgs) -> Entry;
    Unlink => unlink(NameArgs) -> ();
    Rmdir => rmdir(NameArgs) -> ();
    Symlink => symlink(SymlinkArgs) -> Entry;
    Rename => rename(RenameArgs) -> ();
    Link => link(LinkArgs) -> Entry;
    Open => open(OpenArgs<u64>) -> OpenReply;
    Read => read(ReadArgs<u64>) -> Vec<u8>;
    /// Report the number of bytes written with `Completion::count`
    Write => write(WriteArgs<u64>) -> ();
    Flush => flush(FlushArgs) -> ();
    Release => release(ReleaseArgs<u64>) -> ();
    Fsync => fsync(FsyncArgs<u64>) -> ();
    Opendir => opendir(OpenArgs<u64>) -> OpenReply;
    /// Full listing including `.` and `..`; entries must carry an inode
    Readdir => readdir(ReaddirArgs) -> Vec<DirEntry>;
    Releasedir => releasedir(ReleaseArgs<u64>) -> ();
    Fsyncdir => fsyncdir(FsyncArgs<u64>) -> ();
    Statfs => statfs(u64) -> StatFs;
    Setxattr => setxattr(XattrArgs<u64>) -> ();
    Access => access(AccessArgs) -> ();
    Create => create(CreateArgs) -> Created;
}
