// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-addressed dialect
//!
//! Every call names its target by an absolute path inside the mount. Handlers
//! receive owned `PathBuf`s; the transport adapter is responsible for turning
//! kernel inode numbers into paths.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::registry::{OpenArgs, ReadArgs, ReleaseArgs, WriteArgs, XattrArgs};
use crate::types::{DirEntry, FileStat, OpenReply, StatFs};

mod entry;

#[derive(Clone, Debug)]
pub struct CreateArgs {
    pub path: PathBuf,
    pub mode: u32,
    pub flags: i32,
}

#[derive(Clone, Debug)]
pub struct MkdirArgs {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Clone, Debug)]
pub struct RenameArgs {
    pub from: PathBuf,
    pub to: PathBuf,
    pub flags: u32,
}

/// Hard link: `link` becomes another name for the existing `target`
#[derive(Clone, Debug)]
pub struct LinkArgs {
    pub target: PathBuf,
    pub link: PathBuf,
}

/// Symbolic link: `link` is created with contents `target`, which is not
/// resolved
#[derive(Clone, Debug)]
pub struct SymlinkArgs {
    pub target: PathBuf,
    pub link: PathBuf,
}

#[derive(Clone, Debug)]
pub struct TruncateArgs {
    pub path: PathBuf,
    pub size: u64,
    pub fh: Option<u64>,
}

/// `None` leaves the timestamp alone
#[derive(Clone, Debug)]
pub struct UtimensArgs {
    pub path: PathBuf,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

dialect! {
    /// Path-addressed calls, as high-level FUSE filesystems see them
    PathDialect ("path") {
        op: PathOp,
        call: PathCall,
        handlers: PathHandlers,
    }
    Getattr => getattr(PathBuf) -> FileStat;
    Readlink => readlink(PathBuf) -> PathBuf;
    /// Full listing of a directory, in the order it should be shown
    Readdir => readdir(PathBuf) -> Vec<DirEntry>;
    Open => open(OpenArgs<PathBuf>) -> OpenReply;
    Read => read(ReadArgs<PathBuf>) -> Vec<u8>;
    /// Report the number of bytes written with `Completion::count`
    Write => write(WriteArgs<PathBuf>) -> ();
    Release => release(ReleaseArgs<PathBuf>) -> ();
    Create => create(CreateArgs) -> OpenReply;
    Unlink => unlink(PathBuf) -> ();
    Rename => rename(RenameArgs) -> ();
    Mkdir => mkdir(MkdirArgs) -> ();
    Rmdir => rmdir(PathBuf) -> ();
    Link => link(LinkArgs) -> ();
    Symlink => symlink(SymlinkArgs) -> ();
    Truncate => truncate(TruncateArgs) -> ();
    Utimens => utimens(UtimensArgs) -> ();
    Setxattr => setxattr(XattrArgs<PathBuf>) -> ();
    Statfs => statfs(PathBuf) -> StatFs;
}
