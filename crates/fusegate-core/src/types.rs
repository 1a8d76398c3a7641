// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Payload types that handlers report back through their completions

use std::ffi::OsString;
use std::time::SystemTime;

/// Kind of filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    Directory,
    #[default]
    RegularFile,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    /// Decode the `S_IFMT` bits of a mode
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::NamedPipe,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    /// The `S_IFMT` bits for this kind
    pub fn type_bits(self) -> u32 {
        let bits = match self {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::RegularFile => libc::S_IFREG,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::NamedPipe => libc::S_IFIFO,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::Socket => libc::S_IFSOCK,
        };
        bits as u32
    }
}

/// File attributes, the payload of getattr/setattr/lookup style calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub size: u64,
    /// Allocated size in 512-byte blocks
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileKind,
    /// Permission bits (`0o7777` range)
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Default for FileStat {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind: FileKind::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
        }
    }
}

impl FileStat {
    /// Attributes from a full `st_mode` value (type bits plus permissions)
    pub fn from_mode(mode: u32, size: u64) -> Self {
        Self {
            size,
            blocks: size.div_ceil(512),
            kind: FileKind::from_mode(mode),
            perm: (mode & 0o7777) as u16,
            nlink: if FileKind::from_mode(mode) == FileKind::Directory { 2 } else { 1 },
            ..Self::default()
        }
    }

    /// Full `st_mode` value
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | u32::from(self.perm)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Set size and recompute the block count
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.blocks = size.div_ceil(512);
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.mtime = now;
        self.ctime = now;
    }
}

/// Requested attribute changes; `None` leaves the attribute alone
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub fh: Option<u64>,
}

impl SetAttr {
    /// Nothing to change; `fh` alone does not count
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Apply the requested changes to `stat`. An empty request leaves it as is.
    pub fn apply(&self, stat: &mut FileStat, now: SystemTime) {
        if self.is_empty() {
            return;
        }
        if let Some(mode) = self.mode {
            stat.perm = (mode & 0o7777) as u16;
        }
        if let Some(uid) = self.uid {
            stat.uid = uid;
        }
        if let Some(gid) = self.gid {
            stat.gid = gid;
        }
        if let Some(size) = self.size {
            stat.set_size(size);
            stat.mtime = now;
        }
        if let Some(atime) = self.atime {
            stat.atime = atime;
        }
        if let Some(mtime) = self.mtime {
            stat.mtime = mtime;
        }
        stat.ctime = now;
    }
}

/// One directory listing entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    /// Per-entry identifier; the inode dialect relies on it
    pub ino: Option<u64>,
    pub kind: Option<FileKind>,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            ino: None,
            kind: None,
        }
    }

    pub fn with_ino(mut self, ino: u64) -> Self {
        self.ino = Some(ino);
        self
    }

    pub fn with_kind(mut self, kind: FileKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Name-resolution result of the inode dialect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    pub generation: u64,
    pub attr: FileStat,
}

impl Entry {
    pub fn new(attr: FileStat) -> Self {
        Self {
            ino: attr.ino,
            generation: 0,
            attr,
        }
    }
}

/// Result of open/opendir
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenReply {
    /// Handle echoed back on read/write/release; zero when unused
    pub fh: u64,
    pub flags: u32,
}

impl OpenReply {
    pub fn handle(fh: u64) -> Self {
        Self { fh, flags: 0 }
    }
}

/// Result of inode-dialect create: the new entry plus its open handle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Created {
    pub entry: Entry,
    pub open: OpenReply,
}

/// Filesystem statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 512,
            namelen: 255,
            frsize: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn mode_roundtrips_through_kind_and_perm() {
        let stat = FileStat::from_mode(0o040755, 0);
        assert_eq!(stat.kind, FileKind::Directory);
        assert_eq!(stat.perm, 0o755);
        assert_eq!(stat.nlink, 2);
        assert_eq!(stat.mode(), 0o040755);

        let stat = FileStat::from_mode(0o100644, 1025);
        assert_eq!(stat.kind, FileKind::RegularFile);
        assert_eq!(stat.blocks, 3);
    }

    #[test]
    fn setattr_only_touches_requested_fields() {
        let mut stat = FileStat::from_mode(0o100644, 10);
        stat.uid = 7;
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        SetAttr {
            size: Some(0),
            mode: Some(0o600),
            ..SetAttr::default()
        }
        .apply(&mut stat, now);
        assert_eq!(stat.size, 0);
        assert_eq!(stat.perm, 0o600);
        assert_eq!(stat.uid, 7);
        assert_eq!(stat.mtime, now);
        assert_eq!(stat.ctime, now);
    }

    #[test]
    fn empty_setattr_keeps_the_change_time() {
        let mut stat = FileStat::from_mode(0o100644, 10);
        let before = stat.clone();
        let request = SetAttr {
            fh: Some(3),
            ..SetAttr::default()
        };
        assert!(request.is_empty());
        request.apply(&mut stat, SystemTime::UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!(stat, before);
    }
}
