// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel transport through `fuser`
//!
//! [`InodeFuse`] forwards low-level requests one to one. [`PathFuse`] keeps
//! an inode <-> path table so that path-dialect handlers never see inode
//! numbers. Both hand every request to a [`WorkerPool`] thread, which blocks
//! on the bridge while the session thread goes on reading requests.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::{c_int, ENOENT, ENOSYS};
use tracing::{debug, info};

use super::workers::WorkerPool;
use super::{Transport, TransportSession};
use crate::config::{MountConfig, DEFAULT_FSNAME};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, BridgeResult, Errno};
use crate::inode::{InodeDialect, InodeHandlers};
use crate::mount::MountController;
use crate::path::{PathDialect, PathHandlers};
use crate::types::{Created, Entry, FileKind, FileStat, OpenReply, SetAttr, StatFs};

/// Directory entry inode the kernel is told when a handler gave none
const FUSE_UNKNOWN_INO: u64 = 0xffff_ffff;

/// Mount a path-dialect handler set on `config.mount_point` and serve it
/// until unmounted
pub fn mount_path(config: MountConfig, handlers: PathHandlers) -> BridgeResult<()> {
    MountController::<PathDialect>::new(config, handlers).run_blocking(FuseTransport)
}

/// Mount an inode-dialect handler set on `config.mount_point` and serve it
/// until unmounted
pub fn mount_inode(config: MountConfig, handlers: InodeHandlers) -> BridgeResult<()> {
    MountController::<InodeDialect>::new(config, handlers).run_blocking(FuseTransport)
}

/// Translate option strings, after a default `fsname`. Comma-separated
/// lists are accepted; unknown options pass through verbatim.
pub fn mount_options(options: &[String]) -> Vec<MountOption> {
    let parsed: Vec<MountOption> = options
        .iter()
        .flat_map(|group| group.split(','))
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .map(parse_option)
        .collect();
    let mut all = Vec::with_capacity(parsed.len() + 1);
    if !parsed.iter().any(|option| matches!(option, MountOption::FSName(_))) {
        all.push(MountOption::FSName(DEFAULT_FSNAME.to_string()));
    }
    all.extend(parsed);
    all
}

fn parse_option(option: &str) -> MountOption {
    match option {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        other => match other.split_once('=') {
            Some(("fsname", name)) => MountOption::FSName(name.to_string()),
            Some(("subtype", name)) => MountOption::Subtype(name.to_string()),
            _ => MountOption::CUSTOM(other.to_string()),
        },
    }
}

/// Mounts through the kernel FUSE device
#[derive(Clone, Copy, Debug, Default)]
pub struct FuseTransport;

impl Transport<PathDialect> for FuseTransport {
    type Session = FuseSession;

    fn start(self, config: &MountConfig, dispatcher: Dispatcher<PathDialect>) -> BridgeResult<FuseSession> {
        spawn(PathFuse::new(dispatcher, config), config)
    }
}

impl Transport<InodeDialect> for FuseTransport {
    type Session = FuseSession;

    fn start(self, config: &MountConfig, dispatcher: Dispatcher<InodeDialect>) -> BridgeResult<FuseSession> {
        spawn(InodeFuse::new(dispatcher, config), config)
    }
}

pub struct FuseSession {
    session: fuser::BackgroundSession,
}

impl TransportSession for FuseSession {
    fn shutdown(self) {
        // Unmounts, then waits for the session thread to drop the filesystem.
        self.session.join();
    }
}

fn spawn<F: Filesystem + Send + 'static>(filesystem: F, config: &MountConfig) -> BridgeResult<FuseSession> {
    let mount_point = &config.mount_point;
    let metadata = std::fs::metadata(mount_point).map_err(|source| BridgeError::MountPoint {
        path: mount_point.clone(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(BridgeError::MountPoint {
            path: mount_point.clone(),
            source: io::Error::from_raw_os_error(libc::ENOTDIR),
        });
    }

    let options = mount_options(&config.options);
    info!(target: "fusegate::fuse", mount_point = %mount_point.display(), ?options, "mounting");
    let session = fuser::spawn_mount2(filesystem, mount_point, &options).map_err(BridgeError::Transport)?;
    Ok(FuseSession { session })
}

fn errno(status: i32) -> c_int {
    Errno::from_status(status).unwrap_or(Errno::EIO).code()
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

fn file_attr(stat: &FileStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: file_type(stat.kind),
        perm: stat.perm,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: stat.blksize,
        flags: 0,
    }
}

fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|time| match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    })
}

fn reply_statfs(reply: ReplyStatfs, stats: &StatFs) {
    reply.statfs(
        stats.blocks,
        stats.bfree,
        stats.bavail,
        stats.files,
        stats.ffree,
        stats.bsize,
        stats.namelen,
        stats.frsize,
    );
}

fn log_init(dialect: &'static str, pool: &WorkerPool) {
    info!(target: "fusegate::fuse", dialect, workers = pool.thread_count(), "fuse session initialized");
}

/// Low-level requests, forwarded to inode-dialect handlers
pub struct InodeFuse {
    dispatcher: Dispatcher<InodeDialect>,
    pool: WorkerPool,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl InodeFuse {
    pub fn new(dispatcher: Dispatcher<InodeDialect>, config: &MountConfig) -> Self {
        Self {
            dispatcher,
            pool: WorkerPool::new(config.workers),
            attr_ttl: config.attr_ttl(),
            entry_ttl: config.entry_ttl(),
        }
    }

    fn reply_entry(&self, reply: ReplyEntry, run: impl FnOnce(&Dispatcher<InodeDialect>, &mut Entry) -> i32 + Send + 'static) {
        let dispatcher = self.dispatcher.clone();
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let mut entry = Entry::default();
            match run(&dispatcher, &mut entry) {
                0 => reply.entry(&ttl, &file_attr(&entry.attr, entry.ino), entry.generation),
                status => reply.error(errno(status)),
            }
        });
    }

    fn reply_empty(&self, reply: ReplyEmpty, run: impl FnOnce(&Dispatcher<InodeDialect>) -> i32 + Send + 'static) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || match run(&dispatcher) {
            0 => reply.ok(),
            status => reply.error(errno(status)),
        });
    }
}

impl Filesystem for InodeFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        log_init("inode", &self.pool);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(target: "fusegate::fuse", calls = self.dispatcher.calls(), "fuse session finished");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_os_string();
        self.reply_entry(reply, move |d, out| d.lookup(parent, &name, out));
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            dispatcher.forget(ino, nlookup);
        });
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let dispatcher = self.dispatcher.clone();
        let ttl = self.attr_ttl;
        self.pool.run(move || {
            let mut stat = FileStat::default();
            match dispatcher.getattr(ino, &mut stat) {
                0 => reply.attr(&ttl, &file_attr(&stat, ino)),
                status => reply.error(errno(status)),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: resolve_time(atime),
            mtime: resolve_time(mtime),
            fh,
        };
        let dispatcher = self.dispatcher.clone();
        let ttl = self.attr_ttl;
        self.pool.run(move || {
            let mut stat = FileStat::default();
            match dispatcher.setattr(ino, attr, &mut stat) {
                0 => reply.attr(&ttl, &file_attr(&stat, ino)),
                status => reply.error(errno(status)),
            }
        });
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut target = PathBuf::new();
            match dispatcher.readlink(ino, &mut target) {
                0 => reply.data(target.as_os_str().as_bytes()),
                status => reply.error(errno(status)),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_os_string();
        self.reply_entry(reply, move |d, out| d.mknod(parent, &name, mode, umask, rdev, out));
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let name = name.to_os_string();
        self.reply_entry(reply, move |d, out| d.mkdir(parent, &name, mode, umask, out));
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_os_string();
        self.reply_empty(reply, move |d| d.unlink(parent, &name));
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_os_string();
        self.reply_empty(reply, move |d| d.rmdir(parent, &name));
    }

    fn symlink(&mut self, _req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let name = link_name.to_os_string();
        let target = target.to_path_buf();
        self.reply_entry(reply, move |d, out| d.symlink(parent, &name, &target, out));
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.reply_empty(reply, move |d| d.rename(parent, &name, newparent, &newname, flags));
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let newname = newname.to_os_string();
        self.reply_entry(reply, move |d, out| d.link(ino, newparent, &newname, out));
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut open = OpenReply::default();
            match dispatcher.open(ino, flags, &mut open) {
                0 => reply.opened(open.fh, open.flags),
                status => reply.error(errno(status)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut buf = vec![0u8; size as usize];
            match dispatcher.read(ino, fh, offset, &mut buf) {
                status if status < 0 => reply.error(errno(status)),
                count => reply.data(&buf[..count as usize]),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || match dispatcher.write(ino, fh, offset, &data) {
            status if status < 0 => reply.error(errno(status)),
            count => reply.written(count as u32),
        });
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        self.reply_empty(reply, move |d| d.flush(ino, fh, lock_owner));
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        self.reply_empty(reply, move |d| d.release(ino, fh, flags, flush));
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.reply_empty(reply, move |d| d.fsync(ino, fh, datasync));
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut open = OpenReply::default();
            match dispatcher.opendir(ino, flags, &mut open) {
                0 => reply.opened(open.fh, open.flags),
                status => reply.error(errno(status)),
            }
        });
    }

    fn readdir(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut position = 0i64;
            let status = dispatcher.readdir(ino, fh, &mut |entry| {
                position += 1;
                if position <= offset {
                    return false;
                }
                reply.add(
                    entry.ino.unwrap_or(FUSE_UNKNOWN_INO),
                    position,
                    file_type(entry.kind.unwrap_or_default()),
                    &entry.name,
                )
            });
            if status < 0 {
                reply.error(errno(status));
            } else {
                reply.ok();
            }
        });
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        self.reply_empty(reply, move |d| d.releasedir(ino, fh, flags));
    }

    fn fsyncdir(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.reply_empty(reply, move |d| d.fsyncdir(ino, fh, datasync));
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut stats = StatFs::default();
            match dispatcher.statfs(ino, &mut stats) {
                0 => reply_statfs(reply, &stats),
                status => reply.error(errno(status)),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_os_string();
        let value = value.to_vec();
        self.reply_empty(reply, move |d| d.setxattr(ino, &name, &value, flags));
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.reply_empty(reply, move |d| d.access(ino, mask));
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_os_string();
        let dispatcher = self.dispatcher.clone();
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let mut created = Created::default();
            match dispatcher.create(parent, &name, mode, umask, flags, &mut created) {
                0 => {
                    let Created { entry, open } = created;
                    reply.created(&ttl, &file_attr(&entry.attr, entry.ino), entry.generation, open.fh, open.flags);
                }
                status => reply.error(errno(status)),
            }
        });
    }
}

/// Inode numbers handed to the kernel for paths, and back
struct PathTable {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl PathTable {
    fn new() -> Self {
        let root = PathBuf::from("/");
        Self {
            paths: HashMap::from([(FUSE_ROOT_ID, root.clone())]),
            inodes: HashMap::from([(root, FUSE_ROOT_ID)]),
            next_inode: FUSE_ROOT_ID + 1,
        }
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.paths.get(&parent).map(|path| path.join(name))
    }

    fn get_or_alloc_inode(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.inodes.insert(path.to_path_buf(), ino);
        ino
    }

    /// A second name for an existing inode (hard link)
    fn alias(&mut self, path: PathBuf, ino: u64) {
        self.inodes.insert(path, ino);
    }

    /// Drop one name. An inode whose primary name goes is re-homed on a
    /// remaining hard link, if any.
    fn remove(&mut self, path: &Path) {
        let Some(ino) = self.inodes.remove(path) else {
            return;
        };
        if self.paths.get(&ino).is_some_and(|known| known == path) {
            match self.inodes.iter().find(|(_, other)| **other == ino) {
                Some((alias, _)) => {
                    let alias = alias.clone();
                    self.paths.insert(ino, alias);
                }
                None => {
                    self.paths.remove(&ino);
                }
            }
        }
    }

    /// Move `from` and everything below it to `to`
    fn rename(&mut self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(PathBuf, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            self.inodes.remove(&old);
            self.inodes.insert(new.clone(), ino);
            self.paths.insert(ino, new);
        }
    }

    fn forget(&mut self, ino: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        if self.paths.remove(&ino).is_some() {
            self.inodes.retain(|_, known| *known != ino);
        }
    }
}

/// Low-level requests, translated to path-dialect handlers
pub struct PathFuse {
    dispatcher: Dispatcher<PathDialect>,
    table: Arc<Mutex<PathTable>>,
    pool: WorkerPool,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

fn table(table: &Mutex<PathTable>) -> MutexGuard<'_, PathTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PathFuse {
    pub fn new(dispatcher: Dispatcher<PathDialect>, config: &MountConfig) -> Self {
        Self {
            dispatcher,
            table: Arc::new(Mutex::new(PathTable::new())),
            pool: WorkerPool::new(config.workers),
            attr_ttl: config.attr_ttl(),
            entry_ttl: config.entry_ttl(),
        }
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        table(&self.table).path(ino)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        table(&self.table).child(parent, name)
    }

    /// Run `create` for `path`, then answer with its fresh attributes
    fn reply_new_entry(
        &self,
        path: PathBuf,
        reply: ReplyEntry,
        create: impl FnOnce(&Dispatcher<PathDialect>, &Path) -> i32 + Send + 'static,
    ) {
        let dispatcher = self.dispatcher.clone();
        let paths = Arc::clone(&self.table);
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let status = create(&dispatcher, &path);
            if status < 0 {
                return reply.error(errno(status));
            }
            let mut stat = FileStat::default();
            match dispatcher.getattr(&path, &mut stat) {
                0 => {
                    let ino = table(&paths).get_or_alloc_inode(&path);
                    reply.entry(&ttl, &file_attr(&stat, ino), 0);
                }
                status => reply.error(errno(status)),
            }
        });
    }

    fn reply_empty(&self, reply: ReplyEmpty, run: impl FnOnce(&Dispatcher<PathDialect>) -> i32 + Send + 'static) {
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || match run(&dispatcher) {
            0 => reply.ok(),
            status => reply.error(errno(status)),
        });
    }
}

impl Filesystem for PathFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        log_init("path", &self.pool);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(target: "fusegate::fuse", calls = self.dispatcher.calls(), "fuse session finished");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child(parent, name) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        let paths = Arc::clone(&self.table);
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let mut stat = FileStat::default();
            match dispatcher.getattr(&path, &mut stat) {
                0 => {
                    let ino = table(&paths).get_or_alloc_inode(&path);
                    reply.entry(&ttl, &file_attr(&stat, ino), 0);
                }
                status => reply.error(errno(status)),
            }
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        table(&self.table).forget(ino);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        let ttl = self.attr_ttl;
        self.pool.run(move || {
            let mut stat = FileStat::default();
            match dispatcher.getattr(&path, &mut stat) {
                0 => reply.attr(&ttl, &file_attr(&stat, ino)),
                status => reply.error(errno(status)),
            }
        });
    }

    /// Size changes become truncate, time changes utimens. There is no
    /// path-dialect call for ownership or permission changes.
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if mode.is_some() || uid.is_some() || gid.is_some() {
            return reply.error(ENOSYS);
        }
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let (atime, mtime) = (resolve_time(atime), resolve_time(mtime));
        let dispatcher = self.dispatcher.clone();
        let ttl = self.attr_ttl;
        self.pool.run(move || {
            if let Some(size) = size {
                let status = dispatcher.truncate(&path, size, fh);
                if status < 0 {
                    return reply.error(errno(status));
                }
            }
            if atime.is_some() || mtime.is_some() {
                let status = dispatcher.utimens(&path, atime, mtime);
                if status < 0 {
                    return reply.error(errno(status));
                }
            }
            let mut stat = FileStat::default();
            match dispatcher.getattr(&path, &mut stat) {
                0 => reply.attr(&ttl, &file_attr(&stat, ino)),
                status => reply.error(errno(status)),
            }
        });
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut target = PathBuf::new();
            match dispatcher.readlink(&path, &mut target) {
                0 => reply.data(target.as_os_str().as_bytes()),
                status => reply.error(errno(status)),
            }
        });
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child(parent, name) else {
            return reply.error(ENOENT);
        };
        self.reply_new_entry(path, reply, move |d, path| d.mkdir(path, mode & !umask));
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            return reply.error(ENOENT);
        };
        let paths = Arc::clone(&self.table);
        self.reply_empty(reply, move |d| {
            let status = d.unlink(&path);
            if status == 0 {
                table(&paths).remove(&path);
            }
            status
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            return reply.error(ENOENT);
        };
        let paths = Arc::clone(&self.table);
        self.reply_empty(reply, move |d| {
            let status = d.rmdir(&path);
            if status == 0 {
                table(&paths).remove(&path);
            }
            status
        });
    }

    fn symlink(&mut self, _req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let Some(path) = self.child(parent, link_name) else {
            return reply.error(ENOENT);
        };
        let target = target.to_path_buf();
        self.reply_new_entry(path, reply, move |d, path| d.symlink(&target, path));
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (self.child(parent, name), self.child(newparent, newname)) else {
            return reply.error(ENOENT);
        };
        let paths = Arc::clone(&self.table);
        self.reply_empty(reply, move |d| {
            let status = d.rename(&from, &to, flags);
            if status == 0 {
                table(&paths).rename(&from, &to);
            }
            status
        });
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let (Some(target), Some(link)) = (self.path(ino), self.child(newparent, newname)) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        let paths = Arc::clone(&self.table);
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let status = dispatcher.link(&target, &link);
            if status < 0 {
                return reply.error(errno(status));
            }
            let mut stat = FileStat::default();
            match dispatcher.getattr(&link, &mut stat) {
                0 => {
                    table(&paths).alias(link, ino);
                    reply.entry(&ttl, &file_attr(&stat, ino), 0);
                }
                status => reply.error(errno(status)),
            }
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut open = OpenReply::default();
            match dispatcher.open(&path, flags, &mut open) {
                0 => reply.opened(open.fh, open.flags),
                status => reply.error(errno(status)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut buf = vec![0u8; size as usize];
            match dispatcher.read(&path, fh, offset, &mut buf) {
                status if status < 0 => reply.error(errno(status)),
                count => reply.data(&buf[..count as usize]),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let data = data.to_vec();
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || match dispatcher.write(&path, fh, offset, &data) {
            status if status < 0 => reply.error(errno(status)),
            count => reply.written(count as u32),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path(ino) else {
            return reply.ok();
        };
        self.reply_empty(reply, move |d| d.release(&path, fh, flags, flush));
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        let paths = Arc::clone(&self.table);
        self.pool.run(move || {
            let parent_ino = match path.parent() {
                Some(parent) => table(&paths).get_or_alloc_inode(parent),
                None => FUSE_ROOT_ID,
            };
            let mut position = 0i64;
            let mut emit = |ino: u64, kind: FileType, name: &OsStr| -> bool {
                position += 1;
                position > offset && reply.add(ino, position, kind, name)
            };
            if emit(ino, FileType::Directory, OsStr::new(".")) || emit(parent_ino, FileType::Directory, OsStr::new("..")) {
                return reply.ok();
            }
            let status = dispatcher.readdir(&path, &mut |entry| {
                let child = table(&paths).get_or_alloc_inode(&path.join(&entry.name));
                emit(child, file_type(entry.kind.unwrap_or_default()), &entry.name)
            });
            if status < 0 {
                reply.error(errno(status));
            } else {
                reply.ok();
            }
        });
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        self.pool.run(move || {
            let mut stats = StatFs::default();
            match dispatcher.statfs(&path, &mut stats) {
                0 => reply_statfs(reply, &stats),
                status => reply.error(errno(status)),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path(ino) else {
            return reply.error(ENOENT);
        };
        let name = name.to_os_string();
        let value = value.to_vec();
        self.reply_empty(reply, move |d| d.setxattr(&path, &name, &value, flags));
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child(parent, name) else {
            return reply.error(ENOENT);
        };
        let dispatcher = self.dispatcher.clone();
        let paths = Arc::clone(&self.table);
        let ttl = self.entry_ttl;
        self.pool.run(move || {
            let mut open = OpenReply::default();
            let status = dispatcher.create(&path, mode & !umask, flags, &mut open);
            if status < 0 {
                return reply.error(errno(status));
            }
            let mut stat = FileStat::default();
            match dispatcher.getattr(&path, &mut stat) {
                0 => {
                    let ino = table(&paths).get_or_alloc_inode(&path);
                    reply.created(&ttl, &file_attr(&stat, ino), 0, open.fh, open.flags);
                }
                status => reply.error(errno(status)),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_get_a_default_fsname() {
        let options = mount_options(&["allow_other,ro".to_string(), "max_read=4096".to_string()]);
        assert_eq!(
            options,
            vec![
                MountOption::FSName(DEFAULT_FSNAME.to_string()),
                MountOption::AllowOther,
                MountOption::RO,
                MountOption::CUSTOM("max_read=4096".to_string()),
            ]
        );

        let options = mount_options(&["fsname=jsonfs".to_string()]);
        assert_eq!(options, vec![MountOption::FSName("jsonfs".to_string())]);
    }

    #[test]
    fn renames_move_descendants() {
        let mut table = PathTable::new();
        let dir = table.get_or_alloc_inode(Path::new("/a"));
        let file = table.get_or_alloc_inode(Path::new("/a/f"));
        table.rename(Path::new("/a"), Path::new("/b"));
        assert_eq!(table.path(dir), Some(PathBuf::from("/b")));
        assert_eq!(table.path(file), Some(PathBuf::from("/b/f")));
        assert_eq!(table.child(dir, OsStr::new("g")), Some(PathBuf::from("/b/g")));
        assert_eq!(table.get_or_alloc_inode(Path::new("/b/f")), file);
    }

    #[test]
    fn removed_paths_lose_their_inode() {
        let mut table = PathTable::new();
        let ino = table.get_or_alloc_inode(Path::new("/x"));
        table.remove(Path::new("/x"));
        assert_eq!(table.path(ino), None);
        table.forget(FUSE_ROOT_ID);
        assert_eq!(table.path(FUSE_ROOT_ID), Some(PathBuf::from("/")));
    }

    #[test]
    fn unlinking_the_first_name_keeps_the_hard_link() {
        let mut table = PathTable::new();
        let ino = table.get_or_alloc_inode(Path::new("/a"));
        table.alias(PathBuf::from("/b"), ino);

        table.remove(Path::new("/a"));
        assert_eq!(table.path(ino), Some(PathBuf::from("/b")));
        assert_eq!(table.get_or_alloc_inode(Path::new("/b")), ino);

        table.remove(Path::new("/b"));
        assert_eq!(table.path(ino), None);
        assert_ne!(table.get_or_alloc_inode(Path::new("/b")), ino);
    }

    #[test]
    fn forgetting_an_inode_drops_every_name() {
        let mut table = PathTable::new();
        let ino = table.get_or_alloc_inode(Path::new("/a"));
        table.alias(PathBuf::from("/b"), ino);

        table.forget(ino);
        assert_eq!(table.path(ino), None);
        assert_ne!(table.get_or_alloc_inode(Path::new("/b")), ino);
        assert_ne!(table.get_or_alloc_inode(Path::new("/a")), ino);
    }
}
