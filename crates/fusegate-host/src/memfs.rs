// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `memfs`: an inode-dialect filesystem kept in memory
//!
//! Supports hard links, symlinks, device nodes, xattrs and attribute
//! updates. Inodes stay alive while they have a link or a kernel lookup
//! reference.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;

use fusegate_core::inode::ROOT_INO;
use fusegate_core::{
    Completion, Created, DirEntry, Entry, Errno, FileKind, FileStat, InodeHandlers, OpenReply, SetAttr, StatFs,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{SampleError, SampleResult};

const XATTR_CREATE: i32 = 1;
const XATTR_REPLACE: i32 = 2;
pub(crate) const RENAME_NOREPLACE: u32 = 1;

#[derive(Debug)]
enum Data {
    File(Vec<u8>),
    Dir { parent: u64, entries: BTreeMap<OsString, u64> },
    Symlink(PathBuf),
    Special,
}

#[derive(Debug)]
struct Inode {
    attr: FileStat,
    data: Data,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    lookups: u64,
}

impl Inode {
    fn entries(&self) -> SampleResult<&BTreeMap<OsString, u64>> {
        match &self.data {
            Data::Dir { entries, .. } => Ok(entries),
            _ => Err(SampleError::NotADirectory),
        }
    }

    fn entries_mut(&mut self) -> SampleResult<&mut BTreeMap<OsString, u64>> {
        match &mut self.data {
            Data::Dir { entries, .. } => Ok(entries),
            _ => Err(SampleError::NotADirectory),
        }
    }

    fn entry(&self) -> Entry {
        Entry::new(self.attr.clone())
    }
}

#[derive(Debug)]
pub struct MemFs {
    inodes: HashMap<u64, Inode>,
    next_ino: u64,
}

impl Default for MemFs {
    fn default() -> Self {
        let mut root = FileStat::from_mode(libc::S_IFDIR as u32 | 0o755, 0);
        root.ino = ROOT_INO;
        let now = SystemTime::now();
        root.atime = now;
        root.touch(now);
        let root = Inode {
            attr: root,
            data: Data::Dir {
                parent: ROOT_INO,
                entries: BTreeMap::new(),
            },
            xattrs: BTreeMap::new(),
            lookups: 0,
        };
        Self {
            inodes: HashMap::from([(ROOT_INO, root)]),
            next_ino: ROOT_INO + 1,
        }
    }
}

impl MemFs {
    /// Populate from the same document shape `jsonfs` uses: objects are
    /// directories, strings are files
    pub fn from_json(document: &Value) -> SampleResult<Self> {
        let Value::Object(map) = document else {
            return Err(SampleError::InvalidSeed("the top level must be an object".to_string()));
        };
        let mut fs = Self::default();
        fs.seed(ROOT_INO, map)?;
        Ok(fs)
    }

    fn seed(&mut self, parent: u64, map: &serde_json::Map<String, Value>) -> SampleResult<()> {
        for (name, value) in map {
            match value {
                Value::Object(children) => {
                    let ino = self.mkdir(parent, OsStr::new(name), 0o755, 0)?.ino;
                    self.seed(ino, children)?;
                }
                Value::String(text) => {
                    let ino = self.mknod(parent, OsStr::new(name), libc::S_IFREG as u32 | 0o644, 0, 0)?.ino;
                    self.write(ino, 0, text.as_bytes())?;
                }
                other => {
                    return Err(SampleError::InvalidSeed(format!("{name}: expected an object or a string, found {other}")));
                }
            }
        }
        // Seeding is not a kernel lookup
        self.inodes.values_mut().for_each(|inode| inode.lookups = 0);
        Ok(())
    }

    fn inode(&self, ino: u64) -> SampleResult<&Inode> {
        self.inodes.get(&ino).ok_or(SampleError::NotFound)
    }

    fn inode_mut(&mut self, ino: u64) -> SampleResult<&mut Inode> {
        self.inodes.get_mut(&ino).ok_or(SampleError::NotFound)
    }

    fn child(&self, parent: u64, name: &OsStr) -> SampleResult<u64> {
        self.inode(parent)?.entries()?.get(name).copied().ok_or(SampleError::NotFound)
    }

    /// Drop an inode nobody can reach any more
    fn reap(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get(&ino) {
            if inode.attr.nlink == 0 && inode.lookups == 0 {
                debug!(ino, "memfs inode released");
                self.inodes.remove(&ino);
            }
        }
    }

    fn touch(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.attr.touch(SystemTime::now());
        }
    }

    /// Link a fresh inode under `parent`
    fn add(&mut self, parent: u64, name: &OsStr, mode: u32, data: Data) -> SampleResult<Entry> {
        if self.inode(parent)?.entries()?.contains_key(name) {
            return Err(SampleError::AlreadyExists);
        }
        let ino = self.next_ino;
        self.next_ino += 1;

        let now = SystemTime::now();
        let mut attr = FileStat::from_mode(mode, 0);
        attr.ino = ino;
        attr.atime = now;
        attr.touch(now);
        if let Data::Symlink(target) = &data {
            attr.set_size(target.as_os_str().len() as u64);
        }
        let inode = Inode {
            attr,
            data,
            xattrs: BTreeMap::new(),
            lookups: 1,
        };
        let entry = inode.entry();
        if inode.attr.is_dir() {
            self.inode_mut(parent)?.attr.nlink += 1;
        }
        self.inodes.insert(ino, inode);
        self.inode_mut(parent)?.entries_mut()?.insert(name.to_os_string(), ino);
        self.touch(parent);
        Ok(entry)
    }

    pub fn lookup(&mut self, parent: u64, name: &OsStr) -> SampleResult<Entry> {
        let ino = self.child(parent, name)?;
        let inode = self.inode_mut(ino)?;
        inode.lookups += 1;
        Ok(inode.entry())
    }

    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.lookups = inode.lookups.saturating_sub(nlookup);
        }
        self.reap(ino);
    }

    pub fn getattr(&self, ino: u64) -> SampleResult<FileStat> {
        Ok(self.inode(ino)?.attr.clone())
    }

    pub fn setattr(&mut self, ino: u64, changes: &SetAttr) -> SampleResult<FileStat> {
        let inode = self.inode_mut(ino)?;
        if let Some(size) = changes.size {
            let Data::File(data) = &mut inode.data else {
                return Err(if inode.attr.is_dir() {
                    SampleError::IsADirectory
                } else {
                    SampleError::InvalidArgument
                });
            };
            data.resize(usize::try_from(size).map_err(|_| SampleError::InvalidArgument)?, 0);
        }
        changes.apply(&mut inode.attr, SystemTime::now());
        Ok(inode.attr.clone())
    }

    pub fn readlink(&self, ino: u64) -> SampleResult<PathBuf> {
        match &self.inode(ino)?.data {
            Data::Symlink(target) => Ok(target.clone()),
            _ => Err(SampleError::InvalidArgument),
        }
    }

    pub fn mknod(&mut self, parent: u64, name: &OsStr, mode: u32, umask: u32, rdev: u32) -> SampleResult<Entry> {
        let mode = mode & !umask;
        let data = match FileKind::from_mode(mode) {
            FileKind::RegularFile => Data::File(Vec::new()),
            FileKind::Directory | FileKind::Symlink => return Err(SampleError::InvalidArgument),
            _ => Data::Special,
        };
        let mut entry = self.add(parent, name, mode, data)?;
        if rdev != 0 {
            let inode = self.inode_mut(entry.ino)?;
            inode.attr.rdev = rdev;
            entry = inode.entry();
        }
        Ok(entry)
    }

    pub fn mkdir(&mut self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> SampleResult<Entry> {
        let mode = libc::S_IFDIR as u32 | (mode & !umask & 0o7777);
        self.add(parent, name, mode, Data::Dir { parent, entries: BTreeMap::new() })
    }

    pub fn symlink(&mut self, parent: u64, name: &OsStr, target: PathBuf) -> SampleResult<Entry> {
        self.add(parent, name, libc::S_IFLNK as u32 | 0o777, Data::Symlink(target))
    }

    pub fn link(&mut self, ino: u64, newparent: u64, newname: &OsStr) -> SampleResult<Entry> {
        if self.inode(ino)?.attr.is_dir() {
            return Err(SampleError::NotPermitted);
        }
        let entries = self.inode_mut(newparent)?.entries_mut()?;
        if entries.contains_key(newname) {
            return Err(SampleError::AlreadyExists);
        }
        entries.insert(newname.to_os_string(), ino);
        self.touch(newparent);

        let inode = self.inode_mut(ino)?;
        inode.attr.nlink += 1;
        inode.attr.ctime = SystemTime::now();
        inode.lookups += 1;
        Ok(inode.entry())
    }

    pub fn unlink(&mut self, parent: u64, name: &OsStr) -> SampleResult<()> {
        let ino = self.child(parent, name)?;
        if self.inode(ino)?.attr.is_dir() {
            return Err(SampleError::IsADirectory);
        }
        self.inode_mut(parent)?.entries_mut()?.remove(name);
        self.touch(parent);
        self.drop_link(ino)
    }

    pub fn rmdir(&mut self, parent: u64, name: &OsStr) -> SampleResult<()> {
        let ino = self.child(parent, name)?;
        if !self.inode(ino)?.entries()?.is_empty() {
            return Err(SampleError::NotEmpty);
        }
        self.inode_mut(parent)?.entries_mut()?.remove(name);
        let parent_inode = self.inode_mut(parent)?;
        parent_inode.attr.nlink = parent_inode.attr.nlink.saturating_sub(1);
        self.touch(parent);
        self.inode_mut(ino)?.attr.nlink = 0;
        self.reap(ino);
        Ok(())
    }

    fn drop_link(&mut self, ino: u64) -> SampleResult<()> {
        let inode = self.inode_mut(ino)?;
        inode.attr.nlink = inode.attr.nlink.saturating_sub(1);
        inode.attr.ctime = SystemTime::now();
        self.reap(ino);
        Ok(())
    }

    /// Whether `ino` is `ancestor` or lies below it
    fn is_within(&self, mut ino: u64, ancestor: u64) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            match self.inodes.get(&ino).map(|inode| &inode.data) {
                Some(Data::Dir { parent, .. }) if *parent != ino => ino = *parent,
                _ => return false,
            }
        }
    }

    pub fn rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> SampleResult<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(SampleError::InvalidArgument);
        }
        let ino = self.child(parent, name)?;
        let moving_dir = self.inode(ino)?.attr.is_dir();
        self.inode(newparent)?.entries()?;
        if moving_dir && self.is_within(newparent, ino) {
            return Err(SampleError::InvalidArgument);
        }

        let replaced = match self.child(newparent, newname) {
            Ok(existing) if existing == ino => return Ok(()),
            Ok(_) if flags & RENAME_NOREPLACE != 0 => return Err(SampleError::AlreadyExists),
            Ok(existing) => {
                let target = self.inode(existing)?;
                match (target.attr.is_dir(), moving_dir) {
                    (true, false) => return Err(SampleError::IsADirectory),
                    (false, true) => return Err(SampleError::NotADirectory),
                    (true, true) if !target.entries()?.is_empty() => return Err(SampleError::NotEmpty),
                    _ => Some(existing),
                }
            }
            Err(SampleError::NotFound) => None,
            Err(err) => return Err(err),
        };

        self.inode_mut(parent)?.entries_mut()?.remove(name);
        self.inode_mut(newparent)?.entries_mut()?.insert(newname.to_os_string(), ino);
        if moving_dir {
            if let Data::Dir { parent: dotdot, .. } = &mut self.inode_mut(ino)?.data {
                *dotdot = newparent;
            }
            if parent != newparent {
                let old = self.inode_mut(parent)?;
                old.attr.nlink = old.attr.nlink.saturating_sub(1);
                self.inode_mut(newparent)?.attr.nlink += 1;
            }
            if replaced.is_some() {
                let new = self.inode_mut(newparent)?;
                new.attr.nlink = new.attr.nlink.saturating_sub(1);
            }
        }
        self.touch(parent);
        self.touch(newparent);

        if let Some(existing) = replaced {
            if moving_dir {
                self.inode_mut(existing)?.attr.nlink = 0;
                self.reap(existing);
            } else {
                self.drop_link(existing)?;
            }
        }
        Ok(())
    }

    pub fn open(&self, ino: u64) -> SampleResult<OpenReply> {
        match self.inode(ino)?.data {
            Data::Dir { .. } => Err(SampleError::IsADirectory),
            _ => Ok(OpenReply::default()),
        }
    }

    pub fn read(&mut self, ino: u64, offset: u64, buf: &mut [u8]) -> SampleResult<usize> {
        let inode = self.inode_mut(ino)?;
        inode.attr.atime = SystemTime::now();
        let Data::File(data) = &inode.data else {
            return Err(SampleError::InvalidArgument);
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    pub fn write(&mut self, ino: u64, offset: u64, bytes: &[u8]) -> SampleResult<usize> {
        let inode = self.inode_mut(ino)?;
        let Data::File(data) = &mut inode.data else {
            return Err(SampleError::InvalidArgument);
        };
        let start = usize::try_from(offset).map_err(|_| SampleError::InvalidArgument)?;
        let end = start.checked_add(bytes.len()).ok_or(SampleError::InvalidArgument)?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        let size = data.len() as u64;
        inode.attr.set_size(size);
        inode.attr.touch(SystemTime::now());
        Ok(bytes.len())
    }

    /// `.` and `..` first, then the entries in name order
    pub fn readdir(&self, ino: u64) -> SampleResult<Vec<DirEntry>> {
        let inode = self.inode(ino)?;
        let Data::Dir { parent, entries } = &inode.data else {
            return Err(SampleError::NotADirectory);
        };
        let mut listing = vec![
            DirEntry::new(".").with_ino(ino).with_kind(FileKind::Directory),
            DirEntry::new("..").with_ino(*parent).with_kind(FileKind::Directory),
        ];
        for (name, child) in entries {
            let kind = self.inode(*child)?.attr.kind;
            listing.push(DirEntry::new(name).with_ino(*child).with_kind(kind));
        }
        Ok(listing)
    }

    pub fn statfs(&self) -> StatFs {
        let bytes: u64 = self.inodes.values().map(|inode| inode.attr.size).sum();
        StatFs {
            blocks: bytes.div_ceil(512),
            files: self.inodes.len() as u64,
            ..StatFs::default()
        }
    }

    pub fn setxattr(&mut self, ino: u64, name: &OsStr, value: &[u8], flags: i32) -> SampleResult<()> {
        let inode = self.inode_mut(ino)?;
        let exists = inode.xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(SampleError::AlreadyExists);
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(SampleError::NoAttribute);
        }
        inode.xattrs.insert(name.to_os_string(), value.to_vec());
        inode.attr.ctime = SystemTime::now();
        Ok(())
    }

    #[cfg(test)]
    fn xattr(&self, ino: u64, name: &OsStr) -> SampleResult<&[u8]> {
        self.inode(ino)?
            .xattrs
            .get(name)
            .map(Vec::as_slice)
            .ok_or(SampleError::NoAttribute)
    }

    pub fn create(&mut self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> SampleResult<Created> {
        let mode = libc::S_IFREG as u32 | (mode & !umask & 0o7777);
        let entry = self.add(parent, name, mode, Data::File(Vec::new()))?;
        Ok(Created {
            entry,
            open: OpenReply::default(),
        })
    }
}

type Shared = Rc<RefCell<MemFs>>;

fn on_fs<A, P: 'static>(
    fs: &Shared,
    op: impl Fn(&mut MemFs, A) -> SampleResult<P> + 'static,
) -> impl Fn(A, Completion<P>) + 'static {
    let fs = Rc::clone(fs);
    move |args, done| done.result(op(&mut fs.borrow_mut(), args).map_err(Errno::from))
}

pub fn handlers(fs: MemFs) -> InodeHandlers {
    use fusegate_core::inode::{
        AccessArgs, CreateArgs, ForgetArgs, LinkArgs, MkdirArgs, MknodArgs, NameArgs, RenameArgs, SetattrArgs,
        SymlinkArgs,
    };
    use fusegate_core::{OpenArgs, XattrArgs};

    let fs: Shared = Rc::new(RefCell::new(fs));
    InodeHandlers::new()
        .init({
            let fs = Rc::clone(&fs);
            move |done| {
                info!(inodes = fs.borrow().inodes.len(), "memfs ready");
                done.success();
            }
        })
        .lookup(on_fs(&fs, |fs, args: NameArgs| fs.lookup(args.parent, &args.name)))
        .forget(on_fs(&fs, |fs, args: ForgetArgs| {
            fs.forget(args.ino, args.nlookup);
            Ok(())
        }))
        .getattr(on_fs(&fs, |fs, ino: u64| fs.getattr(ino)))
        .setattr(on_fs(&fs, |fs, args: SetattrArgs| fs.setattr(args.ino, &args.attr)))
        .readlink(on_fs(&fs, |fs, ino: u64| fs.readlink(ino)))
        .mknod(on_fs(&fs, |fs, args: MknodArgs| {
            fs.mknod(args.parent, &args.name, args.mode, args.umask, args.rdev)
        }))
        .mkdir(on_fs(&fs, |fs, args: MkdirArgs| fs.mkdir(args.parent, &args.name, args.mode, args.umask)))
        .unlink(on_fs(&fs, |fs, args: NameArgs| fs.unlink(args.parent, &args.name)))
        .rmdir(on_fs(&fs, |fs, args: NameArgs| fs.rmdir(args.parent, &args.name)))
        .symlink(on_fs(&fs, |fs, args: SymlinkArgs| fs.symlink(args.parent, &args.name, args.target)))
        .rename(on_fs(&fs, |fs, args: RenameArgs| {
            fs.rename(args.parent, &args.name, args.newparent, &args.newname, args.flags)
        }))
        .link(on_fs(&fs, |fs, args: LinkArgs| fs.link(args.ino, args.newparent, &args.newname)))
        .open(on_fs(&fs, |fs, args: OpenArgs<u64>| fs.open(args.target)))
        .read({
            let fs = Rc::clone(&fs);
            move |args, done| {
                let mut buf = args.buf;
                match fs.borrow_mut().read(args.target, args.offset, &mut buf) {
                    Ok(n) => done.filled(buf, n),
                    Err(err) => done.error(err.into()),
                }
            }
        })
        .write({
            let fs = Rc::clone(&fs);
            move |args, done| match fs.borrow_mut().write(args.target, args.offset, &args.data) {
                Ok(n) => done.count(n),
                Err(err) => done.error(err.into()),
            }
        })
        .flush(|_, done| done.success())
        .release(|_, done| done.success())
        .fsync(|_, done| done.success())
        .opendir(on_fs(&fs, |fs, args: OpenArgs<u64>| {
            fs.inode(args.target)?.entries()?;
            Ok(OpenReply::default())
        }))
        .readdir(on_fs(&fs, |fs, args: fusegate_core::inode::ReaddirArgs| fs.readdir(args.ino)))
        .releasedir(|_, done| done.success())
        .statfs(on_fs(&fs, |fs, _ino: u64| Ok(fs.statfs())))
        .setxattr(on_fs(&fs, |fs, args: XattrArgs<u64>| {
            fs.setxattr(args.target, &args.name, &args.value, args.flags)
        }))
        .access(on_fs(&fs, |fs, args: AccessArgs| fs.inode(args.ino).map(|_| ())))
        .create(on_fs(&fs, |fs, args: CreateArgs| fs.create(args.parent, &args.name, args.mode, args.umask)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusegate_core::{CallbackTransport, Dispatcher, InodeDialect, MountConfig, MountController, StopSignal};
    use serde_json::json;

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn seed_builds_directories_and_files() {
        let fs = MemFs::from_json(&json!({ "a.txt": "alpha", "sub": { "b.txt": "beta" } })).unwrap();
        let sub = fs.child(ROOT_INO, name("sub")).unwrap();
        let b = fs.child(sub, name("b.txt")).unwrap();
        assert_eq!(fs.getattr(b).unwrap().size, 4);
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 3);
        let listing: Vec<_> = fs.readdir(sub).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(listing, vec![OsString::from("."), OsString::from(".."), OsString::from("b.txt")]);
    }

    #[test]
    fn hard_links_share_an_inode_until_the_last_goes() {
        let mut fs = MemFs::default();
        let file = fs.create(ROOT_INO, name("f"), 0o644, 0o022).unwrap().entry.ino;
        fs.write(file, 0, b"data").unwrap();

        let linked = fs.link(file, ROOT_INO, name("g")).unwrap();
        assert_eq!(linked.ino, file);
        assert_eq!(linked.attr.nlink, 2);
        assert!(matches!(fs.link(ROOT_INO, ROOT_INO, name("h")), Err(SampleError::NotPermitted)));

        fs.unlink(ROOT_INO, name("f")).unwrap();
        assert_eq!(fs.lookup(ROOT_INO, name("g")).unwrap().attr.nlink, 1);

        fs.unlink(ROOT_INO, name("g")).unwrap();
        // Still referenced by the kernel (create, link and lookup)
        assert_eq!(fs.getattr(file).unwrap().nlink, 0);
        fs.forget(file, 3);
        assert!(matches!(fs.getattr(file), Err(SampleError::NotFound)));
    }

    #[test]
    fn rename_moves_and_replaces() {
        let mut fs = MemFs::default();
        let a = fs.mkdir(ROOT_INO, name("a"), 0o755, 0).unwrap().ino;
        let b = fs.mkdir(ROOT_INO, name("b"), 0o755, 0).unwrap().ino;
        fs.create(a, name("x"), 0o644, 0).unwrap();
        fs.create(b, name("y"), 0o644, 0).unwrap();

        assert!(matches!(fs.rename(ROOT_INO, name("a"), a, name("inner"), 0), Err(SampleError::InvalidArgument)));
        assert!(matches!(fs.rename(a, name("x"), b, name("y"), RENAME_NOREPLACE), Err(SampleError::AlreadyExists)));
        assert!(matches!(fs.rename(a, name("x"), ROOT_INO, name("b"), 0), Err(SampleError::IsADirectory)));

        fs.rename(a, name("x"), b, name("y"), 0).unwrap();
        assert!(fs.lookup(a, name("x")).is_err());
        assert_eq!(fs.readdir(b).unwrap().len(), 3);

        fs.rename(ROOT_INO, name("a"), b, name("a"), 0).unwrap();
        let moved = fs.readdir(a).unwrap();
        assert_eq!(moved[1].ino, Some(b));
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 3);
        assert_eq!(fs.getattr(b).unwrap().nlink, 3);
    }

    #[test]
    fn rename_refuses_flags_it_cannot_honour() {
        const RENAME_EXCHANGE: u32 = 2;
        let mut fs = MemFs::from_json(&json!({ "b": "bee" })).unwrap();
        let b = fs.child(ROOT_INO, name("b")).unwrap();

        assert!(matches!(
            fs.rename(ROOT_INO, name("b"), ROOT_INO, name("c"), RENAME_EXCHANGE),
            Err(SampleError::InvalidArgument)
        ));
        assert_eq!(fs.child(ROOT_INO, name("b")).unwrap(), b);
        assert!(matches!(fs.child(ROOT_INO, name("c")), Err(SampleError::NotFound)));
    }

    #[test]
    fn replacing_a_sibling_directory_drops_a_parent_link() {
        let mut fs = MemFs::default();
        fs.mkdir(ROOT_INO, name("src"), 0o755, 0).unwrap();
        let dst = fs.mkdir(ROOT_INO, name("dst"), 0o755, 0).unwrap().ino;
        fs.mkdir(ROOT_INO, name("keep"), 0o755, 0).unwrap();
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 5);

        fs.rename(ROOT_INO, name("src"), ROOT_INO, name("dst"), 0).unwrap();
        let subdirs = fs.readdir(ROOT_INO).unwrap().len() as u32 - 2;
        assert_eq!(subdirs, 2);
        assert_eq!(fs.getattr(ROOT_INO).unwrap().nlink, 2 + subdirs);
        assert_eq!(fs.getattr(dst).unwrap().nlink, 0);
        fs.forget(dst, 1);
        assert!(matches!(fs.getattr(dst), Err(SampleError::NotFound)));
    }

    #[test]
    fn setattr_truncates_and_xattrs_honour_flags() {
        let mut fs = MemFs::default();
        let f = fs.create(ROOT_INO, name("f"), 0o644, 0).unwrap().entry.ino;
        fs.write(f, 0, b"hello world").unwrap();
        let stat = fs
            .setattr(
                f,
                &SetAttr {
                    size: Some(5),
                    mode: Some(0o600),
                    ..SetAttr::default()
                },
            )
            .unwrap();
        assert_eq!((stat.size, stat.perm), (5, 0o600));
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(f, 0, &mut buf).unwrap(), 5);

        assert!(matches!(fs.setxattr(f, name("user.k"), b"v", XATTR_REPLACE), Err(SampleError::NoAttribute)));
        fs.setxattr(f, name("user.k"), b"v", XATTR_CREATE).unwrap();
        assert!(matches!(fs.setxattr(f, name("user.k"), b"w", XATTR_CREATE), Err(SampleError::AlreadyExists)));
        fs.setxattr(f, name("user.k"), b"w", 0).unwrap();
        assert_eq!(fs.xattr(f, name("user.k")).unwrap(), b"w");
    }

    #[test]
    fn mounted_store_answers_through_the_bridge() {
        let fs = MemFs::from_json(&json!({ "etc": { "motd": "hi" } })).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        MountController::<InodeDialect>::new(MountConfig::new("/fusegate-test/memfs"), handlers(fs))
            .run_blocking(CallbackTransport::new(move |d: Dispatcher<InodeDialect>, _stop: StopSignal| {
                let mut etc = Entry::default();
                assert_eq!(d.lookup(ROOT_INO, name("etc"), &mut etc), 0);
                let mut motd = Entry::default();
                assert_eq!(d.lookup(etc.ino, name("motd"), &mut motd), 0);

                let mut link = Entry::default();
                let linked = d.link(motd.ino, ROOT_INO, name("motd"), &mut link);
                let mut target = Entry::default();
                let symlinked = d.symlink(ROOT_INO, name("ln"), std::path::Path::new("etc/motd"), &mut target);
                let mut resolved = PathBuf::new();
                let readlink = d.readlink(target.ino, &mut resolved);
                let mut names = Vec::new();
                let listed = d.readdir(ROOT_INO, 0, &mut |entry| {
                    names.push(entry.name.clone());
                    false
                });
                let removed = d.rmdir(ROOT_INO, name("etc"));
                let _ = tx.send((linked, link.attr.nlink, symlinked, readlink, resolved, listed, names, removed));
            }))
            .unwrap();

        let (linked, nlink, symlinked, readlink, resolved, listed, names, removed) = rx.recv().unwrap();
        assert_eq!((linked, nlink, symlinked, readlink, listed), (0, 2, 0, 0, 0));
        assert_eq!(resolved, PathBuf::from("etc/motd"));
        assert_eq!(names, vec![".", "..", "etc", "ln", "motd"]);
        assert_eq!(removed, -libc::ENOTEMPTY);
    }
}
