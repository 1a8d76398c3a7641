// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `jsonfs`: a path-dialect filesystem over an in-memory JSON tree
//!
//! Objects are directories and strings are files. The tree is seeded from a
//! JSON document and, when a snapshot path is given, written back to it on
//! unmount.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use fusegate_core::{Completion, DirEntry, Errno, FileKind, FileStat, OpenReply, PathHandlers, StatFs};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{SampleError, SampleResult};
use crate::memfs::RENAME_NOREPLACE;

#[derive(Clone, Debug)]
enum Content {
    Dir(BTreeMap<String, Node>),
    File(Vec<u8>),
}

#[derive(Clone, Debug)]
struct Node {
    content: Content,
    perm: u16,
    atime: SystemTime,
    mtime: SystemTime,
}

impl Node {
    fn dir(perm: u16) -> Self {
        Self::new(Content::Dir(BTreeMap::new()), perm)
    }

    fn file(data: Vec<u8>, perm: u16) -> Self {
        Self::new(Content::File(data), perm)
    }

    fn new(content: Content, perm: u16) -> Self {
        let now = SystemTime::now();
        Self {
            content,
            perm,
            atime: now,
            mtime: now,
        }
    }

    fn from_value(value: &Value) -> SampleResult<Self> {
        match value {
            Value::Object(map) => {
                let mut entries = BTreeMap::new();
                for (name, child) in map {
                    if name.is_empty() || name.contains('/') {
                        return Err(SampleError::InvalidSeed(format!("bad entry name {name:?}")));
                    }
                    entries.insert(name.clone(), Node::from_value(child)?);
                }
                Ok(Self::new(Content::Dir(entries), 0o755))
            }
            Value::String(text) => Ok(Node::file(text.clone().into_bytes(), 0o644)),
            other => Err(SampleError::InvalidSeed(format!("expected an object or a string, found {other}"))),
        }
    }

    fn to_value(&self) -> Value {
        match &self.content {
            Content::Dir(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(name, child)| (name.clone(), child.to_value()))
                    .collect::<Map<String, Value>>(),
            ),
            Content::File(data) => Value::String(String::from_utf8_lossy(data).into_owned()),
        }
    }

    fn kind(&self) -> FileKind {
        match self.content {
            Content::Dir(_) => FileKind::Directory,
            Content::File(_) => FileKind::RegularFile,
        }
    }

    fn stat(&self) -> FileStat {
        let size = match &self.content {
            Content::Dir(entries) => entries.len() as u64,
            Content::File(data) => data.len() as u64,
        };
        let mut stat = FileStat::from_mode(self.kind().type_bits() | u32::from(self.perm), size);
        stat.atime = self.atime;
        stat.mtime = self.mtime;
        stat.ctime = self.mtime;
        stat
    }

    fn entries(&self) -> SampleResult<&BTreeMap<String, Node>> {
        match &self.content {
            Content::Dir(entries) => Ok(entries),
            Content::File(_) => Err(SampleError::NotADirectory),
        }
    }

    fn entries_mut(&mut self) -> SampleResult<&mut BTreeMap<String, Node>> {
        match &mut self.content {
            Content::Dir(entries) => Ok(entries),
            Content::File(_) => Err(SampleError::NotADirectory),
        }
    }

    fn data_mut(&mut self) -> SampleResult<&mut Vec<u8>> {
        match &mut self.content {
            Content::File(data) => Ok(data),
            Content::Dir(_) => Err(SampleError::IsADirectory),
        }
    }
}

/// Split an absolute path into entry names
fn names(path: &Path) -> SampleResult<Vec<&str>> {
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => names.push(name.to_str().ok_or(SampleError::InvalidName)?),
            Component::ParentDir | Component::Prefix(_) => return Err(SampleError::InvalidName),
        }
    }
    Ok(names)
}

/// The JSON document as a directory tree
#[derive(Clone, Debug)]
pub struct JsonTree {
    root: Node,
}

impl Default for JsonTree {
    fn default() -> Self {
        Self { root: Node::dir(0o755) }
    }
}

impl JsonTree {
    pub fn from_json(document: &Value) -> SampleResult<Self> {
        if !document.is_object() {
            return Err(SampleError::InvalidSeed("the top level must be an object".to_string()));
        }
        Ok(Self {
            root: Node::from_value(document)?,
        })
    }

    pub fn to_json(&self) -> Value {
        self.root.to_value()
    }

    fn walk(&self, names: &[&str]) -> SampleResult<&Node> {
        let mut node = &self.root;
        for name in names {
            node = node.entries()?.get(*name).ok_or(SampleError::NotFound)?;
        }
        Ok(node)
    }

    fn walk_mut(&mut self, names: &[&str]) -> SampleResult<&mut Node> {
        let mut node = &mut self.root;
        for name in names {
            node = node.entries_mut()?.get_mut(*name).ok_or(SampleError::NotFound)?;
        }
        Ok(node)
    }

    fn node(&self, path: &Path) -> SampleResult<&Node> {
        self.walk(&names(path)?)
    }

    fn node_mut(&mut self, path: &Path) -> SampleResult<&mut Node> {
        let names = names(path)?;
        self.walk_mut(&names)
    }

    /// Entries of the parent directory of `path`, plus the final name
    fn parent_mut<'p>(&mut self, path: &'p Path) -> SampleResult<(&mut BTreeMap<String, Node>, &'p str)> {
        let names = names(path)?;
        let Some((last, parent)) = names.split_last() else {
            return Err(SampleError::InvalidArgument);
        };
        Ok((self.walk_mut(parent)?.entries_mut()?, *last))
    }

    pub fn stat(&self, path: &Path) -> SampleResult<FileStat> {
        Ok(self.node(path)?.stat())
    }

    pub fn list(&self, path: &Path) -> SampleResult<Vec<DirEntry>> {
        Ok(self
            .node(path)?
            .entries()?
            .iter()
            .map(|(name, child)| DirEntry::new(name).with_kind(child.kind()))
            .collect())
    }

    pub fn open(&self, path: &Path) -> SampleResult<OpenReply> {
        match self.node(path)?.content {
            Content::File(_) => Ok(OpenReply::default()),
            Content::Dir(_) => Err(SampleError::IsADirectory),
        }
    }

    /// Copy from `offset` into `buf`; returns the number of bytes copied
    pub fn read(&mut self, path: &Path, offset: u64, buf: &mut [u8]) -> SampleResult<usize> {
        let node = self.node_mut(path)?;
        node.atime = SystemTime::now();
        let data = node.data_mut()?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    /// Write at `offset`, zero-filling any gap
    pub fn write(&mut self, path: &Path, offset: u64, bytes: &[u8]) -> SampleResult<usize> {
        let node = self.node_mut(path)?;
        node.mtime = SystemTime::now();
        let data = node.data_mut()?;
        let start = usize::try_from(offset).map_err(|_| SampleError::InvalidArgument)?;
        let end = start.checked_add(bytes.len()).ok_or(SampleError::InvalidArgument)?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn create(&mut self, path: &Path, mode: u32) -> SampleResult<()> {
        self.insert(path, Node::file(Vec::new(), (mode & 0o7777) as u16))
    }

    pub fn mkdir(&mut self, path: &Path, mode: u32) -> SampleResult<()> {
        self.insert(path, Node::dir((mode & 0o7777) as u16))
    }

    fn insert(&mut self, path: &Path, node: Node) -> SampleResult<()> {
        let (entries, name) = self.parent_mut(path)?;
        if entries.contains_key(name) {
            return Err(SampleError::AlreadyExists);
        }
        entries.insert(name.to_string(), node);
        Ok(())
    }

    pub fn unlink(&mut self, path: &Path) -> SampleResult<()> {
        let (entries, name) = self.parent_mut(path)?;
        match entries.get(name).map(Node::kind) {
            None => Err(SampleError::NotFound),
            Some(FileKind::Directory) => Err(SampleError::IsADirectory),
            Some(_) => {
                entries.remove(name);
                Ok(())
            }
        }
    }

    pub fn rmdir(&mut self, path: &Path) -> SampleResult<()> {
        let (entries, name) = self.parent_mut(path)?;
        let empty = match entries.get(name).map(Node::entries) {
            None => return Err(SampleError::NotFound),
            Some(children) => children?.is_empty(),
        };
        if !empty {
            return Err(SampleError::NotEmpty);
        }
        entries.remove(name);
        Ok(())
    }

    /// Move `from` to `to`, replacing a compatible destination
    /// Move `from` to `to`. `RENAME_NOREPLACE` is the only flag understood.
    pub fn rename(&mut self, from: &Path, to: &Path, flags: u32) -> SampleResult<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(SampleError::InvalidArgument);
        }
        let from_names = names(from)?;
        let to_names = names(to)?;
        if from_names.is_empty() || to_names.is_empty() {
            return Err(SampleError::InvalidArgument);
        }
        if from_names == to_names {
            return Ok(());
        }
        if to_names.starts_with(&from_names) {
            return Err(SampleError::InvalidArgument);
        }

        let moving_dir = matches!(self.walk(&from_names)?.content, Content::Dir(_));
        match self.walk(&to_names) {
            Ok(_) if flags & RENAME_NOREPLACE != 0 => return Err(SampleError::AlreadyExists),
            Ok(target) => match (&target.content, moving_dir) {
                (Content::Dir(_), false) => return Err(SampleError::IsADirectory),
                (Content::File(_), true) => return Err(SampleError::NotADirectory),
                (Content::Dir(children), true) if !children.is_empty() => return Err(SampleError::NotEmpty),
                _ => {}
            },
            Err(SampleError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.walk(&to_names[..to_names.len() - 1])?.entries()?;

        let (entries, name) = self.parent_mut(from)?;
        let node = entries.remove(name).ok_or(SampleError::NotFound)?;
        let (entries, name) = self.parent_mut(to)?;
        entries.insert(name.to_string(), node);
        Ok(())
    }

    pub fn truncate(&mut self, path: &Path, size: u64) -> SampleResult<()> {
        let node = self.node_mut(path)?;
        node.mtime = SystemTime::now();
        let size = usize::try_from(size).map_err(|_| SampleError::InvalidArgument)?;
        node.data_mut()?.resize(size, 0);
        Ok(())
    }

    pub fn set_times(&mut self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> SampleResult<()> {
        let node = self.node_mut(path)?;
        if let Some(atime) = atime {
            node.atime = atime;
        }
        if let Some(mtime) = mtime {
            node.mtime = mtime;
        }
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        fn tally(node: &Node, files: &mut u64, bytes: &mut u64) {
            *files += 1;
            match &node.content {
                Content::Dir(entries) => entries.values().for_each(|child| tally(child, files, bytes)),
                Content::File(data) => *bytes += data.len() as u64,
            }
        }
        let (mut files, mut bytes) = (0, 0);
        tally(&self.root, &mut files, &mut bytes);
        StatFs {
            blocks: bytes.div_ceil(512),
            files,
            ..StatFs::default()
        }
    }
}

type Shared = Rc<RefCell<JsonTree>>;

/// Adapt a tree operation into a handler that completes synchronously
fn on_tree<A, P: 'static>(
    tree: &Shared,
    op: impl Fn(&mut JsonTree, A) -> SampleResult<P> + 'static,
) -> impl Fn(A, Completion<P>) + 'static {
    let tree = Rc::clone(tree);
    move |args, done| done.result(op(&mut tree.borrow_mut(), args).map_err(Errno::from))
}

async fn save_snapshot(path: &Path, document: &Value) -> SampleResult<()> {
    let bytes = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Handlers serving `tree`. With `snapshot` set, the tree is written there
/// as JSON when the mount stops.
pub fn handlers(tree: JsonTree, snapshot: Option<PathBuf>) -> PathHandlers {
    let tree: Shared = Rc::new(RefCell::new(tree));
    PathHandlers::new()
        .init(|done| {
            info!("jsonfs ready");
            done.success();
        })
        .destroy({
            let tree = Rc::clone(&tree);
            move |done| {
                let Some(path) = snapshot.clone() else {
                    return done.success();
                };
                let document = tree.borrow().to_json();
                tokio::task::spawn_local(async move {
                    match save_snapshot(&path, &document).await {
                        Ok(()) => {
                            info!(path = %path.display(), "jsonfs snapshot saved");
                            done.success();
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "failed to save jsonfs snapshot");
                            done.error(Errno::from(err));
                        }
                    }
                });
            }
        })
        .getattr(on_tree(&tree, |t, path: PathBuf| t.stat(&path)))
        .readdir(on_tree(&tree, |t, path: PathBuf| t.list(&path)))
        .open(on_tree(&tree, |t, args: fusegate_core::OpenArgs<PathBuf>| t.open(&args.target)))
        .read({
            let tree = Rc::clone(&tree);
            move |args, done| {
                let mut buf = args.buf;
                match tree.borrow_mut().read(&args.target, args.offset, &mut buf) {
                    Ok(n) => done.filled(buf, n),
                    Err(err) => done.error(err.into()),
                }
            }
        })
        .write({
            let tree = Rc::clone(&tree);
            move |args, done| match tree.borrow_mut().write(&args.target, args.offset, &args.data) {
                Ok(n) => done.count(n),
                Err(err) => done.error(err.into()),
            }
        })
        .release(|_, done| done.success())
        .create(on_tree(&tree, |t, args: fusegate_core::path::CreateArgs| {
            t.create(&args.path, args.mode)?;
            Ok(OpenReply::default())
        }))
        .unlink(on_tree(&tree, |t, path: PathBuf| t.unlink(&path)))
        .rename(on_tree(&tree, |t, args: fusegate_core::path::RenameArgs| t.rename(&args.from, &args.to, args.flags)))
        .mkdir(on_tree(&tree, |t, args: fusegate_core::path::MkdirArgs| t.mkdir(&args.path, args.mode)))
        .rmdir(on_tree(&tree, |t, path: PathBuf| t.rmdir(&path)))
        .truncate(on_tree(&tree, |t, args: fusegate_core::path::TruncateArgs| t.truncate(&args.path, args.size)))
        .utimens(on_tree(&tree, |t, args: fusegate_core::path::UtimensArgs| {
            t.set_times(&args.path, args.atime, args.mtime)
        }))
        .statfs(on_tree(&tree, |t, _path: PathBuf| Ok(t.statfs())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusegate_core::{CallbackTransport, Dispatcher, MountConfig, MountController, PathDialect, StopSignal};
    use serde_json::json;
    use std::ffi::OsString;

    fn seeded() -> JsonTree {
        JsonTree::from_json(&json!({
            "hello.txt": "Hello world!\n",
            "dir1": { "welcome.txt": "Welcome\n", "dir2": {} },
        }))
        .unwrap()
    }

    #[test]
    fn seed_becomes_a_tree() {
        let tree = seeded();
        assert!(tree.stat(Path::new("/")).unwrap().is_dir());
        assert_eq!(tree.stat(Path::new("/hello.txt")).unwrap().size, 13);
        let names: Vec<_> = tree
            .list(Path::new("/dir1"))
            .unwrap()
            .into_iter()
            .map(|entry| (entry.name, entry.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                (OsString::from("dir2"), Some(FileKind::Directory)),
                (OsString::from("welcome.txt"), Some(FileKind::RegularFile)),
            ]
        );
        assert!(matches!(tree.stat(Path::new("/hello.txt/x")), Err(SampleError::NotADirectory)));
        assert!(JsonTree::from_json(&json!({ "n": 1 })).is_err());
        assert!(JsonTree::from_json(&json!("top")).is_err());
    }

    #[test]
    fn reads_and_writes_at_offsets() {
        let mut tree = seeded();
        let mut buf = [0u8; 5];
        assert_eq!(tree.read(Path::new("/hello.txt"), 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(tree.read(Path::new("/hello.txt"), 100, &mut buf).unwrap(), 0);

        tree.create(Path::new("/new"), 0o100600).unwrap();
        assert_eq!(tree.write(Path::new("/new"), 2, b"ab").unwrap(), 2);
        assert_eq!(tree.to_json()["new"], json!("\u{0}\u{0}ab"));
        assert_eq!(tree.stat(Path::new("/new")).unwrap().perm, 0o600);
        assert!(matches!(tree.create(Path::new("/new"), 0o644), Err(SampleError::AlreadyExists)));
        assert!(matches!(tree.write(Path::new("/dir1"), 0, b"x"), Err(SampleError::IsADirectory)));
    }

    #[test]
    fn rename_checks_the_destination() {
        let mut tree = seeded();
        assert!(matches!(
            tree.rename(Path::new("/hello.txt"), Path::new("/dir1"), 0),
            Err(SampleError::IsADirectory)
        ));
        assert!(matches!(
            tree.rename(Path::new("/dir1"), Path::new("/dir1/dir2/inner"), 0),
            Err(SampleError::InvalidArgument)
        ));
        assert!(matches!(
            tree.rename(Path::new("/hello.txt"), Path::new("/missing/x"), 0),
            Err(SampleError::NotFound)
        ));
        assert!(tree.stat(Path::new("/hello.txt")).is_ok());

        tree.rename(Path::new("/dir1"), Path::new("/moved"), 0).unwrap();
        assert!(tree.stat(Path::new("/moved/welcome.txt")).is_ok());
        assert!(matches!(tree.stat(Path::new("/dir1")), Err(SampleError::NotFound)));

        assert!(matches!(tree.rmdir(Path::new("/moved")), Err(SampleError::NotEmpty)));
        assert!(matches!(tree.unlink(Path::new("/moved")), Err(SampleError::IsADirectory)));
        tree.rmdir(Path::new("/moved/dir2")).unwrap();
    }

    #[test]
    fn rename_flags_guard_the_destination() {
        let tree = JsonTree::from_json(&json!({ "a": "AAA", "b": "BBB" })).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/jsonfs-rename"), handlers(tree, None))
            .run_blocking(CallbackTransport::new(move |d: Dispatcher<PathDialect>, _stop: StopSignal| {
                let exchanged = d.rename(Path::new("/a"), Path::new("/b"), 2);
                let kept = d.rename(Path::new("/a"), Path::new("/b"), RENAME_NOREPLACE);
                let fresh = d.rename(Path::new("/a"), Path::new("/c"), RENAME_NOREPLACE);
                let mut buf = [0u8; 8];
                let read_b = d.read(Path::new("/b"), 0, 0, &mut buf);
                let _ = tx.send((exchanged, kept, fresh, read_b, buf[..3].to_vec()));
            }))
            .unwrap();

        let (exchanged, kept, fresh, read_b, contents) = rx.recv().unwrap();
        assert_eq!(exchanged, -libc::EINVAL);
        assert_eq!(kept, -libc::EEXIST);
        assert_eq!((fresh, read_b), (0, 3));
        assert_eq!(contents, b"BBB");
    }

    #[test]
    fn mounted_tree_serves_calls_and_saves_on_unmount() {
        let snapshot = tempfile::NamedTempFile::new().unwrap();
        let handlers = handlers(seeded(), Some(snapshot.path().to_path_buf()));
        let (tx, rx) = std::sync::mpsc::channel();

        MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/jsonfs"), handlers)
            .run_blocking(CallbackTransport::new(move |d: Dispatcher<PathDialect>, _stop: StopSignal| {
                let mut open = OpenReply::default();
                let created = d.create(Path::new("/notes"), 0o644, libc::O_WRONLY, &mut open);
                let written = d.write(Path::new("/notes"), 0, 0, b"remember");
                let renamed = d.rename(Path::new("/notes"), Path::new("/dir1/notes"), 0);
                let mut buf = [0u8; 64];
                let read = d.read(Path::new("/dir1/notes"), 0, 0, &mut buf);
                let removed = d.unlink(Path::new("/hello.txt"));
                let missing = d.unlink(Path::new("/hello.txt"));
                let _ = tx.send((created, written, renamed, read, buf[..8].to_vec(), removed, missing));
            }))
            .unwrap();

        let (created, written, renamed, read, contents, removed, missing) = rx.recv().unwrap();
        assert_eq!((created, written, renamed, read, removed), (0, 8, 0, 8, 0));
        assert_eq!(contents, b"remember");
        assert_eq!(missing, -libc::ENOENT);

        let saved: Value = serde_json::from_slice(&std::fs::read(snapshot.path()).unwrap()).unwrap();
        assert_eq!(
            saved,
            json!({ "dir1": { "welcome.txt": "Welcome\n", "dir2": {}, "notes": "remember" } })
        );
    }
}
