// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `mirrorfs`: a path-dialect passthrough onto a source directory
//!
//! Each call runs as a local task doing `tokio::fs` I/O on the same path
//! under the source root; I/O failures reach the caller as their errno.

use std::fs::{FileTimes, FileType};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use fusegate_core::path::{CreateArgs, LinkArgs, MkdirArgs, RenameArgs, SymlinkArgs, TruncateArgs, UtimensArgs};
use fusegate_core::{Completion, DirEntry, Errno, FileKind, FileStat, OpenArgs, OpenReply, PathHandlers};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{SampleError, SampleResult};
use crate::memfs::RENAME_NOREPLACE;

/// Source directory that mount paths resolve against
#[derive(Debug)]
pub struct Mirror {
    root: PathBuf,
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason.to_string())
}

fn since_epoch(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(u64::try_from(nsecs).unwrap_or(0));
    match u64::try_from(secs) {
        Ok(secs) => SystemTime::UNIX_EPOCH + Duration::from_secs(secs) + nanos,
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

fn kind_of(file_type: FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_fifo() {
        FileKind::NamedPipe
    } else if file_type.is_char_device() {
        FileKind::CharDevice
    } else if file_type.is_block_device() {
        FileKind::BlockDevice
    } else if file_type.is_socket() {
        FileKind::Socket
    } else {
        FileKind::RegularFile
    }
}

fn stat_of(meta: &std::fs::Metadata) -> FileStat {
    FileStat {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: since_epoch(meta.atime(), meta.atime_nsec()),
        mtime: since_epoch(meta.mtime(), meta.mtime_nsec()),
        ctime: since_epoch(meta.ctime(), meta.ctime_nsec()),
        kind: kind_of(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: u32::try_from(meta.rdev()).unwrap_or(0),
        blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
    }
}

impl Mirror {
    /// Mirror `root`, which must be an existing directory
    pub fn new(root: impl Into<PathBuf>) -> SampleResult<Self> {
        let root = root.into();
        if !std::fs::metadata(&root)?.is_dir() {
            return Err(SampleError::NotADirectory);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `path` lives under the source root. Only plain names are
    /// accepted below `/`.
    fn source(&self, path: &Path) -> io::Result<PathBuf> {
        let mut source = self.root.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => source.push(name),
                Component::ParentDir | Component::Prefix(_) => return Err(invalid("path leaves the mirror")),
            }
        }
        Ok(source)
    }

    async fn getattr(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::symlink_metadata(self.source(path)?).await?;
        Ok(stat_of(&meta))
    }

    async fn readdir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut dir = fs::read_dir(self.source(path)?).await?;
        let mut listing = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let kind = kind_of(entry.file_type().await?);
            listing.push(DirEntry::new(entry.file_name()).with_kind(kind));
        }
        Ok(listing)
    }

    async fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(self.source(path)?).await
    }

    /// Checks that the file can be opened with `flags`; reads and writes
    /// reopen by path
    async fn open(&self, path: &Path, flags: i32) -> io::Result<OpenReply> {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        let file = fs::OpenOptions::new().read(read).write(write).open(self.source(path)?).await?;
        if file.metadata().await?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        Ok(OpenReply::default())
    }

    async fn read(&self, path: &Path, offset: u64, mut buf: Vec<u8>) -> io::Result<(Vec<u8>, usize)> {
        let mut file = fs::File::open(self.source(path)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut n = 0;
        while n < buf.len() {
            match file.read(&mut buf[n..]).await? {
                0 => break,
                k => n += k,
            }
        }
        Ok((buf, n))
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut file = fs::OpenOptions::new().write(true).open(self.source(path)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn create(&self, path: &Path, mode: u32) -> io::Result<OpenReply> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(self.source(path)?)
            .await?;
        Ok(OpenReply::default())
    }

    async fn rename(&self, from: &Path, to: &Path, flags: u32) -> io::Result<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let (from, to) = (self.source(from)?, self.source(to)?);
        if flags & RENAME_NOREPLACE != 0 && fs::symlink_metadata(&to).await.is_ok() {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        fs::rename(from, to).await
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.source(path)?).await
    }

    async fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.source(path)?).await
    }

    async fn link(&self, target: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(self.source(target)?, self.source(link)?).await
    }

    /// `target` is stored as given, not mapped into the source
    async fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        fs::symlink(target, self.source(link)?).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(mode & 0o7777);
        builder.create(self.source(path)?).await
    }

    async fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.source(path)?).await?;
        file.set_len(size).await
    }

    async fn utimens(&self, path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> io::Result<()> {
        let source = self.source(path)?;
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        tokio::task::spawn_blocking(move || std::fs::File::open(source)?.set_times(times))
            .await
            .map_err(io::Error::other)?
    }
}

/// Adapt a mirror operation into a handler that answers from a local task
fn on_source<A, P, F, Fut>(mirror: &Rc<Mirror>, op: F) -> impl Fn(A, Completion<P>) + 'static
where
    A: 'static,
    P: 'static,
    F: Fn(Rc<Mirror>, A) -> Fut + 'static,
    Fut: Future<Output = io::Result<P>> + 'static,
{
    let mirror = Rc::clone(mirror);
    move |args, done| {
        let pending = op(Rc::clone(&mirror), args);
        tokio::task::spawn_local(async move {
            let result = pending.await;
            if let Err(err) = &result {
                debug!(error = %err, "mirrorfs call failed");
            }
            done.result(result.map_err(Errno::from));
        });
    }
}

/// Handlers passing every call through to `mirror`'s source directory
pub fn handlers(mirror: Mirror) -> PathHandlers {
    let mirror = Rc::new(mirror);
    let source = mirror.root().to_path_buf();
    PathHandlers::new()
        .init(move |done| {
            info!(source = %source.display(), "mirrorfs started");
            done.success();
        })
        .destroy(|done| {
            info!("mirrorfs stopped");
            done.success();
        })
        .getattr(on_source(&mirror, |m, path: PathBuf| async move { m.getattr(&path).await }))
        .readlink(on_source(&mirror, |m, path: PathBuf| async move { m.readlink(&path).await }))
        .readdir(on_source(&mirror, |m, path: PathBuf| async move { m.readdir(&path).await }))
        .open(on_source(&mirror, |m, args: OpenArgs<PathBuf>| async move {
            m.open(&args.target, args.flags).await
        }))
        .read({
            let mirror = Rc::clone(&mirror);
            move |args, done| {
                let mirror = Rc::clone(&mirror);
                tokio::task::spawn_local(async move {
                    match mirror.read(&args.target, args.offset, args.buf).await {
                        Ok((buf, n)) => done.filled(buf, n),
                        Err(err) => done.error(err.into()),
                    }
                });
            }
        })
        .write({
            let mirror = Rc::clone(&mirror);
            move |args, done| {
                let mirror = Rc::clone(&mirror);
                tokio::task::spawn_local(async move {
                    match mirror.write(&args.target, args.offset, &args.data).await {
                        Ok(n) => done.count(n),
                        Err(err) => done.error(err.into()),
                    }
                });
            }
        })
        .release(|_, done| done.success())
        .create(on_source(&mirror, |m, args: CreateArgs| async move { m.create(&args.path, args.mode).await }))
        .unlink(on_source(&mirror, |m, path: PathBuf| async move { m.unlink(&path).await }))
        .rename(on_source(&mirror, |m, args: RenameArgs| async move {
            m.rename(&args.from, &args.to, args.flags).await
        }))
        .mkdir(on_source(&mirror, |m, args: MkdirArgs| async move { m.mkdir(&args.path, args.mode).await }))
        .rmdir(on_source(&mirror, |m, path: PathBuf| async move { m.rmdir(&path).await }))
        .link(on_source(&mirror, |m, args: LinkArgs| async move { m.link(&args.target, &args.link).await }))
        .symlink(on_source(&mirror, |m, args: SymlinkArgs| async move {
            m.symlink(&args.target, &args.link).await
        }))
        .truncate(on_source(&mirror, |m, args: TruncateArgs| async move {
            m.truncate(&args.path, args.size).await
        }))
        .utimens(on_source(&mirror, |m, args: UtimensArgs| async move {
            m.utimens(&args.path, args.atime, args.mtime).await
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusegate_core::{CallbackTransport, Dispatcher, MountConfig, MountController, PathDialect, StopSignal};
    use std::ffi::OsString;

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"Hello world!\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("inner"), b"inside").unwrap();
        dir
    }

    #[test]
    fn paths_stay_inside_the_source() {
        let dir = source_tree();
        let mirror = Mirror::new(dir.path()).unwrap();
        assert_eq!(mirror.source(Path::new("/")).unwrap(), dir.path());
        assert_eq!(mirror.source(Path::new("/sub/inner")).unwrap(), dir.path().join("sub/inner"));
        let escaped = mirror.source(Path::new("/sub/../../etc/passwd")).unwrap_err();
        assert_eq!(Errno::from(escaped), Errno::EINVAL);

        assert!(matches!(Mirror::new(dir.path().join("hello.txt")), Err(SampleError::NotADirectory)));
        assert!(matches!(Mirror::new(dir.path().join("missing")), Err(SampleError::Io(_))));
    }

    #[test]
    fn kinds_follow_the_source_file_types() {
        let dir = source_tree();
        std::os::unix::fs::symlink("hello.txt", dir.path().join("ln")).unwrap();
        let kind = |name: &str| kind_of(std::fs::symlink_metadata(dir.path().join(name)).unwrap().file_type());
        assert_eq!(kind("sub"), FileKind::Directory);
        assert_eq!(kind("hello.txt"), FileKind::RegularFile);
        assert_eq!(kind("ln"), FileKind::Symlink);

        let stat = stat_of(&std::fs::metadata(dir.path().join("hello.txt")).unwrap());
        assert_eq!(stat.size, 13);
        assert!(stat.mtime > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn mounted_mirror_passes_calls_through() {
        let dir = source_tree();
        let handlers = handlers(Mirror::new(dir.path()).unwrap());
        let (tx, rx) = std::sync::mpsc::channel();

        MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/mirrorfs"), handlers)
            .run_blocking(CallbackTransport::new(move |d: Dispatcher<PathDialect>, _stop: StopSignal| {
                let mut stat = FileStat::default();
                let stat_rc = d.getattr(Path::new("/hello.txt"), &mut stat);

                let mut names = Vec::new();
                let listed = d.readdir(Path::new("/"), &mut |entry| {
                    names.push((entry.name.clone(), entry.kind));
                    false
                });
                names.sort_by(|a, b| a.0.cmp(&b.0));

                let mut buf = [0u8; 5];
                let read = d.read(Path::new("/hello.txt"), 0, 6, &mut buf);

                let mut open = OpenReply::default();
                let created = d.create(Path::new("/sub/notes"), 0o600, libc::O_WRONLY, &mut open);
                let written = d.write(Path::new("/sub/notes"), 0, 0, b"remember");
                let made = d.mkdir(Path::new("/made"), 0o755);
                let renamed = d.rename(Path::new("/sub/notes"), Path::new("/made/notes"), 0);
                let exchanged = d.rename(Path::new("/hello.txt"), Path::new("/made/notes"), 2);
                let kept = d.rename(Path::new("/hello.txt"), Path::new("/made/notes"), RENAME_NOREPLACE);
                let linked = d.symlink(Path::new("hello.txt"), Path::new("/ln"));
                let mut target = PathBuf::new();
                let readlink = d.readlink(Path::new("/ln"), &mut target);
                let truncated = d.truncate(Path::new("/hello.txt"), 5, None);
                let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
                let touched = d.utimens(Path::new("/hello.txt"), None, Some(mtime));

                let missing = d.unlink(Path::new("/nope"));
                let escaped = d.getattr(Path::new("/../outside"), &mut FileStat::default());
                let not_empty = d.rmdir(Path::new("/made"));

                let _ = tx.send((
                    (stat_rc, stat.size, stat.kind),
                    (listed, names),
                    (read, buf),
                    (created, written, made, renamed, exchanged, kept),
                    (linked, readlink, target),
                    (truncated, touched),
                    (missing, escaped, not_empty),
                ));
            }))
            .unwrap();

        let (stat, listing, read, changes, links, resized, failures) = rx.recv().unwrap();
        assert_eq!(stat, (0, 13, FileKind::RegularFile));
        assert_eq!(
            listing,
            (
                0,
                vec![
                    (OsString::from("hello.txt"), Some(FileKind::RegularFile)),
                    (OsString::from("sub"), Some(FileKind::Directory)),
                ]
            )
        );
        assert_eq!(read, (5, *b"world"));
        assert_eq!(changes, (0, 8, 0, 0, -libc::EINVAL, -libc::EEXIST));
        assert_eq!(links, (0, 0, PathBuf::from("hello.txt")));
        assert_eq!(resized, (0, 0));
        assert_eq!(failures, (-libc::ENOENT, -libc::EINVAL, -libc::ENOTEMPTY));

        let source = dir.path();
        assert_eq!(std::fs::read(source.join("made/notes")).unwrap(), b"remember");
        assert!(!source.join("sub/notes").exists());
        assert_eq!(std::fs::read(source.join("hello.txt")).unwrap(), b"Hello");
        let modified = std::fs::metadata(source.join("hello.txt")).unwrap().modified().unwrap();
        assert_eq!(modified, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
        assert_eq!(std::fs::read_link(source.join("ln")).unwrap(), PathBuf::from("hello.txt"));
    }
}
