// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end behaviour of the bridge: transport threads calling into a
//! mount whose handlers run on the test thread

use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use fusegate_core::{
    BridgeError, CallbackTransport, DirEntry, Dispatcher, Entry, Errno, FileStat, InodeDialect,
    InodeHandlers, MountConfig, MountController, MountState, OpenReply, PathDialect, PathHandlers,
    StopSignal,
};

/// Run a path mount on this thread; `body` plays the transport and its
/// return value comes back once the mount has stopped
fn serve_path<R: Send + 'static>(
    mount_point: &str,
    handlers: PathHandlers,
    body: impl FnOnce(Dispatcher<PathDialect>) -> R + Send + 'static,
) -> R {
    let (tx, rx) = mpsc::channel();
    let controller = MountController::<PathDialect>::new(MountConfig::new(mount_point), handlers);
    controller
        .run_blocking(CallbackTransport::new(move |dispatcher: Dispatcher<PathDialect>, _stop: StopSignal| {
            let _ = tx.send(body(dispatcher));
        }))
        .unwrap();
    rx.recv().unwrap()
}

fn regular_file(size: u64) -> FileStat {
    FileStat::from_mode(0o100644, size)
}

#[test]
fn handler_errno_passes_through_and_leaves_outputs_alone() {
    let handlers = PathHandlers::new().getattr(|path, done| {
        if path == Path::new("/present") {
            done.ok(regular_file(3));
        } else {
            done.error(Errno::ENOENT);
        }
    });

    let (missing, untouched, present, size) = serve_path("/fusegate-test/errno", handlers, |d| {
        let mut stat = FileStat {
            size: 42,
            ..FileStat::default()
        };
        let missing = d.getattr(Path::new("/missing"), &mut stat);
        let untouched = stat.size;
        let present = d.getattr(Path::new("/present"), &mut stat);
        (missing, untouched, present, stat.size)
    });

    assert_eq!(missing, -libc::ENOENT);
    assert_eq!(untouched, 42);
    assert_eq!(present, 0);
    assert_eq!(size, 3);
}

#[test]
fn read_copies_exactly_the_reported_bytes() {
    let handlers = PathHandlers::new().read(|args, done| {
        let mut buf = args.buf;
        if args.target == Path::new("/short") {
            buf[..5].copy_from_slice(b"hello");
            done.filled(buf, 5);
        } else {
            // Claims one byte more than was asked for
            let n = buf.len() + 1;
            buf.resize(n, b'x');
            done.filled(buf, n);
        }
    });

    let (short, contents, overlong, after) = serve_path("/fusegate-test/read", handlers, |d| {
        let mut buf = [b'.'; 8];
        let short = d.read(Path::new("/short"), 0, 0, &mut buf);
        let contents = buf;
        let mut buf = [b'.'; 8];
        let overlong = d.read(Path::new("/long"), 0, 0, &mut buf);
        (short, contents, overlong, buf)
    });

    assert_eq!(short, 5);
    assert_eq!(&contents, b"hello...");
    assert_eq!(overlong, -libc::EIO);
    assert_eq!(after, [b'.'; 8]);
}

#[test]
fn write_payload_survives_an_async_boundary() {
    let stored = Rc::new(RefCell::new(Vec::new()));
    let handlers = PathHandlers::new().write({
        let stored = Rc::clone(&stored);
        move |args, done| {
            let stored = Rc::clone(&stored);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let n = args.data.len();
                stored.borrow_mut().extend_from_slice(&args.data);
                done.count(n);
            });
        }
    });

    let status = serve_path("/fusegate-test/write", handlers, |d| {
        let mut data = b"payload".to_vec();
        let status = d.write(Path::new("/f"), 7, 0, &data);
        data.fill(0);
        status
    });

    assert_eq!(status, 7);
    assert_eq!(stored.borrow().as_slice(), b"payload");
}

#[test]
fn write_count_beyond_the_payload_answers_eio() {
    let handlers = PathHandlers::new().write(|args, done| done.count(args.data.len() + 1));

    let (overcount, empty) = serve_path("/fusegate-test/write-overcount", handlers, |d| {
        (d.write(Path::new("/f"), 0, 0, b"abc"), d.write(Path::new("/f"), 0, 0, b""))
    });

    assert_eq!(overcount, -libc::EIO);
    assert_eq!(empty, -libc::EIO);
}

#[test]
fn failed_listing_never_reaches_the_filler() {
    let handlers = PathHandlers::new().readdir(|path, done| {
        if path == Path::new("/locked") {
            done.error(Errno::EACCES);
        } else {
            done.ok(vec![DirEntry::new("only")]);
        }
    });

    let (denied, denied_calls, allowed, allowed_calls) = serve_path("/fusegate-test/readdir-error", handlers, |d| {
        let mut denied_calls = 0;
        let denied = d.readdir(Path::new("/locked"), &mut |_| {
            denied_calls += 1;
            false
        });
        let mut allowed_calls = 0;
        let allowed = d.readdir(Path::new("/"), &mut |_| {
            allowed_calls += 1;
            false
        });
        (denied, denied_calls, allowed, allowed_calls)
    });

    assert_eq!((denied, denied_calls), (-libc::EACCES, 0));
    assert_eq!((allowed, allowed_calls), (0, 1));
}

#[test]
fn concurrent_callers_get_their_own_results() {
    let handlers = PathHandlers::new().read(|args, done| {
        let bytes = args.target.as_os_str().as_encoded_bytes().to_vec();
        // Answer later so the two calls are in flight together
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            let mut buf = args.buf;
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            done.filled(buf, n);
        });
    });

    let results = serve_path("/fusegate-test/concurrent", handlers, |d| {
        thread::scope(|scope| {
            let workers: Vec<_> = ["/a", "/bb"]
                .into_iter()
                .map(|path| {
                    let d = d.clone();
                    scope.spawn(move || {
                        (0..50)
                            .map(|_| {
                                let mut buf = [0u8; 16];
                                let n = d.read(Path::new(path), 0, 0, &mut buf);
                                (path, buf[..n as usize].to_vec())
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect::<Vec<_>>()
        })
    });

    assert_eq!(results.len(), 100);
    for (path, bytes) in results {
        assert_eq!(bytes, path.as_bytes());
    }
}

#[test]
fn unregistered_operations_answer_enosys() {
    let handlers = PathHandlers::new()
        .getattr(|_, done| done.ok(FileStat::from_mode(0o040755, 0)))
        .readdir(|_, done| done.ok(vec![DirEntry::new("a"), DirEntry::new("b")]));

    let (open, handle, listing, status) = serve_path("/fusegate-test/enosys", handlers, |d| {
        let mut open = OpenReply::handle(9);
        let rc = d.open(Path::new("/a"), libc::O_RDONLY, &mut open);
        let mut names = Vec::new();
        let status = d.readdir(Path::new("/"), &mut |entry| {
            names.push(entry.name.clone());
            false
        });
        (rc, open.fh, names, status)
    });

    assert_eq!(open, -libc::ENOSYS);
    assert_eq!(handle, 9);
    assert_eq!(status, 0);
    assert_eq!(listing, vec!["a", "b"]);
}

#[test]
fn init_completes_before_the_first_call_is_dispatched() {
    let initialized = Rc::new(Cell::new(false));
    let seen_by_getattr = Rc::new(Cell::new(None));
    let handlers = PathHandlers::new()
        .init({
            let initialized = Rc::clone(&initialized);
            move |done| {
                let initialized = Rc::clone(&initialized);
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    initialized.set(true);
                    done.success();
                });
            }
        })
        .getattr({
            let initialized = Rc::clone(&initialized);
            let seen = Rc::clone(&seen_by_getattr);
            move |_, done| {
                seen.set(Some(initialized.get()));
                done.ok(FileStat::default());
            }
        });

    let status = serve_path("/fusegate-test/init", handlers, |d| {
        let mut stat = FileStat::default();
        d.getattr(Path::new("/"), &mut stat)
    });

    assert_eq!(status, 0);
    assert_eq!(seen_by_getattr.get(), Some(true));
}

#[test]
fn lost_completions_answer_eio() {
    let handlers = PathHandlers::new()
        .unlink(|_, done| drop(done))
        .rmdir(|_, _done| panic!("handler bug"))
        .mkdir(|_, done| done.success());

    let (dropped, panicked, after) = serve_path("/fusegate-test/lost", handlers, |d| {
        (
            d.unlink(Path::new("/x")),
            d.rmdir(Path::new("/y")),
            d.mkdir(Path::new("/z"), 0o755),
        )
    });

    assert_eq!(dropped, -libc::EIO);
    assert_eq!(panicked, -libc::EIO);
    assert_eq!(after, 0, "the mount keeps serving after a handler panic");
}

#[test]
fn failed_init_aborts_the_mount() {
    let handlers = PathHandlers::new()
        .init(|done| done.error(Errno::EACCES))
        .getattr(|_, done| done.ok(FileStat::default()));
    let controller = MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/init-fail"), handlers);
    let handle = controller.handle();
    let (tx, rx) = mpsc::channel();

    let result = controller.run_blocking(CallbackTransport::new(move |d: Dispatcher<PathDialect>, _stop: StopSignal| {
        let mut stat = FileStat::default();
        let _ = tx.send(d.getattr(Path::new("/"), &mut stat));
    }));

    assert!(matches!(result, Err(BridgeError::InitFailed(errno)) if errno == Errno::EACCES));
    assert_eq!(rx.recv().unwrap(), -libc::EIO);
    assert_eq!(handle.state(), MountState::Unmounted);
}

#[test]
fn unmount_runs_destroy_once() {
    let destroyed = Rc::new(Cell::new(0));
    let handlers = PathHandlers::new()
        .destroy({
            let destroyed = Rc::clone(&destroyed);
            move |done| {
                destroyed.set(destroyed.get() + 1);
                done.success();
            }
        })
        .getattr(|_, done| done.ok(FileStat::default()));
    let controller = MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/unmount"), handlers);
    let handle = controller.handle();

    let unmounter = thread::spawn({
        let handle = handle.clone();
        move || {
            assert!(handle.wait_for(MountState::Running, Duration::from_secs(5)));
            handle.unmount();
        }
    });

    controller
        .run_blocking(CallbackTransport::new(|d: Dispatcher<PathDialect>, stop: StopSignal| {
            let mut stat = FileStat::default();
            while !stop.is_raised() {
                assert_eq!(d.getattr(Path::new("/"), &mut stat), 0);
                thread::sleep(Duration::from_millis(1));
            }
        }))
        .unwrap();
    unmounter.join().unwrap();

    assert_eq!(destroyed.get(), 1);
    assert_eq!(handle.state(), MountState::Unmounted);
}

#[test]
fn a_mount_point_serves_one_session_at_a_time() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let first = thread::spawn(move || {
        let controller =
            MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/dup"), PathHandlers::new());
        handle_tx.send(controller.handle()).unwrap();
        controller.run_blocking(CallbackTransport::new(|_d: Dispatcher<PathDialect>, stop: StopSignal| {
            while !stop.is_raised() {
                thread::sleep(Duration::from_millis(1));
            }
        }))
    });
    let handle = handle_rx.recv().unwrap();
    assert!(handle.wait_for(MountState::Running, Duration::from_secs(5)));

    let second = MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/dup"), PathHandlers::new());
    let result = second.run_blocking(CallbackTransport::new(|_d: Dispatcher<PathDialect>, _stop: StopSignal| {}));
    assert!(matches!(result, Err(BridgeError::AlreadyMounted(path)) if path == PathBuf::from("/fusegate-test/dup")));

    handle.unmount();
    first.join().unwrap().unwrap();

    // Released again once the first session is gone
    let third = MountController::<PathDialect>::new(MountConfig::new("/fusegate-test/dup"), PathHandlers::new());
    third
        .run_blocking(CallbackTransport::new(|_d: Dispatcher<PathDialect>, _stop: StopSignal| {}))
        .unwrap();
}

#[test]
fn inode_dialect_round_trip() {
    let handlers = InodeHandlers::new().lookup(|args, done| {
        if args.parent == fusegate_core::inode::ROOT_INO && args.name == "etc" {
            let mut attr = FileStat::from_mode(0o040755, 0);
            attr.ino = 2;
            done.ok(Entry::new(attr));
        } else {
            done.error(Errno::ENOENT);
        }
    });

    let (tx, rx) = mpsc::channel();
    MountController::<InodeDialect>::new(MountConfig::new("/fusegate-test/inode"), handlers)
        .run_blocking(CallbackTransport::new(move |d: Dispatcher<InodeDialect>, _stop: StopSignal| {
            let mut entry = Entry::default();
            let found = d.lookup(1, OsStr::new("etc"), &mut entry);
            let missing = d.lookup(1, OsStr::new("nope"), &mut Entry::default());
            let forgotten = d.forget(2, 1);
            let unsupported = d.unlink(1, OsStr::new("etc"));
            let _ = tx.send((found, entry.ino, missing, forgotten, unsupported));
        }))
        .unwrap();

    assert_eq!(rx.recv().unwrap(), (0, 2, -libc::ENOENT, 0, -libc::ENOSYS));
}
