// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge between synchronous FUSE worker threads and a single-threaded
//! async handler runtime
//!
//! Filesystem handlers are plain closures registered on a [`PathHandlers`]
//! or [`InodeHandlers`] set. They run one at a time on the mount's runtime
//! thread and answer through a typed [`Completion`], immediately or later
//! from a spawned local task. Transport threads call the synchronous entry
//! points on a [`Dispatcher`] and block until that completion fires.
//!
//! ```no_run
//! use fusegate_core::{FileStat, MountConfig, MountController, PathHandlers, PathDialect};
//!
//! let handlers = PathHandlers::new()
//!     .getattr(|path, done| {
//!         if path.as_os_str() == "/" {
//!             done.ok(FileStat::from_mode(0o040755, 0));
//!         } else {
//!             done.error(fusegate_core::Errno::ENOENT);
//!         }
//!     });
//! let controller = MountController::<PathDialect>::new(MountConfig::new("/mnt/x"), handlers);
//! # let _ = controller;
//! ```

#[macro_use]
mod dialect;

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod inode;
pub mod marshal;
pub mod mount;
pub mod path;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod types;

pub use codec::ResultEnvelope;
pub use config::MountConfig;
pub use dialect::{Dialect, Operation};
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, BridgeResult, Errno};
pub use gate::{Completion, Gate};
pub use inode::{InodeCall, InodeDialect, InodeHandlers, InodeOp};
pub use mount::{MountController, MountHandle, MountState};
pub use path::{PathCall, PathDialect, PathHandlers, PathOp};
pub use registry::{FsyncArgs, OpenArgs, ReadArgs, ReleaseArgs, WriteArgs, XattrArgs};
pub use transport::{CallbackTransport, StopSignal, Transport, TransportSession};
pub use types::{Created, DirEntry, Entry, FileKind, FileStat, OpenReply, SetAttr, StatFs};

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub use transport::fuse::{mount_inode, mount_path, FuseTransport};
