// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pieces of the handler registries shared by both dialects

use std::ffi::OsString;

use crate::error::Errno;
use crate::gate::Completion;

/// A registered handler. Handlers run on the single handler thread, so they
/// need not be `Send`.
pub type Handler<A, P> = Box<dyn Fn(A, Completion<P>)>;

/// A registered lifecycle hook
pub type Hook = Box<dyn Fn(Completion<()>)>;

/// Init and destroy hooks; both default to a no-op success
#[derive(Default)]
pub struct Lifecycle {
    pub(crate) init: Option<Hook>,
    pub(crate) destroy: Option<Hook>,
}

impl Lifecycle {
    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn has_destroy(&self) -> bool {
        self.destroy.is_some()
    }
}

/// Outcome of a data operation nobody registered
pub(crate) fn unsupported<P>(done: Completion<P>) {
    done.error(Errno::ENOSYS);
}

/// Outcome of a reply-less operation nobody registered
pub(crate) fn ignored(done: Completion<()>) {
    done.success();
}

/// open / opendir
#[derive(Clone, Debug)]
pub struct OpenArgs<T> {
    pub target: T,
    pub flags: i32,
}

/// read: the handler fills `buf` and reports how many leading bytes are
/// valid. `buf.len()` is the requested length.
#[derive(Debug)]
pub struct ReadArgs<T> {
    pub target: T,
    pub fh: u64,
    pub offset: u64,
    pub buf: Vec<u8>,
}

impl<T> ReadArgs<T> {
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

/// write: `data` is an owned copy of exactly the bytes the transport sent
#[derive(Debug)]
pub struct WriteArgs<T> {
    pub target: T,
    pub fh: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// release / releasedir
#[derive(Clone, Debug)]
pub struct ReleaseArgs<T> {
    pub target: T,
    pub fh: u64,
    pub flags: i32,
    pub flush: bool,
}

/// fsync / fsyncdir
#[derive(Clone, Debug)]
pub struct FsyncArgs<T> {
    pub target: T,
    pub fh: u64,
    pub datasync: bool,
}

/// setxattr
#[derive(Clone, Debug)]
pub struct XattrArgs<T> {
    pub target: T,
    pub name: OsString,
    pub value: Vec<u8>,
    pub flags: i32,
}
