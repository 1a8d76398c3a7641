// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker-side half of the bridge
//!
//! A [`Dispatcher`] is what a transport holds. Each synchronous entry point
//! (see `path::entry` and `inode::entry`) marshals its arguments, enqueues one
//! pending call, blocks on that call's gate and decodes the envelope.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::codec::ResultEnvelope;
use crate::dialect::{Dialect, Operation};
use crate::error::{BridgeError, Errno};
use crate::gate::{self, Completion};
use crate::marshal::MarshalError;
use crate::queue::{CallSender, PendingCall};

thread_local! {
    static ON_HANDLER_RUNTIME: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as the handler runtime for as long as it lives
pub(crate) struct HandlerRuntimeGuard {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn enter_handler_runtime() -> HandlerRuntimeGuard {
    let previous = ON_HANDLER_RUNTIME.with(|flag| flag.replace(true));
    HandlerRuntimeGuard {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for HandlerRuntimeGuard {
    fn drop(&mut self) {
        ON_HANDLER_RUNTIME.with(|flag| flag.set(self.previous));
    }
}

fn on_handler_runtime() -> bool {
    ON_HANDLER_RUNTIME.with(Cell::get)
}

/// Process-unique call ids
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_call_id() -> u64 {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Synchronous entry into a running mount. Cheap to clone; one per worker.
pub struct Dispatcher<D: Dialect> {
    queue: CallSender<D>,
    debug: bool,
    calls: Arc<AtomicU64>,
}

impl<D: Dialect> Clone for Dispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            debug: self.debug,
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<D: Dialect> fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("dialect", &D::NAME)
            .field("debug", &self.debug)
            .field("calls", &self.calls.load(Ordering::Relaxed))
            .finish()
    }
}

impl<D: Dialect> Dispatcher<D> {
    pub fn new(queue: CallSender<D>, debug: bool) -> Self {
        Self {
            queue,
            debug,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of calls this dispatcher and its clones have issued
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Marshal, enqueue, wait.
    ///
    /// A marshaling failure or a reentrant call is answered here without
    /// enqueuing anything; the returned envelope then carries the errno.
    pub(crate) fn invoke<A, P>(
        &self,
        op: D::Op,
        marshal: impl FnOnce(&'static str) -> Result<A, MarshalError>,
        call: impl FnOnce(A, Completion<P>) -> D::Call,
    ) -> ResultEnvelope<P> {
        let name = op.name();
        if on_handler_runtime() {
            let err = BridgeError::ReentrantDispatch { op: name };
            error!(target: "fusegate::dispatch", op = name, "{err}");
            return ResultEnvelope::error(Errno::EDEADLK);
        }
        let args = match marshal(name) {
            Ok(args) => args,
            Err(err) => return ResultEnvelope::error(refuse(name, err)),
        };

        let id = next_call_id();
        self.calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let (done, gate) = gate::open(name, id);
        if let Err(pending) = self.queue.enqueue(PendingCall::new(id, call(args, done))) {
            warn!(target: "fusegate::dispatch", op = name, id, "handler runtime is gone; answering EIO");
            D::reject(pending.call, Errno::EIO);
        }

        let envelope = gate.wait();
        let status = envelope.status();
        let elapsed_us = started.elapsed().as_micros() as u64;
        if self.debug {
            info!(target: "fusegate::dispatch", op = name, id, status, elapsed_us, "call returned");
        } else {
            trace!(target: "fusegate::dispatch", op = name, id, status, elapsed_us, "call returned");
        }
        envelope
    }
}

/// Log a marshaling failure and pick the status reported in its place
fn refuse(op: &'static str, err: MarshalError) -> Errno {
    if err.is_shape_violation() {
        error!(target: "fusegate::dispatch", op, error = %err, "transport delivered malformed arguments");
    } else {
        debug!(target: "fusegate::dispatch", op, error = %err, "call refused before dispatch");
    }
    err.errno()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathDialect, PathOp};
    use crate::queue;
    use std::path::Path;

    #[test]
    fn dead_runtime_answers_eio() {
        let (tx, rx) = queue::channel::<PathDialect>();
        drop(rx);
        let dispatcher = Dispatcher::new(tx, false);
        assert_eq!(dispatcher.unlink(Path::new("/a")), -libc::EIO);
        assert_eq!(dispatcher.calls(), 1);
    }

    #[test]
    fn reentrant_dispatch_is_refused() {
        let (tx, _rx) = queue::channel::<PathDialect>();
        let dispatcher = Dispatcher::new(tx, false);
        let _guard = enter_handler_runtime();
        assert_eq!(dispatcher.unlink(Path::new("/a")), -libc::EDEADLK);
        assert_eq!(dispatcher.calls(), 0);
    }

    #[test]
    fn malformed_arguments_never_enqueue() {
        let (tx, mut rx) = queue::channel::<PathDialect>();
        let dispatcher = Dispatcher::new(tx, false);
        assert_eq!(dispatcher.unlink(Path::new("")), -libc::EINVAL);
        assert!(rx.try_next().is_none());
        assert_eq!(PathOp::Unlink.name(), "unlink");
    }
}
