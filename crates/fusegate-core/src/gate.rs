// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One-shot completion gates
//!
//! [`open`] creates a linked pair: the [`Completion`] travels with the
//! pending call into the handler runtime, the [`Gate`] stays with the caller.
//! `Completion::complete` consumes the completion, so a call cannot be
//! answered twice. A completion dropped unanswered answers `-EIO` on its way
//! out, which keeps the blocked caller from waiting forever on a handler
//! that panicked or forgot to reply.

use std::fmt;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::codec::ResultEnvelope;
use crate::error::Errno;

/// Create a completion/gate pair for call `id` of operation `op`
pub fn open<P>(op: &'static str, id: u64) -> (Completion<P>, Gate<P>) {
    let (tx, rx) = oneshot::channel();
    let completion = Completion {
        op,
        id,
        started: Instant::now(),
        tx: Some(tx),
    };
    (completion, Gate { op, id, rx })
}

/// Handler-side half: report the outcome of one call, exactly once
#[must_use = "a pending call is answered only when its completion is completed"]
pub struct Completion<P> {
    op: &'static str,
    id: u64,
    started: Instant,
    tx: Option<oneshot::Sender<ResultEnvelope<P>>>,
}

impl<P> Completion<P> {
    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Report the outcome and release the waiting caller
    pub fn complete(mut self, envelope: ResultEnvelope<P>) {
        self.signal(envelope);
    }

    pub fn ok(self, payload: P) {
        self.complete(ResultEnvelope::ok(payload));
    }

    pub fn error(self, errno: Errno) {
        self.complete(ResultEnvelope::error(errno));
    }

    /// Report a raw status with no payload
    pub fn status(self, status: i32) {
        self.complete(ResultEnvelope::from_status(status));
    }

    /// Convenience for handlers that already produce a `Result`
    pub fn result(self, result: Result<P, Errno>) {
        self.complete(result.into());
    }

    fn signal(&mut self, envelope: ResultEnvelope<P>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let status = envelope.status();
        trace!(
            target: "fusegate::dispatch",
            op = self.op,
            id = self.id,
            status,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "call completed"
        );
        if tx.send(envelope).is_err() {
            // The caller stopped waiting; nothing left to release.
            error!(
                target: "fusegate::dispatch",
                op = self.op,
                id = self.id,
                "completion signaled after its gate was abandoned"
            );
        }
    }
}

impl Completion<()> {
    pub fn success(self) {
        self.complete(ResultEnvelope::success());
    }

    /// Byte-transfer success
    pub fn count(self, n: usize) {
        self.complete(ResultEnvelope::count(n));
    }
}

impl Completion<Vec<u8>> {
    /// Read success: `n` leading bytes of `buf` are valid
    pub fn filled(self, buf: Vec<u8>, n: usize) {
        let n = i32::try_from(n).unwrap_or(i32::MAX);
        self.complete(ResultEnvelope::with_payload(n, buf));
    }
}

impl<P> Drop for Completion<P> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            error!(
                target: "fusegate::dispatch",
                op = self.op,
                id = self.id,
                panicking = std::thread::panicking(),
                "completion dropped without a reply; answering EIO"
            );
            self.signal(ResultEnvelope::error(Errno::EIO));
        }
    }
}

impl<P> fmt::Debug for Completion<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("op", &self.op)
            .field("id", &self.id)
            .field("answered", &self.tx.is_none())
            .finish()
    }
}

/// Caller-side half: wait for the handler's outcome
pub struct Gate<P> {
    op: &'static str,
    id: u64,
    rx: oneshot::Receiver<ResultEnvelope<P>>,
}

impl<P> Gate<P> {
    /// Block the current thread until the call completes. There is no
    /// timeout: the transport's contract is synchronous too.
    ///
    /// Must not be called on the handler runtime thread.
    pub fn wait(self) -> ResultEnvelope<P> {
        let Gate { op, id, rx } = self;
        rx.blocking_recv().unwrap_or_else(|_| Self::lost(op, id))
    }

    /// Await the outcome from inside the handler runtime
    pub async fn signaled(self) -> ResultEnvelope<P> {
        let Gate { op, id, rx } = self;
        rx.await.unwrap_or_else(|_| Self::lost(op, id))
    }

    fn lost(op: &'static str, id: u64) -> ResultEnvelope<P> {
        // Completion::drop always signals, so this means the sender vanished
        // without running its destructor (leaked).
        error!(target: "fusegate::dispatch", op, id, "completion vanished; answering EIO");
        ResultEnvelope::error(Errno::EIO)
    }
}
