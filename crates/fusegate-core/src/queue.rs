// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Hand-off channel from transport worker threads to the handler runtime

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::dialect::{Dialect, Operation};

/// One in-flight call, owned by exactly one side at a time
pub struct PendingCall<D: Dialect> {
    pub id: u64,
    pub op: D::Op,
    pub call: D::Call,
    pub enqueued_at: Instant,
}

impl<D: Dialect> PendingCall<D> {
    pub fn new(id: u64, call: D::Call) -> Self {
        Self {
            id,
            op: D::op(&call),
            call,
            enqueued_at: Instant::now(),
        }
    }
}

impl<D: Dialect> fmt::Debug for PendingCall<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("op", &self.op.name())
            .finish_non_exhaustive()
    }
}

/// Counters shared by both ends of one queue
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    max_depth: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub depth: u64,
    pub max_depth: u64,
}

impl QueueStats {
    fn record_enqueue(&self) {
        let enqueued = self.enqueued.fetch_add(1, Ordering::AcqRel) + 1;
        let depth = enqueued.saturating_sub(self.dequeued.load(Ordering::Acquire));
        self.max_depth.fetch_max(depth, Ordering::AcqRel);
    }

    fn record_dequeue(&self) {
        self.dequeued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let dequeued = self.dequeued.load(Ordering::Acquire);
        let enqueued = self.enqueued.load(Ordering::Acquire);
        QueueSnapshot {
            enqueued,
            dequeued,
            depth: enqueued.saturating_sub(dequeued),
            max_depth: self.max_depth.load(Ordering::Acquire),
        }
    }
}

/// Create a queue for one mount
pub fn channel<D: Dialect>() -> (CallSender<D>, CallReceiver<D>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(QueueStats::default());
    (
        CallSender {
            tx,
            stats: Arc::clone(&stats),
        },
        CallReceiver { rx, stats },
    )
}

/// Producer side; cloned into every worker thread
pub struct CallSender<D: Dialect> {
    tx: mpsc::UnboundedSender<PendingCall<D>>,
    stats: Arc<QueueStats>,
}

impl<D: Dialect> Clone for CallSender<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<D: Dialect> CallSender<D> {
    /// Never blocks. When the consumer is gone the call is handed back so the
    /// producer can complete it itself.
    pub fn enqueue(&self, call: PendingCall<D>) -> Result<(), PendingCall<D>> {
        // Count first so a fast consumer never observes dequeued > enqueued.
        self.stats.record_enqueue();
        self.tx.send(call).map_err(|mpsc::error::SendError(call)| {
            self.stats.record_dequeue();
            call
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the handler runtime
pub struct CallReceiver<D: Dialect> {
    rx: mpsc::UnboundedReceiver<PendingCall<D>>,
    stats: Arc<QueueStats>,
}

impl<D: Dialect> CallReceiver<D> {
    /// Next call, or `None` once every producer is gone and the queue is empty
    pub async fn next(&mut self) -> Option<PendingCall<D>> {
        let call = self.rx.recv().await?;
        self.stats.record_dequeue();
        Some(call)
    }

    pub fn try_next(&mut self) -> Option<PendingCall<D>> {
        let call = self.rx.try_recv().ok()?;
        self.stats.record_dequeue();
        Some(call)
    }

    /// Stop accepting calls; already queued ones can still be received
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathCall, PathDialect};
    use std::path::PathBuf;

    fn call(path: &str) -> (PendingCall<PathDialect>, crate::gate::Gate<()>) {
        let (done, gate) = crate::gate::open("unlink", 0);
        (PendingCall::new(0, PathCall::unlink(PathBuf::from(path), done)), gate)
    }

    #[tokio::test]
    async fn every_enqueue_has_a_matching_dequeue() {
        let (tx, mut rx) = channel::<PathDialect>();
        let producers: Vec<_> = (0..4)
            .map(|i| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let (pending, gate) = call(&format!("/f{i}"));
                    tx.enqueue(pending).unwrap();
                    gate
                })
            })
            .collect();
        drop(tx);
        let gates: Vec<_> = producers.into_iter().map(|p| p.join().unwrap()).collect();

        let mut seen = 0;
        while let Some(pending) = rx.next().await {
            assert_eq!(pending.op.name(), "unlink");
            seen += 1;
        }
        assert_eq!(seen, 4);
        let stats = rx.stats();
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.dequeued, 4);
        assert_eq!(stats.depth, 0);
        assert!(stats.max_depth >= 1);
        drop(gates);
    }

    #[test]
    fn closed_queue_hands_the_call_back() {
        let (tx, rx) = channel::<PathDialect>();
        drop(rx);
        let (pending, _gate) = call("/gone");
        let returned = tx.enqueue(pending).unwrap_err();
        assert_eq!(returned.op.name(), "unlink");
        assert!(tx.is_closed());
    }
}
