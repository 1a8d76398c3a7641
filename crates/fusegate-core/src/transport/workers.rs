// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker threads that carry transport requests into the bridge
//!
//! The kernel session delivers requests on a single thread. Each request is
//! pushed here so that many of them can wait on their gates at once while the
//! session thread keeps reading.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: SegQueue<Job>,
    signal: (Mutex<bool>, Condvar),
    shutdown: AtomicBool,
    inflight: AtomicU64,
    max_inflight: AtomicU64,
}

impl Shared {
    fn wake(&self, all: bool) {
        let (lock, cvar) = &self.signal;
        if let Ok(mut pending) = lock.lock() {
            *pending = true;
            if all {
                cvar.notify_all();
            } else {
                cvar.notify_one();
            }
        }
    }

    fn idle(&self) {
        let (lock, cvar) = &self.signal;
        let Ok(mut pending) = lock.lock() else {
            return;
        };
        if !*pending {
            pending = match cvar.wait_timeout(pending, Duration::from_millis(5)) {
                Ok((guard, _)) => guard,
                Err(_) => return,
            };
        }
        *pending = false;
    }
}

/// Fixed set of worker threads. With zero threads, jobs run inline on the
/// submitting thread.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            signal: (Mutex::new(false), Condvar::new()),
            shutdown: AtomicBool::new(false),
            inflight: AtomicU64::new(0),
            max_inflight: AtomicU64::new(0),
        });
        let mut handles = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("fusegate-worker-{index}"))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(target: "fusegate::fuse", index, error = %err, "failed to spawn worker thread"),
            }
        }
        Self { shared, handles }
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Highest number of jobs observed running at once
    pub fn max_inflight(&self) -> u64 {
        self.shared.max_inflight.load(Ordering::Acquire)
    }

    pub fn run(&self, job: impl FnOnce() + Send + 'static) {
        if self.handles.is_empty() {
            job();
            return;
        }
        self.shared.queue.push(Box::new(job));
        self.shared.wake(false);
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        match shared.queue.pop() {
            Some(job) => {
                let running = shared.inflight.fetch_add(1, Ordering::AcqRel) + 1;
                shared.max_inflight.fetch_max(running, Ordering::AcqRel);
                job();
                shared.inflight.fetch_sub(1, Ordering::AcqRel);
            }
            // Queued jobs are drained before a shutdown takes effect.
            None if shared.shutdown.load(Ordering::Acquire) => break,
            None => shared.idle(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake(true);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: "fusegate::fuse", "worker thread panicked");
            }
        }
        debug!(
            target: "fusegate::fuse",
            max_inflight = self.shared.max_inflight.load(Ordering::Acquire),
            "worker pool stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Barrier;

    #[test]
    fn jobs_run_concurrently() {
        let pool = WorkerPool::new(2);
        let barrier = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();
        for i in 0..2 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            pool.run(move || {
                // Both jobs must be running for either to pass the barrier.
                barrier.wait();
                tx.send(i).unwrap();
            });
        }
        let mut seen: Vec<i32> = rx.iter().take(2).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(pool.max_inflight(), 2);
    }

    #[test]
    fn zero_threads_runs_inline() {
        let pool = WorkerPool::new(0);
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        pool.run(move || tx.send(thread::current().id()).unwrap());
        assert_eq!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn drop_drains_queued_jobs() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let pool = WorkerPool::new(1);
            for _ in 0..16 {
                let counter = Arc::clone(&counter);
                pool.run(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
