// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle
//!
//! A [`MountController`] owns the handler registry and the consumer end of
//! the dispatch queue. It runs on the handler thread, inside a tokio
//! `LocalSet`, and walks the mount through
//! `Unmounted -> Starting -> Running -> Stopping -> Unmounted`:
//!
//! * `Starting`: the transport is started and the init hook is awaited.
//!   Calls that arrive meanwhile wait in the queue.
//! * `Running`: queued calls are dispatched one at a time until the
//!   transport lets go of its dispatcher or [`MountHandle::unmount`] is
//!   called.
//! * `Stopping`: the transport is shut down on a blocking thread while the
//!   queue keeps draining, then the destroy hook is awaited.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::config::MountConfig;
use crate::dialect::{Dialect, Operation};
use crate::dispatcher::{self, Dispatcher};
use crate::error::{BridgeError, BridgeResult, Errno};
use crate::gate;
use crate::queue::{self, CallReceiver, PendingCall};
use crate::registry::Hook;
use crate::transport::{Transport, TransportSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MountState {
    Unmounted,
    Starting,
    Running,
    Stopping,
}

impl MountState {
    fn can_become(self, next: MountState) -> bool {
        use MountState::*;
        matches!(
            (self, next),
            (Unmounted, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Unmounted)
                | (Running, Stopping)
                | (Stopping, Unmounted)
        )
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountState::Unmounted => "unmounted",
            MountState::Starting => "starting",
            MountState::Running => "running",
            MountState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mount points with a live session in this process
fn active_mounts() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on a mount point, released on drop
struct MountClaim {
    key: PathBuf,
}

impl MountClaim {
    fn acquire(mount_point: &Path) -> BridgeResult<Self> {
        // Resolved lexically: touching the filesystem here could land in a
        // mount this process is serving.
        let key = std::path::absolute(mount_point).unwrap_or_else(|_| mount_point.to_path_buf());
        if !lock(active_mounts()).insert(key.clone()) {
            return Err(BridgeError::AlreadyMounted(mount_point.to_path_buf()));
        }
        Ok(Self { key })
    }
}

impl Drop for MountClaim {
    fn drop(&mut self) {
        lock(active_mounts()).remove(&self.key);
    }
}

struct Shared {
    mount_point: PathBuf,
    state: Mutex<MountState>,
    changed: Condvar,
    stop: Notify,
}

impl Shared {
    fn state(&self) -> MountState {
        *lock(&self.state)
    }

    fn transition(&self, next: MountState) -> BridgeResult<()> {
        let mut state = lock(&self.state);
        if !state.can_become(next) {
            return Err(BridgeError::InvalidTransition { from: *state, to: next });
        }
        debug!(target: "fusegate::mount", from = %*state, to = %next, "mount state changed");
        *state = next;
        self.changed.notify_all();
        Ok(())
    }
}

/// Observe a mount or ask it to stop, from any thread
#[derive(Clone)]
pub struct MountHandle {
    shared: Arc<Shared>,
}

impl MountHandle {
    pub fn state(&self) -> MountState {
        self.shared.state()
    }

    pub fn mount_point(&self) -> &Path {
        &self.shared.mount_point
    }

    /// Request an unmount. The mount keeps dispatching calls already in
    /// flight; `run` returns once destroy has completed.
    pub fn unmount(&self) {
        info!(target: "fusegate::mount", mount_point = %self.shared.mount_point.display(), "unmount requested");
        self.shared.stop.notify_one();
    }

    /// Block until the mount reaches `state`; false on timeout
    pub fn wait_for(&self, state: MountState, timeout: Duration) -> bool {
        let guard = lock(&self.shared.state);
        match self.shared.changed.wait_timeout_while(guard, timeout, |current| *current != state) {
            Ok((_, result)) => !result.timed_out(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle")
            .field("mount_point", &self.shared.mount_point)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum LifecycleHook {
    Init,
    Destroy,
}

impl LifecycleHook {
    fn name(self) -> &'static str {
        match self {
            LifecycleHook::Init => "init",
            LifecycleHook::Destroy => "destroy",
        }
    }
}

/// Drives one mount of dialect `D` from start to unmount
pub struct MountController<D: Dialect> {
    config: MountConfig,
    handlers: D::Handlers,
    shared: Arc<Shared>,
}

impl<D: Dialect> MountController<D> {
    pub fn new(config: MountConfig, handlers: D::Handlers) -> Self {
        let shared = Arc::new(Shared {
            mount_point: config.mount_point.clone(),
            state: Mutex::new(MountState::Unmounted),
            changed: Condvar::new(),
            stop: Notify::new(),
        });
        Self {
            config,
            handlers,
            shared,
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn handle(&self) -> MountHandle {
        MountHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the mount on the calling thread until it is unmounted
    pub fn run_blocking<T: Transport<D>>(self, transport: T) -> BridgeResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::Runtime)?;
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.run(transport))
    }

    /// Run the mount until it is unmounted. Must be polled inside a
    /// `LocalSet`; handlers may `spawn_local`.
    pub async fn run<T: Transport<D>>(self, transport: T) -> BridgeResult<()> {
        let _claim = MountClaim::acquire(&self.config.mount_point)?;
        let _handler_thread = dispatcher::enter_handler_runtime();
        let mount_point = self.config.mount_point.display().to_string();

        self.shared.transition(MountState::Starting)?;
        info!(
            target: "fusegate::mount",
            dialect = D::NAME,
            mount_point = %mount_point,
            options = ?self.config.options,
            debug = self.config.debug,
            "starting mount"
        );

        let (tx, mut rx) = queue::channel::<D>();
        let session = match transport.start(&self.config, Dispatcher::new(tx, self.config.debug)) {
            Ok(session) => session,
            Err(err) => {
                error!(target: "fusegate::mount", mount_point = %mount_point, error = %err, "transport failed to start");
                self.shared.transition(MountState::Unmounted)?;
                return Err(err);
            }
        };

        if let Err(errno) = self.lifecycle(LifecycleHook::Init).await {
            error!(target: "fusegate::mount", mount_point = %mount_point, %errno, "init hook failed; aborting mount");
            self.shared.transition(MountState::Stopping)?;
            rx.close();
            let stopping = tokio::task::spawn_blocking(move || session.shutdown());
            while let Some(pending) = rx.next().await {
                D::reject(pending.call, Errno::EIO);
            }
            if stopping.await.is_err() {
                error!(target: "fusegate::mount", "transport shutdown panicked");
            }
            self.shared.transition(MountState::Unmounted)?;
            return Err(BridgeError::InitFailed(errno));
        }

        self.shared.transition(MountState::Running)?;
        info!(target: "fusegate::mount", mount_point = %mount_point, "mount running");

        let mut session = Some(session);
        let mut stopping: Option<tokio::task::JoinHandle<()>> = None;
        loop {
            tokio::select! {
                pending = rx.next() => match pending {
                    Some(pending) => self.dispatch(pending),
                    None => break,
                },
                () = self.shared.stop.notified(), if stopping.is_none() => {
                    self.shared.transition(MountState::Stopping)?;
                    if let Some(session) = session.take() {
                        stopping = Some(tokio::task::spawn_blocking(move || session.shutdown()));
                    }
                }
            }
        }

        if stopping.is_none() {
            info!(target: "fusegate::mount", mount_point = %mount_point, "transport stopped delivering calls");
            self.shared.transition(MountState::Stopping)?;
        }

        if let Err(errno) = self.lifecycle(LifecycleHook::Destroy).await {
            warn!(target: "fusegate::mount", mount_point = %mount_point, %errno, "destroy hook failed");
        }

        if let Some(session) = session.take() {
            stopping = Some(tokio::task::spawn_blocking(move || session.shutdown()));
        }
        if let Some(task) = stopping {
            if task.await.is_err() {
                error!(target: "fusegate::mount", "transport shutdown panicked");
            }
        }

        self.log_stats(&rx);
        self.shared.transition(MountState::Unmounted)?;
        info!(target: "fusegate::mount", mount_point = %mount_point, "mount stopped");
        Ok(())
    }

    fn dispatch(&self, pending: PendingCall<D>) {
        let PendingCall {
            id,
            op,
            call,
            enqueued_at,
        } = pending;
        let op = op.name();
        let queued_us = enqueued_at.elapsed().as_micros() as u64;
        if self.config.debug {
            info!(target: "fusegate::dispatch", op, id, queued_us, "dispatching");
        } else {
            trace!(target: "fusegate::dispatch", op, id, queued_us, "dispatching");
        }

        let handlers = &self.handlers;
        // The completion is dropped while unwinding, which answers EIO.
        if panic::catch_unwind(AssertUnwindSafe(|| D::dispatch(handlers, call))).is_err() {
            error!(target: "fusegate::dispatch", op, id, "handler panicked");
        }
    }

    async fn lifecycle(&self, hook: LifecycleHook) -> Result<(), Errno> {
        let lifecycle = D::lifecycle(&self.handlers);
        let registered: Option<&Hook> = match hook {
            LifecycleHook::Init => lifecycle.init.as_ref(),
            LifecycleHook::Destroy => lifecycle.destroy.as_ref(),
        };
        let name = hook.name();
        let Some(registered) = registered else {
            debug!(target: "fusegate::mount", hook = name, "no hook registered");
            return Ok(());
        };

        let started = Instant::now();
        let (done, gate) = gate::open(name, dispatcher::next_call_id());
        if panic::catch_unwind(AssertUnwindSafe(|| registered(done))).is_err() {
            error!(target: "fusegate::mount", hook = name, "lifecycle hook panicked");
        }
        let status = codec::status(name, gate.signaled().await);
        info!(
            target: "fusegate::mount",
            hook = name,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lifecycle hook completed"
        );
        match Errno::from_status(status) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn log_stats(&self, rx: &CallReceiver<D>) {
        let stats = rx.stats();
        info!(
            target: "fusegate::mount",
            enqueued = stats.enqueued,
            dequeued = stats.dequeued,
            max_depth = stats.max_depth,
            "dispatch queue drained"
        );
    }
}

impl<D: Dialect> fmt::Debug for MountController<D>
where
    D::Handlers: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountController")
            .field("dialect", &D::NAME)
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("state", &self.shared.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_lifecycle() {
        use MountState::*;
        assert!(Unmounted.can_become(Starting));
        assert!(Starting.can_become(Running));
        assert!(Running.can_become(Stopping));
        assert!(Stopping.can_become(Unmounted));
        assert!(!Unmounted.can_become(Running));
        assert!(!Running.can_become(Unmounted));
        assert!(!Stopping.can_become(Running));
    }

    #[test]
    fn mount_points_are_claimed_once() {
        let first = MountClaim::acquire(Path::new("/tmp/fusegate-claim-test")).unwrap();
        let err = MountClaim::acquire(Path::new("/tmp/fusegate-claim-test")).err().unwrap();
        assert!(matches!(err, BridgeError::AlreadyMounted(_)));
        drop(first);
        assert!(MountClaim::acquire(Path::new("/tmp/fusegate-claim-test")).is_ok());
    }
}
