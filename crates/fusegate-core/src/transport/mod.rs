// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The seam between a mount and whatever delivers its calls

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::error;

use crate::config::MountConfig;
use crate::dialect::Dialect;
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, BridgeResult};

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod fuse;
pub mod workers;

/// Something that issues synchronous calls into a mount
pub trait Transport<D: Dialect> {
    type Session: TransportSession;

    /// Start delivering calls through `dispatcher`. The transport owns the
    /// dispatcher; the mount treats its last clone going away as the
    /// transport having stopped.
    fn start(self, config: &MountConfig, dispatcher: Dispatcher<D>) -> BridgeResult<Self::Session>;
}

/// A started transport
pub trait TransportSession: Send + 'static {
    /// Stop delivering calls and wait until the transport has let go of its
    /// dispatcher. May block.
    fn shutdown(self);
}

/// Raised when the mount asks a [`CallbackTransport`] to stop
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A transport driven by caller code on its own thread.
///
/// The body receives the dispatcher and may clone it into as many worker
/// threads as it likes. The transport counts as stopped once the body has
/// returned and every clone is dropped.
pub struct CallbackTransport<F> {
    body: F,
}

impl<F> CallbackTransport<F> {
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<D, F> Transport<D> for CallbackTransport<F>
where
    D: Dialect,
    F: FnOnce(Dispatcher<D>, StopSignal) + Send + 'static,
{
    type Session = CallbackSession;

    fn start(self, _config: &MountConfig, dispatcher: Dispatcher<D>) -> BridgeResult<CallbackSession> {
        let stop = StopSignal::default();
        let body = self.body;
        let thread = thread::Builder::new()
            .name("fusegate-transport".to_string())
            .spawn({
                let stop = stop.clone();
                move || body(dispatcher, stop)
            })
            .map_err(BridgeError::Transport)?;
        Ok(CallbackSession { stop, thread })
    }
}

pub struct CallbackSession {
    stop: StopSignal,
    thread: JoinHandle<()>,
}

impl TransportSession for CallbackSession {
    fn shutdown(self) {
        self.stop.raise();
        if self.thread.join().is_err() {
            error!(target: "fusegate::mount", "transport thread panicked");
        }
    }
}
