//! Transports between the three peers
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport (trait)                                              │
//! │  ├── ServerLink        WebSocket to the authoritative server    │
//! │  ├── PeripheralTransport  hub: GATT server, many peers          │
//! │  ├── CentralTransport     satellite: scan, connect, subscribe   │
//! │  └── StreamFallbackTransport  newline JSON over TCP             │
//! │                                                                 │
//! │  Every transport                                                │
//! │  ├── runs its I/O on its own task (WorkerSlot)                  │
//! │  ├── reports through an EventSink onto the coordinator queue    │
//! │  └── exposes its ConnectionState through a StateCell            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `send` and `send_command` never block: they enqueue onto the worker and
//! fail fast with [`SyncError::NotReady`] when the channel has not confirmed
//! bidirectional delivery. Hub-side transports still remember the envelope
//! handed to `send`, so a peer that subscribes later gets the latest snapshot.

use std::future::Future;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncResult;
use crate::types::{Command, Envelope};

pub mod central;
pub mod events;
pub mod fallback;
pub mod peripheral;
pub mod server_link;

pub use central::{CentralStats, CentralStatsSnapshot, CentralTimings, CentralTransport};
pub use events::{ConnectionState, EventSink, StateCell, TaggedEvent, TransportEvent, TransportKind};
pub use fallback::{
    FallbackOptions, FallbackRole, StreamFallbackTransport, FALLBACK_SERVICE_NAME,
    FALLBACK_SERVICE_UUID,
};
pub use peripheral::{PeripheralOptions, PeripheralTransport};
pub use server_link::{ReconnectPolicy, ServerEndpoint, ServerLink};

/// Common contract of every transport
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start the worker. Calling `start` on a running transport is a no-op.
    async fn start(&self) -> SyncResult<()>;

    /// Stop the worker, cancelling its timers and closing its links
    async fn stop(&self);

    /// Push a snapshot to the connected peer(s)
    fn send(&self, envelope: &Envelope) -> SyncResult<()>;

    /// Send a command upstream
    fn send_command(&self, command: &Command) -> SyncResult<()>;

    fn state(&self) -> ConnectionState;
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The background task of one transport.
///
/// Holds at most one live worker. A worker that exited on its own (for
/// example a server link with a manual reconnect policy) can be replaced by
/// the next `spawn`.
#[derive(Default)]
pub(crate) struct WorkerSlot {
    inner: Mutex<Option<Worker>>,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn `task` unless a worker is already running. Returns whether it spawned.
    pub(crate) fn spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.inner.lock();
        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                return false;
            }
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));
        *slot = Some(Worker { token, handle });
        true
    }

    /// Cancel the worker and wait for it to wind down
    pub(crate) async fn stop(&self) {
        let worker = self.inner.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                if e.is_panic() {
                    debug!(error = %e, "Transport worker panicked");
                }
            }
        }
    }
}
