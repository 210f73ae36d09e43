//! Stream-socket fallback transport
//!
//! A connection-oriented backup for when the radio path cannot reach `Ready`.
//! No advertising or scanning: the hub listens, the satellite dials peers it
//! already knows.
//!
//! ```text
//!   hub (Listen)                          satellite (Dial)
//! ┌──────────────────┐   TCP connect   ┌──────────────────────────┐
//! │ accept loop      │ ◄────────────── │ paired peers, in order   │
//! │ push snapshot ─► │ ── {"notes"..}\n│ ─► Inbound(Envelope)     │
//! │ InboundCommand ◄─│ ◄─ {"new_note"}\n│ ◄─ send_command          │
//! └──────────────────┘                 └──────────────────────────┘
//! ```
//!
//! One JSON object per line. A connection that fails to read or write is
//! dropped from the peer set; the dialer retries on its own interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{ConnectionState, EventSink, StateCell, TransportEvent, TransportKind};
use super::{Transport, WorkerSlot};
use crate::error::{SyncError, SyncResult};
use crate::radio::SERVICE_UUID;
use crate::sync::codec::{decode, decode_command, encode, encode_command};
use crate::types::{Command, Envelope};

/// Service identifier used to look the hub up during pairing
pub const FALLBACK_SERVICE_UUID: Uuid = SERVICE_UUID;

/// Human-readable service name used during pairing
pub const FALLBACK_SERVICE_NAME: &str = "LiveNotesClassic";

/// Which end of the stream this transport is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackRole {
    /// Hub: accept connections on this address
    Listen(SocketAddr),
    /// Satellite: try these paired peers in order
    Dial(Vec<SocketAddr>),
}

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Pause between dial rounds
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    /// Longest accepted line; longer lines are discarded
    pub max_line_length: usize,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_line_length: 1024 * 1024,
        }
    }
}

struct Inner {
    role: FallbackRole,
    options: FallbackOptions,
    events: EventSink,
    state: StateCell,
    /// Latest snapshot line (hub only)
    snapshot: RwLock<Option<String>>,
    /// Writer queue per connected peer
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Newline-delimited JSON over TCP
pub struct StreamFallbackTransport {
    inner: Arc<Inner>,
    worker: WorkerSlot,
}

impl StreamFallbackTransport {
    pub fn new(role: FallbackRole, options: FallbackOptions, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                options,
                events,
                state: StateCell::new(),
                snapshot: RwLock::new(None),
                peers: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
            }),
            worker: WorkerSlot::new(),
        }
    }

    pub fn role(&self) -> &FallbackRole {
        &self.inner.role
    }

    /// Bound listen address once the hub is listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }
}

#[async_trait]
impl Transport for StreamFallbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn start(&self) -> SyncResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        match &self.inner.role {
            FallbackRole::Listen(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AddrNotAvailable => {
                        SyncError::CapabilityUnavailable(format!("cannot listen on {}: {}", addr, e))
                    }
                    _ => SyncError::Io(e),
                });
                let listener = match listener {
                    Ok(listener) => listener,
                    Err(e) => {
                        if let SyncError::CapabilityUnavailable(reason) = &e {
                            self.inner.set_state(ConnectionState::Unavailable(reason.clone()));
                        }
                        return Err(e);
                    }
                };
                let bound = listener.local_addr()?;
                *self.inner.local_addr.lock() = Some(bound);
                info!(addr = %bound, service = FALLBACK_SERVICE_NAME, "Fallback listening");
                self.inner.set_state(ConnectionState::Advertising);

                let inner = self.inner.clone();
                self.worker
                    .spawn(move |token| async move { inner.accept_loop(listener, token).await });
            }
            FallbackRole::Dial(peers) => {
                if peers.is_empty() {
                    let reason = "no paired peers".to_string();
                    self.inner.set_state(ConnectionState::Unavailable(reason.clone()));
                    return Err(SyncError::CapabilityUnavailable(reason));
                }
                let inner = self.inner.clone();
                self.worker
                    .spawn(move |token| async move { inner.dial_loop(token).await });
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.worker.stop().await;
        self.inner.peers.lock().clear();
        self.inner.set_state(ConnectionState::Idle);
    }

    fn send(&self, envelope: &Envelope) -> SyncResult<()> {
        if matches!(self.inner.role, FallbackRole::Dial(_)) {
            return Err(SyncError::Unsupported(
                "satellite does not push snapshots".to_string(),
            ));
        }
        let line = String::from_utf8_lossy(&encode(envelope)).into_owned();
        *self.inner.snapshot.write() = Some(line.clone());

        let mut peers = self.inner.peers.lock();
        peers.retain(|peer, tx| match tx.send(line.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(%peer, "Fallback peer queue closed, dropping peer");
                false
            }
        });
        let delivered = !peers.is_empty();
        drop(peers);
        if !delivered {
            self.inner.refresh_state();
            return Err(SyncError::NotReady("no fallback peers".to_string()));
        }
        Ok(())
    }

    fn send_command(&self, command: &Command) -> SyncResult<()> {
        if matches!(self.inner.role, FallbackRole::Listen(_)) {
            return Err(SyncError::Unsupported(format!(
                "hub does not send {} commands",
                command.name()
            )));
        }
        let line = String::from_utf8_lossy(&encode_command(command)).into_owned();
        let peers = self.inner.peers.lock();
        let tx = peers
            .values()
            .next()
            .ok_or_else(|| SyncError::NotReady("fallback not connected".to_string()))?;
        tx.send(line)
            .map_err(|_| SyncError::NotReady("fallback connection closing".to_string()))
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state.set(TransportKind::Fallback, next);
    }

    fn refresh_state(&self) {
        let connected = !self.peers.lock().is_empty();
        let next = match (&self.role, connected) {
            (_, true) => ConnectionState::Ready,
            (FallbackRole::Listen(_), false) => ConnectionState::Advertising,
            (FallbackRole::Dial(_), false) => ConnectionState::Disconnected,
        };
        self.set_state(next);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let inner = self.clone();
                        let token = token.child_token();
                        tokio::spawn(async move {
                            inner.serve_connection(stream, remote.to_string(), token).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Fallback accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Fallback accept loop stopped");
    }

    async fn dial_loop(self: Arc<Self>, token: CancellationToken) {
        let FallbackRole::Dial(candidates) = &self.role else {
            return;
        };
        loop {
            self.set_state(ConnectionState::Connecting);
            let mut connected = None;
            for addr in candidates {
                tokio::select! {
                    _ = token.cancelled() => return,
                    attempt = timeout(self.options.connect_timeout, TcpStream::connect(addr)) => {
                        match attempt {
                            Ok(Ok(stream)) => {
                                connected = Some((stream, *addr));
                                break;
                            }
                            Ok(Err(e)) => debug!(peer = %addr, error = %e, "Paired peer unreachable"),
                            Err(_) => debug!(peer = %addr, "Paired peer timed out"),
                        }
                    }
                }
            }

            match connected {
                Some((stream, addr)) => {
                    self.serve_connection(stream, addr.to_string(), token.clone())
                        .await;
                }
                None => {
                    debug!(candidates = candidates.len(), "No paired peer reachable");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.options.retry_interval) => {}
            }
        }
    }

    async fn serve_connection(&self, stream: TcpStream, peer: String, token: CancellationToken) {
        let framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.options.max_line_length),
        );
        let (mut sink, mut lines) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if matches!(self.role, FallbackRole::Listen(_)) {
            if let Some(snapshot) = self.snapshot.read().clone() {
                let _ = tx.send(snapshot);
            }
        }
        self.peers.lock().insert(peer.clone(), tx);
        self.refresh_state();
        info!(%peer, "Fallback peer connected");
        self.events.emit(TransportEvent::Connected { peer: peer.clone() });
        self.events.emit(TransportEvent::Ready { peer: peer.clone() });

        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break "stopped".to_string(),
                Some(line) = rx.recv() => {
                    if let Err(e) = sink.send(line).await {
                        break e.to_string();
                    }
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => self.handle_line(&peer, &line),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(%peer, max = self.options.max_line_length, "Dropping oversize line");
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "closed by peer".to_string(),
                },
            }
        };

        self.peers.lock().remove(&peer);
        if !token.is_cancelled() {
            self.refresh_state();
        }
        info!(%peer, %reason, "Fallback peer disconnected");
        self.events.emit(TransportEvent::Disconnected {
            peer: Some(peer),
            reason,
        });
    }

    fn handle_line(&self, peer: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match &self.role {
            FallbackRole::Listen(_) => match decode_command(line.as_bytes()) {
                Ok(Command::RequestState) => {
                    let snapshot = self.snapshot.read().clone();
                    if let (Some(snapshot), Some(tx)) = (snapshot, self.peers.lock().get(peer)) {
                        let _ = tx.send(snapshot);
                    }
                }
                Ok(command) => self.events.emit(TransportEvent::InboundCommand {
                    peer: peer.to_string(),
                    command,
                }),
                Err(e) => warn!(%peer, error = %e, "Dropping undecodable command"),
            },
            FallbackRole::Dial(_) => match decode(line.as_bytes()) {
                Ok(envelope) => self.events.emit(TransportEvent::Inbound(envelope)),
                Err(e) => warn!(%peer, error = %e, "Dropping undecodable snapshot"),
            },
        }
    }
}
