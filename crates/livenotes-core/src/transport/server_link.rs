//! WebSocket link to the authoritative server
//!
//! ```text
//!   Connecting ──► Ready ──► Disconnected
//!        ▲                        │
//!        └── Backoff policy ──────┤
//!                                 └── Manual policy: stay down until
//!                                     restart() / reconfigure()
//! ```
//!
//! The server sends its full state as one text frame on connect and again
//! after every accepted note. Outbound traffic is `{"new_note": ...}` only,
//! fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ConnectionState, EventSink, StateCell, TransportEvent, TransportKind};
use super::{Transport, WorkerSlot};
use crate::error::{SyncError, SyncResult};
use crate::sync::codec::{decode, encode_command};
use crate::types::{Command, Envelope};

/// Address of the authoritative server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/ws".to_string()
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: default_path(),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new("192.168.10.161", 8000)
    }
}

/// What the link does after it goes down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Stay down until restarted from outside
    #[default]
    Manual,
    /// Reconnect on an exponential schedule
    Backoff { initial_ms: u64, max_ms: u64 },
}

struct Inner {
    endpoint: RwLock<ServerEndpoint>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: EventSink,
    state: StateCell,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// Persistent socket to the authoritative server
pub struct ServerLink {
    inner: Arc<Inner>,
    worker: WorkerSlot,
}

impl ServerLink {
    pub fn new(
        endpoint: ServerEndpoint,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: RwLock::new(endpoint),
                policy,
                connect_timeout,
                events,
                state: StateCell::new(),
                outbound: Mutex::new(None),
            }),
            worker: WorkerSlot::new(),
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        self.inner.endpoint.read().clone()
    }

    /// Tear the link down and bring it up again
    pub async fn restart(&self) -> SyncResult<()> {
        self.stop().await;
        self.start().await
    }

    /// Point the link at a new server and reconnect
    pub async fn reconfigure(&self, host: impl Into<String>, port: u16) -> SyncResult<()> {
        let host = host.into();
        info!(%host, port, "Server address changed");
        {
            let mut endpoint = self.inner.endpoint.write();
            endpoint.host = host;
            endpoint.port = port;
        }
        self.restart().await
    }
}

#[async_trait]
impl Transport for ServerLink {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerLink
    }

    async fn start(&self) -> SyncResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        let inner = self.inner.clone();
        self.worker
            .spawn(move |token| async move { inner.run(token, rx).await });
        Ok(())
    }

    async fn stop(&self) {
        self.worker.stop().await;
        self.inner.outbound.lock().take();
        self.inner.set_state(ConnectionState::Idle);
    }

    fn send(&self, _envelope: &Envelope) -> SyncResult<()> {
        Err(SyncError::Unsupported(
            "server link accepts commands only".to_string(),
        ))
    }

    fn send_command(&self, command: &Command) -> SyncResult<()> {
        if matches!(command, Command::RequestState) {
            return Err(SyncError::Unsupported(
                "server pushes state on connect".to_string(),
            ));
        }
        if !self.inner.state.get().is_ready() {
            return Err(SyncError::NotReady("server link down".to_string()));
        }
        let text = String::from_utf8_lossy(&encode_command(command)).into_owned();
        self.inner
            .outbound
            .lock()
            .as_ref()
            .and_then(|tx| tx.send(text).ok())
            .ok_or_else(|| SyncError::NotReady("server link stopped".to_string()))
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state.set(TransportKind::ServerLink, next);
    }

    async fn run(self: Arc<Self>, token: CancellationToken, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        let mut delay = match self.policy {
            ReconnectPolicy::Backoff { initial_ms, .. } => Duration::from_millis(initial_ms),
            ReconnectPolicy::Manual => Duration::ZERO,
        };

        loop {
            let url = self.endpoint.read().url();
            self.set_state(ConnectionState::Connecting);
            info!(%url, "Connecting to server");

            let connected = tokio::select! {
                _ = token.cancelled() => return,
                result = timeout(self.connect_timeout, connect_async(url.as_str())) => result,
            };

            let reason = match connected {
                Ok(Ok((ws, _response))) => {
                    self.set_state(ConnectionState::Ready);
                    info!(%url, "Server link ready");
                    self.events.emit(TransportEvent::Connected { peer: url.clone() });
                    self.events.emit(TransportEvent::Ready { peer: url.clone() });
                    if let ReconnectPolicy::Backoff { initial_ms, .. } = self.policy {
                        delay = Duration::from_millis(initial_ms);
                    }
                    self.session(ws, &mut outbound_rx, &token).await
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", self.connect_timeout),
            };

            if token.is_cancelled() {
                return;
            }
            warn!(%url, %reason, "Server link down");
            self.set_state(ConnectionState::Disconnected);
            self.events.emit(TransportEvent::Disconnected {
                peer: Some(url),
                reason,
            });

            match self.policy {
                ReconnectPolicy::Manual => {
                    info!("Waiting for an explicit reconnect");
                    return;
                }
                ReconnectPolicy::Backoff { max_ms, .. } => {
                    debug!(?delay, "Reconnecting after backoff");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(Duration::from_millis(max_ms));
                }
            }
        }
    }

    async fn session(
        &self,
        ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        token: &CancellationToken,
    ) -> String {
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return "stopped".to_string();
                }
                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return e.to_string();
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.deliver(&bytes),
                    Some(Ok(Message::Close(_))) => return "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                    None => return "stream ended".to_string(),
                },
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        match decode(payload) {
            Ok(envelope) => {
                debug!(size = payload.len(), "Server state received");
                self.events.emit(TransportEvent::Inbound(envelope));
            }
            Err(e) => warn!(error = %e, "Dropping undecodable server message"),
        }
    }
}
