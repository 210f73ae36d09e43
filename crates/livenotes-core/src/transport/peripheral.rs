//! Hub-side radio transport
//!
//! Hosts the GATT service and serves any number of satellites:
//!
//! ```text
//!   Idle ─► Advertising ─► Connected (≥1 peer) ─► Ready (≥1 subscribed)
//!              ▲                │                      │
//!              └── last peer ◄──┴──────────────────────┘
//!                  disconnects (keeps advertising)
//! ```
//!
//! | Channel | Access       | Behavior                                      |
//! |---------|--------------|-----------------------------------------------|
//! | data    | read         | offset read of the latest snapshot            |
//! | data    | notify       | snapshot pushed on subscribe and on `send`    |
//! | command | write        | `request_state` pushes, `new_note` forwarded  |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ConnectionState, EventSink, StateCell, TransportEvent, TransportKind};
use super::{Transport, WorkerSlot};
use crate::error::{SyncError, SyncResult};
use crate::radio::{
    DeviceAddress, GattLayout, GattResponse, PeripheralRadio, ServerEvent,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::sync::codec::{decode_command, encode};
use crate::sync::framing::{read_at_offset, PayloadMode, PushFramer, DEFAULT_PAYLOAD_CEILING};
use crate::types::{Command, Envelope};

/// Tuning for the hub-side radio transport
#[derive(Debug, Clone)]
pub struct PeripheralOptions {
    pub payload_mode: PayloadMode,
    pub payload_ceiling: usize,
    /// Delay before reopening the server after a transient failure
    pub retry_interval: Duration,
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            payload_mode: PayloadMode::Truncate,
            payload_ceiling: DEFAULT_PAYLOAD_CEILING,
            retry_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
struct PeerLink {
    subscribed: bool,
}

struct Inner {
    radio: Arc<dyn PeripheralRadio>,
    layout: GattLayout,
    options: PeripheralOptions,
    events: EventSink,
    state: StateCell,
    /// Encoded latest snapshot; the value of the data channel
    snapshot: RwLock<Bytes>,
    push_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

/// GATT server transport run by the hub
pub struct PeripheralTransport {
    inner: Arc<Inner>,
    worker: WorkerSlot,
}

impl PeripheralTransport {
    pub fn new(radio: Arc<dyn PeripheralRadio>, options: PeripheralOptions, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                layout: GattLayout::LIVE_NOTES,
                options,
                events,
                state: StateCell::new(),
                snapshot: RwLock::new(Bytes::from_static(b"{}")),
                push_tx: Mutex::new(None),
            }),
            worker: WorkerSlot::new(),
        }
    }

    /// Current value of the data channel
    pub fn snapshot_bytes(&self) -> Bytes {
        self.inner.snapshot.read().clone()
    }
}

#[async_trait]
impl Transport for PeripheralTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Peripheral
    }

    async fn start(&self) -> SyncResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        *self.inner.push_tx.lock() = Some(push_tx);
        let inner = self.inner.clone();
        self.worker
            .spawn(move |token| async move { inner.run(token, push_rx).await });
        Ok(())
    }

    async fn stop(&self) {
        self.worker.stop().await;
        self.inner.push_tx.lock().take();
    }

    fn send(&self, envelope: &Envelope) -> SyncResult<()> {
        *self.inner.snapshot.write() = Bytes::from(encode(envelope));
        if !self.inner.state.get().is_ready() {
            return Err(SyncError::NotReady("no subscribed peers".to_string()));
        }
        self.inner
            .push_tx
            .lock()
            .as_ref()
            .and_then(|tx| tx.send(()).ok())
            .ok_or_else(|| SyncError::NotReady("peripheral stopped".to_string()))
    }

    fn send_command(&self, command: &Command) -> SyncResult<()> {
        Err(SyncError::Unsupported(format!(
            "peripheral does not send {} commands",
            command.name()
        )))
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken, mut push_rx: mpsc::UnboundedReceiver<()>) {
        loop {
            match self.serve(&token, &mut push_rx).await {
                Ok(()) => break,
                Err(SyncError::CapabilityUnavailable(reason)) => {
                    warn!(%reason, "Peripheral radio unavailable");
                    self.state
                        .set(TransportKind::Peripheral, ConnectionState::Unavailable(reason.clone()));
                    self.events.emit(TransportEvent::Disconnected { peer: None, reason });
                    self.radio.close_server().await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Peripheral server failed, retrying");
                    self.state
                        .set(TransportKind::Peripheral, ConnectionState::Disconnected);
                    self.events.emit(TransportEvent::Disconnected {
                        peer: None,
                        reason: e.to_string(),
                    });
                    self.radio.close_server().await;
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_interval) => {}
                    }
                }
            }
        }

        self.radio.stop_advertising().await;
        self.radio.close_server().await;
        self.state.set(TransportKind::Peripheral, ConnectionState::Idle);
        info!("Peripheral stopped");
    }

    async fn serve(
        &self,
        token: &CancellationToken,
        push_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> SyncResult<()> {
        let mut server_events = self.radio.open_server(&self.layout).await?;
        self.radio.start_advertising(self.layout.service).await?;
        self.state.set(TransportKind::Peripheral, ConnectionState::Advertising);
        info!(service = %self.layout.service, "Advertising");

        let mut peers: HashMap<DeviceAddress, PeerLink> = HashMap::new();
        let mut framer = PushFramer::new(self.options.payload_mode, self.options.payload_ceiling);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = server_events.recv() => match event {
                    Some(event) => self.handle_server_event(event, &mut peers, &mut framer).await,
                    None => return Err(SyncError::Network("GATT server closed".to_string())),
                },
                Some(()) = push_rx.recv() => {
                    // Collapse queued pushes; every push carries the latest snapshot.
                    while push_rx.try_recv().is_ok() {}
                    let subscribed: Vec<_> = peers
                        .iter()
                        .filter(|(_, link)| link.subscribed)
                        .map(|(device, _)| device.clone())
                        .collect();
                    for device in subscribed {
                        self.push_to(&device, &mut framer).await;
                    }
                }
            }
        }
    }

    async fn handle_server_event(
        &self,
        event: ServerEvent,
        peers: &mut HashMap<DeviceAddress, PeerLink>,
        framer: &mut PushFramer,
    ) {
        match event {
            ServerEvent::Connected(device) => {
                info!(peer = %device, "Peer connected");
                peers.insert(device.clone(), PeerLink::default());
                self.refresh_state(peers);
                self.events.emit(TransportEvent::Connected {
                    peer: device.to_string(),
                });
            }
            ServerEvent::Disconnected(device) => {
                if peers.remove(&device).is_none() {
                    return;
                }
                info!(peer = %device, remaining = peers.len(), "Peer disconnected");
                self.refresh_state(peers);
                if peers.is_empty() {
                    self.events.emit(TransportEvent::Disconnected {
                        peer: Some(device.to_string()),
                        reason: "last peer disconnected".to_string(),
                    });
                }
            }
            ServerEvent::DescriptorWrite {
                device,
                characteristic,
                descriptor,
                value,
                reply,
            } => {
                if characteristic != self.layout.data || descriptor != self.layout.client_config {
                    respond(reply, GattResponse::Failure);
                    return;
                }
                respond(reply, GattResponse::Success(Bytes::new()));

                let enable = value[..] == ENABLE_NOTIFICATION_VALUE[..];
                peers.entry(device.clone()).or_default().subscribed = enable;
                self.refresh_state(peers);
                if enable {
                    info!(peer = %device, "Peer subscribed");
                    self.events.emit(TransportEvent::Ready {
                        peer: device.to_string(),
                    });
                    self.push_to(&device, framer).await;
                } else {
                    debug!(peer = %device, "Peer unsubscribed");
                }
            }
            ServerEvent::Read {
                device,
                characteristic,
                offset,
                reply,
            } => {
                if characteristic != self.layout.data {
                    let _ = reply.send(GattResponse::Failure);
                    return;
                }
                let value = read_at_offset(&self.snapshot.read(), offset);
                debug!(peer = %device, offset, len = value.len(), "Data read");
                let _ = reply.send(GattResponse::Success(value));
            }
            ServerEvent::Write {
                device,
                characteristic,
                value,
                reply,
            } => {
                if characteristic != self.layout.command {
                    respond(reply, GattResponse::Failure);
                    return;
                }
                match decode_command(&value) {
                    Ok(Command::RequestState) => {
                        respond(reply, GattResponse::Success(Bytes::new()));
                        debug!(peer = %device, "State requested");
                        self.push_to(&device, framer).await;
                    }
                    Ok(command @ Command::NewNote(_)) => {
                        respond(reply, GattResponse::Success(Bytes::new()));
                        self.events.emit(TransportEvent::InboundCommand {
                            peer: device.to_string(),
                            command,
                        });
                    }
                    Err(e) => {
                        warn!(peer = %device, error = %e, "Dropping undecodable command");
                        respond(reply, GattResponse::Failure);
                    }
                }
            }
        }
    }

    /// Notify one peer with the latest snapshot. Failures stay local to that peer.
    async fn push_to(&self, device: &DeviceAddress, framer: &mut PushFramer) {
        let payload = self.snapshot.read().clone();
        let frames = match framer.frame(&payload) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(peer = %device, error = %e, "Snapshot not pushed");
                return;
            }
        };
        for frame in frames {
            if let Err(e) = self.radio.notify(device, self.layout.data, frame).await {
                warn!(peer = %device, error = %e, "Notification failed");
                return;
            }
        }
        debug!(peer = %device, size = payload.len(), "Snapshot pushed");
    }

    fn refresh_state(&self, peers: &HashMap<DeviceAddress, PeerLink>) {
        let next = if peers.values().any(|link| link.subscribed) {
            ConnectionState::Ready
        } else if peers.is_empty() {
            ConnectionState::Advertising
        } else {
            ConnectionState::Connected
        };
        self.state.set(TransportKind::Peripheral, next);
    }
}

fn respond(reply: Option<tokio::sync::oneshot::Sender<GattResponse>>, response: GattResponse) {
    if let Some(reply) = reply {
        let _ = reply.send(response);
    }
}
