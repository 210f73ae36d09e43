//! Satellite-side radio transport
//!
//! ## State machine
//!
//! ```text
//!  Idle
//!   │ start()
//!   ▼
//!  Scanning{filtered} ──8s──► Scanning{broad} ──8s──► (retry after 3s)
//!   │ found                     │ found
//!   ▼                           ▼
//!  Connecting ─► Connected ─┬─ discover service ─ enable notifications ─► Ready
//!                           │        │ missing: disconnect, rescan now
//!                           └── watchdog 8s: disconnect, rescan, start fallback
//!  Ready ── link lost ──► Disconnected ──2s──► Scanning{filtered}
//! ```
//!
//! The fallback transport is also started when a scan round finds no hub and
//! when the radio turns out to be unavailable. Starting it is idempotent.
//!
//! The watchdog wraps the whole establish phase in one `tokio::time::timeout`,
//! so a stall produces exactly one forced disconnect and one rescan, and
//! reaching `Ready` drops the timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ConnectionState, EventSink, StateCell, TransportEvent, TransportKind};
use super::{Transport, WorkerSlot};
use crate::error::{SyncError, SyncResult};
use crate::radio::{
    Advertisement, CentralRadio, ClientEvent, GattClient, GattConnection, GattLayout,
    ScanFilter, ENABLE_NOTIFICATION_VALUE,
};
use crate::sync::codec::{decode, encode_command};
use crate::sync::framing::Reassembler;
use crate::types::{Command, Envelope};

/// Upper bound on a pulled snapshot
const MAX_PULL_BYTES: usize = 1024 * 1024;

/// Timers of the satellite state machine
#[derive(Debug, Clone)]
pub struct CentralTimings {
    /// Length of each scan phase (filtered, then broad)
    pub scan_timeout: Duration,
    /// Connected → Ready deadline
    pub watchdog_timeout: Duration,
    /// Pause after a scan that found nothing or failed
    pub scan_retry: Duration,
    /// Pause after an established link is lost
    pub reconnect_backoff: Duration,
    /// Delay between a `new_note` write and the follow-up `request_state`
    pub request_state_delay: Duration,
}

impl Default for CentralTimings {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(8),
            watchdog_timeout: Duration::from_secs(8),
            scan_retry: Duration::from_secs(3),
            reconnect_backoff: Duration::from_secs(2),
            request_state_delay: Duration::from_millis(500),
        }
    }
}

/// Counters for observing the state machine
#[derive(Debug, Default)]
pub struct CentralStats {
    scan_cycles: AtomicU64,
    connect_attempts: AtomicU64,
    watchdog_fired: AtomicU64,
    envelopes_received: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of [`CentralStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralStatsSnapshot {
    pub scan_cycles: u64,
    pub connect_attempts: u64,
    pub watchdog_fired: u64,
    pub envelopes_received: u64,
    pub decode_failures: u64,
}

impl CentralStats {
    pub fn snapshot(&self) -> CentralStatsSnapshot {
        CentralStatsSnapshot {
            scan_cycles: self.scan_cycles.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            watchdog_fired: self.watchdog_fired.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

enum Outbound {
    Command(Command),
    Pull(oneshot::Sender<SyncResult<Envelope>>),
}

/// What the worker does after one pass of the state machine
enum Next {
    /// Scan again immediately
    Rescan,
    /// Scan again after a pause
    Retry(Duration),
    /// Stop until `start()` is called again
    Unavailable(String),
}

struct Inner {
    radio: Arc<dyn CentralRadio>,
    layout: GattLayout,
    timings: CentralTimings,
    events: EventSink,
    state: StateCell,
    stats: CentralStats,
    fallback: RwLock<Option<Arc<dyn Transport>>>,
    client: Mutex<Option<Arc<dyn GattClient>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

/// GATT client transport run by the satellite
pub struct CentralTransport {
    inner: Arc<Inner>,
    worker: WorkerSlot,
}

impl CentralTransport {
    pub fn new(radio: Arc<dyn CentralRadio>, timings: CentralTimings, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                layout: GattLayout::LIVE_NOTES,
                timings,
                events,
                state: StateCell::new(),
                stats: CentralStats::default(),
                fallback: RwLock::new(None),
                client: Mutex::new(None),
                outbound: Mutex::new(None),
            }),
            worker: WorkerSlot::new(),
        }
    }

    /// Transport started when the radio path cannot reach a hub
    pub fn set_fallback(&self, fallback: Arc<dyn Transport>) {
        *self.inner.fallback.write() = Some(fallback);
    }

    pub fn stats(&self) -> CentralStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Read the full snapshot from the data channel with offset reads.
    ///
    /// The decoded envelope is also forwarded to the coordinator.
    ///
    /// # Errors
    ///
    /// `SyncError::NotReady` unless the link is ready; decode and read
    /// failures otherwise.
    pub async fn pull(&self) -> SyncResult<Envelope> {
        if !self.inner.state.get().is_ready() {
            return Err(SyncError::NotReady("central not ready".to_string()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.enqueue(Outbound::Pull(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| SyncError::NotReady("link lost during pull".to_string()))?
    }
}

#[async_trait]
impl Transport for CentralTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Central
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
        // The worker may have exited on its own as `Unavailable`.
        self.inner.set_state(ConnectionState::Idle);
    }

    fn send(&self, _envelope: &Envelope) -> SyncResult<()> {
        Err(SyncError::Unsupported(
            "satellite does not push snapshots".to_string(),
        ))
    }

    fn send_command(&self, command: &Command) -> SyncResult<()> {
        if !self.inner.state.get().is_ready() {
            return Err(SyncError::NotReady("central not ready".to_string()));
        }
        self.inner.enqueue(Outbound::Command(command.clone()))
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state.set(TransportKind::Central, next);
    }

    fn enqueue(&self, message: Outbound) -> SyncResult<()> {
        self.outbound
            .lock()
            .as_ref()
            .and_then(|tx| tx.send(message).ok())
            .ok_or_else(|| SyncError::NotReady("central stopped".to_string()))
    }

    async fn run(self: Arc<Self>, token: CancellationToken, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = self.cycle(&mut outbound_rx) => next,
            };
            match next {
                Next::Rescan => {}
                Next::Retry(delay) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Next::Unavailable(reason) => {
                    warn!(%reason, "Central radio unavailable");
                    self.set_state(ConnectionState::Unavailable(reason.clone()));
                    self.events.emit(TransportEvent::Disconnected { peer: None, reason });
                    self.start_fallback().await;
                    return;
                }
            }
        }

        self.radio.stop_scan().await;
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.set_state(ConnectionState::Idle);
        info!("Central stopped");
    }

    /// One pass: scan, connect, establish, then serve until the link drops
    async fn cycle(&self, outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Next {
        let advertisement = match self.scan().await {
            Ok(Some(advertisement)) => advertisement,
            Ok(None) => {
                debug!("No hub found, retrying scan");
                self.set_state(ConnectionState::Disconnected);
                self.start_fallback().await;
                return Next::Retry(self.timings.scan_retry);
            }
            Err(SyncError::CapabilityUnavailable(reason)) => return Next::Unavailable(reason),
            Err(e) => {
                warn!(error = %e, "Scan failed");
                self.set_state(ConnectionState::Disconnected);
                self.start_fallback().await;
                return Next::Retry(self.timings.scan_retry);
            }
        };

        let peer = advertisement.device.to_string();
        self.set_state(ConnectionState::Connecting);
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!(%peer, name = ?advertisement.name, "Connecting");

        let GattConnection { client, mut events } =
            match self.radio.connect(&advertisement.device).await {
                Ok(connection) => connection,
                Err(SyncError::CapabilityUnavailable(reason)) => return Next::Unavailable(reason),
                Err(e) => {
                    warn!(%peer, error = %e, "Connect failed");
                    self.set_state(ConnectionState::Disconnected);
                    return Next::Retry(self.timings.reconnect_backoff);
                }
            };
        *self.client.lock() = Some(client.clone());
        self.set_state(ConnectionState::Connected);
        self.events.emit(TransportEvent::Connected { peer: peer.clone() });

        match timeout(self.timings.watchdog_timeout, self.establish(client.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "Link setup failed");
                self.drop_link(client.as_ref(), &peer, e.to_string()).await;
                return match e {
                    SyncError::Protocol(_) => Next::Rescan,
                    _ => Next::Retry(self.timings.reconnect_backoff),
                };
            }
            Err(_) => {
                self.stats.watchdog_fired.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, timeout = ?self.timings.watchdog_timeout, "Watchdog fired before notifications were enabled");
                self.drop_link(client.as_ref(), &peer, "watchdog timeout".to_string())
                    .await;
                self.start_fallback().await;
                return Next::Rescan;
            }
        }

        self.set_state(ConnectionState::Ready);
        self.events.emit(TransportEvent::Ready { peer: peer.clone() });
        info!(%peer, "Notifications enabled, requesting state");
        if let Err(e) = self.write_command(client.as_ref(), &Command::RequestState).await {
            warn!(%peer, error = %e, "Initial state request failed");
        }

        let reason = self.serve(client.as_ref(), &mut events, outbound_rx).await;
        info!(%peer, %reason, "Link lost");
        self.drop_link(client.as_ref(), &peer, reason).await;
        Next::Retry(self.timings.reconnect_backoff)
    }

    /// Filtered scan, then broad scan. `None` when both windows pass empty.
    async fn scan(&self) -> SyncResult<Option<Advertisement>> {
        self.stats.scan_cycles.fetch_add(1, Ordering::Relaxed);
        for filtered in [true, false] {
            let filter = if filtered {
                ScanFilter::Service(self.layout.service)
            } else {
                ScanFilter::Any
            };
            self.set_state(ConnectionState::Scanning { filtered });
            info!(filtered, "Scanning");

            let mut advertisements = self.radio.start_scan(filter).await?;
            let found = timeout(self.timings.scan_timeout, advertisements.recv()).await;
            self.radio.stop_scan().await;
            match found {
                Ok(Some(advertisement)) => return Ok(Some(advertisement)),
                Ok(None) => return Err(SyncError::Network("scan ended".to_string())),
                Err(_) if filtered => debug!("Filtered scan found nothing, broadening"),
                Err(_) => {}
            }
        }
        Ok(None)
    }

    /// Service discovery and notification subscription
    async fn establish(&self, client: &dyn GattClient) -> SyncResult<()> {
        let services = client.discover_services().await?;
        let service = services
            .iter()
            .find(|s| s.uuid == self.layout.service)
            .ok_or_else(|| SyncError::Protocol("service not found".to_string()))?;
        for characteristic in [self.layout.data, self.layout.command] {
            if !service.characteristics.contains(&characteristic) {
                return Err(SyncError::Protocol(format!(
                    "characteristic {} missing",
                    characteristic
                )));
            }
        }
        client
            .write_descriptor(
                self.layout.data,
                self.layout.client_config,
                &ENABLE_NOTIFICATION_VALUE,
            )
            .await
    }

    async fn serve(
        &self,
        client: &dyn GattClient,
        events: &mut mpsc::UnboundedReceiver<ClientEvent>,
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> String {
        let mut reassembler = Reassembler::new();
        let mut request_at: Option<Instant> = None;

        loop {
            let deadline = request_at;
            let follow_up = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(ClientEvent::Notification { characteristic, value }) => {
                        if characteristic == self.layout.data {
                            if let Some(payload) = reassembler.accept(value) {
                                self.deliver(&payload, "notify");
                            }
                        }
                    }
                    Some(ClientEvent::Disconnected { reason }) => return reason,
                    None => return "link closed".to_string(),
                },
                message = outbound_rx.recv() => match message {
                    Some(Outbound::Command(command)) => {
                        if let Err(e) = self.write_command(client, &command).await {
                            warn!(command = command.name(), error = %e, "Command write failed");
                            if e.is_transient() {
                                return e.to_string();
                            }
                        } else if matches!(command, Command::NewNote(_)) {
                            request_at = Some(Instant::now() + self.timings.request_state_delay);
                        }
                    }
                    Some(Outbound::Pull(reply)) => {
                        let _ = reply.send(self.read_snapshot(client).await);
                    }
                    None => return "stopped".to_string(),
                },
                _ = follow_up => {
                    request_at = None;
                    if let Err(e) = self.write_command(client, &Command::RequestState).await {
                        warn!(error = %e, "Follow-up state request failed");
                    }
                }
            }
        }
    }

    async fn write_command(&self, client: &dyn GattClient, command: &Command) -> SyncResult<()> {
        debug!(command = command.name(), "Writing command");
        client
            .write(self.layout.command, &encode_command(command))
            .await
    }

    async fn read_snapshot(&self, client: &dyn GattClient) -> SyncResult<Envelope> {
        let mut buffer = Vec::new();
        loop {
            let part = client.read(self.layout.data, buffer.len()).await?;
            if part.is_empty() {
                break;
            }
            buffer.extend_from_slice(&part);
            if buffer.len() > MAX_PULL_BYTES {
                return Err(SyncError::Protocol(format!(
                    "snapshot larger than {} bytes",
                    MAX_PULL_BYTES
                )));
            }
        }
        self.deliver(&buffer, "read")
            .ok_or_else(|| SyncError::Protocol("pulled snapshot did not decode".to_string()))
    }

    /// Decode and forward a snapshot; undecodable payloads are dropped
    fn deliver(&self, payload: &[u8], via: &'static str) -> Option<Envelope> {
        match decode(payload) {
            Ok(envelope) => {
                self.stats.envelopes_received.fetch_add(1, Ordering::Relaxed);
                debug!(via, size = payload.len(), "Snapshot received");
                self.events.emit(TransportEvent::Inbound(envelope.clone()));
                Some(envelope)
            }
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(via, size = payload.len(), error = %e, "Dropping undecodable snapshot");
                None
            }
        }
    }

    async fn drop_link(&self, client: &dyn GattClient, peer: &str, reason: String) {
        client.disconnect().await;
        self.client.lock().take();
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(TransportEvent::Disconnected {
            peer: Some(peer.to_string()),
            reason,
        });
    }

    async fn start_fallback(&self) {
        let fallback = self.fallback.read().clone();
        if let Some(fallback) = fallback {
            // Already dialing
            if !matches!(
                fallback.state(),
                ConnectionState::Idle | ConnectionState::Unavailable(_)
            ) {
                return;
            }
            info!("Starting fallback transport");
            if let Err(e) = fallback.start().await {
                warn!(error = %e, "Fallback transport failed to start");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorMessage;
    use crate::radio::sim::{SimAir, SimPeripheral};
    use crate::radio::{PeripheralRadio, ServerEvent, SERVICE_UUID};

    fn fast_timings() -> CentralTimings {
        CentralTimings {
            scan_timeout: Duration::from_millis(200),
            watchdog_timeout: Duration::from_millis(200),
            scan_retry: Duration::from_millis(50),
            reconnect_backoff: Duration::from_millis(50),
            request_state_delay: Duration::from_millis(50),
        }
    }

    /// A bare hub that acknowledges subscriptions and records commands
    async fn bare_hub(air: &SimAir) -> (SimPeripheral, mpsc::UnboundedReceiver<ServerEvent>) {
        let hub = air.peripheral("HUB", Some("hub"));
        let events = hub.open_server(&GattLayout::LIVE_NOTES).await.unwrap();
        hub.start_advertising(SERVICE_UUID).await.unwrap();
        (hub, events)
    }

    /// Stand-in fallback that counts how often it is started
    #[derive(Default)]
    struct CountingFallback {
        starts: std::sync::atomic::AtomicUsize,
        state: Mutex<Option<ConnectionState>>,
    }

    #[async_trait]
    impl Transport for CountingFallback {
        fn kind(&self) -> TransportKind {
            TransportKind::Fallback
        }

        async fn start(&self) -> SyncResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = Some(ConnectionState::Connecting);
            Ok(())
        }

        async fn stop(&self) {
            self.state.lock().take();
        }

        fn send(&self, _envelope: &Envelope) -> SyncResult<()> {
            Ok(())
        }

        fn send_command(&self, _command: &Command) -> SyncResult<()> {
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            self.state.lock().clone().unwrap_or(ConnectionState::Idle)
        }
    }

    fn central(air: &SimAir) -> (CentralTransport, mpsc::UnboundedReceiver<CoordinatorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = CentralTransport::new(
            Arc::new(air.central("SAT")),
            fast_timings(),
            EventSink::new(TransportKind::Central, tx),
        );
        (transport, rx)
    }

    #[tokio::test]
    async fn test_send_is_unsupported_and_commands_need_ready() {
        let air = SimAir::new();
        let (central, _rx) = central(&air);
        assert!(matches!(
            central.send(&Envelope::default()),
            Err(SyncError::Unsupported(_))
        ));
        assert!(matches!(
            central.send_command(&Command::RequestState),
            Err(SyncError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_reaches_ready_and_requests_state() {
        let air = SimAir::new();
        let (_hub, mut server_events) = bare_hub(&air).await;
        let (central, _rx) = central(&air);
        central.start().await.unwrap();

        let mut saw_request = false;
        while let Some(event) = server_events.recv().await {
            match event {
                ServerEvent::DescriptorWrite { reply, .. } => {
                    let _ = reply.unwrap().send(crate::radio::GattResponse::Success(Default::default()));
                }
                ServerEvent::Write { value, reply, .. } => {
                    assert_eq!(&value[..], br#"{"request_state":true}"#);
                    let _ = reply.unwrap().send(crate::radio::GattResponse::Success(Default::default()));
                    saw_request = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_request);
        assert_eq!(central.state(), ConnectionState::Ready);
        central.stop().await;
        assert_eq!(central.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_service_rescans() {
        let air = SimAir::new();
        let (hub, _server_events) = bare_hub(&air).await;
        hub.set_hide_service(true);
        let (central, _rx) = central(&air);
        central.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = central.stats();
        assert!(stats.connect_attempts >= 2, "{:?}", stats);
        assert_eq!(stats.watchdog_fired, 0);
        central.stop().await;
    }

    #[tokio::test]
    async fn test_broad_scan_after_filtered_timeout() {
        let air = SimAir::new();
        let (hub, mut server_events) = bare_hub(&air).await;
        hub.set_include_service_in_advertisement(false);
        let (central, _rx) = central(&air);
        central.start().await.unwrap();

        // First link arrives only once the broad scan runs
        let started = Instant::now();
        loop {
            if let Some(ServerEvent::Connected(_)) = server_events.recv().await {
                break;
            }
        }
        assert!(started.elapsed() >= Duration::from_millis(150));
        central.stop().await;
    }

    #[tokio::test]
    async fn test_unavailable_radio_stops() {
        let air = SimAir::new();
        let radio = air.central("SAT");
        radio.set_available(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let central = CentralTransport::new(
            Arc::new(radio),
            fast_timings(),
            EventSink::new(TransportKind::Central, tx),
        );
        let fallback = Arc::new(CountingFallback::default());
        central.set_fallback(fallback.clone());
        central.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(central.state(), ConnectionState::Unavailable(_)));
        assert_eq!(central.stats().connect_attempts, 0);
        assert_eq!(fallback.starts.load(Ordering::SeqCst), 1);

        central.stop().await;
        assert_eq!(central.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_scan_starts_fallback_once() {
        let air = SimAir::new();
        let (central, _rx) = central(&air);
        let fallback = Arc::new(CountingFallback::default());
        central.set_fallback(fallback.clone());
        central.start().await.unwrap();

        // Two filtered+broad rounds with nothing advertising
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(central.stats().scan_cycles >= 2);
        assert_eq!(central.stats().connect_attempts, 0);
        assert_eq!(fallback.starts.load(Ordering::SeqCst), 1);
        central.stop().await;
    }
}
