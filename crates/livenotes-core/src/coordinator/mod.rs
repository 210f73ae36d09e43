//! The sync coordinator
//!
//! One task owns the [`Dataset`] and drains one queue. Transports enqueue
//! what they receive; the engine enqueues local notes. Nothing else mutates
//! the dataset.
//!
//! ```text
//! ServerLink ─┐                         ┌─► cache writer task
//! Peripheral ─┤                         ├─► hub-side transports (push)
//! Central ────┼─► mpsc ─► Coordinator ──┼─► ServerLink (relay new_note)
//! Fallback ───┤                         ├─► watch<Envelope>
//! engine ─────┘                         └─► watch<StatusReport>
//! ```
//!
//! The handler never awaits I/O: transports expose non-blocking `send`, and
//! snapshots are persisted by a separate writer task that keeps only the
//! latest pending snapshot.

pub mod dataset;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Role;
use crate::error::{SyncError, SyncResult};
use crate::status::{HealthFlags, StatusReport};
use crate::storage::SnapshotCache;
use crate::transport::{
    ConnectionState, TaggedEvent, Transport, TransportEvent, TransportKind,
};
use crate::types::{now_millis, Command, Envelope, Note};

pub use dataset::{Dataset, Upsert};

/// How often transport states are re-read for the status report.
///
/// Some transitions (scanning, advertising) never produce an event.
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Messages drained by the coordinator
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Something a transport reported
    Transport(TaggedEvent),
    /// A note created on this device
    LocalNote {
        note: Note,
        reply: oneshot::Sender<SyncResult<Note>>,
    },
    /// A state refresh was requested from the hub
    RefreshRequested,
    /// Flush the cache and exit
    Shutdown,
}

/// Persists snapshots off the coordinator task.
///
/// Snapshots queued while a write is in flight collapse into the newest one.
struct CacheWriter {
    tx: mpsc::UnboundedSender<Envelope>,
    handle: JoinHandle<()>,
}

impl CacheWriter {
    fn spawn(cache: SnapshotCache) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(cache, rx));
        Self { tx, handle }
    }

    fn write(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!("Cache writer gone, snapshot kept in memory only");
        }
    }

    /// Write whatever is still queued, then stop
    async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cache writer did not finish cleanly");
        }
    }
}

async fn write_loop(cache: SnapshotCache, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(mut latest) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            latest = newer;
        }
        let cache = cache.clone();
        match tokio::task::spawn_blocking(move || cache.store(&latest)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist snapshot, will retry on next change"),
            Err(e) => warn!(error = %e, "Cache write task failed"),
        }
    }
}

/// Single writer over the dataset
pub struct SyncCoordinator {
    role: Role,
    dataset: Dataset,
    transports: Vec<Arc<dyn Transport>>,
    cache: CacheWriter,
    relay_to_server: bool,
    syncing: bool,
    last_synced_at: Option<i64>,
    status_tx: watch::Sender<StatusReport>,
    dataset_tx: watch::Sender<Envelope>,
}

impl SyncCoordinator {
    /// Build a coordinator over a hydrated dataset.
    ///
    /// Must be called inside a tokio runtime (the cache writer is spawned here).
    pub fn new(
        role: Role,
        dataset: Dataset,
        transports: Vec<Arc<dyn Transport>>,
        cache: SnapshotCache,
        relay_to_server: bool,
    ) -> Self {
        let (status_tx, _) = watch::channel(StatusReport::default());
        let (dataset_tx, _) = watch::channel(dataset.snapshot());
        Self {
            role,
            dataset,
            transports,
            cache: CacheWriter::spawn(cache),
            relay_to_server,
            syncing: false,
            last_synced_at: None,
            status_tx,
            dataset_tx,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_dataset(&self) -> watch::Receiver<Envelope> {
        self.dataset_tx.subscribe()
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Drain `rx` until a `Shutdown` arrives or every sender is gone
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoordinatorMessage>) {
        info!(role = ?self.role, notes = self.dataset.notes().len(), "Coordinator started");
        self.publish_status();

        let mut refresh = tokio::time::interval(STATUS_REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(CoordinatorMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                _ = refresh.tick() => {}
            }
            self.publish_status();
        }

        info!("Coordinator stopping");
        self.cache.close().await;
    }

    /// Apply one message
    pub fn handle(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Transport(tagged) => self.on_transport_event(tagged),
            CoordinatorMessage::LocalNote { note, reply } => {
                let result = self.on_local_note(note);
                if let Err(e) = &result {
                    warn!(error = %e, "Local note not applied");
                }
                let _ = reply.send(result);
            }
            CoordinatorMessage::RefreshRequested => {
                if self.peer_ready() {
                    self.syncing = true;
                }
            }
            CoordinatorMessage::Shutdown => {}
        }
    }

    /// Hand the hydrated snapshot to hub-side transports so the first peer
    /// to subscribe receives it.
    ///
    /// Call before the transports are started.
    pub fn prime_transports(&self) {
        if self.role == Role::Hub {
            let snapshot = self.dataset.snapshot();
            self.push(&snapshot);
        }
    }

    fn on_transport_event(&mut self, tagged: TaggedEvent) {
        let source = tagged.source;
        match tagged.event {
            TransportEvent::Connected { peer } => {
                info!(transport = %source, %peer, "Connected");
            }
            TransportEvent::Ready { peer } => {
                info!(transport = %source, %peer, "Ready");
                // Hub-side transports push the cached snapshot on subscribe.
                if self.role == Role::Hub && source.is_peer() {
                    self.last_synced_at = Some(now_millis());
                }
            }
            TransportEvent::Disconnected { peer, reason } => {
                info!(transport = %source, peer = ?peer, %reason, "Disconnected");
                if !self.peer_ready() {
                    self.syncing = false;
                }
            }
            TransportEvent::Inbound(envelope) => self.on_inbound(source, envelope),
            TransportEvent::InboundCommand { peer, command } => {
                self.on_inbound_command(source, &peer, command)
            }
        }
    }

    /// Whether snapshots from `source` are authoritative for this role
    fn accepts_snapshot_from(&self, source: TransportKind) -> bool {
        match self.role {
            Role::Hub => source == TransportKind::ServerLink,
            Role::Satellite => matches!(source, TransportKind::Central | TransportKind::Fallback),
        }
    }

    fn on_inbound(&mut self, source: TransportKind, envelope: Envelope) {
        if !self.accepts_snapshot_from(source) {
            warn!(transport = %source, role = ?self.role, "Ignoring snapshot from non-authoritative source");
            return;
        }
        if envelope.is_empty() {
            debug!(transport = %source, "Ignoring empty envelope");
            return;
        }
        let changed = self.dataset.replace_wholesale(envelope);
        if source.is_peer() {
            self.syncing = false;
            self.last_synced_at = Some(now_millis());
        }
        debug!(
            transport = %source,
            changed,
            notes = self.dataset.notes().len(),
            projects = self.dataset.projects().len(),
            "Snapshot applied"
        );
        if changed {
            self.after_mutation(Some(source), None);
        }
    }

    fn on_inbound_command(&mut self, source: TransportKind, peer: &str, command: Command) {
        if self.role == Role::Satellite {
            debug!(transport = %source, %peer, command = command.name(), "Satellite ignores commands");
            return;
        }
        match command {
            Command::NewNote(note) => match self.dataset.apply_new_note(note, now_millis()) {
                Ok((stored, upsert)) => {
                    info!(transport = %source, %peer, id = ?stored.id, ?upsert, "Note received");
                    self.after_mutation(Some(source), Some(&stored));
                }
                Err(e) => warn!(transport = %source, %peer, error = %e, "Rejected note"),
            },
            // Answered by the transport itself.
            Command::RequestState => {
                debug!(transport = %source, %peer, "State requested");
            }
        }
    }

    fn on_local_note(&mut self, note: Note) -> SyncResult<Note> {
        match self.role {
            Role::Hub => {
                let (stored, upsert) = self.dataset.apply_new_note(note, now_millis())?;
                info!(id = ?stored.id, ?upsert, "Local note added");
                self.after_mutation(None, Some(&stored));
                Ok(stored)
            }
            Role::Satellite => {
                let note = self.dataset.normalize(note, now_millis())?;
                let command = Command::NewNote(note.clone());
                let upstream = self.upstream().ok_or_else(|| {
                    SyncError::NotReady("no connection to the hub".to_string())
                })?;
                upstream.send_command(&command)?;
                info!(via = %upstream.kind(), "Note forwarded to hub");
                self.syncing = true;
                Ok(note)
            }
        }
    }

    /// First ready upstream: the radio link, then the stream fallback
    fn upstream(&self) -> Option<Arc<dyn Transport>> {
        [TransportKind::Central, TransportKind::Fallback]
            .into_iter()
            .find_map(|kind| {
                self.transports
                    .iter()
                    .find(|t| t.kind() == kind && t.state().is_ready())
                    .cloned()
            })
    }

    fn after_mutation(&mut self, origin: Option<TransportKind>, note: Option<&Note>) {
        let snapshot = self.dataset.snapshot();
        self.cache.write(snapshot.clone());
        self.dataset_tx.send_replace(snapshot.clone());

        if self.role != Role::Hub {
            return;
        }
        if self.push(&snapshot) {
            self.last_synced_at = Some(now_millis());
        }

        let Some(note) = note else { return };
        if !self.relay_to_server || origin == Some(TransportKind::ServerLink) {
            return;
        }
        for server in self
            .transports
            .iter()
            .filter(|t| t.kind() == TransportKind::ServerLink)
        {
            match server.send_command(&Command::NewNote(note.clone())) {
                Ok(()) => debug!(id = ?note.id, "Note relayed to server"),
                Err(e) => warn!(id = ?note.id, error = %e, "Note not relayed to server"),
            }
        }
    }

    /// Send `snapshot` to every hub-side transport. Returns whether any
    /// peer received it.
    fn push(&self, snapshot: &Envelope) -> bool {
        let mut delivered = false;
        for transport in self
            .transports
            .iter()
            .filter(|t| matches!(t.kind(), TransportKind::Peripheral | TransportKind::Fallback))
        {
            match transport.send(snapshot) {
                Ok(()) => delivered = true,
                Err(SyncError::NotReady(reason)) => {
                    debug!(transport = %transport.kind(), %reason, "Snapshot held for next peer")
                }
                Err(e) => warn!(transport = %transport.kind(), error = %e, "Snapshot push failed"),
            }
        }
        delivered
    }

    fn peer_ready(&self) -> bool {
        self.transports
            .iter()
            .any(|t| t.kind().is_peer() && t.state().is_ready())
    }

    /// Current status derived from the transports' states
    pub fn status_report(&self) -> StatusReport {
        let mut flags = HealthFlags {
            syncing: self.syncing,
            last_synced_at: self.last_synced_at,
            ..Default::default()
        };
        for transport in &self.transports {
            let kind = transport.kind();
            match transport.state() {
                ConnectionState::Ready if kind.is_peer() => flags.peer_ready = true,
                ConnectionState::Ready => flags.server_ready = true,
                ConnectionState::Unavailable(reason) => {
                    flags.unavailable.push(format!("{}: {}", kind, reason))
                }
                _ => {}
            }
        }
        StatusReport::from_flags(flags)
    }

    fn publish_status(&self) {
        let report = self.status_report();
        self.status_tx.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            info!(status = %report, "Status changed");
            *current = report;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusLabel;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Transport double recording what the coordinator hands it
    struct FakeTransport {
        kind: TransportKind,
        state: Mutex<ConnectionState>,
        sent: Mutex<Vec<Envelope>>,
        commands: Mutex<Vec<Command>>,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, state: ConnectionState) -> Arc<Self> {
            Arc::new(Self {
                kind,
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
            })
        }

        fn set_state(&self, state: ConnectionState) {
            *self.state.lock() = state;
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn start(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn stop(&self) {}

        fn send(&self, envelope: &Envelope) -> SyncResult<()> {
            self.sent.lock().push(envelope.clone());
            if self.state.lock().is_ready() {
                Ok(())
            } else {
                Err(SyncError::NotReady("fake".into()))
            }
        }

        fn send_command(&self, command: &Command) -> SyncResult<()> {
            if !self.state.lock().is_ready() {
                return Err(SyncError::NotReady("fake".into()));
            }
            self.commands.lock().push(command.clone());
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            self.state.lock().clone()
        }
    }

    struct TestContext {
        _dir: TempDir,
        cache: SnapshotCache,
    }

    impl TestContext {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let cache = SnapshotCache::in_dir(dir.path());
            Self { _dir: dir, cache }
        }

        fn coordinator(&self, role: Role, transports: Vec<Arc<dyn Transport>>) -> SyncCoordinator {
            SyncCoordinator::new(role, Dataset::new(), transports, self.cache.clone(), true)
        }
    }

    fn inbound(source: TransportKind, envelope: Envelope) -> CoordinatorMessage {
        CoordinatorMessage::Transport(TaggedEvent {
            source,
            event: TransportEvent::Inbound(envelope),
        })
    }

    fn new_note(source: TransportKind, note: Note) -> CoordinatorMessage {
        CoordinatorMessage::Transport(TaggedEvent {
            source,
            event: TransportEvent::InboundCommand {
                peer: "peer".into(),
                command: Command::NewNote(note),
            },
        })
    }

    fn local(note: Note) -> (CoordinatorMessage, oneshot::Receiver<SyncResult<Note>>) {
        let (reply, rx) = oneshot::channel();
        (CoordinatorMessage::LocalNote { note, reply }, rx)
    }

    // ========================================================================
    // Hub
    // ========================================================================

    #[tokio::test]
    async fn test_hub_new_note_pushes_and_relays() {
        let ctx = TestContext::new();
        let server = FakeTransport::new(TransportKind::ServerLink, ConnectionState::Ready);
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![server.clone(), peripheral.clone()]);

        coordinator.handle(new_note(TransportKind::Peripheral, Note::new("a", "b")));

        assert_eq!(coordinator.dataset().notes().len(), 1);
        let pushed = peripheral.sent.lock().last().cloned().unwrap();
        assert_eq!(pushed.notes.unwrap()[0].title, "a");
        assert!(matches!(server.commands.lock()[0], Command::NewNote(_)));
        assert!(server.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_server_notes_are_not_relayed_back() {
        let ctx = TestContext::new();
        let server = FakeTransport::new(TransportKind::ServerLink, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![server.clone()]);

        coordinator.handle(new_note(TransportKind::ServerLink, Note::new("a", "b")));

        assert_eq!(coordinator.dataset().notes().len(), 1);
        assert!(server.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_relay_can_be_disabled() {
        let ctx = TestContext::new();
        let server = FakeTransport::new(TransportKind::ServerLink, ConnectionState::Ready);
        let transports: Vec<Arc<dyn Transport>> = vec![server.clone()];
        let mut coordinator =
            SyncCoordinator::new(Role::Hub, Dataset::new(), transports, ctx.cache.clone(), false);

        let (message, reply) = local(Note::new("a", "b"));
        coordinator.handle(message);

        assert!(reply.await.unwrap().is_ok());
        assert!(server.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_note_is_rejected_without_side_effects() {
        let ctx = TestContext::new();
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![peripheral.clone()]);

        let (message, reply) = local(Note::new(" ", "b"));
        coordinator.handle(message);

        assert!(matches!(reply.await.unwrap(), Err(SyncError::InvalidNote(_))));
        assert!(coordinator.dataset().notes().is_empty());
        assert!(peripheral.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_snapshot_replaces_and_publishes() {
        let ctx = TestContext::new();
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Idle);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![peripheral.clone()]);
        let mut dataset_rx = coordinator.subscribe_dataset();

        let env = Envelope::snapshot(vec![Note::new("s", "1").with_id(1)], vec![]);
        coordinator.handle(inbound(TransportKind::ServerLink, env.clone()));

        assert!(dataset_rx.has_changed().unwrap());
        assert_eq!(dataset_rx.borrow_and_update().notes, env.notes);
        // Held by the transport for the next subscriber.
        assert_eq!(peripheral.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_snapshot_is_idempotent() {
        let ctx = TestContext::new();
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![peripheral.clone()]);

        let env = Envelope::snapshot(vec![Note::new("s", "1").with_id(1)], vec![]);
        coordinator.handle(inbound(TransportKind::ServerLink, env.clone()));
        let before = coordinator.dataset().clone();
        coordinator.handle(inbound(TransportKind::ServerLink, env));

        assert_eq!(coordinator.dataset(), &before);
        assert_eq!(peripheral.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hub_ignores_snapshots_from_peers() {
        let ctx = TestContext::new();
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Ready);
        let fallback = FakeTransport::new(TransportKind::Fallback, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Hub, vec![peripheral.clone(), fallback.clone()]);
        coordinator.handle(new_note(TransportKind::Peripheral, Note::new("keep", "me")));
        let before = coordinator.dataset().clone();

        let rogue = Envelope::snapshot(vec![Note::new("rogue", "x").with_id(99)], vec![]);
        coordinator.handle(inbound(TransportKind::Peripheral, rogue.clone()));
        coordinator.handle(inbound(TransportKind::Fallback, rogue));

        assert_eq!(coordinator.dataset(), &before);
        assert_eq!(peripheral.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_prime_hands_hydrated_snapshot_to_hub_transports() {
        let ctx = TestContext::new();
        let peripheral = FakeTransport::new(TransportKind::Peripheral, ConnectionState::Idle);
        let server = FakeTransport::new(TransportKind::ServerLink, ConnectionState::Idle);
        let dataset = Dataset::from_envelope(Envelope::snapshot(
            vec![Note::new("cached", "note").with_id(3)],
            vec![],
        ));
        let transports: Vec<Arc<dyn Transport>> = vec![peripheral.clone(), server.clone()];
        let coordinator =
            SyncCoordinator::new(Role::Hub, dataset, transports, ctx.cache.clone(), true);

        coordinator.prime_transports();

        let held = peripheral.sent.lock().last().cloned().unwrap();
        assert_eq!(held.notes.unwrap()[0].id, Some(3));
        assert!(server.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cache_written_after_mutation() {
        let ctx = TestContext::new();
        let coordinator = ctx.coordinator(Role::Hub, vec![]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(coordinator.run(rx));

        let (reply, reply_rx) = oneshot::channel();
        tx.send(CoordinatorMessage::LocalNote {
            note: Note::new("persist", "me"),
            reply,
        })
        .unwrap();
        reply_rx.await.unwrap().unwrap();
        tx.send(CoordinatorMessage::Shutdown).unwrap();
        handle.await.unwrap();

        let cached = ctx.cache.load().unwrap();
        assert_eq!(cached.notes.unwrap()[0].title, "persist");
    }

    // ========================================================================
    // Satellite
    // ========================================================================

    #[tokio::test]
    async fn test_satellite_forwards_to_first_ready_upstream() {
        let ctx = TestContext::new();
        let central = FakeTransport::new(TransportKind::Central, ConnectionState::Scanning { filtered: true });
        let fallback = FakeTransport::new(TransportKind::Fallback, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Satellite, vec![central.clone(), fallback.clone()]);

        let (message, reply) = local(Note::new("a", "b"));
        coordinator.handle(message);
        let forwarded = reply.await.unwrap().unwrap();

        assert_eq!(forwarded.project_name.as_deref(), Some("General"));
        assert_eq!(fallback.commands.lock().len(), 1);
        assert!(central.commands.lock().is_empty());
        // Satellites wait for the hub's snapshot instead of mutating locally.
        assert!(coordinator.dataset().notes().is_empty());
        assert_eq!(coordinator.status_report().label, StatusLabel::Syncing);

        central.set_state(ConnectionState::Ready);
        let (message, _reply) = local(Note::new("c", "d"));
        coordinator.handle(message);
        assert_eq!(central.commands.lock().len(), 1);
        assert_eq!(fallback.commands.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_satellite_without_upstream_is_not_ready() {
        let ctx = TestContext::new();
        let central = FakeTransport::new(TransportKind::Central, ConnectionState::Disconnected);
        let mut coordinator = ctx.coordinator(Role::Satellite, vec![central]);

        let (message, reply) = local(Note::new("a", "b"));
        coordinator.handle(message);
        assert!(matches!(reply.await.unwrap(), Err(SyncError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_satellite_ignores_server_snapshots() {
        let ctx = TestContext::new();
        let central = FakeTransport::new(TransportKind::Central, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Satellite, vec![central]);

        coordinator.handle(inbound(
            TransportKind::ServerLink,
            Envelope::snapshot(vec![Note::new("x", "y").with_id(1)], vec![]),
        ));
        assert!(coordinator.dataset().notes().is_empty());

        coordinator.handle(inbound(
            TransportKind::Fallback,
            Envelope::snapshot(vec![Note::new("x", "y").with_id(1)], vec![]),
        ));
        assert_eq!(coordinator.dataset().notes().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_snapshot_marks_synced() {
        let ctx = TestContext::new();
        let central = FakeTransport::new(TransportKind::Central, ConnectionState::Ready);
        let mut coordinator = ctx.coordinator(Role::Satellite, vec![central.clone()]);
        assert_eq!(coordinator.status_report().label, StatusLabel::AwaitingFirstSync);

        let (message, _reply) = local(Note::new("a", "b"));
        coordinator.handle(message);
        assert_eq!(coordinator.status_report().label, StatusLabel::Syncing);

        coordinator.handle(inbound(
            TransportKind::Central,
            Envelope::snapshot(vec![Note::new("a", "b").with_id(1)], vec![]),
        ));
        assert!(matches!(
            coordinator.status_report().label,
            StatusLabel::SyncedAt { .. }
        ));
        assert_eq!(coordinator.dataset().notes().len(), 1);
        // Satellites never push snapshots.
        assert!(central.sent.lock().is_empty());
    }

    // ========================================================================
    // Status
    // ========================================================================

    #[tokio::test]
    async fn test_status_reports_unavailable_transports() {
        let ctx = TestContext::new();
        let server = FakeTransport::new(TransportKind::ServerLink, ConnectionState::Ready);
        let peripheral = FakeTransport::new(
            TransportKind::Peripheral,
            ConnectionState::Unavailable("radio off".into()),
        );
        let coordinator = ctx.coordinator(Role::Hub, vec![server, peripheral]);

        let report = coordinator.status_report();
        assert_eq!(report.label, StatusLabel::ServerOnly);
        assert_eq!(report.flags.unavailable, vec!["peripheral: radio off".to_string()]);
    }
}
