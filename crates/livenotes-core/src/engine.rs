//! The sync engine - explicit owner of the coordinator and its transports
//!
//! One `SyncEngine` per process role. It hydrates the dataset from the
//! snapshot cache, builds the transports the role and configuration call
//! for, starts the coordinator, and tears everything down on `shutdown`.
//!
//! # Example
//!
//! ```ignore
//! use livenotes_core::{EngineConfig, Note, Radios, SyncEngine};
//!
//! let engine = SyncEngine::start(EngineConfig::default(), Radios::none()).await?;
//! engine.add_note(Note::new("Groceries", "oat milk")).await?;
//! println!("{}", engine.status());
//! engine.shutdown().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EngineConfig, Role};
use crate::coordinator::{CoordinatorMessage, Dataset, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::radio::{CentralRadio, PeripheralRadio};
use crate::status::StatusReport;
use crate::storage::SnapshotCache;
use crate::transport::{
    CentralStatsSnapshot, CentralTransport, ConnectionState, EventSink, FallbackRole,
    PeripheralTransport, ServerLink, StreamFallbackTransport, Transport, TransportKind,
};
use crate::types::{Command, Envelope, Note};

/// Radio backends supplied by the host platform
#[derive(Clone, Default)]
pub struct Radios {
    pub peripheral: Option<Arc<dyn PeripheralRadio>>,
    pub central: Option<Arc<dyn CentralRadio>>,
}

impl Radios {
    /// No radio; only the server link and the stream fallback run
    pub fn none() -> Self {
        Self::default()
    }

    pub fn hub(radio: Arc<dyn PeripheralRadio>) -> Self {
        Self {
            peripheral: Some(radio),
            central: None,
        }
    }

    pub fn satellite(radio: Arc<dyn CentralRadio>) -> Self {
        Self {
            peripheral: None,
            central: Some(radio),
        }
    }
}

/// Running engine
pub struct SyncEngine {
    role: Role,
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    transports: Vec<Arc<dyn Transport>>,
    server: Option<Arc<ServerLink>>,
    central: Option<Arc<CentralTransport>>,
    fallback: Option<Arc<StreamFallbackTransport>>,
    status_rx: watch::Receiver<StatusReport>,
    dataset_rx: watch::Receiver<Envelope>,
    coordinator: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Hydrate, build the transports for `config.role`, and start everything.
    ///
    /// Transports whose capability is missing are left `Unavailable` rather
    /// than failing the engine; see [`SyncEngine::retry_unavailable`].
    pub async fn start(config: EngineConfig, radios: Radios) -> SyncResult<Self> {
        info!(role = ?config.role, data_dir = %config.data_dir.display(), "Starting sync engine");

        let cache = SnapshotCache::in_dir(&config.data_dir);
        let dataset = match cache.load() {
            Some(envelope) => Dataset::from_envelope(envelope),
            None => Dataset::new(),
        };
        info!(
            notes = dataset.notes().len(),
            projects = dataset.projects().len(),
            "Dataset hydrated"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = |kind| EventSink::new(kind, tx.clone());

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        let mut server = None;
        let mut central = None;
        let mut fallback = None;

        match config.role {
            Role::Hub => {
                if config.server.enabled {
                    let link = Arc::new(ServerLink::new(
                        config.server.endpoint(),
                        config.server.reconnect,
                        config.server.connect_timeout(),
                        sink(TransportKind::ServerLink),
                    ));
                    transports.push(link.clone());
                    server = Some(link);
                }
                if let Some(radio) = radios.peripheral {
                    transports.push(Arc::new(PeripheralTransport::new(
                        radio,
                        config.radio.peripheral_options(),
                        sink(TransportKind::Peripheral),
                    )));
                }
                if let Some(addr) = config.fallback.listen {
                    let listen = Arc::new(StreamFallbackTransport::new(
                        FallbackRole::Listen(addr),
                        config.fallback.options(),
                        sink(TransportKind::Fallback),
                    ));
                    transports.push(listen.clone());
                    fallback = Some(listen);
                }
            }
            Role::Satellite => {
                if !config.fallback.paired_peers.is_empty() {
                    let dial = Arc::new(StreamFallbackTransport::new(
                        FallbackRole::Dial(config.fallback.paired_peers.clone()),
                        config.fallback.options(),
                        sink(TransportKind::Fallback),
                    ));
                    fallback = Some(dial);
                }
                if let Some(radio) = radios.central {
                    let link = Arc::new(CentralTransport::new(
                        radio,
                        config.radio.central_timings(),
                        sink(TransportKind::Central),
                    ));
                    if let Some(dial) = &fallback {
                        link.set_fallback(dial.clone());
                    }
                    transports.push(link.clone());
                    central = Some(link);
                }
                if let Some(dial) = &fallback {
                    transports.push(dial.clone());
                }
            }
        }

        let coordinator = SyncCoordinator::new(
            config.role,
            dataset,
            transports.clone(),
            cache,
            config.sync.relay_to_server,
        );
        coordinator.prime_transports();
        let status_rx = coordinator.subscribe_status();
        let dataset_rx = coordinator.subscribe_dataset();
        let handle = tokio::spawn(coordinator.run(rx));

        let engine = Self {
            role: config.role,
            tx,
            transports,
            server,
            central,
            fallback,
            status_rx,
            dataset_rx,
            coordinator: Some(handle),
        };
        engine.start_transports().await;
        Ok(engine)
    }

    async fn start_transports(&self) {
        for transport in &self.transports {
            // The satellite's fallback is started by the central once the
            // radio path fails, or right away when there is no radio at all.
            if self.role == Role::Satellite
                && transport.kind() == TransportKind::Fallback
                && self.central.is_some()
            {
                continue;
            }
            if let Err(e) = transport.start().await {
                warn!(transport = %transport.kind(), error = %e, "Transport failed to start");
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Add a note created on this device.
    ///
    /// On the hub the note is applied and fanned out. On a satellite it is
    /// forwarded to the hub and shows up once the hub pushes its snapshot.
    ///
    /// # Errors
    ///
    /// `SyncError::InvalidNote` for a blank title or content;
    /// `SyncError::NotReady` on a satellite with no ready upstream.
    pub async fn add_note(&self, note: Note) -> SyncResult<Note> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::LocalNote { note, reply })
            .map_err(|_| SyncError::Shutdown("coordinator stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SyncError::Shutdown("coordinator stopped".to_string()))?
    }

    /// Latest published dataset
    pub fn snapshot(&self) -> Envelope {
        self.dataset_rx.borrow().clone()
    }

    pub fn status(&self) -> StatusReport {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.status_rx.clone()
    }

    pub fn subscribe_dataset(&self) -> watch::Receiver<Envelope> {
        self.dataset_rx.clone()
    }

    pub fn transport_states(&self) -> Vec<(TransportKind, ConnectionState)> {
        self.transports
            .iter()
            .map(|t| (t.kind(), t.state()))
            .collect()
    }

    /// Point the server link at a new address and reconnect
    pub async fn reconfigure_server(&self, host: impl Into<String>, port: u16) -> SyncResult<()> {
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| SyncError::Unsupported("no server link".to_string()))?;
        server.reconfigure(host, port).await
    }

    /// Reconnect the server link (the manual reconnect policy never retries on its own)
    pub async fn reconnect_server(&self) -> SyncResult<()> {
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| SyncError::Unsupported("no server link".to_string()))?;
        server.restart().await
    }

    /// Start again every transport sitting in `Unavailable`
    pub async fn retry_unavailable(&self) {
        for transport in &self.transports {
            if let ConnectionState::Unavailable(reason) = transport.state() {
                info!(transport = %transport.kind(), %reason, "Retrying unavailable transport");
                transport.stop().await;
                if let Err(e) = transport.start().await {
                    warn!(transport = %transport.kind(), error = %e, "Transport still unavailable");
                }
            }
        }
    }

    /// Ask the hub for a fresh snapshot (satellite only).
    ///
    /// Reads the snapshot over the radio when the radio link is ready,
    /// otherwise sends a state request over the fallback.
    pub async fn request_refresh(&self) -> SyncResult<()> {
        if self.role != Role::Satellite {
            return Err(SyncError::Unsupported(
                "the hub holds the dataset".to_string(),
            ));
        }
        let _ = self.tx.send(CoordinatorMessage::RefreshRequested);
        if let Some(central) = self.central.as_ref().filter(|c| c.state().is_ready()) {
            return central.pull().await.map(|_| ());
        }
        match self.fallback.as_ref().filter(|f| f.state().is_ready()) {
            Some(fallback) => fallback.send_command(&Command::RequestState),
            None => Err(SyncError::NotReady("no connection to the hub".to_string())),
        }
    }

    pub fn central_stats(&self) -> Option<CentralStatsSnapshot> {
        self.central.as_ref().map(|c| c.stats())
    }

    /// Address the hub's fallback listener is bound to
    pub fn fallback_addr(&self) -> Option<SocketAddr> {
        self.fallback.as_ref().and_then(|f| f.local_addr())
    }

    /// Stop every transport, then flush the cache and stop the coordinator
    pub async fn shutdown(mut self) {
        info!("Shutting down sync engine");
        for transport in &self.transports {
            transport.stop().await;
        }
        let _ = self.tx.send(CoordinatorMessage::Shutdown);
        if let Some(handle) = self.coordinator.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Coordinator did not stop cleanly");
            }
        }
        info!("Sync engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusLabel;
    use crate::types::Project;
    use tempfile::TempDir;

    fn offline_hub(dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.server.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_hub_without_transports_applies_notes() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::start(offline_hub(&dir), Radios::none())
            .await
            .unwrap();

        let stored = engine
            .add_note(Note::new("Title", "Body").with_project("Work"))
            .await
            .unwrap();
        assert_eq!(stored.project_name.as_deref(), Some("Work"));

        let mut rx = engine.subscribe_dataset();
        rx.wait_for(|env| env.notes.as_ref().is_some_and(|n| n.len() == 1))
            .await
            .unwrap();
        assert_eq!(engine.snapshot().notes.unwrap()[0].title, "Title");
        assert!(engine.transport_states().is_empty());
        assert_eq!(engine.status().label, StatusLabel::Disconnected);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_hydrates_from_cache() {
        let dir = TempDir::new().unwrap();
        SnapshotCache::in_dir(dir.path())
            .store(&Envelope::snapshot(
                vec![Note::new("cached", "note").with_id(4)],
                vec![Project::new("General", "#90CAF9")],
            ))
            .unwrap();

        let engine = SyncEngine::start(offline_hub(&dir), Radios::none())
            .await
            .unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.notes.unwrap()[0].id, Some(4));
        assert_eq!(snapshot.projects.unwrap().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_satellite_rejects_note_without_upstream() {
        let dir = TempDir::new().unwrap();
        let mut config = offline_hub(&dir);
        config.role = Role::Satellite;
        let engine = SyncEngine::start(config, Radios::none()).await.unwrap();

        let result = engine.add_note(Note::new("a", "b")).await;
        assert!(matches!(result, Err(SyncError::NotReady(_))));
        assert!(matches!(
            engine.request_refresh().await,
            Err(SyncError::NotReady(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure_without_server_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::start(offline_hub(&dir), Radios::none())
            .await
            .unwrap();
        assert!(matches!(
            engine.reconfigure_server("10.0.0.1", 8000).await,
            Err(SyncError::Unsupported(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_fallback_client_gets_hydrated_snapshot() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let dir = TempDir::new().unwrap();
        SnapshotCache::in_dir(dir.path())
            .store(&Envelope::snapshot(vec![Note::new("cached", "note").with_id(7)], vec![]))
            .unwrap();
        let mut config = offline_hub(&dir);
        config.fallback.listen = Some("127.0.0.1:0".parse().unwrap());
        let engine = SyncEngine::start(config, Radios::none()).await.unwrap();

        let stream = tokio::net::TcpStream::connect(engine.fallback_addr().unwrap())
            .await
            .unwrap();
        let mut line = String::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            BufReader::new(stream).read_line(&mut line),
        )
        .await
        .unwrap()
        .unwrap();
        let pushed = crate::sync::codec::decode(line.trim().as_bytes()).unwrap();
        assert_eq!(pushed.notes.unwrap()[0].id, Some(7));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_hub_fallback_listener_binds() {
        let dir = TempDir::new().unwrap();
        let mut config = offline_hub(&dir);
        config.fallback.listen = Some("127.0.0.1:0".parse().unwrap());
        let engine = SyncEngine::start(config, Radios::none()).await.unwrap();

        let addr = engine.fallback_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(
            engine.transport_states(),
            vec![(TransportKind::Fallback, ConnectionState::Advertising)]
        );
        engine.shutdown().await;
    }
}
