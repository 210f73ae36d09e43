//! In-memory simulated radio
//!
//! A [`SimAir`] is a shared medium. Peripherals registered on it advertise and
//! host GATT servers; centrals scan it and connect. Everything is delivered
//! through tokio channels, so hub and satellite engines can run in one process.
//!
//! Fault knobs on [`SimPeripheral`] reproduce the failure modes the transports
//! must survive: missing capability, a service that disappears, advertisements
//! without the service id, subscriptions that are never acknowledged, and
//! links that drop.
//!
//! Limits match a real radio: notifications above 512 bytes are
//! rejected and a single read returns at most 512 bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{
    Advertisement, CentralRadio, ClientEvent, DeviceAddress, DiscoveredService, GattClient,
    GattConnection, GattLayout, GattResponse, PeripheralRadio, ScanFilter, ServerEvent,
};
use crate::error::{SyncError, SyncResult};

/// Largest notification the simulated radio accepts
pub const SIM_NOTIFY_CEILING: usize = 512;

/// Largest value returned by one simulated read
pub const SIM_READ_LIMIT: usize = 512;

/// How often a running scan re-reports visible advertisers
const SCAN_INTERVAL: Duration = Duration::from_millis(50);

struct ServerSlot {
    layout: GattLayout,
    events: mpsc::UnboundedSender<ServerEvent>,
}

struct PeripheralNode {
    name: Option<String>,
    available: bool,
    server: Option<ServerSlot>,
    advertising: Option<Uuid>,
    include_service_in_advertisement: bool,
    hide_service: bool,
    stall_subscriptions: bool,
    links: HashMap<DeviceAddress, mpsc::UnboundedSender<ClientEvent>>,
}

impl PeripheralNode {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            available: true,
            server: None,
            advertising: None,
            include_service_in_advertisement: true,
            hide_service: false,
            stall_subscriptions: false,
            links: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct AirState {
    peripherals: HashMap<DeviceAddress, PeripheralNode>,
}

/// Shared simulated medium
#[derive(Clone, Default)]
pub struct SimAir {
    inner: Arc<Mutex<AirState>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral at `address`
    pub fn peripheral(&self, address: impl Into<String>, name: Option<&str>) -> SimPeripheral {
        let address = DeviceAddress::new(address);
        self.inner.lock().peripherals.insert(
            address.clone(),
            PeripheralNode::new(name.map(str::to_string)),
        );
        SimPeripheral {
            air: self.clone(),
            address,
        }
    }

    /// Create a central at `address`
    pub fn central(&self, address: impl Into<String>) -> SimCentral {
        SimCentral {
            air: self.clone(),
            address: DeviceAddress::new(address),
            available: Arc::new(AtomicBool::new(true)),
            scan: Arc::new(Mutex::new(None)),
        }
    }

    fn advertisements(&self) -> Vec<Advertisement> {
        let state = self.inner.lock();
        let mut ads: Vec<_> = state
            .peripherals
            .iter()
            .filter_map(|(address, node)| {
                let service = node.advertising?;
                Some(Advertisement {
                    device: address.clone(),
                    name: node.name.clone(),
                    services: if node.include_service_in_advertisement {
                        vec![service]
                    } else {
                        Vec::new()
                    },
                })
            })
            .collect();
        ads.sort_by(|a, b| a.device.cmp(&b.device));
        ads
    }
}

/// Hub-side handle on the simulated air
#[derive(Clone)]
pub struct SimPeripheral {
    air: SimAir,
    address: DeviceAddress,
}

impl SimPeripheral {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut PeripheralNode) -> R) -> Option<R> {
        let mut state = self.air.inner.lock();
        state.peripherals.get_mut(&self.address).map(f)
    }

    /// Simulate the radio being switched off or permissions revoked
    pub fn set_available(&self, available: bool) {
        self.with_node(|node| node.available = available);
    }

    /// Never acknowledge subscription (descriptor) writes
    pub fn set_stall_subscriptions(&self, stall: bool) {
        self.with_node(|node| node.stall_subscriptions = stall);
    }

    /// Report no services during discovery
    pub fn set_hide_service(&self, hide: bool) {
        self.with_node(|node| node.hide_service = hide);
    }

    /// Leave the service id out of advertisements (defeats filtered scans)
    pub fn set_include_service_in_advertisement(&self, include: bool) {
        self.with_node(|node| node.include_service_in_advertisement = include);
    }

    /// Devices currently linked to this peripheral
    pub fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.with_node(|node| {
            let mut devices: Vec<_> = node.links.keys().cloned().collect();
            devices.sort();
            devices
        })
        .unwrap_or_default()
    }

    /// Drop the link to `central` as if it went out of range
    pub fn drop_link(&self, central: &DeviceAddress) {
        let dropped = self.with_node(|node| {
            let link = node.links.remove(central)?;
            Some((link, node.server.as_ref().map(|s| s.events.clone())))
        });
        if let Some(Some((link, server))) = dropped {
            debug!(peripheral = %self.address, %central, "Sim link dropped");
            let _ = link.send(ClientEvent::Disconnected {
                reason: "link lost".to_string(),
            });
            if let Some(server) = server {
                let _ = server.send(ServerEvent::Disconnected(central.clone()));
            }
        }
    }
}

#[async_trait]
impl PeripheralRadio for SimPeripheral {
    async fn open_server(
        &self,
        layout: &GattLayout,
    ) -> SyncResult<mpsc::UnboundedReceiver<ServerEvent>> {
        let layout = *layout;
        self.with_node(|node| {
            if !node.available {
                return Err(SyncError::CapabilityUnavailable(
                    "radio unavailable".to_string(),
                ));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            node.server = Some(ServerSlot { layout, events: tx });
            Ok(rx)
        })
        .unwrap_or_else(|| Err(SyncError::CapabilityUnavailable("no such device".into())))
    }

    async fn start_advertising(&self, service: Uuid) -> SyncResult<()> {
        self.with_node(|node| {
            if !node.available {
                return Err(SyncError::CapabilityUnavailable(
                    "radio unavailable".to_string(),
                ));
            }
            node.advertising = Some(service);
            Ok(())
        })
        .unwrap_or_else(|| Err(SyncError::CapabilityUnavailable("no such device".into())))
    }

    async fn stop_advertising(&self) {
        self.with_node(|node| node.advertising = None);
    }

    async fn notify(
        &self,
        device: &DeviceAddress,
        characteristic: Uuid,
        value: Bytes,
    ) -> SyncResult<()> {
        if value.len() > SIM_NOTIFY_CEILING {
            return Err(SyncError::Protocol(format!(
                "notification of {} bytes exceeds {}",
                value.len(),
                SIM_NOTIFY_CEILING
            )));
        }
        let link = self
            .with_node(|node| node.links.get(device).cloned())
            .flatten()
            .ok_or_else(|| SyncError::Network(format!("{} not connected", device)))?;
        link.send(ClientEvent::Notification {
            characteristic,
            value,
        })
        .map_err(|_| SyncError::Network(format!("{} link closed", device)))
    }

    async fn close_server(&self) {
        let links = self
            .with_node(|node| {
                node.server = None;
                node.advertising = None;
                node.links.drain().map(|(_, link)| link).collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for link in links {
            let _ = link.send(ClientEvent::Disconnected {
                reason: "server closed".to_string(),
            });
        }
    }
}

/// Satellite-side handle on the simulated air
#[derive(Clone)]
pub struct SimCentral {
    air: SimAir,
    address: DeviceAddress,
    available: Arc<AtomicBool>,
    scan: Arc<Mutex<Option<CancellationToken>>>,
}

impl SimCentral {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl CentralRadio for SimCentral {
    async fn start_scan(
        &self,
        filter: ScanFilter,
    ) -> SyncResult<mpsc::UnboundedReceiver<Advertisement>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::CapabilityUnavailable(
                "radio unavailable".to_string(),
            ));
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.scan.lock().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let air = self.air.clone();
        tokio::spawn(async move {
            loop {
                for adv in air.advertisements() {
                    if filter.matches(&adv) && tx.send(adv).is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                }
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) {
        if let Some(token) = self.scan.lock().take() {
            token.cancel();
        }
    }

    async fn connect(&self, device: &DeviceAddress) -> SyncResult<GattConnection> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::CapabilityUnavailable(
                "radio unavailable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let server = {
            let mut state = self.air.inner.lock();
            let node = state
                .peripherals
                .get_mut(device)
                .ok_or_else(|| SyncError::Network(format!("{} not found", device)))?;
            let server = match (&node.server, node.advertising) {
                (Some(server), Some(_)) => server.events.clone(),
                _ => return Err(SyncError::Network(format!("{} not connectable", device))),
            };
            node.links.insert(self.address.clone(), tx);
            server
        };

        debug!(central = %self.address, peripheral = %device, "Sim link established");
        let _ = server.send(ServerEvent::Connected(self.address.clone()));

        Ok(GattConnection {
            client: Arc::new(SimGattClient {
                air: self.air.clone(),
                peripheral: device.clone(),
                central: self.address.clone(),
            }),
            events: rx,
        })
    }
}

struct SimGattClient {
    air: SimAir,
    peripheral: DeviceAddress,
    central: DeviceAddress,
}

/// What a client request needs from the peripheral node
struct LinkView {
    server: mpsc::UnboundedSender<ServerEvent>,
    layout: GattLayout,
    hide_service: bool,
    stall_subscriptions: bool,
}

impl SimGattClient {
    fn link(&self) -> SyncResult<LinkView> {
        let state = self.air.inner.lock();
        let node = state
            .peripherals
            .get(&self.peripheral)
            .filter(|node| node.links.contains_key(&self.central))
            .ok_or_else(|| SyncError::Network("not connected".to_string()))?;
        let server = node
            .server
            .as_ref()
            .ok_or_else(|| SyncError::Network("server closed".to_string()))?;
        Ok(LinkView {
            server: server.events.clone(),
            layout: server.layout,
            hide_service: node.hide_service,
            stall_subscriptions: node.stall_subscriptions,
        })
    }

    async fn request(
        &self,
        server: &mpsc::UnboundedSender<ServerEvent>,
        build: impl FnOnce(oneshot::Sender<GattResponse>) -> ServerEvent,
    ) -> SyncResult<GattResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        server
            .send(build(reply_tx))
            .map_err(|_| SyncError::Network("server closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SyncError::Network("no response".to_string()))
    }
}

#[async_trait]
impl GattClient for SimGattClient {
    fn device(&self) -> &DeviceAddress {
        &self.peripheral
    }

    async fn discover_services(&self) -> SyncResult<Vec<DiscoveredService>> {
        let link = self.link()?;
        if link.hide_service {
            return Ok(Vec::new());
        }
        Ok(vec![DiscoveredService {
            uuid: link.layout.service,
            characteristics: vec![link.layout.data, link.layout.command],
        }])
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> SyncResult<()> {
        let link = self.link()?;
        if link.stall_subscriptions {
            debug!(central = %self.central, "Sim stalling descriptor write");
            return std::future::pending().await;
        }
        let value = Bytes::copy_from_slice(value);
        let device = self.central.clone();
        match self
            .request(&link.server, |reply| ServerEvent::DescriptorWrite {
                device,
                characteristic,
                descriptor,
                value,
                reply: Some(reply),
            })
            .await?
        {
            GattResponse::Success(_) => Ok(()),
            GattResponse::Failure => Err(SyncError::Protocol(
                "descriptor write rejected".to_string(),
            )),
        }
    }

    async fn read(&self, characteristic: Uuid, offset: usize) -> SyncResult<Bytes> {
        let link = self.link()?;
        let device = self.central.clone();
        match self
            .request(&link.server, |reply| ServerEvent::Read {
                device,
                characteristic,
                offset,
                reply,
            })
            .await?
        {
            GattResponse::Success(value) => Ok(value.slice(..value.len().min(SIM_READ_LIMIT))),
            GattResponse::Failure => Err(SyncError::Protocol("read rejected".to_string())),
        }
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> SyncResult<()> {
        let link = self.link()?;
        let value = Bytes::copy_from_slice(value);
        let device = self.central.clone();
        match self
            .request(&link.server, |reply| ServerEvent::Write {
                device,
                characteristic,
                value,
                reply: Some(reply),
            })
            .await?
        {
            GattResponse::Success(_) => Ok(()),
            GattResponse::Failure => Err(SyncError::Protocol("write rejected".to_string())),
        }
    }

    async fn disconnect(&self) {
        let server = {
            let mut state = self.air.inner.lock();
            state.peripherals.get_mut(&self.peripheral).and_then(|node| {
                node.links.remove(&self.central)?;
                node.server.as_ref().map(|s| s.events.clone())
            })
        };
        if let Some(server) = server {
            debug!(central = %self.central, peripheral = %self.peripheral, "Sim link closed by central");
            let _ = server.send(ServerEvent::Disconnected(self.central.clone()));
        }
    }
}
