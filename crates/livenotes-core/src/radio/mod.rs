//! Short-range radio seam for the primary transport
//!
//! The host platform owns the radio. The engine talks to it through two
//! traits that mirror the GATT model:
//!
//! ```text
//!   hub                                        satellite
//! ┌──────────────────────┐                 ┌──────────────────────┐
//! │ PeripheralRadio      │   advertise     │ CentralRadio         │
//! │  open_server ──────► │ ──────────────► │  start_scan          │
//! │  ServerEvent stream  │ ◄── connect ─── │  connect ─► GattClient│
//! │  notify(data) ─────► │ ── notify ────► │  ClientEvent stream  │
//! │  Read/Write replies  │ ◄── read/write ─│  read / write        │
//! └──────────────────────┘                 └──────────────────────┘
//! ```
//!
//! Callback-style platform APIs map onto channels: server-side requests carry
//! a `oneshot` reply sender instead of a request id, and asynchronous client
//! notifications arrive on an `mpsc` receiver.
//!
//! [`sim`] provides an in-memory radio used by the tests and the `demo`
//! command.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::SyncResult;

pub mod sim;

/// Primary service identifier (advertised by the hub)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa9e86dbd_0cd6_4a4a_a904_3622fa6b49f4);
/// Data channel: readable + notifiable snapshot
pub const DATA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xb9e86dbd_0cd6_4a4a_a904_3622fa6b49f4);
/// Command channel: writable
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xc9e86dbd_0cd6_4a4a_a904_3622fa6b49f4);
/// Standard client characteristic configuration descriptor
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Descriptor value that turns notifications on
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// Descriptor value that turns notifications off
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Radio address of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifiers of the service hosted by the hub.
///
/// Hub and satellite builds must agree on every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattLayout {
    pub service: Uuid,
    pub data: Uuid,
    pub command: Uuid,
    pub client_config: Uuid,
}

impl GattLayout {
    /// The Live Notes service layout
    pub const LIVE_NOTES: GattLayout = GattLayout {
        service: SERVICE_UUID,
        data: DATA_CHARACTERISTIC_UUID,
        command: COMMAND_CHARACTERISTIC_UUID,
        client_config: CLIENT_CONFIG_DESCRIPTOR_UUID,
    };
}

impl Default for GattLayout {
    fn default() -> Self {
        Self::LIVE_NOTES
    }
}

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub device: DeviceAddress,
    pub name: Option<String>,
    /// Service ids included in the advertisement payload (may be empty)
    pub services: Vec<Uuid>,
}

/// Scan filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Only devices advertising this service id
    Service(Uuid),
    /// Every advertising device
    Any,
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        match self {
            ScanFilter::Service(id) => advertisement.services.contains(id),
            ScanFilter::Any => true,
        }
    }
}

/// Reply to a server-side read or write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattResponse {
    Success(Bytes),
    Failure,
}

/// Events delivered to the hub's GATT server
#[derive(Debug)]
pub enum ServerEvent {
    Connected(DeviceAddress),
    Disconnected(DeviceAddress),
    /// Characteristic read at `offset`
    Read {
        device: DeviceAddress,
        characteristic: Uuid,
        offset: usize,
        reply: oneshot::Sender<GattResponse>,
    },
    /// Characteristic write; `reply` is `None` for write-without-response
    Write {
        device: DeviceAddress,
        characteristic: Uuid,
        value: Bytes,
        reply: Option<oneshot::Sender<GattResponse>>,
    },
    /// Descriptor write (subscription changes)
    DescriptorWrite {
        device: DeviceAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
        reply: Option<oneshot::Sender<GattResponse>>,
    },
}

/// Events delivered to a satellite's GATT connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Notification { characteristic: Uuid, value: Bytes },
    Disconnected { reason: String },
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Hub-side radio: hosts the GATT server and advertises it
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Open a GATT server hosting `layout`.
    ///
    /// # Errors
    ///
    /// `SyncError::CapabilityUnavailable` when the radio is off or permissions
    /// are missing.
    async fn open_server(&self, layout: &GattLayout)
        -> SyncResult<mpsc::UnboundedReceiver<ServerEvent>>;

    /// Start connectable advertising of `service`
    async fn start_advertising(&self, service: Uuid) -> SyncResult<()>;

    async fn stop_advertising(&self);

    /// Send a notification to one connected device
    async fn notify(&self, device: &DeviceAddress, characteristic: Uuid, value: Bytes)
        -> SyncResult<()>;

    /// Close the server and drop every link
    async fn close_server(&self);
}

/// An open GATT connection from the satellite's side
#[async_trait]
pub trait GattClient: Send + Sync {
    fn device(&self) -> &DeviceAddress;

    async fn discover_services(&self) -> SyncResult<Vec<DiscoveredService>>;

    /// Write a descriptor and wait for the acknowledgement
    async fn write_descriptor(&self, characteristic: Uuid, descriptor: Uuid, value: &[u8])
        -> SyncResult<()>;

    /// Read a characteristic value starting at `offset`
    async fn read(&self, characteristic: Uuid, offset: usize) -> SyncResult<Bytes>;

    /// Write a characteristic value and wait for the acknowledgement
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> SyncResult<()>;

    async fn disconnect(&self);
}

/// Client handle plus its event stream
pub struct GattConnection {
    pub client: Arc<dyn GattClient>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Satellite-side radio: scans and connects
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Start scanning. Advertisements arrive until [`CentralRadio::stop_scan`].
    ///
    /// # Errors
    ///
    /// `SyncError::CapabilityUnavailable` when the radio is off or permissions
    /// are missing.
    async fn start_scan(&self, filter: ScanFilter)
        -> SyncResult<mpsc::UnboundedReceiver<Advertisement>>;

    async fn stop_scan(&self);

    async fn connect(&self, device: &DeviceAddress) -> SyncResult<GattConnection>;
}
