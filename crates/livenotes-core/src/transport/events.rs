//! Connection states and transport events
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionState: per-transport state machine position          │
//! │  ├── Idle                                                       │
//! │  ├── Advertising / Scanning { filtered }                        │
//! │  ├── Connecting → Connected → Ready                             │
//! │  ├── Disconnected (loops back after backoff)                    │
//! │  └── Unavailable (capability missing, waits for start())        │
//! │                                                                 │
//! │  TransportEvent: what a transport reports to the coordinator    │
//! │  ├── Connected / Ready / Disconnected                           │
//! │  ├── Inbound(Envelope)                                          │
//! │  └── InboundCommand                                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::coordinator::CoordinatorMessage;
use crate::types::{Command, Envelope};

/// Which transport an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// WebSocket to the authoritative server
    ServerLink,
    /// Hub-side radio (GATT server)
    Peripheral,
    /// Satellite-side radio (GATT client)
    Central,
    /// Newline-delimited JSON stream socket
    Fallback,
}

impl TransportKind {
    /// True for transports that talk to the other device rather than the server
    pub fn is_peer(&self) -> bool {
        !matches!(self, TransportKind::ServerLink)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::ServerLink => "server",
            TransportKind::Peripheral => "peripheral",
            TransportKind::Central => "central",
            TransportKind::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// Position of a transport in its connection state machine
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not started, or stopped
    #[default]
    Idle,
    /// Hub is advertising and waiting for peers
    Advertising,
    /// Satellite is scanning; `filtered` is false after the fallback broad scan
    Scanning { filtered: bool },
    /// Connection attempt in flight
    Connecting,
    /// Link up, bidirectional delivery not yet confirmed
    Connected,
    /// Link up and delivery confirmed (e.g. subscription acknowledged)
    Ready,
    /// Link lost; a retry is scheduled unless the policy says otherwise
    Disconnected,
    /// Capability missing; no retry until `start()` is called again
    Unavailable(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Advertising => write!(f, "Advertising"),
            ConnectionState::Scanning { filtered: true } => write!(f, "Scanning"),
            ConnectionState::Scanning { filtered: false } => write!(f, "Scanning (broad)"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Unavailable(reason) => write!(f, "Unavailable: {}", reason),
        }
    }
}

/// Events emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peer link came up
    Connected { peer: String },
    /// A peer link confirmed bidirectional delivery
    Ready { peer: String },
    /// A link was lost. `peer` is `None` when the whole transport went down.
    Disconnected { peer: Option<String>, reason: String },
    /// A snapshot arrived
    Inbound(Envelope),
    /// A command arrived from a peer
    InboundCommand { peer: String, command: Command },
}

/// A transport event together with its source
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub source: TransportKind,
    pub event: TransportEvent,
}

/// Handle a transport uses to enqueue events onto the coordinator's queue
#[derive(Clone)]
pub struct EventSink {
    source: TransportKind,
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl EventSink {
    pub fn new(source: TransportKind, tx: mpsc::UnboundedSender<CoordinatorMessage>) -> Self {
        Self { source, tx }
    }

    pub fn source(&self) -> TransportKind {
        self.source
    }

    /// Enqueue an event. Dropped silently once the coordinator has shut down.
    pub fn emit(&self, event: TransportEvent) {
        trace!(source = %self.source, ?event, "Emitting transport event");
        let _ = self.tx.send(CoordinatorMessage::Transport(TaggedEvent {
            source: self.source,
            event,
        }));
    }
}

/// Shared, cheaply readable connection state
#[derive(Clone, Default)]
pub struct StateCell {
    inner: Arc<RwLock<ConnectionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        self.inner.read().clone()
    }

    /// Set the state, logging real transitions
    pub fn set(&self, kind: TransportKind, next: ConnectionState) {
        let mut state = self.inner.write();
        if *state != next {
            debug!(transport = %kind, from = %*state, to = %next, "State transition");
            *state = next;
        }
    }
}
