//! Live Notes Core Library
//!
//! Keeps a small set of notes, grouped into projects, consistent across three
//! peers that can each create notes.
//!
//! ## Overview
//!
//! ```text
//!            WebSocket                 radio (GATT)
//!  server ◄─────────────► hub ◄─────────────────────► satellite
//!                          ▲   newline JSON over TCP     ▲
//!                          └──────── (fallback) ─────────┘
//! ```
//!
//! - The **server** is authoritative: its snapshots replace the hub's dataset.
//! - The **hub** holds the dataset, pushes snapshots to satellites, and
//!   relays their notes to the server.
//! - A **satellite** mirrors the hub and forwards its own notes as commands.
//!
//! Each link is a [`Transport`](transport::Transport) with its own connection
//! state machine. A single [`SyncCoordinator`] task applies everything they
//! receive and publishes the resulting dataset and [`StatusReport`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use livenotes_core::{EngineConfig, Note, Radios, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::load("livenotes.toml")?;
//!     let engine = SyncEngine::start(config, Radios::none()).await?;
//!
//!     engine.add_note(Note::new("Standup", "ship the fallback").with_project("Work")).await?;
//!
//!     let mut status = engine.subscribe_status();
//!     while status.changed().await.is_ok() {
//!         println!("{}", *status.borrow());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod radio;
pub mod status;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{EngineConfig, Role};
pub use coordinator::{CoordinatorMessage, Dataset, SyncCoordinator, Upsert};
pub use engine::{Radios, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use logging::{DebugLog, DebugLogLayer};
pub use status::{status, HealthFlags, StatusLabel, StatusReport};
pub use storage::SnapshotCache;
pub use sync::{decode, decode_command, encode, encode_command, DecodeError, PayloadMode};
pub use transport::{ConnectionState, Transport, TransportEvent, TransportKind};
pub use types::*;
