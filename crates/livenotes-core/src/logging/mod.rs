//! In-memory connection history
//!
//! A tracing layer mirrors log events into a small ring buffer that a UI
//! can show as "recent activity":
//!
//! ```text
//! tracing::info!(peer = %addr, "Peer connected")
//!        │
//!        ▼
//! DebugLogLayer ──► DebugLog (50 entries, newest first)
//!                     └── "14:02:11 Peer connected peer=AA:BB"
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use livenotes_core::logging::{DebugLog, DebugLogLayer};
//! use tracing_subscriber::prelude::*;
//!
//! let log = DebugLog::new();
//! tracing_subscriber::registry()
//!     .with(DebugLogLayer::new(log.clone()))
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//!
//! for line in log.lines() {
//!     println!("{}", line);
//! }
//! ```

pub mod layer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use parking_lot::Mutex;

pub use layer::DebugLogLayer;

/// Number of entries kept
pub const DEBUG_LOG_CAPACITY: usize = 50;

/// One captured log event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Epoch milliseconds
    pub at: i64,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Local.timestamp_millis_opt(self.at).single() {
            Some(time) => write!(f, "{} {}", time.format("%H:%M:%S"), self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        for (name, value) in &self.fields {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

/// Bounded, newest-first log shared between the layer and readers
#[derive(Debug, Clone)]
pub struct DebugLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl DebugLog {
    pub fn new() -> Self {
        Self::with_capacity(DEBUG_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    /// Entries, newest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Rendered entries, newest first
    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new()
    }
}
