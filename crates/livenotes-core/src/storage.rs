//! Durable snapshot cache
//!
//! A single JSON document (`cached_state.json`) holding the last-known
//! envelope. Read once at startup, overwritten after every mutation.
//!
//! - An absent or unreadable cache hydrates as "no cache", never as an error.
//! - Writes go to a sibling temp file that is renamed over the cache, so a
//!   crash mid-write leaves the previous snapshot intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::codec::{decode, encode};
use crate::types::Envelope;

/// File name of the cache inside the data directory
pub const CACHE_FILE_NAME: &str = "cached_state.json";

/// Snapshot cache rooted in a data directory
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    /// Cache stored as `<data_dir>/cached_state.json`
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(CACHE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached envelope. `None` when absent or corrupt.
    pub fn load(&self) -> Option<Envelope> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot cache");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot cache unreadable, starting empty");
                return None;
            }
        };
        match decode(&bytes) {
            Ok(envelope) => {
                debug!(
                    path = %self.path.display(),
                    notes = envelope.notes.as_ref().map_or(0, Vec::len),
                    projects = envelope.projects.as_ref().map_or(0, Vec::len),
                    "Snapshot cache loaded"
                );
                Some(envelope)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot cache corrupt, starting empty");
                None
            }
        }
    }

    /// Overwrite the cache with `envelope`
    pub fn store(&self, envelope: &Envelope) -> SyncResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SyncError::Storage("cache path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&encode(envelope))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Snapshot cache written");
        Ok(())
    }
}
