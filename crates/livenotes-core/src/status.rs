//! User-facing sync status
//!
//! [`status`] is a pure function of four inputs, evaluated top to bottom:
//!
//! | # | Condition                  | Label                           |
//! |---|----------------------------|---------------------------------|
//! | 1 | peer && syncing            | syncing                         |
//! | 2 | peer && last synced        | synced at HH:MM:SS              |
//! | 3 | peer                       | connected, awaiting first sync  |
//! | 4 | server && !peer            | server only                     |
//! | 5 | !server && peer            | peer only, server offline       |
//! | 6 | otherwise                  | disconnected                    |
//!
//! Row 5 can never match: any `peer` input is taken by rows 1-3. It stays in
//! the chain so the precedence reads exactly as the table.

use std::fmt;

use chrono::{Local, TimeZone};
use serde::Serialize;

/// Status label shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusLabel {
    Syncing,
    /// Epoch milliseconds of the last applied snapshot
    SyncedAt { at: i64 },
    AwaitingFirstSync,
    ServerOnly,
    PeerOnly,
    Disconnected,
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLabel::Syncing => f.write_str("syncing"),
            StatusLabel::SyncedAt { at } => match Local.timestamp_millis_opt(*at).single() {
                Some(time) => write!(f, "synced at {}", time.format("%H:%M:%S")),
                None => f.write_str("synced"),
            },
            StatusLabel::AwaitingFirstSync => f.write_str("connected, awaiting first sync"),
            StatusLabel::ServerOnly => f.write_str("server only"),
            StatusLabel::PeerOnly => f.write_str("peer only, server offline"),
            StatusLabel::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Derive the status label
pub fn status(
    server_ready: bool,
    peer_ready: bool,
    syncing: bool,
    last_synced_at: Option<i64>,
) -> StatusLabel {
    if peer_ready && syncing {
        StatusLabel::Syncing
    } else if let (true, Some(at)) = (peer_ready, last_synced_at) {
        StatusLabel::SyncedAt { at }
    } else if peer_ready {
        StatusLabel::AwaitingFirstSync
    } else if server_ready && !peer_ready {
        StatusLabel::ServerOnly
    } else if !server_ready && peer_ready {
        StatusLabel::PeerOnly
    } else {
        StatusLabel::Disconnected
    }
}

/// Structured flags behind the label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthFlags {
    pub server_ready: bool,
    pub peer_ready: bool,
    pub syncing: bool,
    pub last_synced_at: Option<i64>,
    /// Transports stuck on a missing capability, with the reason
    pub unavailable: Vec<String>,
}

/// Label plus flags, published after every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub label: StatusLabel,
    pub flags: HealthFlags,
}

impl StatusReport {
    pub fn from_flags(flags: HealthFlags) -> Self {
        Self {
            label: status(
                flags.server_ready,
                flags.peer_ready,
                flags.syncing,
                flags.last_synced_at,
            ),
            flags,
        }
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::from_flags(HealthFlags::default())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        for reason in &self.flags.unavailable {
            write!(f, " [{}]", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syncing_regardless_of_timestamp() {
        assert_eq!(status(true, true, true, Some(5)), StatusLabel::Syncing);
        assert_eq!(status(true, true, true, None), StatusLabel::Syncing);
        assert_eq!(status(false, true, true, None), StatusLabel::Syncing);
    }

    #[test]
    fn test_known_inputs() {
        assert_eq!(status(false, false, false, None), StatusLabel::Disconnected);
        assert_eq!(status(true, false, false, None), StatusLabel::ServerOnly);
        assert_eq!(status(true, true, false, Some(9)), StatusLabel::SyncedAt { at: 9 });
        assert_eq!(status(false, true, false, None), StatusLabel::AwaitingFirstSync);
    }

    #[test]
    fn test_total_over_input_space() {
        for server in [false, true] {
            for peer in [false, true] {
                for syncing in [false, true] {
                    for last in [None, Some(0)] {
                        let label = status(server, peer, syncing, last);
                        assert_ne!(label, StatusLabel::PeerOnly);
                        if !peer {
                            let expected = if server {
                                StatusLabel::ServerOnly
                            } else {
                                StatusLabel::Disconnected
                            };
                            assert_eq!(label, expected);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StatusLabel::Syncing.to_string(), "syncing");
        assert_eq!(StatusLabel::ServerOnly.to_string(), "server only");
        assert_eq!(
            StatusLabel::AwaitingFirstSync.to_string(),
            "connected, awaiting first sync"
        );
        let synced = StatusLabel::SyncedAt { at: 0 }.to_string();
        assert!(synced.starts_with("synced at "));
        assert_eq!(synced.len(), "synced at 00:00:00".len());
    }

    #[test]
    fn test_report_from_flags() {
        let report = StatusReport::from_flags(HealthFlags {
            server_ready: true,
            unavailable: vec!["central: radio unavailable".into()],
            ..Default::default()
        });
        assert_eq!(report.label, StatusLabel::ServerOnly);
        assert_eq!(report.to_string(), "server only [central: radio unavailable]");
    }
}
