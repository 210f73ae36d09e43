//! Core types for Live Notes
//!
//! Field names follow the JSON the mobile builds and the server exchange
//! (camelCase), so the same structs serve the wire, the cache and the dataset.

use serde::{Deserialize, Serialize};

/// Project name used when a note arrives without one
pub const DEFAULT_PROJECT_NAME: &str = "General";

/// Fixed palette shared by every build; index chosen by [`palette_color`]
pub const PROJECT_PALETTE: [&str; 8] = [
    "#90CAF9", "#FFB74D", "#A5D6A7", "#F48FB1", "#CE93D8", "#FFE082", "#80CBC4", "#B0BEC5",
];

/// A single note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Server-side project row id, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Hex color, e.g. `#90CAF9`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_color: Option<String>,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Note {
    /// Create a note with only title and content set
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            content: content.into(),
            project_id: None,
            project_name: None,
            project_color: None,
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_project(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.project_color = Some(color.into());
        self
    }

    pub fn with_updated_at(mut self, epoch_ms: i64) -> Self {
        self.updated_at = Some(epoch_ms);
        self
    }
}

/// A project (notes are grouped by project name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Unique key within the project set
    pub name: String,
    pub color: String,
}

impl Project {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Partial snapshot of the dataset.
///
/// `None` means "unchanged"; `Some(vec![])` means "clear all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<Note>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<Project>>,
}

impl Envelope {
    /// Full snapshot carrying both collections
    pub fn snapshot(notes: Vec<Note>, projects: Vec<Project>) -> Self {
        Self {
            notes: Some(notes),
            projects: Some(projects),
        }
    }

    /// True when neither field is present (a no-op envelope)
    pub fn is_empty(&self) -> bool {
        self.notes.is_none() && self.projects.is_none()
    }
}

/// Command sent toward the peer holding authoritative-enough state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the peer to push its full snapshot
    RequestState,
    /// Create or replace a note
    NewNote(Note),
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::RequestState => "request_state",
            Command::NewNote(_) => "new_note",
        }
    }
}

/// Resolve a project color from the fixed palette.
///
/// Uses the 31-multiplier string hash over UTF-16 code units with 32-bit
/// wrapping so every build (phone, watch, this crate) agrees on the color.
pub fn palette_color(project_name: &str) -> &'static str {
    let hash = project_name
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    // |i32::MIN| stays negative; MIN is a multiple of 8 so the index is 0 either way.
    let index = (hash.wrapping_abs() % PROJECT_PALETTE.len() as i32).unsigned_abs() as usize;
    PROJECT_PALETTE[index]
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
