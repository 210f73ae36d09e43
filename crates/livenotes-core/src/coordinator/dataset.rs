//! The shared dataset and its merge rules
//!
//! Two rules touch the dataset:
//!
//! - **Wholesale replace** (authoritative snapshots): each field present in
//!   the envelope replaces the local collection; projects are re-sorted by
//!   name, case-insensitively. The only path that can shrink the dataset.
//! - **Upsert by id** (`new_note`): a note whose id matches replaces the
//!   existing one in place; anything else is prepended.

use crate::error::{SyncError, SyncResult};
use crate::types::{palette_color, Envelope, Note, Project, DEFAULT_PROJECT_NAME};

/// Where an upserted note landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Replaced { index: usize },
    Prepended,
}

/// Notes (most recent first) and projects (sorted by name)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    notes: Vec<Note>,
    projects: Vec<Project>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a cached or received envelope (missing fields are empty)
    pub fn from_envelope(envelope: Envelope) -> Self {
        let mut dataset = Self::new();
        dataset.replace_wholesale(envelope);
        dataset
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    /// Full snapshot with both fields present
    pub fn snapshot(&self) -> Envelope {
        Envelope::snapshot(self.notes.clone(), self.projects.clone())
    }

    /// Replace every field present in `envelope`. Returns whether anything changed.
    pub fn replace_wholesale(&mut self, envelope: Envelope) -> bool {
        let mut changed = false;
        if let Some(notes) = envelope.notes {
            changed |= self.notes != notes;
            self.notes = notes;
        }
        if let Some(mut projects) = envelope.projects {
            projects.sort_by_key(|p| p.name.to_lowercase());
            changed |= self.projects != projects;
            self.projects = projects;
        }
        changed
    }

    /// Normalize `note` and upsert it by id.
    ///
    /// Title and content are trimmed and must be non-blank. A blank or missing
    /// project becomes `"General"`. A missing color comes from the existing
    /// project of that name, else from the palette. A missing `updatedAt` is
    /// stamped with `now`. The project set itself is left alone; projects only
    /// change through wholesale replace.
    ///
    /// # Errors
    ///
    /// `SyncError::InvalidNote` when title or content is blank.
    pub fn apply_new_note(&mut self, note: Note, now: i64) -> SyncResult<(Note, Upsert)> {
        let note = self.normalize(note, now)?;

        let upsert = match note
            .id
            .and_then(|id| self.notes.iter().position(|n| n.id == Some(id)))
        {
            Some(index) => {
                self.notes[index] = note.clone();
                Upsert::Replaced { index }
            }
            None => {
                self.notes.insert(0, note.clone());
                Upsert::Prepended
            }
        };
        Ok((note, upsert))
    }

    /// Apply the note defaults without storing anything
    pub fn normalize(&self, mut note: Note, now: i64) -> SyncResult<Note> {
        note.title = note.title.trim().to_string();
        note.content = note.content.trim().to_string();
        if note.title.is_empty() || note.content.is_empty() {
            return Err(SyncError::InvalidNote(
                "title and content are required".to_string(),
            ));
        }

        let project = note
            .project_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_PROJECT_NAME)
            .to_string();
        if note.project_color.is_none() {
            note.project_color = Some(self.color_for(&project));
        }
        note.project_name = Some(project);
        note.updated_at.get_or_insert(now);
        Ok(note)
    }

    /// Color of an existing project, else the palette color for the name
    pub fn color_for(&self, project_name: &str) -> String {
        self.projects
            .iter()
            .find(|p| p.name == project_name)
            .map(|p| p.color.clone())
            .unwrap_or_else(|| palette_color(project_name).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: Option<i64>, title: &str) -> Note {
        let mut note = Note::new(title, "body").with_updated_at(1);
        note.id = id;
        note
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut ds = Dataset::from_envelope(Envelope::snapshot(
            vec![note(Some(3), "a"), note(Some(7), "b"), note(Some(9), "c")],
            vec![],
        ));
        let (_, upsert) = ds.apply_new_note(note(Some(7), "X"), 5).unwrap();
        assert_eq!(upsert, Upsert::Replaced { index: 1 });
        assert_eq!(ds.notes().len(), 3);
        assert_eq!(ds.notes()[1].title, "X");
    }

    #[test]
    fn test_upsert_without_id_prepends() {
        let mut ds = Dataset::from_envelope(Envelope::snapshot(vec![note(Some(1), "a")], vec![]));
        let (_, upsert) = ds.apply_new_note(note(None, "new"), 5).unwrap();
        assert_eq!(upsert, Upsert::Prepended);
        assert_eq!(ds.notes().len(), 2);
        assert_eq!(ds.notes()[0].title, "new");
    }

    #[test]
    fn test_unknown_id_prepends() {
        let mut ds = Dataset::from_envelope(Envelope::snapshot(vec![note(Some(1), "a")], vec![]));
        let (_, upsert) = ds.apply_new_note(note(Some(42), "new"), 5).unwrap();
        assert_eq!(upsert, Upsert::Prepended);
        assert_eq!(ds.notes()[0].id, Some(42));
    }

    #[test]
    fn test_defaults() {
        let mut ds = Dataset::new();
        let (stored, _) = ds.apply_new_note(Note::new("  a ", " b\n"), 1234).unwrap();
        assert_eq!(stored.title, "a");
        assert_eq!(stored.content, "b");
        assert_eq!(stored.project_name.as_deref(), Some("General"));
        assert_eq!(stored.project_color.as_deref(), Some(palette_color("General")));
        assert_eq!(stored.updated_at, Some(1234));
    }

    #[test]
    fn test_blank_project_becomes_general() {
        let mut ds = Dataset::new();
        let (stored, _) = ds
            .apply_new_note(Note::new("a", "b").with_project("   "), 1)
            .unwrap();
        assert_eq!(stored.project_name.as_deref(), Some("General"));
    }

    #[test]
    fn test_existing_project_color_wins_over_palette() {
        let mut ds = Dataset::from_envelope(Envelope::snapshot(
            vec![],
            vec![Project::new("General", "#123456")],
        ));
        let (stored, _) = ds.apply_new_note(Note::new("a", "b"), 1).unwrap();
        assert_eq!(stored.project_color.as_deref(), Some("#123456"));

        let (explicit, _) = ds
            .apply_new_note(Note::new("c", "d").with_color("#ABCDEF"), 1)
            .unwrap();
        assert_eq!(explicit.project_color.as_deref(), Some("#ABCDEF"));
        assert_eq!(ds.projects().len(), 1);
    }

    #[test]
    fn test_blank_note_rejected() {
        let mut ds = Dataset::new();
        assert!(matches!(
            ds.apply_new_note(Note::new("  ", "b"), 1),
            Err(SyncError::InvalidNote(_))
        ));
        assert!(matches!(
            ds.apply_new_note(Note::new("a", ""), 1),
            Err(SyncError::InvalidNote(_))
        ));
        assert!(ds.notes().is_empty());
    }

    #[test]
    fn test_wholesale_replace_is_idempotent() {
        let env = Envelope::snapshot(
            vec![note(Some(1), "a"), note(Some(2), "b")],
            vec![Project::new("work", "#1"), Project::new("Alpha", "#2")],
        );
        let mut ds = Dataset::new();
        assert!(ds.replace_wholesale(env.clone()));
        let once = ds.clone();
        assert!(!ds.replace_wholesale(env));
        assert_eq!(ds, once);
        assert_eq!(ds.projects()[0].name, "Alpha");
    }

    #[test]
    fn test_partial_envelope_keeps_missing_fields() {
        let mut ds = Dataset::from_envelope(Envelope::snapshot(
            vec![note(Some(1), "a")],
            vec![Project::new("P", "#1")],
        ));
        ds.replace_wholesale(Envelope {
            notes: Some(vec![]),
            projects: None,
        });
        assert!(ds.notes().is_empty());
        assert_eq!(ds.projects().len(), 1);
    }
}
