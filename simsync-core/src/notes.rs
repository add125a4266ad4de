//! Plain note mirroring.
//!
//! [`NoteMirror`] logs every note the server changes and remembers the
//! first one as the active note. [`NoteMirror::append_change`] builds a
//! delta change that appends a line to the active note. Only one append is
//! in flight at a time: the next waits until the server echoes or rejects
//! the previous one, so every delta is based on an acknowledged version.

use std::collections::BTreeMap;

use crate::bucket::{BucketState, StateError};
use crate::store::{Applied, Entity, EntityStore, CONTENT_FIELD};
use crate::sync::protocol::{Change, ChangeRejection, FieldOp};

/// Bucket state for a note bucket.
#[derive(Debug, Default)]
pub struct NoteMirror {
    active: Option<String>,
    /// ccid of the append still waiting for its echo.
    pending: Option<String>,
}

impl NoteMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the note appended to, once one has been changed remotely.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_active(&mut self, id: impl Into<String>) {
        self.active = Some(id.into());
    }

    /// Whether an append is still waiting for the server.
    pub fn append_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A change appending `line` to the active note, computed against the
    /// note's current text and version. `None` while there is no active
    /// note or the previous append is unacknowledged.
    pub fn append_change(&mut self, store: &EntityStore, line: &str) -> Option<Change> {
        if self.pending.is_some() {
            return None;
        }
        let note = store.get(self.active.as_deref()?)?;
        let updated = format!("{}{}", note.content, line);
        let delta = store.codec().delta(&note.content, &updated);

        let mut values = BTreeMap::new();
        values.insert(CONTENT_FIELD.to_string(), FieldOp::Delta(delta));
        let change = Change::modify(note.id.as_str(), values).with_source_version(note.version);
        self.pending = Some(change.ccid.clone());
        Some(change)
    }
}

impl BucketState for NoteMirror {
    fn init(&mut self, cursor: &str, entities: &[Entity]) -> Result<(), StateError> {
        tracing::info!("Mirroring {} note(s) at {}", entities.len(), cursor);
        self.pending = None;
        if let Some(active) = &self.active {
            if !entities.iter().any(|note| &note.id == active) {
                tracing::info!("Active note {} is gone", active);
                self.active = None;
            }
        }
        Ok(())
    }

    fn update(&mut self, change: &Change, applied: &Applied) -> Result<(), StateError> {
        if self.pending.as_deref() == Some(change.ccid.as_str()) {
            self.pending = None;
        }
        match applied {
            Applied::Modified { entity, created } => {
                if !change.values.contains_key(CONTENT_FIELD) {
                    return Ok(());
                }
                if *created {
                    tracing::info!("New note {}:\n{}", entity.id, entity.content);
                } else {
                    tracing::info!("Note {} is now:\n{}", entity.id, entity.content);
                }
                if self.active.is_none() {
                    tracing::info!("Appending to note {} from now on", entity.id);
                    self.active = Some(entity.id.clone());
                }
            }
            Applied::Deleted { entity: Some(note) } => {
                tracing::info!("Note {} was deleted", note.id);
                if self.active.as_deref() == Some(note.id.as_str()) {
                    self.active = None;
                }
            }
            Applied::Deleted { entity: None } | Applied::Stale { .. } => {}
        }
        Ok(())
    }

    fn rejected(&mut self, rejection: &ChangeRejection) {
        if let Some(ccid) = &self.pending {
            if rejection.ccids.is_empty() || rejection.ccids.contains(ccid) {
                tracing::warn!("Append {} was rejected ({})", ccid, rejection.error);
                self.pending = None;
            }
        }
    }
}

/// The line the `notes` command appends on each tick.
pub fn timestamp_line() -> String {
    format!(
        "Appended by simsync at {}.\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z")
    )
}
