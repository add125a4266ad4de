//! Mirrors a bucket of files into a local directory.
//!
//! Each entity's content is a JSON-encoded [`SyncedFile`]: a path relative to
//! the sync directory plus the file bytes. Remote changes are written to
//! disk through [`BucketState`], and local filesystem events become outgoing
//! changes through [`LocalBridge::handle_local_event`].
//!
//! Echo suppression uses two single-slot flags. After a local change is
//! produced, the next remote update is assumed to be its echo and skipped.
//! Before the bridge touches a file itself, it remembers that path, and the
//! next local event for it is assumed to be caused by that write and
//! skipped. Several rapid edits of the same path can therefore suppress the
//! wrong event.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::bucket::{BucketState, StateError};
use crate::store::{Applied, Entity, EntityStore, CONTENT_FIELD};
use crate::sync::protocol::{generate_entity_id, Change, ChangeRejection, FieldOp};

/// Errors raised while mirroring files.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("entity {id} does not hold a synced file: {source}")]
    Payload {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode synced file {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsafe path '{0}'")]
    UnsafePath(String),

    #[error("path {} is outside the sync directory", .0.display())]
    OutsideRoot(PathBuf),

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| BridgeError::Io {
            action,
            path,
            source,
        }
    }
}

/// The content payload of a file entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedFile {
    #[serde(rename = "FilePath")]
    pub path: String,
    #[serde(rename = "FileContent", with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl SyncedFile {
    pub fn decode(entity: &Entity) -> Result<Self, BridgeError> {
        serde_json::from_str(&entity.content).map_err(|source| BridgeError::Payload {
            id: entity.id.clone(),
            source,
        })
    }

    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|source| BridgeError::Encode {
            path: self.path.clone(),
            source,
        })
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A filesystem notification, as reported by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// The file was written or moved into place.
    Written(PathBuf),
    /// The file was removed or moved away.
    Removed(PathBuf),
}

impl LocalEvent {
    pub fn path(&self) -> &Path {
        match self {
            LocalEvent::Written(path) | LocalEvent::Removed(path) => path,
        }
    }
}

/// Keeps a directory and a file bucket in step.
#[derive(Debug)]
pub struct LocalBridge {
    root: PathBuf,
    path_to_id: HashMap<String, String>,
    id_to_path: HashMap<String, String>,
    ignore_next_remote_apply: bool,
    ignore_next_local_event: Option<String>,
}

impl LocalBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path_to_id: HashMap::new(),
            id_to_path: HashMap::new(),
            ignore_next_remote_apply: false,
            ignore_next_local_event: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id_for(&self, path: &str) -> Option<&str> {
        self.path_to_id.get(path).map(String::as_str)
    }

    pub fn path_for(&self, id: &str) -> Option<&str> {
        self.id_to_path.get(id).map(String::as_str)
    }

    /// Number of mirrored files.
    pub fn len(&self) -> usize {
        self.path_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_to_id.is_empty()
    }

    /// Turns a filesystem event into the change to send, if any.
    ///
    /// `store` is read to find the version a write is based on; it must be
    /// the store of the bucket this bridge belongs to.
    pub fn handle_local_event(
        &mut self,
        store: &EntityStore,
        event: &LocalEvent,
    ) -> Result<Option<Change>, BridgeError> {
        let path = self.relative_path(event.path())?;

        if self.ignore_next_local_event.as_deref() == Some(path.as_str()) {
            self.ignore_next_local_event = None;
            tracing::debug!("Ignoring event for {} caused by a remote change", path);
            return Ok(None);
        }

        match event {
            LocalEvent::Written(_) => self.local_write(store, path),
            LocalEvent::Removed(_) => Ok(self.local_remove(path)),
        }
    }

    /// Called once the directory watch is in place. Files written before
    /// that produce no events, so nothing is left to suppress.
    pub fn watching_started(&mut self) {
        if let Some(path) = self.ignore_next_local_event.take() {
            tracing::debug!("No event will follow the earlier write of {}", path);
        }
    }

    fn local_write(
        &mut self,
        store: &EntityStore,
        path: String,
    ) -> Result<Option<Change>, BridgeError> {
        let full_path = self.root.join(&path);
        if full_path.is_dir() {
            return Ok(None);
        }
        let content = match fs::read(&full_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{} vanished before it could be read", path);
                return Ok(None);
            }
            Err(e) => return Err(BridgeError::io("read", &full_path)(e)),
        };

        let file = SyncedFile { path, content };
        let existing = self
            .path_to_id
            .get(&file.path)
            .and_then(|id| store.get(id));
        if let Some(entity) = existing {
            if SyncedFile::decode(entity).ok().as_ref() == Some(&file) {
                tracing::debug!("{} is unchanged, nothing to send", file.path);
                return Ok(None);
            }
        }

        let mut values = BTreeMap::new();
        values.insert(
            CONTENT_FIELD.to_string(),
            FieldOp::Literal(Value::String(file.encode()?)),
        );

        let change = match existing {
            Some(entity) => {
                Change::modify(entity.id.as_str(), values).with_source_version(entity.version)
            }
            None => {
                let id = match self.path_to_id.get(&file.path) {
                    Some(id) => id.clone(),
                    None => generate_entity_id(),
                };
                insert_creation_fields(&mut values);
                tracing::info!("New file {} becomes entity {}", file.path, id);
                self.path_to_id.insert(file.path.clone(), id.clone());
                self.id_to_path.insert(id.clone(), file.path);
                Change::modify(id, values)
            }
        };

        self.ignore_next_remote_apply = true;
        Ok(Some(change))
    }

    fn local_remove(&mut self, path: String) -> Option<Change> {
        let Some(id) = self.path_to_id.remove(&path) else {
            tracing::debug!("{} is not synced, ignoring removal", path);
            return None;
        };
        self.id_to_path.remove(&id);

        tracing::info!("File {} removed, deleting entity {}", path, id);
        self.ignore_next_remote_apply = true;
        Some(Change::delete(id))
    }

    /// Maps a watcher path to the wire path, relative to the sync directory.
    fn relative_path(&self, path: &Path) -> Result<String, BridgeError> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| BridgeError::OutsideRoot(path.to_path_buf()))?
        } else {
            path
        };
        wire_path(relative)
    }

    fn write_file(&self, file: &SyncedFile) -> Result<(), BridgeError> {
        let full_path = self.root.join(&file.path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(BridgeError::io("create", parent))?;
        }
        fs::write(&full_path, &file.content).map_err(BridgeError::io("write", &full_path))
    }

    fn remove_file(&self, path: &str) -> Result<(), BridgeError> {
        let full_path = self.root.join(path);
        match fs::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::io("remove", &full_path)(e)),
        }
    }

    fn record(&mut self, id: &str, path: String) -> Option<String> {
        if let Some(previous) = self.path_to_id.insert(path.clone(), id.to_string()) {
            if previous != id {
                tracing::warn!("{} now belongs to entity {} instead of {}", path, id, previous);
                self.id_to_path.remove(&previous);
            }
        }
        match self.id_to_path.insert(id.to_string(), path.clone()) {
            Some(old) if old != path => {
                self.path_to_id.remove(&old);
                Some(old)
            }
            _ => None,
        }
    }

    fn apply_remote(&mut self, change: &Change, applied: &Applied) -> Result<(), BridgeError> {
        match applied {
            Applied::Modified { entity, .. } => {
                let mut file = SyncedFile::decode(entity)?;
                file.path = wire_path(Path::new(&file.path))?;

                self.ignore_next_local_event = Some(file.path.clone());
                self.write_file(&file)?;
                if let Some(old_path) = self.record(&entity.id, file.path.clone()) {
                    tracing::info!("Entity {} moved from {} to {}", entity.id, old_path, file.path);
                    self.remove_file(&old_path)?;
                } else {
                    tracing::info!("Wrote {} from entity {}", file.path, entity.id);
                }
            }
            Applied::Deleted { .. } => {
                if let Some(path) = self.id_to_path.remove(&change.target_id) {
                    self.path_to_id.remove(&path);
                    self.ignore_next_local_event = Some(path.clone());
                    self.remove_file(&path)?;
                    tracing::info!("Removed {} for deleted entity {}", path, change.target_id);
                }
            }
            Applied::Stale { .. } => {}
        }
        Ok(())
    }
}

impl BucketState for LocalBridge {
    fn init(&mut self, _cursor: &str, entities: &[Entity]) -> Result<(), StateError> {
        self.path_to_id.clear();
        self.id_to_path.clear();
        self.ignore_next_remote_apply = false;
        self.ignore_next_local_event = None;

        for entity in entities {
            let mut file = SyncedFile::decode(entity)?;
            file.path = wire_path(Path::new(&file.path))?;
            self.write_file(&file)?;
            self.record(&entity.id, file.path);
        }

        tracing::info!("Mirrored {} file(s) into {}", self.len(), self.root.display());
        Ok(())
    }

    fn update(&mut self, change: &Change, applied: &Applied) -> Result<(), StateError> {
        if self.ignore_next_remote_apply {
            self.ignore_next_remote_apply = false;
            tracing::debug!("Suppressed echo of change {} for {}", change.ccid, change.target_id);
            return Ok(());
        }

        self.apply_remote(change, applied)?;
        Ok(())
    }

    fn rejected(&mut self, _rejection: &ChangeRejection) {
        // The rejection replaces the echo this flag was waiting for.
        self.ignore_next_remote_apply = false;
    }
}

/// Literal fields the note server requires on a new entity. Only trashed
/// entities can be deleted there, so files are created as already trashed.
fn insert_creation_fields(values: &mut BTreeMap<String, FieldOp>) {
    let now = chrono::Utc::now().timestamp();
    let fields = [
        ("creationDate", json!(now)),
        ("modificationDate", json!(now)),
        ("deleted", json!(true)),
        ("publishURL", json!("")),
        ("shareURL", json!("")),
        ("systemTags", json!([])),
        ("tags", json!([])),
    ];
    for (name, value) in fields {
        values.insert(name.to_string(), FieldOp::Literal(value));
    }
}

/// Joins the normal components of a relative path with `/`.
fn wire_path(path: &Path) -> Result<String, BridgeError> {
    let unsafe_path = || BridgeError::UnsafePath(path.display().to_string());
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(unsafe_path)?),
            Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path());
    }
    Ok(parts.join("/"))
}
