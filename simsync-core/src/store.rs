//! In-memory mirror of one bucket's entities.
//!
//! The store is rebuilt from a full index fetch on every connection and then
//! advanced one broadcast change at a time, in the order the server sent
//! them.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::delta::{DeltaCodec, DeltaError, DiffMatchPatch};
use crate::sync::protocol::{Change, EntityReply, FieldOp, Operation};

/// Name of the field holding an entity's synchronized text.
pub const CONTENT_FIELD: &str = "content";

/// Errors raised while building or mutating the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity {id} has no usable content: {reason}")]
    InvalidContent { id: String, reason: String },

    #[error("field '{field}' of entity {id} cannot take {reason}")]
    InvalidFieldValue {
        id: String,
        field: String,
        reason: String,
    },

    #[error("delta for field '{field}' of entity {id} does not fit its current text: {source}")]
    Delta {
        id: String,
        field: String,
        #[source]
        source: DeltaError,
    },
}

/// A synchronized record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub version: u64,
    pub content: String,
    /// Every other server-side field, kept as received.
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Builds an entity from the `data` object the server returns for it.
    pub fn from_data(
        id: impl Into<String>,
        version: u64,
        mut data: Map<String, Value>,
    ) -> Result<Self, StoreError> {
        let id = id.into();
        let content = match data.remove(CONTENT_FIELD) {
            Some(Value::String(content)) => content,
            Some(other) => {
                return Err(StoreError::InvalidContent {
                    id,
                    reason: format!("content is not a string: {}", other),
                })
            }
            None => {
                return Err(StoreError::InvalidContent {
                    id,
                    reason: "content field is missing".to_string(),
                })
            }
        };

        Ok(Self {
            id,
            version,
            content,
            fields: data,
        })
    }

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            content: String::new(),
            fields: Map::new(),
        }
    }
}

/// What applying one change did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The entity after the change; `created` when it was not known before.
    Modified { entity: Entity, created: bool },
    /// The removed entity, or `None` when the id was unknown.
    Deleted { entity: Option<Entity> },
    /// The change does not advance the entity past its known version.
    Stale { known_version: u64 },
}

/// The client-side mirror of a bucket.
pub struct EntityStore {
    cursor: String,
    entities: HashMap<String, Entity>,
    codec: Box<dyn DeltaCodec>,
}

impl EntityStore {
    /// Creates an empty store using the diff-match-patch delta codec.
    pub fn new() -> Self {
        Self::with_codec(DiffMatchPatch)
    }

    pub fn with_codec(codec: impl DeltaCodec + 'static) -> Self {
        Self {
            cursor: String::new(),
            entities: HashMap::new(),
            codec: Box::new(codec),
        }
    }

    /// Replaces the whole store with freshly fetched entities.
    ///
    /// Nothing is replaced if any entity is unusable.
    pub fn bootstrap(
        &mut self,
        cursor: impl Into<String>,
        replies: Vec<EntityReply>,
    ) -> Result<(), StoreError> {
        let mut entities = HashMap::with_capacity(replies.len());
        for reply in replies {
            let data = reply.data.ok_or_else(|| StoreError::InvalidContent {
                id: reply.id.clone(),
                reason: "entity is unknown to the server".to_string(),
            })?;
            let entity = Entity::from_data(reply.id, reply.version, data)?;
            entities.insert(entity.id.clone(), entity);
        }

        self.cursor = cursor.into();
        self.entities = entities;
        Ok(())
    }

    /// Applies one change.
    ///
    /// A failed change leaves the store untouched.
    pub fn apply_change(&mut self, change: &Change) -> Result<Applied, StoreError> {
        let id = change.target_id.as_str();

        if change.operation == Operation::Delete {
            return Ok(Applied::Deleted {
                entity: self.entities.remove(id),
            });
        }

        let existing = self.entities.get(id);
        if let (Some(entity), Some(end_version)) = (existing, change.end_version) {
            if end_version <= entity.version {
                return Ok(Applied::Stale {
                    known_version: entity.version,
                });
            }
        }

        let created = existing.is_none();
        let mut entity = existing.cloned().unwrap_or_else(|| Entity::empty(id));

        for (field, op) in &change.values {
            self.apply_field(&mut entity, field, op)?;
        }
        if let Some(end_version) = change.end_version {
            entity.version = end_version;
        }

        self.entities.insert(entity.id.clone(), entity.clone());
        Ok(Applied::Modified { entity, created })
    }

    fn apply_field(&self, entity: &mut Entity, field: &str, op: &FieldOp) -> Result<(), StoreError> {
        let invalid = |reason: String| StoreError::InvalidFieldValue {
            id: entity.id.clone(),
            field: field.to_string(),
            reason,
        };

        if field == CONTENT_FIELD {
            match op {
                FieldOp::Literal(Value::String(text)) => entity.content = text.clone(),
                FieldOp::Literal(other) => {
                    return Err(invalid(format!("non-string literal {}", other)))
                }
                FieldOp::Remove => entity.content.clear(),
                FieldOp::Delta(delta) => {
                    entity.content = self.apply_delta(entity, field, &entity.content, delta)?
                }
                FieldOp::Unsupported { op, .. } => {
                    tracing::debug!("Leaving {}.{} untouched: op '{}'", entity.id, field, op)
                }
            }
            return Ok(());
        }

        match op {
            FieldOp::Literal(value) => {
                entity.fields.insert(field.to_string(), value.clone());
            }
            FieldOp::Remove => {
                entity.fields.remove(field);
            }
            FieldOp::Delta(delta) => {
                let base = match entity.fields.get(field) {
                    None => "",
                    Some(Value::String(text)) => text.as_str(),
                    Some(other) => return Err(invalid(format!("a delta on {}", other))),
                };
                let text = self.apply_delta(entity, field, base, delta)?;
                entity.fields.insert(field.to_string(), Value::String(text));
            }
            FieldOp::Unsupported { op, .. } => {
                tracing::debug!("Leaving {}.{} untouched: op '{}'", entity.id, field, op)
            }
        }
        Ok(())
    }

    fn apply_delta(
        &self,
        entity: &Entity,
        field: &str,
        base: &str,
        delta: &str,
    ) -> Result<String, StoreError> {
        self.codec
            .apply(base, delta)
            .map_err(|source| StoreError::Delta {
                id: entity.id.clone(),
                field: field.to_string(),
                source,
            })
    }

    /// Opaque checkpoint of the last full index fetch.
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All entities, ordered by id.
    pub fn entities(&self) -> Vec<&Entity> {
        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    /// The codec used for `d` field operations.
    pub fn codec(&self) -> &dyn DeltaCodec {
        self.codec.as_ref()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
