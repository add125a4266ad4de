//! The mirror shared between the sync engine and its caller.
//!
//! A [`Bucket`] pairs the engine's [`EntityStore`] with caller state that
//! implements [`BucketState`]. Both live behind one lock ([`SharedBucket`]):
//! the engine's reader takes it for every broadcast change, and other
//! change producers (a filesystem watcher, a timer) take it to read the
//! mirror or update their own indices.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::store::{Applied, Entity, EntityStore};
use crate::sync::protocol::{Broadcast, Change, ChangeRejection, EntityReply};
use crate::sync::SyncError;

/// Error type returned by [`BucketState`] callbacks.
pub type StateError = Box<dyn std::error::Error + Send + Sync>;

/// Callbacks the engine drives as the mirror changes.
pub trait BucketState: Send {
    /// Called once per connection, after the full index fetch.
    fn init(&mut self, cursor: &str, entities: &[Entity]) -> Result<(), StateError>;

    /// Called after each broadcast change has been applied to the store.
    /// Stale changes are never passed on.
    fn update(&mut self, change: &Change, applied: &Applied) -> Result<(), StateError>;

    /// Called when the server refuses a change this client submitted.
    fn rejected(&mut self, _rejection: &ChangeRejection) {}
}

/// Entity store plus caller state.
pub struct Bucket<S> {
    store: EntityStore,
    state: S,
}

/// A bucket behind the lock all tasks share.
pub type SharedBucket<S> = Arc<Mutex<Bucket<S>>>;

impl<S: BucketState> Bucket<S> {
    pub fn new(state: S) -> Self {
        Self::with_store(EntityStore::new(), state)
    }

    pub fn with_store(store: EntityStore, state: S) -> Self {
        Self { store, state }
    }

    /// Wraps the bucket for sharing between tasks.
    pub fn shared(self) -> SharedBucket<S> {
        Arc::new(Mutex::new(self))
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Read access to the store alongside write access to the state.
    pub fn parts_mut(&mut self) -> (&EntityStore, &mut S) {
        (&self.store, &mut self.state)
    }

    /// Rebuilds the store from a full fetch and hands it to the state.
    pub fn bootstrap(&mut self, cursor: String, replies: Vec<EntityReply>) -> Result<(), SyncError> {
        self.store
            .bootstrap(cursor, replies)
            .map_err(|e| SyncError::InvalidBootstrapData(e.to_string()))?;

        let entities: Vec<Entity> = self.store.entities().into_iter().cloned().collect();
        self.state
            .init(self.store.cursor(), &entities)
            .map_err(|e| SyncError::StateError(e.to_string()))
    }

    /// Applies one element of a change broadcast.
    pub fn receive(&mut self, broadcast: &Broadcast) -> Result<(), SyncError> {
        let change = match broadcast {
            Broadcast::Change(change) => change,
            Broadcast::Rejected(rejection) => {
                tracing::warn!(
                    "Server rejected change(s) {:?} for {} with error {}",
                    rejection.ccids,
                    rejection.id,
                    rejection.error
                );
                self.state.rejected(rejection);
                return Ok(());
            }
        };

        let applied = self.store.apply_change(change)?;
        if let Applied::Stale { known_version } = applied {
            tracing::debug!(
                "Skipping stale change {} for {} (known version {})",
                change.ccid,
                change.target_id,
                known_version
            );
            return Ok(());
        }

        tracing::debug!(
            "Applied change {} to {} ({:?})",
            change.ccid,
            change.target_id,
            change.end_version
        );

        self.state
            .update(change, &applied)
            .map_err(|e| SyncError::StateError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::{FieldOp, Operation};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder {
        inits: Vec<(String, usize)>,
        updates: Vec<(String, Operation)>,
        rejections: usize,
        fail_updates: bool,
    }

    impl BucketState for Recorder {
        fn init(&mut self, cursor: &str, entities: &[Entity]) -> Result<(), StateError> {
            self.inits.push((cursor.to_string(), entities.len()));
            Ok(())
        }

        fn update(&mut self, change: &Change, _applied: &Applied) -> Result<(), StateError> {
            if self.fail_updates {
                return Err("refused".into());
            }
            self.updates
                .push((change.target_id.clone(), change.operation));
            Ok(())
        }

        fn rejected(&mut self, _rejection: &ChangeRejection) {
            self.rejections += 1;
        }
    }

    fn hello_reply() -> EntityReply {
        EntityReply {
            id: "a".to_string(),
            version: 1,
            data: json!({"content": "hello"}).as_object().cloned(),
        }
    }

    fn append(end_version: u64, delta: &str) -> Broadcast {
        let mut values = BTreeMap::new();
        values.insert("content".to_string(), FieldOp::Delta(delta.to_string()));
        let mut change = Change::modify("a", values);
        change.end_version = Some(end_version);
        Broadcast::Change(change)
    }

    #[test]
    fn test_bootstrap_calls_init_once() {
        let mut bucket = Bucket::new(Recorder::default());
        bucket
            .bootstrap("cv-1".to_string(), vec![hello_reply()])
            .unwrap();

        assert_eq!(bucket.state().inits, vec![("cv-1".to_string(), 1)]);
    }

    #[test]
    fn test_bootstrap_failure_is_invalid_bootstrap_data() {
        let mut bucket = Bucket::new(Recorder::default());
        let bad = EntityReply {
            id: "a".to_string(),
            version: 1,
            data: None,
        };

        let err = bucket.bootstrap("cv".to_string(), vec![bad]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidBootstrapData(_)));
        assert!(bucket.state().inits.is_empty());
    }

    #[test]
    fn test_receive_updates_store_then_state() {
        let mut bucket = Bucket::new(Recorder::default());
        bucket
            .bootstrap("cv".to_string(), vec![hello_reply()])
            .unwrap();

        bucket.receive(&append(2, "=5\t+ world")).unwrap();

        assert_eq!(bucket.store().get("a").unwrap().content, "hello world");
        assert_eq!(
            bucket.state().updates,
            vec![("a".to_string(), Operation::Modify)]
        );
    }

    #[test]
    fn test_stale_change_not_forwarded() {
        let mut bucket = Bucket::new(Recorder::default());
        bucket
            .bootstrap("cv".to_string(), vec![hello_reply()])
            .unwrap();

        bucket.receive(&append(1, "=5\t+ again")).unwrap();

        assert!(bucket.state().updates.is_empty());
        assert_eq!(bucket.store().get("a").unwrap().content, "hello");
    }

    #[test]
    fn test_rejection_reaches_state_without_touching_store() {
        let mut bucket = Bucket::new(Recorder::default());
        bucket
            .bootstrap("cv".to_string(), vec![hello_reply()])
            .unwrap();

        bucket
            .receive(&Broadcast::Rejected(ChangeRejection {
                error: 400,
                id: "a".to_string(),
                ccids: vec!["c".to_string()],
            }))
            .unwrap();

        assert_eq!(bucket.state().rejections, 1);
        assert_eq!(bucket.store().get("a").unwrap().version, 1);
    }

    #[test]
    fn test_errors_map_to_sync_errors() {
        let mut bucket = Bucket::new(Recorder::default());
        bucket
            .bootstrap("cv".to_string(), vec![hello_reply()])
            .unwrap();

        let err = bucket.receive(&append(2, "=40")).unwrap_err();
        assert!(matches!(err, SyncError::DeltaApplyError(_)));

        bucket.state_mut().fail_updates = true;
        let err = bucket.receive(&append(2, "=5")).unwrap_err();
        assert!(matches!(err, SyncError::StateError(_)));
    }
}
