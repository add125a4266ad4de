//! Filesystem watching for `simsync sync`.
//!
//! Watcher events are mapped to [`LocalEvent`]s and run through the
//! bucket's [`LocalBridge`]; any resulting change is queued for the sync
//! client.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use simsync_core::{Change, ConnectionState, LocalBridge, LocalEvent, SharedBucket};

/// Maps one watcher event to bridge events. Creation, access and metadata
/// events map to nothing; the write that follows a creation is reported
/// separately.
pub fn local_events(event: &Event) -> Vec<LocalEvent> {
    match &event.kind {
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            event.paths.iter().cloned().map(LocalEvent::Written).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(LocalEvent::Written).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            event.paths.iter().cloned().map(LocalEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                LocalEvent::Removed(from.clone()),
                LocalEvent::Written(to.clone()),
            ],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| renamed(path))
            .collect(),
        _ => Vec::new(),
    }
}

/// A rename whose direction the backend did not report.
fn renamed(path: &Path) -> LocalEvent {
    if path.exists() {
        LocalEvent::Written(path.to_path_buf())
    } else {
        LocalEvent::Removed(path.to_path_buf())
    }
}

/// Watches `root` once the client is streaming and queues the changes the
/// bridge derives from local edits.
///
/// Returns when the client stops or the outgoing queue closes.
pub async fn forward_local_changes(
    root: PathBuf,
    bucket: SharedBucket<LocalBridge>,
    outgoing: mpsc::Sender<Change>,
    mut states: watch::Receiver<ConnectionState>,
) -> Result<(), notify::Error> {
    // Remote files are written before local edits are picked up
    if states
        .wait_for(|state| *state == ConnectionState::Streaming)
        .await
        .is_err()
    {
        return Ok(());
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result| {
        let _ = event_tx.send(result);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    bucket.lock().await.state_mut().watching_started();
    tracing::info!("Watching {}", root.display());

    while let Some(result) = event_rx.recv().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Watch error: {}", e);
                continue;
            }
        };

        for local in local_events(&event) {
            let change = {
                let mut bucket = bucket.lock().await;
                let (store, bridge) = bucket.parts_mut();
                bridge.handle_local_event(store, &local)
            };

            match change {
                Ok(Some(change)) => {
                    if outgoing.send(change).await.is_err() {
                        tracing::debug!("Outgoing queue closed, stopping watcher");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping {}: {}", local.path().display(), e),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use simsync_core::Bucket;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_data_modification_is_a_write() {
        let events = local_events(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/sync/a.txt"],
        ));
        assert_eq!(events, vec![LocalEvent::Written(PathBuf::from("/sync/a.txt"))]);
    }

    #[test]
    fn test_removal_and_rename_from() {
        let removed = local_events(&event(EventKind::Remove(RemoveKind::File), &["/sync/a.txt"]));
        assert_eq!(removed, vec![LocalEvent::Removed(PathBuf::from("/sync/a.txt"))]);

        let moved_away = local_events(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/sync/a.txt"],
        ));
        assert_eq!(moved_away, vec![LocalEvent::Removed(PathBuf::from("/sync/a.txt"))]);
    }

    #[test]
    fn test_rename_both_is_remove_then_write() {
        let events = local_events(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/sync/old.txt", "/sync/new.txt"],
        ));
        assert_eq!(
            events,
            vec![
                LocalEvent::Removed(PathBuf::from("/sync/old.txt")),
                LocalEvent::Written(PathBuf::from("/sync/new.txt")),
            ]
        );
    }

    #[test]
    fn test_create_and_access_are_ignored() {
        assert!(local_events(&event(EventKind::Create(CreateKind::File), &["/sync/a.txt"])).is_empty());
        assert!(local_events(&event(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/sync/a.txt"]
        ))
        .is_empty());
    }

    #[test]
    fn test_rename_of_unknown_direction_checks_the_path() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("here.txt");
        std::fs::write(&present, b"x").unwrap();
        let absent = dir.path().join("gone.txt");

        let events = local_events(&Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(present.clone())
            .add_path(absent.clone()));
        assert_eq!(
            events,
            vec![LocalEvent::Written(present), LocalEvent::Removed(absent)]
        );
    }

    #[tokio::test]
    async fn test_forwarding_stops_when_client_goes_away() {
        let dir = TempDir::new().unwrap();
        let bucket = Bucket::new(LocalBridge::new(dir.path())).shared();
        let (outgoing_tx, _outgoing_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Handshaking);
        drop(state_tx);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            forward_local_changes(dir.path().to_path_buf(), bucket, outgoing_tx, state_rx),
        )
        .await
        .expect("forwarding did not stop");
        assert!(result.is_ok());
    }
}
