//! Note mirroring command.

use std::time::Duration;

use clap::Args;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

use simsync_core::notes::timestamp_line;
use simsync_core::{Bucket, Change, Disconnect, NoteMirror, SharedBucket, SyncClient, SyncError};

use super::{interrupted, runtime};
use crate::config::{Config, ConfigError};

/// Mirror a note bucket and log every change
#[derive(Debug, Args)]
pub struct NotesCommand {
    /// Append a timestamped line to the active note every SECS seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    append_every: Option<u64>,
}

impl NotesCommand {
    pub fn run(&self, config: &Config) -> Result<(), NotesCommandError> {
        let rt = runtime().map_err(NotesCommandError::RuntimeError)?;
        rt.block_on(self.mirror(config))
    }

    async fn mirror(&self, config: &Config) -> Result<(), NotesCommandError> {
        let client = SyncClient::new(config.client_settings()?);
        let bucket = Bucket::new(NoteMirror::new()).shared();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);

        let appender = self.append_every.map(|secs| {
            tokio::spawn(append_lines(
                bucket.clone(),
                outgoing_tx.clone(),
                Duration::from_secs(secs),
            ))
        });
        drop(outgoing_tx);

        println!("Mirroring bucket '{}'", config.bucket.value);
        let result = client.run(bucket, outgoing_rx, interrupted()).await;

        if let Some(appender) = appender {
            appender.abort();
        }

        match result? {
            Disconnect::Interrupted => println!("Sync stopped."),
            Disconnect::RemoteClosed => println!("Server closed the connection."),
        }
        Ok(())
    }
}

/// Queues an append to the active note on every tick.
async fn append_lines(bucket: SharedBucket<NoteMirror>, outgoing: mpsc::Sender<Change>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;

        let change = {
            let mut bucket = bucket.lock().await;
            let (store, mirror) = bucket.parts_mut();
            mirror.append_change(store, &timestamp_line())
        };
        let Some(change) = change else {
            tracing::debug!("No active note or an append is still in flight");
            continue;
        };

        tracing::info!("Appending a line to note {}", change.target_id);
        if outgoing.send(change).await.is_err() {
            break;
        }
    }
}

/// Errors from the notes command
#[derive(Debug)]
pub enum NotesCommandError {
    ConfigError(ConfigError),
    SyncError(SyncError),
    RuntimeError(String),
}

impl std::fmt::Display for NotesCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotesCommandError::ConfigError(e) => write!(f, "{}", e),
            NotesCommandError::SyncError(e) => write!(f, "{}", e),
            NotesCommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for NotesCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotesCommandError::ConfigError(e) => Some(e),
            NotesCommandError::SyncError(e) => Some(e),
            NotesCommandError::RuntimeError(_) => None,
        }
    }
}

impl From<ConfigError> for NotesCommandError {
    fn from(e: ConfigError) -> Self {
        NotesCommandError::ConfigError(e)
    }
}

impl From<SyncError> for NotesCommandError {
    fn from(e: SyncError) -> Self {
        NotesCommandError::SyncError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simsync_core::sync::protocol::EntityReply;
    use simsync_core::sync::FieldOp;

    #[tokio::test]
    async fn test_append_lines_targets_active_note() {
        let mut bucket = Bucket::new(NoteMirror::new());
        bucket
            .bootstrap(
                "cv".to_string(),
                vec![EntityReply {
                    id: "a".to_string(),
                    version: 2,
                    data: serde_json::json!({"content": "hello"}).as_object().cloned(),
                }],
            )
            .unwrap();
        bucket.state_mut().set_active("a");
        let bucket = bucket.shared();
        let (tx, mut rx) = mpsc::channel(1);

        let task = tokio::spawn(append_lines(bucket, tx, Duration::from_millis(20)));
        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        task.abort();

        assert_eq!(change.target_id, "a");
        assert_eq!(change.source_version, Some(2));
        assert!(matches!(change.values["content"], FieldOp::Delta(_)));
    }
}
