//! File sync command: mirrors a bucket of files into a directory.

use std::path::PathBuf;

use clap::Args;
use tokio::sync::{mpsc, oneshot};

use simsync_core::{Bucket, Disconnect, LocalBridge, SyncClient, SyncError};

use super::{interrupted, runtime};
use crate::config::{Config, ConfigError};
use crate::watch::forward_local_changes;

/// Mirror a bucket of files into a local directory
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Directory to mirror (default: sync_dir from the config)
    #[arg(long)]
    dir: Option<PathBuf>,
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), SyncCommandError> {
        let rt = runtime().map_err(SyncCommandError::RuntimeError)?;
        rt.block_on(self.sync(config))
    }

    async fn sync(&self, config: &Config) -> Result<(), SyncCommandError> {
        let settings = config.client_settings()?;

        let dir = self
            .dir
            .clone()
            .unwrap_or_else(|| config.sync_dir.value.clone());
        std::fs::create_dir_all(&dir).map_err(|e| SyncCommandError::DirError(dir.clone(), e))?;
        let root = dir
            .canonicalize()
            .map_err(|e| SyncCommandError::DirError(dir.clone(), e))?;

        let client = SyncClient::new(settings);
        let bucket = Bucket::new(LocalBridge::new(&root)).shared();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
        let (watch_failed_tx, watch_failed_rx) = oneshot::channel();

        let watcher = tokio::spawn({
            let root = root.clone();
            let bucket = bucket.clone();
            let states = client.state();
            async move {
                let result = forward_local_changes(root, bucket, outgoing_tx, states).await;
                if result.is_err() {
                    let _ = watch_failed_tx.send(());
                }
                result
            }
        });

        let shutdown = async {
            tokio::select! {
                _ = interrupted() => {}
                _ = watch_failed_rx => {}
            }
        };

        println!("Syncing {} with bucket '{}'", root.display(), config.bucket.value);
        let result = client.run(bucket, outgoing_rx, shutdown).await;

        let watch_result = if watcher.is_finished() {
            watcher.await.ok()
        } else {
            watcher.abort();
            None
        };
        if let Some(Err(e)) = watch_result {
            return Err(SyncCommandError::WatchError(e));
        }

        match result? {
            Disconnect::Interrupted => println!("Sync stopped."),
            Disconnect::RemoteClosed => println!("Server closed the connection."),
        }
        Ok(())
    }
}

/// Errors from the sync command
#[derive(Debug)]
pub enum SyncCommandError {
    ConfigError(ConfigError),
    SyncError(SyncError),
    DirError(PathBuf, std::io::Error),
    WatchError(notify::Error),
    RuntimeError(String),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::ConfigError(e) => write!(f, "{}", e),
            SyncCommandError::SyncError(e) => write!(f, "{}", e),
            SyncCommandError::DirError(path, e) => {
                write!(f, "Cannot use sync directory '{}': {}", path.display(), e)
            }
            SyncCommandError::WatchError(e) => write!(f, "Failed to watch directory: {}", e),
            SyncCommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::ConfigError(e) => Some(e),
            SyncCommandError::SyncError(e) => Some(e),
            SyncCommandError::DirError(_, e) => Some(e),
            SyncCommandError::WatchError(e) => Some(e),
            SyncCommandError::RuntimeError(_) => None,
        }
    }
}

impl From<ConfigError> for SyncCommandError {
    fn from(e: ConfigError) -> Self {
        SyncCommandError::ConfigError(e)
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::SyncError(e)
    }
}
