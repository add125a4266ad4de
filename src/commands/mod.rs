mod config_cmd;
mod notes_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use notes_cmd::NotesCommand;
pub use sync_cmd::SyncCommand;

/// Resolves on Ctrl-C.
pub(crate) async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received"),
        Err(e) => {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Runtime for one command.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| e.to_string())
}
