//! CLI client for control-socket operations.
//!
//! One-shot commands: connect to the daemon, perform a single request,
//! print the result, and exit.

mod daemon_client;
mod format;

use crate::cli::ClientAction;
use daemon_client::DaemonClient;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon: {0}")]
    Daemon(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the client command. Called from `main.rs` for `Command::Client`.
pub async fn run(action: ClientAction) -> Result<(), ClientError> {
    let socket_path =
        crate::daemon::resolve_socket_path().map_err(|e| ClientError::Daemon(e.to_string()))?;
    let mut daemon = DaemonClient::connect(&socket_path).await?;

    match action {
        ClientAction::ListClipboards => {
            let clipboards = daemon.list_clipboards().await?;
            format::print_clipboards(&clipboards);
        }
        ClientAction::AddClipboard { label, max_entries } => {
            daemon.add_clipboard(&label, max_entries).await?;
            println!("Added clipboard {label}");
        }
        ClientAction::RenameClipboard { clipboard, label } => {
            daemon.rename_clipboard(&clipboard, &label).await?;
            println!("Renamed clipboard {clipboard} to {label}");
        }
        ClientAction::ListEndpoints { clipboard } => {
            let endpoints = daemon.list_endpoints(&clipboard).await?;
            format::print_endpoints(&clipboard, &endpoints);
        }
        ClientAction::ListEntries { clipboard, limit } => {
            let entries = daemon.list_entries(&clipboard, limit).await?;
            format::print_entries(&entries);
        }
        ClientAction::GetEntry {
            clipboard,
            index,
            mime_type,
            metadata_only,
        } => {
            let mime_type = content_mime_type(mime_type, metadata_only);
            let fetched = daemon.get_entry(&clipboard, index, mime_type).await?;
            format::print_entry(&fetched)?;
        }
        ClientAction::GetEntryById {
            entry_id,
            mime_type,
            metadata_only,
        } => {
            let mime_type = content_mime_type(mime_type, metadata_only);
            let fetched = daemon.get_entry_by_id(&entry_id, mime_type).await?;
            format::print_entry(&fetched)?;
        }
        ClientAction::Star { entry_id } => {
            daemon.set_starred(&entry_id, true).await?;
            println!("Starred {entry_id}");
        }
        ClientAction::Unstar { entry_id } => {
            daemon.set_starred(&entry_id, false).await?;
            println!("Unstarred {entry_id}");
        }
        ClientAction::RemoveEntry { entry_id } => {
            daemon.remove_entry(&entry_id).await?;
            println!("Removed {entry_id}");
        }
        ClientAction::Clear { clipboard } => {
            let removed = daemon.clear_history(&clipboard).await?;
            println!("Removed {removed} entries from {clipboard}");
        }
        ClientAction::Activate { entry_id } => {
            daemon.activate_entry(&entry_id).await?;
            println!("Activated {entry_id}");
        }
    }

    Ok(())
}

/// The mime type whose bytes should be fetched, if any.
fn content_mime_type(mime_type: String, metadata_only: bool) -> Option<String> {
    (!metadata_only).then_some(mime_type)
}
