use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "clipsyncd", about = "Clipboard synchronization and history daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the sync daemon
    Daemon {
        /// Config file (default: $XDG_CONFIG_HOME/clipsync/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Talk to a running daemon
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// List clipboards
    ListClipboards,

    /// Create a clipboard
    AddClipboard {
        label: String,

        /// History bound (default 100)
        #[arg(long)]
        max_entries: Option<u32>,
    },

    /// Relabel a clipboard
    RenameClipboard { clipboard: String, label: String },

    /// List endpoints attached to a clipboard
    ListEndpoints { clipboard: String },

    /// List a clipboard's history, newest first
    ListEntries {
        clipboard: String,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show an entry by history position (0 = most recent)
    GetEntry {
        clipboard: String,
        index: u32,

        /// Mime type whose bytes are written to stdout
        #[arg(long, default_value = "text/plain")]
        mime_type: String,

        /// Print metadata only
        #[arg(long)]
        metadata_only: bool,
    },

    /// Show an entry by id
    GetEntryById {
        entry_id: String,

        #[arg(long, default_value = "text/plain")]
        mime_type: String,

        #[arg(long)]
        metadata_only: bool,
    },

    /// Pin an entry so eviction skips it
    Star { entry_id: String },

    /// Unpin an entry
    Unstar { entry_id: String },

    /// Delete an entry, pinned or not
    RemoveEntry { entry_id: String },

    /// Delete every unpinned entry of a clipboard
    Clear { clipboard: String },

    /// Push an older entry to every endpoint again
    Activate { entry_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daemon_with_config() {
        let cli = Cli::try_parse_from(["clipsyncd", "daemon", "--config", "/tmp/c.toml"]).unwrap();
        match cli.command {
            Command::Daemon { config } => assert_eq!(config, Some(PathBuf::from("/tmp/c.toml"))),
            _ => panic!("expected daemon"),
        }
    }

    #[test]
    fn parses_get_entry_defaults() {
        let cli = Cli::try_parse_from(["clipsyncd", "client", "get-entry", "main", "2"]).unwrap();
        match cli.command {
            Command::Client {
                action:
                    ClientAction::GetEntry {
                        clipboard,
                        index,
                        mime_type,
                        metadata_only,
                    },
            } => {
                assert_eq!(clipboard, "main");
                assert_eq!(index, 2);
                assert_eq!(mime_type, "text/plain");
                assert!(!metadata_only);
            }
            _ => panic!("expected get-entry"),
        }
    }
}
