//! Sync daemon: clipboards, endpoints and the control socket.
//!
//! Architecture: channel-based actor. A single daemon loop owns all
//! mutable state ([`state::DaemonState`]): the clipboard registry and
//! the content store. Endpoints report selection changes as
//! [`UpdateNotice`]s; transfers run in spawned tasks that report back
//! as [`Progress`]; per-connection tasks forward control requests as
//! [`DaemonCommand`]s.

mod connection;
mod handler;
pub mod registry;
pub mod state;

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::DaemonCommand;
use state::{DaemonState, Progress};

use crate::config::{Config, ConfigError};
use crate::endpoint::UpdateNotice;
use crate::store::Store;

/// Daemon startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error("daemon already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open store: {0}")]
    Store(crate::error::Error),
    #[error("setup failed: {0}")]
    Setup(crate::error::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Fails if the store cannot be opened (the daemon never runs without
/// one), `$XDG_RUNTIME_DIR` is unset, the socket cannot be bound, or
/// another daemon already owns it.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let store = open_store(&config)?;

    let socket_path = resolve_socket_path()?;
    let listener = bind_socket(&socket_path).await?;

    let (updates_tx, updates_rx) = mpsc::unbounded_channel::<UpdateNotice>();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel::<Progress>();
    let mut state = DaemonState::new(config, store, updates_tx, progress_tx);
    if let Err(e) = state.build() {
        remove_socket(&socket_path);
        return Err(DaemonError::Setup(e));
    }

    tracing::info!(
        path = %socket_path.display(),
        clipboards = state.registry.len(),
        "daemon listening"
    );

    // Graceful shutdown on SIGTERM or SIGINT.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    serve(listener, state, updates_rx, progress_rx, shutdown).await;

    remove_socket(&socket_path);
    tracing::info!("daemon stopped");
    Ok(())
}

fn open_store(config: &Config) -> Result<Store, DaemonError> {
    if config.ephemeral {
        tracing::info!("ephemeral mode, history is kept in memory");
        return Store::in_memory().map_err(DaemonError::Store);
    }
    let dir = config.data_dir()?;
    let store = Store::open(&dir).map_err(DaemonError::Store)?;
    tracing::info!(dir = %dir.display(), "store opened");
    Ok(store)
}

/// The daemon loop. Returns once `shutdown` completes.
async fn serve(
    listener: UnixListener,
    mut state: DaemonState,
    mut updates_rx: mpsc::UnboundedReceiver<UpdateNotice>,
    mut progress_rx: mpsc::UnboundedReceiver<Progress>,
    shutdown: impl Future<Output = ()>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<DaemonCommand>();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        connection::spawn_connection(stream, cmd_tx.clone());
                        tracing::debug!("accepted connection");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Control request from a connection task --
            Some(cmd) = cmd_rx.recv() => {
                let (response, fan_out) = handler::handle_message(&mut state, cmd.request);
                let _ = cmd.response_tx.send(response);
                if let Some(fan_out) = fan_out {
                    state.spawn_deliver(fan_out);
                }
            }

            // -- Selection changed on an endpoint --
            Some(notice) = updates_rx.recv() => state.on_notice(notice),

            // -- Transfer task finished --
            Some(progress) = progress_rx.recv() => state.on_progress(progress),

            () = &mut shutdown => break,
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(error = %e, path = %path.display(), "failed to remove socket");
    }
}

// -- Socket setup --

/// `$XDG_RUNTIME_DIR/clipsync/control.sock`.
pub fn resolve_socket_path() -> Result<PathBuf, DaemonError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| DaemonError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("clipsync")
        .join("control.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another daemon
/// is running. If it fails, the socket is stale and is removed.
async fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::MkdirFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    // Always enforce 0700, even on a directory that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            DaemonError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            }
        })?;
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            match UnixStream::connect(path).await {
                Ok(_) => Err(DaemonError::AlreadyRunning(path.to_path_buf())),
                Err(_) => {
                    tracing::info!(path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path).map_err(|e| DaemonError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                    UnixListener::bind(path).map_err(|e| DaemonError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        Err(e) => Err(DaemonError::BindFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
