mod cli;
mod client;
mod clipboard;
mod config;
mod daemon;
mod endpoint;
mod entry;
mod error;
mod ipc;
mod store;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Daemon { config } => {
            let config = match config::Config::load(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "config failed");
                    eprintln!("clipsyncd daemon: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = daemon::run(config).await {
                tracing::error!(error = %e, "daemon failed");
                eprintln!("clipsyncd daemon: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { action } => {
            if let Err(e) = client::run(action).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("clipsyncd client: {e}");
                std::process::exit(1);
            }
        }
    }
}
