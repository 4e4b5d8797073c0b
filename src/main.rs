//! Drive Backup Daemon
//!
//! Snapshots remote drive accounts and backs up their files, driven over a
//! local Unix socket.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use drive_backup::b2::B2Client;
use drive_backup::config::{Config, StoreConfig};
use drive_backup::drive::DriveProvider;
use drive_backup::ipc::IpcServer;
use drive_backup::source::{SourceProvider, TreeSource};
use drive_backup::store::{B2Storage, LocalStorage, StorageProvider};
use drive_backup::BackupManager;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Drive Backup Daemon - Snapshot and back up remote drive accounts

USAGE:
    drive-backup-daemon          # Run IPC server (default)
    drive-backup-daemon help

COMMANDS:
    (none)  Run IPC server mode (newline-delimited JSON on a Unix socket)
    help    Show this help message

ENVIRONMENT:
    DRIVE_BACKUP_STORE            local (default) or b2
    DRIVE_BACKUP_DIR              Local store root
    B2_KEY_ID, B2_KEY, B2_BUCKET  B2 credentials (b2 store)
    GOOGLE_CLIENT_ID              OAuth client for Drive access
    GOOGLE_CLIENT_SECRET          OAuth client secret
    DRIVE_BACKUP_REFRESH_EVERY    Bulk backup refresh interval (default 10)
    DRIVE_BACKUP_DECODE_CAPACITY  Decoded snapshot cache size (default 1000)
    DRIVE_BACKUP_SOCKET           Socket path (default /tmp/drive-backup.sock)
    RUST_LOG                      Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Server);
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(anyhow!("Unknown command: {}", other)),
    }
}

/// Provider used when no OAuth app is configured
struct NoSources;

#[async_trait::async_trait]
impl SourceProvider for NoSources {
    async fn acquire(&self, account: &str) -> Result<Option<Arc<dyn TreeSource>>> {
        warn!(account = account, "No OAuth app configured, remote access unavailable");
        Ok(None)
    }
}

async fn build_storage(config: &Config) -> Result<Arc<dyn StorageProvider>> {
    match &config.store {
        StoreConfig::Local { root } => {
            info!(root = %root.display(), "Using local store");
            Ok(Arc::new(LocalStorage::new(root.clone())))
        }
        StoreConfig::B2 {
            key_id,
            key,
            bucket,
        } => {
            let client = B2Client::authorize(key_id, key, bucket)
                .await
                .context("Failed to authorize with B2")?;
            info!(bucket = %bucket, "Using B2 store");
            Ok(Arc::new(B2Storage::new(client)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Help => {
            print_help();
        }
        Command::Server => {
            let config = Config::from_env()?;
            info!(settings = ?config.settings, "Starting Drive Backup daemon");

            let storage = build_storage(&config).await?;
            let sources: Arc<dyn SourceProvider> = match config.oauth.clone() {
                Some(app) => Arc::new(DriveProvider::new(app, Arc::clone(&storage))?),
                None => Arc::new(NoSources),
            };
            let manager = Arc::new(BackupManager::new(sources, storage, config.settings));

            let mut ipc_server = IpcServer::new(Arc::clone(&manager), config.socket_path.clone());
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }
            let ipc_server = Arc::new(ipc_server);

            info!("Daemon ready. Waiting for commands...");

            let server = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, waiting for running work...");
            ipc_handle.abort();
            ipc_server.stop().await?;
            manager.shutdown().await;

            info!("Shutdown complete.");
        }
    }

    Ok(())
}
