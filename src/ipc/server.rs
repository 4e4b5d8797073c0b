//! IPC Server - Unix socket server for local operator tools
//!
//! Handles incoming connections and dispatches commands to the
//! BackupManager.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::backup::BackupManager;
use crate::error::BackupError;
use crate::ipc::protocol::{parse_command, serialize_response, Command, Response, PROTOCOL_VERSION};

/// IPC Server that listens for commands on a Unix socket
pub struct IpcServer {
    manager: Arc<BackupManager>,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    pub fn new(manager: Arc<BackupManager>, socket_path: PathBuf) -> Self {
        Self {
            manager,
            socket_path,
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Bind the socket, replacing a stale one
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .context("Failed to bind Unix socket")?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self.manager);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, manager, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    manager: Arc<BackupManager>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &manager).await,
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

fn failure(e: BackupError) -> Response {
    Response::Error {
        error: e.to_string(),
    }
}

/// Process a command and return a response
pub async fn process_command(command: Command, manager: &Arc<BackupManager>) -> Response {
    match command {
        Command::GenerateCache { account } => {
            info!(account = %account, "Processing generateCache command");
            match manager.generate_cache(&account).await {
                Ok(started) => Response::Started { started },
                Err(e) => failure(e),
            }
        }

        Command::Status { account } => match manager.status(&account).await {
            Ok(status) => Response::Status {
                version: PROTOCOL_VERSION,
                status,
            },
            Err(e) => failure(e),
        },

        Command::GetFiles {
            account,
            generation,
            folder_id,
        } => {
            let Some(generation) = generation.resolve() else {
                return Response::Error {
                    error: format!("Unknown generation: {:?}", generation),
                };
            };
            match manager.get_files(&account, generation, &folder_id).await {
                Ok(items) => Response::Files { items },
                Err(e) => failure(e),
            }
        }

        Command::Backup { account, file_id } => {
            info!(account = %account, file_id = %file_id, "Processing backup command");
            match manager.backup(&account, &file_id).await {
                Ok(_) => Response::Success {
                    message: Some(format!("Backup of {} started", file_id)),
                },
                Err(e) => failure(e),
            }
        }

        Command::BackupCache {
            account,
            generation,
        } => {
            info!(account = %account, generation = generation, "Processing backupCache command");
            match manager.backup_cache(&account, generation).await {
                Ok(started) => Response::Started { started },
                Err(e) => failure(e),
            }
        }

        Command::CacheStatus {
            account,
            generation,
        } => match manager.cache_status(&account, generation).await {
            Ok(status) => Response::CacheStatus { status },
            Err(e) => failure(e),
        },

        Command::DownloadUrl { account, file_id } => {
            match manager.download_url(&account, &file_id).await {
                Ok(url) => Response::DownloadUrl { url },
                Err(e) => failure(e),
            }
        }
    }
}
