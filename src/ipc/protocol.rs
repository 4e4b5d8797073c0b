//! IPC protocol definitions
//!
//! Newline-delimited JSON frames exchanged with local operator tools over a
//! Unix domain socket. Every command names the account it acts on.

use serde::{Deserialize, Serialize};

use crate::backup::{CacheStatus, GenerationStatus, LIVE_GENERATION};
use crate::item::Item;

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Snapshot selector: a generation id, or `"live"` for the remote drive itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Generation {
    Id(i64),
    Named(String),
}

impl Generation {
    /// Resolve to a generation id; `None` for unknown names
    pub fn resolve(&self) -> Option<i64> {
        match self {
            Generation::Id(id) => Some(*id),
            Generation::Named(name) if name == "live" => Some(LIVE_GENERATION),
            Generation::Named(_) => None,
        }
    }
}

/// Commands sent to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Start building a new snapshot
    #[serde(rename_all = "camelCase")]
    GenerateCache { account: String },
    /// Generation progress and existing snapshots
    #[serde(rename_all = "camelCase")]
    Status { account: String },
    /// Direct children of a folder in a snapshot or the live drive
    #[serde(rename_all = "camelCase")]
    GetFiles {
        account: String,
        generation: Generation,
        folder_id: String,
    },
    /// Back up one file in the background
    #[serde(rename_all = "camelCase")]
    Backup { account: String, file_id: String },
    /// Back up every file of a snapshot that is not yet stored
    #[serde(rename_all = "camelCase")]
    BackupCache { account: String, generation: i64 },
    /// Backup coverage of a snapshot
    #[serde(rename_all = "camelCase")]
    CacheStatus { account: String, generation: i64 },
    /// Short-lived link to a completed backup
    #[serde(rename_all = "camelCase")]
    DownloadUrl { account: String, file_id: String },
}

/// Responses sent back to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Success response
    #[serde(rename_all = "camelCase")]
    Success {
        /// Optional success message
        message: Option<String>,
    },
    /// Error response
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error message
        error: String,
    },
    /// Outcome of a request that starts background work; `false` while
    /// the same kind of work is already running for the account
    #[serde(rename_all = "camelCase")]
    Started { started: bool },
    #[serde(rename_all = "camelCase")]
    Status {
        version: u32,
        #[serde(flatten)]
        status: GenerationStatus,
    },
    #[serde(rename_all = "camelCase")]
    Files { items: Vec<Item> },
    #[serde(rename_all = "camelCase")]
    CacheStatus {
        #[serde(flatten)]
        status: CacheStatus,
    },
    #[serde(rename_all = "camelCase")]
    DownloadUrl { url: String },
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_cache() {
        let json = r#"{"type":"generateCache","account":"user-1"}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::GenerateCache { account } => assert_eq!(account, "user-1"),
            other => panic!("Expected GenerateCache, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_files_generations() {
        let json = r#"{"type":"getFiles","account":"u","generation":1700000000000,"folderId":"1"}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::GetFiles {
                generation,
                folder_id,
                ..
            } => {
                assert_eq!(generation.resolve(), Some(1700000000000));
                assert_eq!(folder_id, "1");
            }
            other => panic!("Expected GetFiles, got {:?}", other),
        }

        let json = r#"{"type":"getFiles","account":"u","generation":"live","folderId":"root"}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::GetFiles { generation, .. } => {
                assert_eq!(generation.resolve(), Some(LIVE_GENERATION))
            }
            other => panic!("Expected GetFiles, got {:?}", other),
        }

        assert_eq!(Generation::Named("latest".to_string()).resolve(), None);
    }

    #[test]
    fn test_parse_backup_commands() {
        let json = r#"{"type":"backup","account":"u","fileId":"abc"}"#;
        assert!(matches!(
            parse_command(json.as_bytes()).unwrap(),
            Command::Backup { file_id, .. } if file_id == "abc"
        ));

        let json = r#"{"type":"backupCache","account":"u","generation":42}"#;
        assert!(matches!(
            parse_command(json.as_bytes()).unwrap(),
            Command::BackupCache { generation: 42, .. }
        ));

        assert!(parse_command(br#"{"type":"mount"}"#).is_err());
    }

    #[test]
    fn test_serialize_status_response() {
        let response = Response::Status {
            version: PROTOCOL_VERSION,
            status: GenerationStatus {
                progress: -1,
                generations: vec![1, 2],
            },
        };
        let json: serde_json::Value =
            serde_json::from_slice(&serialize_response(&response).unwrap()).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["progress"], -1);
        assert_eq!(json["generations"][1], 2);
    }

    #[test]
    fn test_serialize_cache_status_response() {
        let response = Response::CacheStatus {
            status: CacheStatus {
                generation: 7,
                total_files: 3,
                backed_up_files: 1,
                total_file_size: 30,
                backed_up_file_size: 10,
                backing_up: true,
            },
        };
        let json = String::from_utf8(serialize_response(&response).unwrap()).unwrap();
        assert!(json.ends_with('\n'));
        assert!(json.contains(r#""type":"cacheStatus""#));
        assert!(json.contains(r#""backedUpFileSize":10"#));
        assert!(json.contains(r#""backingUp":true"#));
    }

    #[test]
    fn test_serialize_error_response() {
        let response = Response::Error {
            error: "Not found: folder x".to_string(),
        };
        let json = String::from_utf8(serialize_response(&response).unwrap()).unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("folder x"));
    }
}
