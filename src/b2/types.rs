//! B2 API types
//!
//! Defines types for Backblaze B2 API requests and responses.

use serde::{Deserialize, Serialize};

use crate::serde_util::deserialize_flexible_u64;

/// B2 file/folder information from API responses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Full file path within the bucket
    pub file_name: String,
    /// File size in bytes (0 for folders)
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub content_length: u64,
    /// Upload timestamp in milliseconds since epoch
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub upload_timestamp: u64,
    /// Action type: "upload", "folder", "hide", "start"
    pub action: String,
    /// Optional file ID (null for folder entries)
    #[serde(default)]
    pub file_id: Option<String>,
    /// Content type (MIME type, null for folder entries)
    #[serde(default)]
    pub content_type: Option<String>,
}

impl FileInfo {
    /// Check if this entry represents a directory
    pub fn is_directory(&self) -> bool {
        self.action == "folder" || self.file_name.ends_with('/')
    }

    /// Whether this is a live uploaded file (not a hide marker or folder)
    pub fn is_upload(&self) -> bool {
        self.action == "upload" && !self.is_directory()
    }
}

/// Response from b2_list_file_names API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    /// List of files in the response
    pub files: Vec<FileInfo>,
    /// Next file name for pagination (None if no more files)
    pub next_file_name: Option<String>,
}

/// Request body for b2_list_file_names API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListFileNamesRequest {
    pub bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    pub max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<String>,
}

/// Upload URL from B2 (for uploading files)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrl {
    pub upload_url: String,
    pub authorization_token: String,
}

/// Response from a successful file upload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    pub file_id: String,
    pub file_name: String,
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub content_length: u64,
    pub content_type: String,
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub upload_timestamp: u64,
}

/// Response from b2_get_download_authorization API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DownloadAuthorization {
    pub authorization_token: String,
}
