//! Durable store capability
//!
//! A per-account namespace of named artifacts. Snapshots, completed file
//! backups and in-progress transfers all live side by side, told apart by
//! their suffix.

pub mod b2;
pub mod local;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use b2::B2Storage;
pub use local::LocalStorage;

/// Suffix of snapshot artifacts (`<epochMillis>.cache`)
pub const CACHE_SUFFIX: &str = ".cache";
/// Suffix of completed file backups (`<fileId>.file`)
pub const FILE_SUFFIX: &str = ".file";
/// Suffix of in-progress file backups (`<fileId>.temp`)
pub const TEMP_SUFFIX: &str = ".temp";
/// Artifact holding the account's remote credential
pub const CREDENTIAL_NAME: &str = "google.config";

pub fn cache_name(generation: i64) -> String {
    format!("{}{}", generation, CACHE_SUFFIX)
}

pub fn file_name(file_id: &str) -> String {
    format!("{}{}", file_id, FILE_SUFFIX)
}

pub fn temp_name(file_id: &str) -> String {
    format!("{}{}", file_id, TEMP_SUFFIX)
}

/// Parse the generation id out of a `<epochMillis>.cache` name
pub fn parse_cache_name(name: &str) -> Option<i64> {
    name.strip_suffix(CACHE_SUFFIX)?.parse().ok()
}

/// Parse the file id out of a `<fileId>.file` name
pub fn parse_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(FILE_SUFFIX).filter(|id| !id.is_empty())
}

/// Writable stream for a chunked upload
#[async_trait]
pub trait UploadSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Flush and close; the artifact is complete once this returns
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Give up on the transfer, leaving whatever was written visible under
    /// the upload's name
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// One account's namespace in durable storage
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Names of all artifacts in the namespace
    async fn list(&self) -> Result<Vec<String>>;

    /// Contents of an artifact, `None` if absent
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Replace an artifact (delete, then create)
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Open a streamed upload of `expected_size` bytes
    async fn open_upload(&self, name: &str, expected_size: u64) -> Result<Box<dyn UploadSink>>;

    /// Move an artifact, replacing whatever is at `to`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove an artifact; absent artifacts are not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Short-lived direct-access URL for an artifact
    async fn download_url(&self, name: &str) -> Result<String>;
}

/// Hands out per-account store namespaces
pub trait StorageProvider: Send + Sync {
    fn access(&self, account: &str) -> Arc<dyn DurableStore>;
}
