//! B2-backed durable store
//!
//! Each account is the key prefix `<account>/` in a single bucket. B2 has no
//! rename, so renames are copy-then-delete.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DurableStore, StorageProvider, UploadSink};
use crate::b2::{B2Client, B2Error};

/// Validity of URLs handed out by `download_url`
const DOWNLOAD_URL_VALIDITY: Duration = Duration::from_secs(3600);

/// Storage provider over one B2 bucket
pub struct B2Storage {
    client: B2Client,
}

impl B2Storage {
    pub fn new(client: B2Client) -> Self {
        Self { client }
    }
}

impl StorageProvider for B2Storage {
    fn access(&self, account: &str) -> Arc<dyn DurableStore> {
        Arc::new(B2Store {
            client: self.client.clone(),
            prefix: format!("{}/", account.replace('/', "_")),
        })
    }
}

/// A single account's key prefix
pub struct B2Store {
    client: B2Client,
    prefix: String,
}

impl B2Store {
    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// File id of the current version, `None` if absent
    async fn file_id(&self, key: &str) -> Result<Option<String>> {
        match self.client.get_file_info(key).await {
            Ok(info) => Ok(info.file_id),
            Err(e) if B2Error::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        if let Some(id) = self.file_id(key).await? {
            match self.client.delete_file(key, &id).await {
                Ok(()) => {}
                Err(e) if B2Error::is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for B2Store {
    async fn list(&self) -> Result<Vec<String>> {
        let files = self
            .client
            .list_file_names(Some(&self.prefix), Some("/"))
            .await?;
        Ok(files
            .into_iter()
            .filter(|f| f.is_upload())
            .filter_map(|f| f.file_name.strip_prefix(&self.prefix).map(String::from))
            .collect())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.client.download_file(&self.key(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if B2Error::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let key = self.key(name);
        self.delete_key(&key).await?;
        self.client.upload_file(&key, data).await?;
        Ok(())
    }

    async fn open_upload(&self, name: &str, expected_size: u64) -> Result<Box<dyn UploadSink>> {
        debug!(key = %self.key(name), expected_size = expected_size, "Spooling upload");
        Ok(Box::new(B2Upload {
            client: self.client.clone(),
            key: self.key(name),
            spool: Spool::new()?,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_key = self.key(from);
        let to_key = self.key(to);
        let source_id = self
            .file_id(&from_key)
            .await?
            .ok_or_else(|| B2Error::NotFound(from_key.clone()))?;

        self.delete_key(&to_key).await?;
        self.client.copy_file(&source_id, &to_key).await?;
        self.client.delete_file(&from_key, &source_id).await?;
        debug!(from = %from_key, to = %to_key, "Renamed artifact");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_key(&self.key(name)).await
    }

    async fn download_url(&self, name: &str) -> Result<String> {
        self.client
            .authorized_download_url(&self.key(name), DOWNLOAD_URL_VALIDITY)
            .await
    }
}

/// Local spool file plus running SHA-1 of everything written to it
struct Spool {
    file: tempfile::NamedTempFile,
    writer: tokio::fs::File,
    hasher: Sha1,
    written: u64,
}

impl Spool {
    fn new() -> Result<Self> {
        let file = tempfile::NamedTempFile::new().context("Failed to create upload spool")?;
        let writer = tokio::fs::File::from_std(
            file.reopen()
                .context("Failed to open upload spool for writing")?,
        );
        Ok(Self {
            file,
            writer,
            hasher: Sha1::new(),
            written: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.writer
            .write_all(chunk)
            .await
            .context("Failed to write upload spool")?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and close the writer; returns the spool, its length and hex SHA-1
    async fn seal(self) -> Result<(tempfile::NamedTempFile, u64, String)> {
        let Spool {
            file,
            mut writer,
            hasher,
            written,
        } = self;
        writer.flush().await.context("Failed to flush upload spool")?;
        drop(writer);
        Ok((file, written, format!("{:x}", hasher.finalize())))
    }
}

/// Spools chunks locally; whatever was spooled is uploaded when the sink is
/// finished or aborted
struct B2Upload {
    client: B2Client,
    key: String,
    spool: Spool,
}

impl B2Upload {
    async fn publish(self) -> Result<()> {
        let (file, written, sha1_hex) = self.spool.seal().await?;
        self.client
            .upload_spooled(&self.key, file.path(), written, &sha1_hex)
            .await?;
        // spool file is removed when dropped here
        Ok(())
    }
}

#[async_trait]
impl UploadSink for B2Upload {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.spool.write(&chunk).await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.publish().await
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        debug!(key = %self.key, written = self.spool.written, "Uploading partial transfer");
        self.publish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spool_keeps_partial_content_and_hash() {
        let mut spool = Spool::new().unwrap();
        spool.write(b"hel").await.unwrap();
        spool.write(b"lo").await.unwrap();

        let (file, written, sha1_hex) = spool.seal().await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"hello");
        assert_eq!(sha1_hex, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[tokio::test]
    async fn test_empty_spool() {
        let (file, written, sha1_hex) = Spool::new().unwrap().seal().await.unwrap();
        assert_eq!(written, 0);
        assert!(std::fs::read(file.path()).unwrap().is_empty());
        assert_eq!(sha1_hex, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }
}
