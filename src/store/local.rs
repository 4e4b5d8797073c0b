//! Local filesystem durable store
//!
//! One directory per account under a configured root.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{DurableStore, StorageProvider, UploadSink};

/// Storage provider rooted at a local directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root under the platform data directory
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("drive-backup")
    }
}

impl StorageProvider for LocalStorage {
    fn access(&self, account: &str) -> Arc<dyn DurableStore> {
        Arc::new(LocalStore {
            dir: self.root.join(account_dir(account)),
        })
    }
}

/// Directory name of an account: percent-encoded, with dot-only and empty
/// names escaped so the result always stays below the root
fn account_dir(account: &str) -> String {
    let encoded = urlencoding::encode(account).into_owned();
    if encoded.is_empty() {
        "%".to_string()
    } else if encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

/// Keep account ids and artifact names from escaping their directory
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\', ':'], "_")
}

/// A single account's directory
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    async fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(anyhow!("Invalid artifact name: {:?}", name));
        }
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create store directory: {:?}", self.dir))?;
        Ok(self.dir.join(sanitize(name)))
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {:?}", path)),
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut read_dir = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to list store directory"),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name).await?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name).await?;
        remove_if_exists(&path).await?;
        fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        debug!(path = %path.display(), size = data.len(), "Wrote artifact");
        Ok(())
    }

    async fn open_upload(&self, name: &str, expected_size: u64) -> Result<Box<dyn UploadSink>> {
        let path = self.path(name).await?;
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {:?}", path))?;
        Ok(Box::new(LocalUpload {
            file,
            path,
            expected_size,
            written: 0,
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.path(from).await?;
        let to_path = self.path(to).await?;
        fs::rename(&from_path, &to_path)
            .await
            .with_context(|| format!("Failed to rename {:?} to {:?}", from_path, to_path))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name).await?;
        remove_if_exists(&path).await
    }

    async fn download_url(&self, name: &str) -> Result<String> {
        let path = self.path(name).await?;
        if fs::metadata(&path).await.is_err() {
            return Err(anyhow!("Artifact not found: {}", name));
        }
        Ok(format!("file://{}", path.display()))
    }
}

/// Upload straight into the destination file
struct LocalUpload {
    file: fs::File,
    path: PathBuf,
    expected_size: u64,
    written: u64,
}

#[async_trait]
impl UploadSink for LocalUpload {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write to {:?}", self.path))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        debug!(path = %self.path.display(), written = self.written, "Upload abandoned");
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if self.written != self.expected_size {
            warn!(
                path = %self.path.display(),
                written = self.written,
                expected = self.expected_size,
                "Upload size differs from declared size"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_list() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::new(dir.path()).access("acct");

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.read("missing.file").await.unwrap().is_none());

        store.write("a.cache", b"one").await.unwrap();
        store.write("a.cache", b"two").await.unwrap();
        assert_eq!(store.read("a.cache").await.unwrap().unwrap(), b"two");
        assert_eq!(store.list().await.unwrap(), vec!["a.cache".to_string()]);
    }

    #[tokio::test]
    async fn test_upload_and_rename_replaces_target() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::new(dir.path()).access("acct");
        store.write("x.file", b"old").await.unwrap();

        let mut sink = store.open_upload("x.temp", 5).await.unwrap();
        sink.write_chunk(Bytes::from_static(b"he")).await.unwrap();
        sink.write_chunk(Bytes::from_static(b"llo")).await.unwrap();
        sink.finish().await.unwrap();

        store.rename("x.temp", "x.file").await.unwrap();
        assert_eq!(store.read("x.file").await.unwrap().unwrap(), b"hello");
        assert!(store.read("x.temp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.access("a").write("f.file", b"1").await.unwrap();

        assert!(storage.access("b").list().await.unwrap().is_empty());
        assert!(storage.access("../a").list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dot_accounts_stay_inside_root() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(outer.path().join("outside.file"), b"secret").unwrap();

        let storage = LocalStorage::new(&root);
        for account in ["..", ".", ""] {
            let store = storage.access(account);
            assert!(store.list().await.unwrap().is_empty(), "{:?}", account);
            assert!(store.read("outside.file").await.unwrap().is_none());

            store.write("mine.file", b"x").await.unwrap();
            assert_eq!(store.list().await.unwrap(), vec!["mine.file".to_string()]);
        }

        assert_eq!(account_dir(".."), "%2E%2E");
        assert_eq!(account_dir("a/b"), "a%2Fb");
        assert_eq!(
            std::fs::read(outer.path().join("outside.file")).unwrap(),
            b"secret"
        );
        // Nothing was written next to the root
        assert!(!outer.path().join("mine.file").exists());
        assert!(!root.join("mine.file").exists());
    }

    #[tokio::test]
    async fn test_delete_and_download_url() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::new(dir.path()).access("acct");

        store.delete("nothing.file").await.unwrap();
        assert!(store.download_url("f.file").await.is_err());

        store.write("f.file", b"data").await.unwrap();
        let url = store.download_url("f.file").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("f.file"));

        store.delete("f.file").await.unwrap();
        assert!(store.read("f.file").await.unwrap().is_none());
    }
}
