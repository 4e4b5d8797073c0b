//! Backup job
//!
//! Copies one file's content from the tree source into the account's store.
//! Bytes land in `<id>.temp` and are renamed to `<id>.file` only once the
//! whole declared size has arrived. No retry happens here.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{BackupError, Result};
use crate::source::{DownloadHandle, TreeSource};
use crate::store::{file_name, temp_name, DurableStore, UploadSink};

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Transferring = 1,
    Completed = 2,
    Failed = 3,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobState::Transferring,
            2 => JobState::Completed,
            3 => JobState::Failed,
            _ => JobState::Pending,
        }
    }
}

/// Live, shareable view of a job's progress
#[derive(Debug)]
pub struct JobProgress {
    pub account: String,
    pub file_id: String,
    total: AtomicU64,
    transferred: AtomicU64,
    state: AtomicU8,
}

impl JobProgress {
    pub fn new(account: &str, file_id: &str) -> Self {
        Self {
            account: account.to_string(),
            file_id: file_id.to_string(),
            total: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            state: AtomicU8::new(JobState::Pending as u8),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn total_size(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Percent done (0-100); 0 while the size is unknown or zero
    pub fn percentage(&self) -> f64 {
        let total = self.total_size();
        if total == 0 {
            return 0.0;
        }
        self.bytes_transferred() as f64 * 100.0 / total as f64
    }
}

/// One file transfer
pub struct BackupJob {
    progress: Arc<JobProgress>,
    source: Arc<dyn TreeSource>,
    store: Arc<dyn DurableStore>,
}

impl BackupJob {
    pub fn new(
        account: &str,
        file_id: &str,
        source: Arc<dyn TreeSource>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            progress: Arc::new(JobProgress::new(account, file_id)),
            source,
            store,
        }
    }

    pub fn progress(&self) -> Arc<JobProgress> {
        Arc::clone(&self.progress)
    }

    /// Run the transfer to completion or failure.
    ///
    /// A failed job leaves its `.temp` artifact behind.
    pub async fn run(self) -> Result<()> {
        let result = self.transfer().await;
        let progress = &self.progress;
        match &result {
            Ok(()) => {
                progress.set_state(JobState::Completed);
                info!(
                    account = %progress.account,
                    file_id = %progress.file_id,
                    size = progress.total_size(),
                    "Backup completed"
                );
            }
            Err(e) => {
                progress.set_state(JobState::Failed);
                warn!(
                    account = %progress.account,
                    file_id = %progress.file_id,
                    transferred = progress.bytes_transferred(),
                    error = %e,
                    "Backup failed"
                );
            }
        }
        result
    }

    async fn transfer(&self) -> Result<()> {
        let file_id = self.progress.file_id.as_str();

        let handle = self.source.download(file_id).await?;
        self.progress.total.store(handle.size, Ordering::Relaxed);

        let temp = temp_name(file_id);
        let mut sink = self.store.open_upload(&temp, handle.size).await?;
        self.progress.set_state(JobState::Transferring);
        debug!(file_id = file_id, size = handle.size, "Transfer started");

        if let Err(e) = self.pump(sink.as_mut(), handle).await {
            // Whatever arrived stays visible as the .temp artifact
            if let Err(abort_err) = sink.abort().await {
                warn!(file_id = file_id, error = %abort_err, "Failed to keep partial upload");
            }
            return Err(e);
        }

        sink.finish().await?;
        self.store.rename(&temp, &file_name(file_id)).await?;
        Ok(())
    }

    /// Copy the body into the sink, checking the declared size
    async fn pump(&self, sink: &mut dyn UploadSink, handle: DownloadHandle) -> Result<()> {
        let file_id = self.progress.file_id.as_str();
        let failed = |reason: String| BackupError::TransferFailed(file_id.to_string(), reason);

        let mut body = handle.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| failed(format!("{:#}", e)))?;
            let len = chunk.len() as u64;
            sink.write_chunk(chunk).await?;
            self.progress.transferred.fetch_add(len, Ordering::Relaxed);
        }

        let transferred = self.progress.bytes_transferred();
        if transferred != handle.size {
            return Err(failed(format!(
                "stream ended after {} of {} bytes",
                transferred, handle.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStorage, StorageProvider};
    use crate::testutil::{FakeSource, MemoryStore};
    use tempfile::TempDir;

    fn setup(source: FakeSource) -> (TempDir, Arc<dyn DurableStore>, Arc<dyn TreeSource>) {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::new(dir.path()).access("acct");
        (dir, store, Arc::new(source))
    }

    #[test]
    fn test_percentage() {
        let progress = JobProgress::new("acct", "f");
        assert_eq!(progress.percentage(), 0.0);
        progress.total.store(200, Ordering::Relaxed);
        progress.transferred.store(50, Ordering::Relaxed);
        assert_eq!(progress.percentage(), 25.0);
    }

    #[tokio::test]
    async fn test_completed_job_renames() {
        let (_dir, store, source) = setup(FakeSource::new().with_body("f", b"hello world"));
        let job = BackupJob::new("acct", "f", source, Arc::clone(&store));
        let progress = job.progress();
        assert_eq!(progress.state(), JobState::Pending);

        job.run().await.unwrap();

        assert_eq!(progress.state(), JobState::Completed);
        assert_eq!(progress.percentage(), 100.0);
        assert_eq!(store.read("f.file").await.unwrap().unwrap(), b"hello world");
        assert!(store.read("f.temp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_temp() {
        let (_dir, store, source) =
            setup(FakeSource::new().with_failing_body("f", b"partial", 100));
        let job = BackupJob::new("acct", "f", source, Arc::clone(&store));
        let progress = job.progress();

        let err = job.run().await.unwrap_err();
        assert!(matches!(err, BackupError::TransferFailed(_, _)));
        assert_eq!(progress.state(), JobState::Failed);
        assert!(store.read("f.file").await.unwrap().is_none());
        assert!(store.read("f.temp").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_short_stream_is_a_failure() {
        let (_dir, store, source) =
            setup(FakeSource::new().with_sized_body("f", b"abc", 10));
        let err = BackupJob::new("acct", "f", source, Arc::clone(&store))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::TransferFailed(_, _)));
        assert!(store.read("f.file").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_file_fails_before_upload() {
        let (_dir, store, source) = setup(FakeSource::new());
        assert!(BackupJob::new("acct", "nope", source, Arc::clone(&store))
            .run()
            .await
            .is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_is_published_as_temp() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let source: Arc<dyn TreeSource> =
            Arc::new(FakeSource::new().with_failing_body("f", b"partial", 100));

        let err = BackupJob::new("acct", "f", source, Arc::clone(&store))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::TransferFailed(_, _)));
        assert_eq!(store.read("f.temp").await.unwrap().unwrap(), b"partial");
        assert!(store.read("f.file").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_upload_is_published_as_temp() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let source: Arc<dyn TreeSource> =
            Arc::new(FakeSource::new().with_sized_body("f", b"abc", 10));

        assert!(BackupJob::new("acct", "f", source, Arc::clone(&store))
            .run()
            .await
            .is_err());
        assert_eq!(store.list().await.unwrap(), vec!["f.temp".to_string()]);
    }
}
