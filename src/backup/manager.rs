//! Backup Manager - Orchestrates snapshots and file backups
//!
//! Owns every piece of process-wide state: running generations, in-flight
//! jobs, bulk-backup markers, the cache registry and the background tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::job::{BackupJob, JobProgress, JobState};
use crate::cache::registry::CacheRegistry;
use crate::cache::tree;
use crate::config::ManagerSettings;
use crate::error::{BackupError, Result};
use crate::item::{Item, ACTION_DOWNLOAD};
use crate::source::{SourceProvider, TreeSource};
use crate::store::{file_name, parse_file_name, DurableStore, StorageProvider};

/// Generation id standing for the live, uncached view
pub const LIVE_GENERATION: i64 = 0;

/// Generation progress and existing snapshots for an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    /// Items enumerated by the running generation, -1 when idle
    pub progress: i64,
    /// Existing snapshot ids, oldest first
    pub generations: Vec<i64>,
}

/// Backup coverage of one snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub generation: i64,
    pub total_files: u64,
    pub backed_up_files: u64,
    pub total_file_size: u64,
    pub backed_up_file_size: u64,
    /// Whether a bulk backup is running for the account
    pub backing_up: bool,
}

/// Handle to a single-file job started by [`BackupManager::backup`]
pub struct JobHandle {
    pub progress: Arc<JobProgress>,
    done: oneshot::Receiver<JobState>,
}

impl JobHandle {
    /// Final state of the job
    pub async fn wait(self) -> JobState {
        self.done.await.unwrap_or(JobState::Failed)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Copy)]
enum Marker {
    Generation,
    Bulk,
}

/// Clears an account's running marker when dropped, including on panic
struct Running {
    manager: Arc<BackupManager>,
    account: String,
    marker: Marker,
}

impl Drop for Running {
    fn drop(&mut self) {
        match self.marker {
            Marker::Generation => {
                lock(&self.manager.generations).remove(&self.account);
            }
            Marker::Bulk => {
                lock(&self.manager.bulk).remove(&self.account);
            }
        }
    }
}

/// Orchestrates snapshot generation and backups for all accounts
pub struct BackupManager {
    sources: Arc<dyn SourceProvider>,
    storage: Arc<dyn StorageProvider>,
    registry: CacheRegistry,
    settings: ManagerSettings,
    /// Item counters of running generations by account
    generations: StdMutex<HashMap<String, Arc<AtomicI64>>>,
    /// In-flight jobs by job id
    jobs: RwLock<HashMap<u64, Arc<JobProgress>>>,
    next_job_id: AtomicU64,
    /// Accounts with a running bulk backup
    bulk: StdMutex<HashSet<String>>,
    tasks: Mutex<JoinSet<()>>,
}

impl BackupManager {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        storage: Arc<dyn StorageProvider>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            sources,
            storage,
            registry: CacheRegistry::new(settings.decode_capacity),
            settings,
            generations: StdMutex::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            bulk: StdMutex::new(HashSet::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    async fn source(&self, account: &str) -> Result<Arc<dyn TreeSource>> {
        self.sources
            .acquire(account)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("remote credential for {}", account)))
    }

    fn store(&self, account: &str) -> Arc<dyn DurableStore> {
        self.storage.access(account)
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Reap whatever already finished
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Start building a new snapshot.
    ///
    /// Returns `false` if a generation is already running for the account.
    pub async fn generate_cache(self: &Arc<Self>, account: &str) -> Result<bool> {
        let progress = Arc::new(AtomicI64::new(0));
        {
            let mut generations = lock(&self.generations);
            if generations.contains_key(account) {
                debug!(account = account, "Generation already running");
                return Ok(false);
            }
            generations.insert(account.to_string(), Arc::clone(&progress));
        }
        let running = Running {
            manager: Arc::clone(self),
            account: account.to_string(),
            marker: Marker::Generation,
        };

        let source = self.source(account).await?;

        info!(account = account, "Starting snapshot generation");
        self.spawn(async move {
            running
                .manager
                .run_generation(&running.account, source, &progress)
                .await;
        })
        .await;
        Ok(true)
    }

    async fn run_generation(&self, account: &str, source: Arc<dyn TreeSource>, progress: &AtomicI64) {
        let tree = match tree::build(source.enumerate_all(), progress).await {
            Ok(tree) => tree,
            Err(e) => {
                error!(account = account, error = %e, "Snapshot generation failed");
                return;
            }
        };

        let store = self.store(account);
        match self.registry.write(account, store.as_ref(), tree).await {
            Ok(generation) => info!(
                account = account,
                generation = generation,
                items = progress.load(Ordering::Relaxed),
                "Snapshot generation finished"
            ),
            Err(e) => error!(account = account, error = %e, "Failed to store snapshot"),
        }
    }

    pub async fn status(&self, account: &str) -> Result<GenerationStatus> {
        let progress = lock(&self.generations)
            .get(account)
            .map_or(-1, |p| p.load(Ordering::Relaxed));
        let store = self.store(account);
        let generations = self.registry.generations(store.as_ref()).await?;
        Ok(GenerationStatus {
            progress,
            generations,
        })
    }

    /// Direct children of a folder, decorated with backup state.
    ///
    /// [`LIVE_GENERATION`] lists the remote drive directly.
    pub async fn get_files(&self, account: &str, generation: i64, folder_id: &str) -> Result<Vec<Item>> {
        let mut items = if generation == LIVE_GENERATION {
            let source = self.source(account).await?;
            source
                .list_children(folder_id)
                .await?
                .iter()
                .map(Item::redacted)
                .collect()
        } else {
            let store = self.store(account);
            self.registry
                .folder(account, store.as_ref(), generation, folder_id)
                .await?
        };
        self.mark_actions(account, &mut items).await?;
        Ok(items)
    }

    /// Completed backups in the account's store
    async fn backed_up(&self, store: &dyn DurableStore) -> Result<HashSet<String>> {
        Ok(store
            .list()
            .await?
            .iter()
            .filter_map(|name| parse_file_name(name))
            .map(str::to_string)
            .collect())
    }

    /// Run a job while it is visible in the in-flight registry
    async fn run_job(&self, job: BackupJob) -> JobState {
        let progress = job.progress();
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        self.jobs.write().await.insert(id, Arc::clone(&progress));

        let _ = job.run().await;

        self.jobs.write().await.remove(&id);
        progress.state()
    }

    /// Start backing up one file in the background
    pub async fn backup(self: &Arc<Self>, account: &str, file_id: &str) -> Result<JobHandle> {
        let source = self.source(account).await?;
        let job = BackupJob::new(account, file_id, source, self.store(account));
        let progress = job.progress();
        let (tx, rx) = oneshot::channel();

        info!(account = account, file_id = file_id, "Starting backup");
        let manager = Arc::clone(self);
        self.spawn(async move {
            let state = manager.run_job(job).await;
            let _ = tx.send(state);
        })
        .await;

        Ok(JobHandle { progress, done: rx })
    }

    /// Back up every binary item of a snapshot that is not yet in the store.
    ///
    /// Returns `false` if a bulk backup is already running for the account.
    pub async fn backup_cache(self: &Arc<Self>, account: &str, generation: i64) -> Result<bool> {
        if !lock(&self.bulk).insert(account.to_string()) {
            debug!(account = account, "Bulk backup already running");
            return Ok(false);
        }
        let running = Running {
            manager: Arc::clone(self),
            account: account.to_string(),
            marker: Marker::Bulk,
        };

        let store = self.store(account);
        let tree = self.registry.load(account, store.as_ref(), generation).await?;
        let source = self.source(account).await?;

        info!(account = account, generation = generation, "Starting bulk backup");
        self.spawn(async move {
            running
                .manager
                .run_bulk(&running.account, &tree, source, store)
                .await;
        })
        .await;
        Ok(true)
    }

    async fn run_bulk(
        &self,
        account: &str,
        tree: &Item,
        source: Arc<dyn TreeSource>,
        store: Arc<dyn DurableStore>,
    ) {
        let mut done = match self.backed_up(store.as_ref()).await {
            Ok(done) => done,
            Err(e) => {
                error!(account = account, error = %e, "Failed to list completed backups");
                return;
            }
        };

        let refresh_every = self.settings.refresh_every.max(1);
        let (mut processed, mut transferred, mut failed) = (0usize, 0usize, 0usize);

        for item in tree.walk().filter(|i| i.binary) {
            if processed > 0 && processed % refresh_every == 0 {
                match self.backed_up(store.as_ref()).await {
                    Ok(fresh) => done = fresh,
                    Err(e) => warn!(account = account, error = %e, "Failed to refresh completed backups"),
                }
            }
            processed += 1;

            if done.contains(&item.id) {
                continue;
            }

            let job = BackupJob::new(account, &item.id, Arc::clone(&source), Arc::clone(&store));
            match self.run_job(job).await {
                JobState::Completed => {
                    transferred += 1;
                    done.insert(item.id.clone());
                }
                _ => {
                    failed += 1;
                    warn!(account = account, file_id = %item.id, "Skipping file after failed backup");
                }
            }
        }

        info!(
            account = account,
            processed = processed,
            transferred = transferred,
            failed = failed,
            "Bulk backup finished"
        );
    }

    /// Set the download action on backed-up items and live progress on
    /// items with an in-flight job
    pub async fn mark_actions(&self, account: &str, items: &mut [Item]) -> Result<()> {
        let store = self.store(account);
        let done = self.backed_up(store.as_ref()).await?;

        let in_flight: HashMap<String, f64> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|p| p.account == account)
            .map(|p| (p.file_id.clone(), p.percentage()))
            .collect();

        for item in items.iter_mut() {
            if done.contains(&item.id) && !item.actions.iter().any(|a| a == ACTION_DOWNLOAD) {
                item.actions.push(ACTION_DOWNLOAD.to_string());
            }
            if let Some(percentage) = in_flight.get(&item.id) {
                item.downloading = Some(*percentage);
            }
        }
        Ok(())
    }

    /// Short-lived URL for a completed backup
    pub async fn download_url(&self, account: &str, file_id: &str) -> Result<String> {
        let store = self.store(account);
        if !self.backed_up(store.as_ref()).await?.contains(file_id) {
            return Err(BackupError::NotFound(format!("backup of {}", file_id)));
        }
        Ok(store.download_url(&file_name(file_id)).await?)
    }

    /// Backup coverage of one snapshot
    pub async fn cache_status(&self, account: &str, generation: i64) -> Result<CacheStatus> {
        let store = self.store(account);
        let tree = self.registry.load(account, store.as_ref(), generation).await?;
        let done = self.backed_up(store.as_ref()).await?;

        let mut status = CacheStatus {
            generation,
            backing_up: lock(&self.bulk).contains(account),
            ..Default::default()
        };
        for item in tree.walk().filter(|i| i.binary) {
            let size = item.size.unwrap_or(0);
            status.total_files += 1;
            status.total_file_size += size;
            if done.contains(&item.id) {
                status.backed_up_files += 1;
                status.backed_up_file_size += size;
            }
        }
        Ok(status)
    }

    /// Number of jobs currently transferring or pending
    pub async fn active_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Wait for every background task to finish
    pub async fn shutdown(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
            if tasks.is_empty() {
                break;
            }
            info!(count = tasks.len(), "Waiting for background tasks");
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Background task panicked");
                }
            }
        }
        info!("All background tasks finished");
    }
}
