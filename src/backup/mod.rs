//! Backup jobs and their orchestration

pub mod job;
pub mod manager;

pub use job::{BackupJob, JobProgress, JobState};
pub use manager::{BackupManager, CacheStatus, GenerationStatus, JobHandle, LIVE_GENERATION};
