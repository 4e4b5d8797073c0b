//! Drive backup engine
//!
//! Snapshots the file tree of remote drive accounts and copies file content
//! into durable storage, tracking progress per file and per snapshot.

pub mod b2;
pub mod backup;
pub mod cache;
pub mod config;
pub mod drive;
pub mod error;
pub mod ipc;
pub mod item;
pub mod serde_util;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use backup::BackupManager;
pub use config::{Config, ManagerSettings};
pub use error::{BackupError, Result};
pub use item::Item;
