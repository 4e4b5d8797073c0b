//! Daemon configuration
//!
//! Everything is read from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::cache::decoded::DEFAULT_CAPACITY;
use crate::drive::OAuthApp;
use crate::store::LocalStorage;

/// Default IPC socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/drive-backup.sock";

/// Default number of bulk-backup items between backed-up set refreshes
pub const DEFAULT_REFRESH_EVERY: usize = 10;

/// Tunables used by the backup manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Bulk backup re-lists completed artifacts after this many items
    pub refresh_every: usize,
    /// Bound of the decoded-snapshot cache
    pub decode_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            refresh_every: DEFAULT_REFRESH_EVERY,
            decode_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Where artifacts are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Local {
        root: PathBuf,
    },
    B2 {
        key_id: String,
        key: String,
        bucket: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    /// `None` when no OAuth app is configured; accounts then never acquire
    pub oauth: Option<OAuthApp>,
    pub socket_path: PathBuf,
    pub settings: ManagerSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store = match lookup("DRIVE_BACKUP_STORE").as_deref() {
            None | Some("local") => StoreConfig::Local {
                root: lookup("DRIVE_BACKUP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(LocalStorage::default_root),
            },
            Some("b2") => StoreConfig::B2 {
                key_id: required(&lookup, "B2_KEY_ID")?,
                key: required(&lookup, "B2_KEY")?,
                bucket: required(&lookup, "B2_BUCKET")?,
            },
            Some(other) => return Err(anyhow!("Unknown DRIVE_BACKUP_STORE: {}", other)),
        };

        let oauth = match (lookup("GOOGLE_CLIENT_ID"), lookup("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthApp {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let defaults = ManagerSettings::default();
        let settings = ManagerSettings {
            refresh_every: number(&lookup, "DRIVE_BACKUP_REFRESH_EVERY", defaults.refresh_every)?,
            decode_capacity: number(
                &lookup,
                "DRIVE_BACKUP_DECODE_CAPACITY",
                defaults.decode_capacity,
            )?,
        };
        if settings.refresh_every == 0 || settings.decode_capacity == 0 {
            return Err(anyhow!("Refresh interval and decode capacity must be positive"));
        }

        Ok(Self {
            store,
            oauth,
            socket_path: lookup("DRIVE_BACKUP_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            settings,
        })
    }
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| anyhow!("{} must be set", key))
}

fn number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
