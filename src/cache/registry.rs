//! Cache registry
//!
//! Names, lists, stores and decodes snapshot generations for an account.
//! Snapshots are zstd-compressed JSON trees stored as `<epochMillis>.cache`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, info};

use super::decoded::DecodedCache;
use crate::error::{BackupError, Result};
use crate::item::Item;
use crate::store::{cache_name, parse_cache_name, DurableStore};

/// zstd level for snapshot bodies
const COMPRESSION_LEVEL: i32 = 3;

/// Snapshot naming, storage and decode caching
pub struct CacheRegistry {
    decoded: DecodedCache,
    last_generation: AtomicI64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Serialize and compress a tree
pub fn encode(tree: &Item) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(tree).context("Failed to serialize snapshot")?;
    zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL).context("Failed to compress snapshot")
}

/// Decompress and parse a stored snapshot
pub fn decode(data: &[u8]) -> std::result::Result<Item, String> {
    let json = zstd::decode_all(data).map_err(|e| format!("decompression failed: {}", e))?;
    serde_json::from_slice(&json).map_err(|e| format!("invalid snapshot body: {}", e))
}

impl CacheRegistry {
    pub fn new(decode_capacity: usize) -> Self {
        Self {
            decoded: DecodedCache::new(decode_capacity),
            last_generation: AtomicI64::new(0),
        }
    }

    /// Next generation id: current epoch millis, strictly increasing
    pub fn next_generation(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last_generation.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_generation.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Sorted generation ids present in the store
    pub async fn generations(&self, store: &dyn DurableStore) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = store
            .list()
            .await?
            .iter()
            .filter_map(|name| parse_cache_name(name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Persist a finished tree as a new generation
    pub async fn write(&self, account: &str, store: &dyn DurableStore, tree: Item) -> Result<i64> {
        let generation = self.next_generation();
        let tree = Arc::new(tree);

        let encoded = {
            let tree = Arc::clone(&tree);
            tokio::task::spawn_blocking(move || encode(&tree))
                .await
                .context("Snapshot encoder panicked")??
        };

        store.write(&cache_name(generation), &encoded).await?;
        self.decoded.insert(account, generation, tree);
        info!(
            account = account,
            generation = generation,
            size = encoded.len(),
            "Wrote snapshot"
        );
        Ok(generation)
    }

    /// Decoded tree for a generation, from memory or the store
    pub async fn load(
        &self,
        account: &str,
        store: &dyn DurableStore,
        generation: i64,
    ) -> Result<Arc<Item>> {
        if let Some(tree) = self.decoded.get(account, generation) {
            return Ok(tree);
        }

        let name = cache_name(generation);
        let data = store
            .read(&name)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("snapshot {}", generation)))?;

        let tree = tokio::task::spawn_blocking(move || decode(&data))
            .await
            .context("Snapshot decoder panicked")?
            .map_err(|reason| BackupError::Malformed(name, reason))?;

        let tree = Arc::new(tree);
        self.decoded.insert(account, generation, Arc::clone(&tree));
        debug!(account = account, generation = generation, "Decoded snapshot");
        Ok(tree)
    }

    /// Direct children of `folder_id` within a generation, redacted.
    ///
    /// Breadth-first search from the root, matching on id.
    pub async fn folder(
        &self,
        account: &str,
        store: &dyn DurableStore,
        generation: i64,
        folder_id: &str,
    ) -> Result<Vec<Item>> {
        let tree = self.load(account, store, generation).await?;
        find_children(&tree, folder_id)
            .ok_or_else(|| BackupError::NotFound(format!("folder {}", folder_id)))
    }

    pub fn decoded(&self) -> &DecodedCache {
        &self.decoded
    }
}

/// Redacted direct children of the first item with `folder_id`, breadth-first
pub fn find_children(root: &Item, folder_id: &str) -> Option<Vec<Item>> {
    let mut queue = VecDeque::from([root]);
    while let Some(item) = queue.pop_front() {
        if item.id == folder_id {
            return Some(
                item.children
                    .iter()
                    .flatten()
                    .map(Item::redacted)
                    .collect(),
            );
        }
        if let Some(children) = &item.children {
            queue.extend(children.iter());
        }
    }
    None
}
