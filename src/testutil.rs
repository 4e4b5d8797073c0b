//! In-memory tree source and provider for tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::Semaphore;

use crate::item::{Item, FOLDER_KIND};
use crate::source::{DownloadHandle, SourceProvider, TreeSource};
use crate::store::{DurableStore, UploadSink};

/// Chunk size of scripted download bodies
const CHUNK: usize = 4;

#[derive(Clone)]
struct Body {
    data: Vec<u8>,
    declared: u64,
    fail: bool,
}

/// Scripted tree source
#[derive(Default)]
pub struct FakeSource {
    items: Vec<Item>,
    bodies: HashMap<String, Body>,
    gate: Option<Arc<Semaphore>>,
    fail_enumeration: bool,
    panic_enumeration: bool,
    /// Artifacts written into a store when a given file starts downloading
    side_effects: HashMap<String, (Arc<dyn DurableStore>, String)>,
    downloads: Mutex<Vec<String>>,
}

pub fn folder(id: &str, parent: &str, name: &str) -> Item {
    Item {
        id: id.to_string(),
        name: name.to_string(),
        kind: FOLDER_KIND.to_string(),
        parent_id: Some(parent.to_string()),
        ..Default::default()
    }
}

pub fn file(id: &str, parent: &str, name: &str, size: u64) -> Item {
    Item {
        id: id.to_string(),
        name: name.to_string(),
        kind: "application/octet-stream".to_string(),
        parent_id: Some(parent.to_string()),
        binary: true,
        size: Some(size),
        ..Default::default()
    }
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(mut self, items: Vec<Item>) -> Self {
        self.items = items;
        self
    }

    pub fn with_body(self, file_id: &str, data: &[u8]) -> Self {
        self.with_sized_body(file_id, data, data.len() as u64)
    }

    /// Declared size differs from the bytes actually streamed
    pub fn with_sized_body(mut self, file_id: &str, data: &[u8], declared: u64) -> Self {
        self.bodies.insert(
            file_id.to_string(),
            Body {
                data: data.to_vec(),
                declared,
                fail: false,
            },
        );
        self
    }

    /// Streams `data`, then reports an error
    pub fn with_failing_body(mut self, file_id: &str, data: &[u8], declared: u64) -> Self {
        self.bodies.insert(
            file_id.to_string(),
            Body {
                data: data.to_vec(),
                declared,
                fail: true,
            },
        );
        self
    }

    /// Each enumeration waits for one permit before yielding anything
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_enumeration_error(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    pub fn with_enumeration_panic(mut self) -> Self {
        self.panic_enumeration = true;
        self
    }

    /// Downloading `file_id` first writes `artifact` into `store`
    pub fn with_side_effect(
        mut self,
        file_id: &str,
        store: Arc<dyn DurableStore>,
        artifact: &str,
    ) -> Self {
        self.side_effects
            .insert(file_id.to_string(), (store, artifact.to_string()));
        self
    }

    /// File ids passed to `download`, in call order
    pub fn downloads(&self) -> Vec<String> {
        self.downloads
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TreeSource for FakeSource {
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Item>> {
        Ok(self
            .items
            .iter()
            .filter(|i| i.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    fn enumerate_all(&self) -> BoxStream<'_, Result<Item>> {
        let gate = self.gate.clone();
        let explode = self.panic_enumeration;
        let mut items: Vec<Result<Item>> = self.items.iter().cloned().map(Ok).collect();
        if self.fail_enumeration {
            items.push(Err(anyhow!("enumeration page failed")));
        }

        stream::once(async move {
            if let Some(gate) = gate {
                gate.acquire().await?.forget();
            }
            if explode {
                panic!("enumeration blew up");
            }
            Ok::<_, anyhow::Error>(stream::iter(items))
        })
        .try_flatten()
        .boxed()
    }

    async fn download(&self, file_id: &str) -> Result<DownloadHandle> {
        if let Ok(mut downloads) = self.downloads.lock() {
            downloads.push(file_id.to_string());
        }
        if let Some((store, artifact)) = self.side_effects.get(file_id) {
            store.write(artifact, b"done elsewhere").await?;
        }
        let body = self
            .bodies
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", file_id))?;

        let mut chunks: Vec<Result<Bytes>> = body
            .data
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if body.fail {
            chunks.push(Err(anyhow!("connection reset")));
        }

        Ok(DownloadHandle {
            size: body.declared,
            body: stream::iter(chunks).boxed(),
        })
    }
}

/// Provider over a fixed set of fake accounts
#[derive(Default)]
pub struct FakeProvider {
    sources: HashMap<String, Arc<FakeSource>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account: &str, source: Arc<FakeSource>) -> Self {
        self.sources.insert(account.to_string(), source);
        self
    }
}

#[async_trait]
impl SourceProvider for FakeProvider {
    async fn acquire(&self, account: &str) -> Result<Option<Arc<dyn TreeSource>>> {
        Ok(self
            .sources
            .get(account)
            .map(|s| Arc::clone(s) as Arc<dyn TreeSource>))
    }
}

/// Store that only publishes an upload once the sink is closed, the way
/// object stores without partial writes behave
#[derive(Default)]
pub struct MemoryStore {
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn artifacts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.artifacts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.artifacts().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.artifacts().get(name).cloned())
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        self.artifacts().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn open_upload(&self, name: &str, _expected_size: u64) -> Result<Box<dyn UploadSink>> {
        Ok(Box::new(MemoryUpload {
            artifacts: Arc::clone(&self.artifacts),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut artifacts = self.artifacts();
        let data = artifacts
            .remove(from)
            .ok_or_else(|| anyhow!("no such artifact: {}", from))?;
        artifacts.insert(to.to_string(), data);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.artifacts().remove(name);
        Ok(())
    }

    async fn download_url(&self, name: &str) -> Result<String> {
        Ok(format!("memory://{}", name))
    }
}

struct MemoryUpload {
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    name: String,
    buffer: Vec<u8>,
}

impl MemoryUpload {
    fn publish(self) {
        let mut artifacts = self.artifacts.lock().unwrap_or_else(|e| e.into_inner());
        artifacts.insert(self.name, self.buffer);
    }
}

#[async_trait]
impl UploadSink for MemoryUpload {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.publish();
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.publish();
        Ok(())
    }
}
