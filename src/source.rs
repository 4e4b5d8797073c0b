//! Remote tree source capability
//!
//! The engine never talks to a provider directly. It consumes these traits,
//! implemented for Google Drive in [`crate::drive`] and by fakes in tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::item::Item;

/// Streamable file content plus its declared size
pub struct DownloadHandle {
    /// Total size in bytes as reported by the provider
    pub size: u64,
    /// Body chunks; an `Err` is a provider-reported failure
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Everything an authorized account can see on the remote drive
#[async_trait]
pub trait TreeSource: Send + Sync {
    /// Direct children of a folder, with all pages drained
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Item>>;

    /// Every item of the account as a lazy, page-by-page sequence.
    ///
    /// Single pass: restart by calling again.
    fn enumerate_all(&self) -> BoxStream<'_, Result<Item>>;

    /// Size and content stream of a binary file
    async fn download(&self, file_id: &str) -> Result<DownloadHandle>;
}

/// Resolves an account id to an authorized tree source
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// `None` when the account has no usable credential
    async fn acquire(&self, account: &str) -> Result<Option<Arc<dyn TreeSource>>>;
}
