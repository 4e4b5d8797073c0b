//! Google Drive API Client
//!
//! Implements the remote tree source over the Drive v3 REST API: paginated
//! listing, full-account enumeration, and streamed downloads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use moka::sync::Cache;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::token::{AccessTokens, OAuthApp};
use super::types::{FileList, FileSize, StoredCredential, FILE_FIELDS};
use crate::item::Item;
use crate::source::{DownloadHandle, SourceProvider, TreeSource};
use crate::store::{StorageProvider, CREDENTIAL_NAME};

/// Drive v3 files endpoint
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";

/// HTTP client timeout for metadata calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Records per `files.list` page
const PAGE_SIZE: &str = "1000";

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Authorized sources kept per process
const SOURCE_CACHE_CAPACITY: u64 = 100;

/// Drive client bound to one account's access tokens
pub struct DriveClient {
    http_client: Client,
    tokens: AccessTokens,
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

impl DriveClient {
    pub fn new(http_client: Client, tokens: AccessTokens) -> Self {
        Self {
            http_client,
            tokens,
        }
    }

    /// Send an authorized request with retry and backoff.
    ///
    /// A 401 drops the cached access token before the next attempt.
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let backoff_ms = [500u64, 1000, 2000];
        let mut attempt = 0;

        loop {
            let token = self.tokens.get().await?;
            let outcome = build(&self.http_client).bearer_auth(&token).send().await;

            let retry_reason = match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if !is_retryable(status) || attempt >= MAX_RETRIES {
                        return Err(anyhow!("Drive {} failed ({}): {}", operation, status, body));
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        self.tokens.invalidate().await;
                    }
                    status.to_string()
                }
                Err(e) => {
                    if !(e.is_timeout() || e.is_connect()) || attempt >= MAX_RETRIES {
                        return Err(e).with_context(|| format!("Drive {} failed", operation));
                    }
                    e.to_string()
                }
            };

            let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
            attempt += 1;
            warn!(
                operation = operation,
                attempt = attempt,
                max = MAX_RETRIES,
                delay_ms = delay,
                reason = %retry_reason,
                "Retrying Drive operation"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        self.send(operation, |http| {
            http.get(url).query(query).timeout(REQUEST_TIMEOUT)
        })
        .await?
        .json()
        .await
        .with_context(|| format!("Failed to parse Drive {} response", operation))
    }

    /// Fetch one page of `files.list`
    async fn list_page(&self, q: &str, page_token: Option<&str>) -> Result<FileList> {
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut query = vec![
            ("q", q),
            ("fields", fields.as_str()),
            ("pageSize", PAGE_SIZE),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        debug!(q = q, page = ?page_token, "Listing Drive page");
        self.get_json("files.list", FILES_URL, &query).await
    }
}

/// Query for the children of one folder
fn children_query(parent_id: &str) -> String {
    format!(
        "'{}' in parents and trashed = false",
        parent_id.replace('\\', "\\\\").replace('\'', "\\'")
    )
}

const ALL_QUERY: &str = "trashed = false";

#[async_trait]
impl TreeSource for DriveClient {
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Item>> {
        let q = children_query(parent_id);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_page(&q, page_token.as_deref()).await?;
            items.extend(page.files.into_iter().map(Item::from));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!(parent = parent_id, count = items.len(), "Listed Drive folder");
        Ok(items)
    }

    fn enumerate_all(&self) -> BoxStream<'_, Result<Item>> {
        // State: Some(cursor) while pages remain; the first cursor is None
        let pages = stream::try_unfold(Some(None::<String>), move |state| async move {
            let Some(cursor) = state else {
                return Ok::<_, anyhow::Error>(None);
            };
            let page = self.list_page(ALL_QUERY, cursor.as_deref()).await?;
            let next = page
                .next_page_token
                .filter(|t| !t.is_empty())
                .map(Some);
            Ok(Some((page.files, next)))
        });

        pages
            .map_ok(|files| stream::iter(files.into_iter().map(|f| Ok::<_, anyhow::Error>(Item::from(f)))))
            .try_flatten()
            .boxed()
    }

    async fn download(&self, file_id: &str) -> Result<DownloadHandle> {
        let url = format!("{}/{}", FILES_URL, urlencoding::encode(file_id));

        let meta: FileSize = self
            .get_json("files.get", &url, &[("fields", "size")])
            .await?;
        let size = meta
            .size
            .ok_or_else(|| anyhow!("File {} has no downloadable content", file_id))?;

        let response = self
            .send("files.get media", |http| http.get(&url).query(&[("alt", "media")]))
            .await?;

        info!(file_id = file_id, size = size, "Opened Drive download");
        let body = response
            .bytes_stream()
            .map_err(|e| anyhow::Error::new(e).context("Drive download stream failed"))
            .boxed();

        Ok(DownloadHandle { size, body })
    }
}

/// Hands out Drive clients for accounts with a stored refresh token
pub struct DriveProvider {
    http_client: Client,
    app: OAuthApp,
    storage: Arc<dyn StorageProvider>,
    sources: Cache<String, Arc<DriveClient>>,
}

impl DriveProvider {
    pub fn new(app: OAuthApp, storage: Arc<dyn StorageProvider>) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let sources = Cache::builder()
            .max_capacity(SOURCE_CACHE_CAPACITY)
            .time_to_idle(Duration::from_secs(3600))
            .name("drive_sources")
            .build();

        Ok(Self {
            http_client,
            app,
            storage,
            sources,
        })
    }
}

#[async_trait]
impl SourceProvider for DriveProvider {
    async fn acquire(&self, account: &str) -> Result<Option<Arc<dyn TreeSource>>> {
        if let Some(client) = self.sources.get(account) {
            return Ok(Some(client));
        }

        let store = self.storage.access(account);
        let Some(raw) = store.read(CREDENTIAL_NAME).await? else {
            debug!(account = account, "No stored Drive credential");
            return Ok(None);
        };
        let credential: StoredCredential = match serde_json::from_slice(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(account = account, error = %e, "Unreadable Drive credential");
                return Ok(None);
            }
        };

        let tokens = AccessTokens::new(
            self.http_client.clone(),
            self.app.clone(),
            credential.refresh_token,
        );
        if let Err(e) = tokens.get().await {
            warn!(account = account, error = %e, "Drive credential rejected");
            return Ok(None);
        }

        let client = Arc::new(DriveClient::new(self.http_client.clone(), tokens));
        self.sources.insert(account.to_string(), Arc::clone(&client));
        info!(account = account, "Drive access acquired");
        Ok(Some(client))
    }
}
