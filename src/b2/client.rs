//! Backblaze B2 API Client
//!
//! Provides authenticated access to a B2 bucket for listing, download,
//! upload, copy and delete. Backs the B2 durable store.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::errors::B2Error;
use super::types::{
    DownloadAuthorization, FileInfo, ListFileNamesRequest, ListFilesResponse, UploadResponse,
    UploadUrl,
};

/// B2 API base URL for authorization (v3 for nested apiInfo structure)
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Auth state that can be refreshed (interior mutability)
struct AuthState {
    auth_token: String,
    api_url: String,
    download_url: String,
}

/// B2 API client for making authenticated requests
#[derive(Clone)]
pub struct B2Client {
    /// HTTP client for making requests
    http_client: Client,
    /// B2 account ID
    account_id: String,
    /// Mutable auth state (refreshable on 401)
    auth_state: Arc<RwLock<AuthState>>,
    /// Stored credentials for re-authorization
    key_id: String,
    key: String,
    /// Bucket ID to operate on
    bucket_id: String,
    /// Bucket name (for download URLs)
    bucket_name: String,
}

/// Response from b2_authorize_account API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
    download_url: String,
}

/// Response from b2_list_buckets API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

/// Turn a non-success response into a typed B2Error
async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(B2Error::from_status(status, &body).into())
}

fn basic_auth(key_id: &str, key: &str) -> String {
    let credentials = format!("{}:{}", key_id, key);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    format!("Basic {}", encoded)
}

impl B2Client {
    /// Get current auth token
    fn auth_token(&self) -> String {
        match self.auth_state.read() {
            Ok(state) => state.auth_token.clone(),
            Err(poisoned) => poisoned.into_inner().auth_token.clone(),
        }
    }

    /// Get current API URL
    fn api_url(&self) -> String {
        match self.auth_state.read() {
            Ok(state) => state.api_url.clone(),
            Err(poisoned) => poisoned.into_inner().api_url.clone(),
        }
    }

    /// Get current download URL
    fn download_url(&self) -> String {
        match self.auth_state.read() {
            Ok(state) => state.download_url.clone(),
            Err(poisoned) => poisoned.into_inner().download_url.clone(),
        }
    }

    /// Refresh the auth token by re-authorizing with B2
    pub async fn refresh_auth(&self) -> Result<()> {
        info!("Refreshing B2 auth token...");

        let response = self
            .http_client
            .get(B2_AUTH_URL)
            .header("Authorization", basic_auth(&self.key_id, &self.key))
            .send()
            .await
            .context("Failed to refresh B2 auth")?;

        let auth_response: AuthorizeAccountResponse = check(response)
            .await?
            .json()
            .await
            .context("Failed to parse B2 auth refresh response")?;

        let mut state = self
            .auth_state
            .write()
            .map_err(|_| anyhow!("B2 auth state lock poisoned"))?;
        state.auth_token = auth_response.authorization_token;
        state.api_url = auth_response.api_info.storage_api.api_url;
        state.download_url = auth_response.api_info.storage_api.download_url;

        info!("B2 auth token refreshed successfully");
        Ok(())
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, path: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backoff_ms = [500u64, 1000, 2000];
        let mut attempt = 0;

        loop {
            let e = match f().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            let (is_retryable, is_auth_expired) = match B2Error::find(&e) {
                Some(b2) => (b2.is_retryable(), matches!(b2, B2Error::AuthExpired)),
                None => {
                    // Transport failures never reach a status code
                    let transport = e
                        .chain()
                        .find_map(|c| c.downcast_ref::<reqwest::Error>())
                        .map(|re| B2Error::from_reqwest(re).is_retryable())
                        .unwrap_or(false);
                    (transport, false)
                }
            };

            if !is_retryable || attempt >= MAX_RETRIES {
                debug!(operation = operation, path = path, error = %e, "B2 operation failed");
                return Err(e);
            }

            // Handle auth expiry by refreshing token
            if is_auth_expired && attempt == 0 {
                warn!(operation = operation, "Auth expired, refreshing token...");
                if let Err(refresh_err) = self.refresh_auth().await {
                    error!(error = %refresh_err, "Failed to refresh auth token");
                }
            }

            let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
            attempt += 1;
            warn!(
                operation = operation,
                path = path,
                attempt = attempt,
                max = MAX_RETRIES,
                delay_ms = delay,
                error = %e,
                "Retrying B2 operation"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Authorize with B2 and create a new client for the specified bucket
    ///
    /// # Arguments
    /// * `key_id` - B2 application key ID
    /// * `key` - B2 application key
    /// * `bucket_name` - Name of the bucket to access
    pub async fn authorize(key_id: &str, key: &str, bucket_name: &str) -> Result<Self> {
        info!(bucket = bucket_name, "Authorizing with B2 API...");

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let response = http_client
            .get(B2_AUTH_URL)
            .header("Authorization", basic_auth(key_id, key))
            .send()
            .await
            .context("Failed to connect to B2 API")?;

        let auth_response: AuthorizeAccountResponse = check(response)
            .await
            .context("B2 authorization failed")?
            .json()
            .await
            .context("Failed to parse B2 auth response")?;

        let api_url = auth_response.api_info.storage_api.api_url;
        let download_url = auth_response.api_info.storage_api.download_url;
        debug!(api_url = %api_url, download_url = %download_url, "B2 authorization successful");

        let mut client = Self {
            http_client,
            account_id: auth_response.account_id,
            auth_state: Arc::new(RwLock::new(AuthState {
                auth_token: auth_response.authorization_token,
                api_url,
                download_url,
            })),
            key_id: key_id.to_string(),
            key: key.to_string(),
            bucket_id: String::new(),
            bucket_name: bucket_name.to_string(),
        };

        client.bucket_id = client.get_bucket_id(bucket_name).await?;

        info!(bucket_name = bucket_name, bucket_id = %client.bucket_id, "B2 client ready");
        Ok(client)
    }

    /// Look up bucket ID from bucket name
    async fn get_bucket_id(&self, bucket_name: &str) -> Result<String> {
        let url = format!("{}/b2api/v2/b2_list_buckets", self.api_url());

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", self.auth_token())
            .json(&serde_json::json!({
                "accountId": self.account_id,
                "bucketName": bucket_name
            }))
            .send()
            .await
            .context("Failed to list buckets")?;

        let list_response: ListBucketsResponse = check(response)
            .await?
            .json()
            .await
            .context("Failed to parse bucket list")?;

        list_response
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| anyhow!("Bucket '{}' not found", bucket_name))
    }

    /// List files in the bucket with optional prefix and delimiter
    ///
    /// Drains every page before returning.
    pub async fn list_file_names(
        &self,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Vec<FileInfo>> {
        let mut all_files = Vec::new();
        let mut start_file_name: Option<String> = None;

        loop {
            let request = ListFileNamesRequest {
                bucket_id: self.bucket_id.clone(),
                prefix: prefix.map(String::from),
                delimiter: delimiter.map(String::from),
                max_file_count: 1000,
                start_file_name: start_file_name.clone(),
            };
            let request = &request;

            debug!(prefix = ?prefix, delimiter = ?delimiter, start = ?start_file_name, "Listing files from B2");

            let list_response: ListFilesResponse = self
                .with_retry("list_file_names", prefix.unwrap_or(""), || async move {
                    let url = format!("{}/b2api/v2/b2_list_file_names", self.api_url());
                    let response = self
                        .http_client
                        .post(&url)
                        .header("Authorization", self.auth_token())
                        .json(&request)
                        .send()
                        .await
                        .context("Failed to list files")?;
                    check(response)
                        .await?
                        .json::<ListFilesResponse>()
                        .await
                        .context("Failed to parse file list")
                })
                .await?;

            all_files.extend(list_response.files);

            match list_response.next_file_name {
                Some(next) => start_file_name = Some(next),
                None => break,
            }
        }

        debug!(count = all_files.len(), "Listed files from B2");
        Ok(all_files)
    }

    /// Download file content from B2
    ///
    /// A missing file surfaces as [`B2Error::NotFound`] in the error chain.
    pub async fn download_file(&self, file_name: &str) -> Result<Vec<u8>> {
        let bytes = self
            .with_retry("download_file", file_name, || async move {
                let url = format!(
                    "{}/file/{}/{}",
                    self.download_url(),
                    self.bucket_name,
                    urlencoding::encode(file_name)
                );
                debug!(file = file_name, url = %url, "Downloading file from B2");

                let response = self
                    .http_client
                    .get(&url)
                    .header("Authorization", self.auth_token())
                    .send()
                    .await
                    .context("Failed to download file from B2")?;
                check(response)
                    .await?
                    .bytes()
                    .await
                    .context("Failed to read file content")
            })
            .await?;

        debug!(file = file_name, size = bytes.len(), "Downloaded file from B2");
        Ok(bytes.to_vec())
    }

    /// Get file info by exact path
    pub async fn get_file_info(&self, file_path: &str) -> Result<FileInfo> {
        // B2 has no "get file by path" API; list with the exact path as prefix
        let files = self.list_file_names(Some(file_path), None).await?;

        files
            .into_iter()
            .find(|f| f.file_name == file_path && f.is_upload())
            .ok_or_else(|| B2Error::NotFound(file_path.to_string()).into())
    }

    /// Get an upload URL for uploading files to B2
    async fn get_upload_url(&self) -> Result<UploadUrl> {
        self.with_retry("get_upload_url", "", || async move {
            let url = format!("{}/b2api/v2/b2_get_upload_url", self.api_url());
            let response = self
                .http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({ "bucketId": self.bucket_id }))
                .send()
                .await
                .context("Failed to get upload URL")?;
            check(response)
                .await?
                .json::<UploadUrl>()
                .await
                .context("Failed to parse upload URL response")
        })
        .await
    }

    /// Upload a file to B2 from memory
    pub async fn upload_file(&self, file_name: &str, data: &[u8]) -> Result<FileInfo> {
        use sha1::{Digest, Sha1};
        let hash = format!("{:x}", Sha1::digest(data));
        let hash = hash.as_str();

        self.with_retry("upload_file", file_name, || async move {
            let upload_url = self.get_upload_url().await?;
            let response = self
                .http_client
                .post(&upload_url.upload_url)
                .header("Authorization", &upload_url.authorization_token)
                .header("X-Bz-File-Name", urlencoding::encode(file_name).as_ref())
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", data.len())
                .header("X-Bz-Content-Sha1", hash)
                .body(data.to_vec())
                .send()
                .await
                .context("Failed to upload file to B2")?;
            let uploaded: UploadResponse = check(response)
                .await?
                .json()
                .await
                .context("Failed to parse upload response")?;
            Ok(uploaded.into())
        })
        .await
    }

    /// Upload a spooled local file to B2 without loading it into memory
    ///
    /// `sha1_hex` must be the SHA-1 of the file content.
    pub async fn upload_spooled(
        &self,
        file_name: &str,
        spool: &Path,
        len: u64,
        sha1_hex: &str,
    ) -> Result<FileInfo> {
        info!(file = file_name, size = len, "Uploading spooled file to B2");

        self.with_retry("upload_spooled", file_name, || async move {
            let upload_url = self.get_upload_url().await?;
            let file = tokio::fs::File::open(spool)
                .await
                .with_context(|| format!("Failed to open spool file {:?}", spool))?;
            let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

            let response = self
                .http_client
                .post(&upload_url.upload_url)
                .header("Authorization", &upload_url.authorization_token)
                .header("X-Bz-File-Name", urlencoding::encode(file_name).as_ref())
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", len)
                .header("X-Bz-Content-Sha1", sha1_hex)
                .timeout(Duration::from_secs(3600))
                .body(body)
                .send()
                .await
                .context("Failed to upload file to B2")?;
            let uploaded: UploadResponse = check(response)
                .await?
                .json()
                .await
                .context("Failed to parse upload response")?;
            Ok(uploaded.into())
        })
        .await
    }

    /// Delete a file version from B2 (permanent delete)
    pub async fn delete_file(&self, file_name: &str, file_id: &str) -> Result<()> {
        debug!(file = file_name, file_id = file_id, "Deleting file from B2");

        self.with_retry("delete_file", file_name, || async move {
            let url = format!("{}/b2api/v2/b2_delete_file_version", self.api_url());
            let response = self
                .http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({
                    "fileName": file_name,
                    "fileId": file_id
                }))
                .send()
                .await
                .context("Failed to delete file from B2")?;
            check(response).await.map(|_| ())
        })
        .await
    }

    /// Copy a file within B2 (server-side, no download/upload)
    pub async fn copy_file(&self, source_file_id: &str, dest_file_name: &str) -> Result<FileInfo> {
        debug!(source_id = source_file_id, dest = dest_file_name, "Copying file in B2");

        self.with_retry("copy_file", dest_file_name, || async move {
            let url = format!("{}/b2api/v2/b2_copy_file", self.api_url());
            let response = self
                .http_client
                .post(&url)
                .header("Authorization", self.auth_token())
                .json(&serde_json::json!({
                    "sourceFileId": source_file_id,
                    "fileName": dest_file_name
                }))
                .send()
                .await
                .context("Failed to copy file in B2")?;
            check(response)
                .await?
                .json::<FileInfo>()
                .await
                .context("Failed to parse copy response")
        })
        .await
    }

    /// Build a pre-authorized download URL valid for `valid_for`
    pub async fn authorized_download_url(
        &self,
        file_name: &str,
        valid_for: Duration,
    ) -> Result<String> {
        let authorization: DownloadAuthorization = self
            .with_retry("get_download_authorization", file_name, || async move {
                let url = format!("{}/b2api/v2/b2_get_download_authorization", self.api_url());
                let response = self
                    .http_client
                    .post(&url)
                    .header("Authorization", self.auth_token())
                    .json(&serde_json::json!({
                        "bucketId": self.bucket_id,
                        "fileNamePrefix": file_name,
                        "validDurationInSeconds": valid_for.as_secs()
                    }))
                    .send()
                    .await
                    .context("Failed to get download authorization")?;
                check(response)
                    .await?
                    .json::<DownloadAuthorization>()
                    .await
                    .context("Failed to parse download authorization")
            })
            .await?;

        Ok(format!(
            "{}/file/{}/{}?Authorization={}",
            self.download_url(),
            self.bucket_name,
            urlencoding::encode(file_name),
            urlencoding::encode(&authorization.authorization_token)
        ))
    }
}

impl From<UploadResponse> for FileInfo {
    fn from(upload: UploadResponse) -> Self {
        FileInfo {
            file_name: upload.file_name,
            content_length: upload.content_length,
            upload_timestamp: upload.upload_timestamp,
            action: "upload".to_string(),
            file_id: Some(upload.file_id),
            content_type: Some(upload.content_type),
        }
    }
}
