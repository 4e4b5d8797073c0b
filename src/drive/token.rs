//! Access token cache
//!
//! Exchanges a stored refresh token for short-lived access tokens and keeps
//! the current one until shortly before it expires.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::TokenResponse;

/// OAuth token endpoint
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens are dropped this long before their reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// OAuth application credentials
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
}

/// Refreshable access token for one account
pub struct AccessTokens {
    http_client: Client,
    app: OAuthApp,
    refresh_token: String,
    current: Mutex<Option<(String, Instant)>>,
}

impl AccessTokens {
    pub fn new(http_client: Client, app: OAuthApp, refresh_token: String) -> Self {
        Self {
            http_client,
            app,
            refresh_token,
            current: Mutex::new(None),
        }
    }

    /// A valid access token, refreshing if needed
    pub async fn get(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some((token, expires_at)) = current.as_ref() {
            if *expires_at > Instant::now() {
                return Ok(token.clone());
            }
        }

        let fresh = self.exchange().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_MARGIN);
        *current = Some((fresh.access_token.clone(), Instant::now() + lifetime));
        debug!(expires_in = fresh.expires_in, "Fetched access token");
        Ok(fresh.access_token)
    }

    /// Forget the current token (after a 401)
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    async fn exchange(&self) -> Result<TokenResponse> {
        let response = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("Failed to reach token endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Token refresh failed ({}): {}", status, body));
        }

        response
            .json()
            .await
            .context("Failed to parse token response")
    }
}
