use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::db::Database;
use crate::models::TokenPair;

/// Refresh this long before the access token actually expires.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;
/// How long an authorization `state` stays redeemable.
const STATE_TTL_SECS: i64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenGrant {
    /// Some servers omit the refresh token on refresh; keep the old one then.
    pub fn into_pair(self, now: DateTime<Utc>, previous_refresh: Option<&str>) -> Result<TokenPair> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| anyhow!("Token response did not include a refresh token"))?;
        Ok(TokenPair {
            access_token: self.access_token,
            refresh_token,
            expires_at: now + ChronoDuration::seconds(self.expires_in),
        })
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

pub struct UpworkOAuth {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl UpworkOAuth {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self { http, config })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .context("Failed to reach OAuth token endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OAuth token request failed with status {}: {}",
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse OAuth token response")
    }
}

#[async_trait]
impl TokenRefresher for UpworkOAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }
}

pub fn needs_refresh(tokens: &TokenPair, now: DateTime<Utc>) -> bool {
    tokens.expires_at - now <= ChronoDuration::seconds(REFRESH_MARGIN_SECS)
}

pub fn new_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

pub fn authorization_url(config: &OAuthConfig, state: &str) -> Result<String> {
    let url = Url::parse_with_params(
        &config.authorize_url,
        &[
            ("response_type", "code"),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("state", state),
        ],
    )
    .context("Invalid OAuth authorize URL")?;
    Ok(url.to_string())
}

/// Starts the connect flow for an account: remembers a fresh `state` and
/// returns the URL the account owner should open.
pub fn begin_authorization(db: &Database, config: &OAuthConfig, user_id: &str, now: DateTime<Utc>) -> Result<String> {
    let state = new_state();
    db.save_oauth_state(&state, user_id, now)?;
    authorization_url(config, &state)
}

/// Redeems the callback: the state must be known and recent, then the code
/// is exchanged and the token pair stored for the account that started the
/// flow. Returns that account id.
pub async fn complete_authorization(
    db: &Database,
    oauth: &dyn TokenRefresher,
    state: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let (user_id, created_at) = db
        .take_oauth_state(state)?
        .ok_or_else(|| anyhow!("Unknown or already used OAuth state"))?;
    if now - created_at > ChronoDuration::seconds(STATE_TTL_SECS) {
        return Err(anyhow!("OAuth state expired, start the connection again"));
    }

    let grant = oauth.exchange_code(code).await?;
    let tokens = grant.into_pair(now, None)?;
    db.save_credentials(&user_id, &tokens)?;
    tracing::info!(account = %user_id, "Marketplace account connected");
    Ok(user_id)
}

/// Returns a usable access token for the account, refreshing and persisting
/// a new pair first when the stored one is about to expire. `Ok(None)` means
/// the account never connected.
pub async fn fresh_access_token(
    db: &Database,
    oauth: Option<&dyn TokenRefresher>,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let Some(tokens) = db.get_credentials(user_id)? else {
        return Ok(None);
    };
    if !needs_refresh(&tokens, now) {
        return Ok(Some(tokens.access_token));
    }

    let oauth = oauth.ok_or_else(|| anyhow!("Access token expired and OAuth is not configured"))?;
    tracing::debug!(account = %user_id, "Refreshing marketplace access token");
    let grant = oauth
        .refresh(&tokens.refresh_token)
        .await
        .context("Failed to refresh marketplace access token")?;
    let refreshed = grant.into_pair(now, Some(&tokens.refresh_token))?;
    db.save_credentials(user_id, &refreshed)?;
    Ok(Some(refreshed.access_token))
}
