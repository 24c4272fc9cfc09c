use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::browser::{SessionProviderConfig, DEFAULT_SESSION_API_URL};
use crate::marketplace::DEFAULT_API_URL;
use crate::oauth::OAuthConfig;

const DEFAULT_TOKEN_URL: &str = "https://www.upwork.com/api/v3/oauth2/token";
const DEFAULT_AUTHORIZE_URL: &str = "https://www.upwork.com/ab/account-security/oauth2/authorize";

/// Runtime configuration. Every external service is optional: a missing
/// credential disables that piece and the affected operations log and stop
/// instead of failing at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub oauth: Option<OAuthConfig>,
    pub api_url: String,
    pub session_provider: Option<SessionProviderConfig>,
    /// Six-field cron expressions (seconds first).
    pub discovery_cron: String,
    pub auto_apply_cron: String,
    pub auto_apply_jitter: Duration,
    pub manual_refresh_cap: u32,
}

impl Config {
    /// Load configuration from `.env` and the environment
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let oauth = match (get("UPWORK_CLIENT_ID"), get("UPWORK_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthConfig {
                client_id,
                client_secret,
                redirect_uri: get("UPWORK_REDIRECT_URI")
                    .unwrap_or_else(|| "http://localhost:8080/upwork/callback".to_string()),
                authorize_url: get("UPWORK_AUTHORIZE_URL").unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string()),
                token_url: get("UPWORK_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            }),
            _ => None,
        };

        let session_provider = match (get("BROWSERBASE_API_KEY"), get("BROWSERBASE_PROJECT_ID")) {
            (Some(api_key), Some(project_id)) => Some(SessionProviderConfig {
                api_url: get("BROWSERBASE_API_URL").unwrap_or_else(|| DEFAULT_SESSION_API_URL.to_string()),
                api_key,
                project_id,
            }),
            _ => None,
        };

        Ok(Self {
            db_path: get("AUTOBID_DB_PATH").map(PathBuf::from),
            oauth,
            api_url: get("UPWORK_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            session_provider,
            discovery_cron: get("DISCOVERY_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            auto_apply_cron: get("AUTO_APPLY_CRON").unwrap_or_else(|| "0 0 15 * * *".to_string()),
            auto_apply_jitter: Duration::from_secs(
                get("AUTO_APPLY_JITTER_SECS")
                    .unwrap_or_else(|| "7200".to_string())
                    .parse()
                    .context("AUTO_APPLY_JITTER_SECS must be a whole number of seconds")?,
            ),
            manual_refresh_cap: get("MANUAL_REFRESH_DAILY_CAP")
                .unwrap_or_else(|| "3".to_string())
                .parse()
                .context("MANUAL_REFRESH_DAILY_CAP must be a valid number")?,
        })
    }
}
