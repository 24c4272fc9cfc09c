use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thirtyfour::common::config::WebDriverConfig;
use thirtyfour::prelude::*;
use tokio::time::Instant;

use crate::humanize::Viewport;

pub const DEFAULT_SESSION_API_URL: &str = "https://api.browserbase.com/v1";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const WEBDRIVER_TIMEOUT: Duration = Duration::from_secs(120);
const SIGNING_KEY_HEADER: &str = "x-bb-signing-key";

/// One way of finding an element. The target site is not ours and its markup
/// shifts, so callers pass an ordered list of these and the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locator {
    Css(&'static str),
    XPath(&'static str),
}

impl Locator {
    fn by(&self) -> By {
        match self {
            Locator::Css(css) => By::Css(*css),
            Locator::XPath(xpath) => By::XPath(*xpath),
        }
    }
}

/// The slice of browser behaviour the submitter relies on.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    /// Full HTML of the current document.
    async fn content(&self) -> Result<String>;
    async fn scroll_by(&self, pixels: i64) -> Result<()>;
    /// Polls until one of `candidates` is present and visible, trying them in
    /// order each round. `None` once `timeout` passes.
    async fn wait_for(&self, candidates: &[Locator], timeout: Duration) -> Result<Option<Locator>>;
    async fn scroll_into_view(&self, at: &Locator) -> Result<()>;
    async fn click(&self, at: &Locator) -> Result<()>;
    /// Replaces the element's value with `text`.
    async fn fill(&self, at: &Locator, text: &str) -> Result<()>;
    async fn text(&self, at: &Locator) -> Result<String>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub viewport: Viewport,
    pub stealth: bool,
    /// Saved browser profile (cookies, login) to attach to and keep updated.
    pub persistent_context_id: Option<String>,
}

/// Raised by a launcher that has no session provider to talk to.
#[derive(Debug, thiserror::Error)]
#[error("Browser session provider is not configured (BROWSERBASE_API_KEY / BROWSERBASE_PROJECT_ID)")]
pub struct LauncherNotConfigured;

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &SessionConfig) -> Result<Box<dyn BrowserPage>>;
}

// --- Remote session provider ---

#[derive(Debug, Clone)]
pub struct SessionProviderConfig {
    pub api_url: String,
    pub api_key: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    project_id: &'a str,
    browser_settings: BrowserSettings<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrowserSettings<'a> {
    advanced_stealth: bool,
    viewport: ViewportBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<ContextBody<'a>>,
}

#[derive(Debug, Serialize)]
struct ViewportBody {
    width: u32,
    height: u32,
}

#[derive(Debug, Serialize)]
struct ContextBody<'a> {
    id: &'a str,
    persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub id: String,
    pub connect_url: String,
    #[serde(default)]
    pub selenium_remote_url: Option<String>,
    /// Sent with every WebDriver request to `selenium_remote_url`.
    #[serde(default)]
    pub signing_key: Option<String>,
}

impl RemoteSession {
    /// WebDriver endpoint of the session. `connect_url` speaks CDP only, so a
    /// session without a Selenium URL cannot be driven.
    fn webdriver_url(&self) -> Result<&str> {
        self.selenium_remote_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("Browser session {} has no WebDriver endpoint", self.id))
    }

    /// HTTP client for the WebDriver connection, carrying the session's
    /// signing key on every request.
    fn webdriver_client(&self) -> Result<reqwest::Client> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &self.signing_key {
            let value = reqwest::header::HeaderValue::from_str(key)
                .context("Browser session signing key is not a valid header value")?;
            headers.insert(SIGNING_KEY_HEADER, value);
        }
        reqwest::Client::builder()
            .default_headers(headers)
            .timeout(WEBDRIVER_TIMEOUT)
            .build()
            .context("Failed to build WebDriver HTTP client")
    }
}

pub struct RemoteBrowserLauncher {
    http: reqwest::Client,
    config: Option<SessionProviderConfig>,
}

impl RemoteBrowserLauncher {
    pub fn new(config: Option<SessionProviderConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build browser session HTTP client")?;
        Ok(Self { http, config })
    }

    async fn create_session(&self, provider: &SessionProviderConfig, config: &SessionConfig) -> Result<RemoteSession> {
        let body = CreateSessionRequest {
            project_id: &provider.project_id,
            browser_settings: BrowserSettings {
                advanced_stealth: config.stealth,
                viewport: ViewportBody {
                    width: config.viewport.width,
                    height: config.viewport.height,
                },
                context: config
                    .persistent_context_id
                    .as_deref()
                    .map(|id| ContextBody { id, persist: true }),
            },
        };

        let response = self
            .http
            .post(format!("{}/sessions", provider.api_url.trim_end_matches('/')))
            .header("X-BB-API-Key", &provider.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to request a remote browser session")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Browser session request failed with status {}: {}",
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse browser session response")
    }
}

#[async_trait]
impl BrowserLauncher for RemoteBrowserLauncher {
    async fn launch(&self, config: &SessionConfig) -> Result<Box<dyn BrowserPage>> {
        let provider = self
            .config
            .as_ref()
            .ok_or(LauncherNotConfigured)?;

        let session = self.create_session(provider, config).await?;
        tracing::debug!(session = %session.id, connect_url = %session.connect_url, "Remote browser session created");

        let endpoint = session.webdriver_url()?;
        if session.signing_key.is_none() {
            tracing::warn!(session = %session.id, "Browser session returned no signing key");
        }
        let driver = WebDriver::new_with_config_and_client(
            endpoint,
            DesiredCapabilities::chrome(),
            WebDriverConfig::default(),
            session.webdriver_client()?,
        )
        .await
        .context("Failed to connect to remote browser session")?;

        Ok(Box::new(WebDriverPage { driver }))
    }
}

// --- WebDriver-backed page ---

pub struct WebDriverPage {
    driver: WebDriver,
}

impl WebDriverPage {
    async fn element(&self, at: &Locator) -> Result<WebElement> {
        self.driver
            .find(at.by())
            .await
            .with_context(|| format!("Element {:?} not found", at))
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {}", url))
    }

    async fn content(&self) -> Result<String> {
        self.driver.source().await.context("Failed to read page source")
    }

    async fn scroll_by(&self, pixels: i64) -> Result<()> {
        let script = format!("window.scrollBy({{ top: {}, behavior: 'smooth' }});", pixels);
        self.driver
            .execute(script, Vec::new())
            .await
            .context("Failed to scroll page")?;
        Ok(())
    }

    async fn wait_for(&self, candidates: &[Locator], timeout: Duration) -> Result<Option<Locator>> {
        let deadline = Instant::now() + timeout;
        loop {
            for candidate in candidates {
                if let Ok(element) = self.driver.find(candidate.by()).await {
                    if element.is_displayed().await.unwrap_or(false) {
                        return Ok(Some(*candidate));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scroll_into_view(&self, at: &Locator) -> Result<()> {
        self.element(at).await?.scroll_into_view().await?;
        Ok(())
    }

    async fn click(&self, at: &Locator) -> Result<()> {
        self.element(at)
            .await?
            .click()
            .await
            .with_context(|| format!("Failed to click {:?}", at))
    }

    async fn fill(&self, at: &Locator, text: &str) -> Result<()> {
        let element = self.element(at).await?;
        element.clear().await?;
        element
            .send_keys(text)
            .await
            .with_context(|| format!("Failed to type into {:?}", at))
    }

    async fn text(&self, at: &Locator) -> Result<String> {
        Ok(self.element(at).await?.text().await?)
    }

    async fn close(&self) -> Result<()> {
        self.driver.clone().quit().await?;
        Ok(())
    }
}
