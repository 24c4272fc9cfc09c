//! Test doubles shared by the module tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::browser::{BrowserLauncher, BrowserPage, Locator, SessionConfig};
use crate::clock::{Clock, Pacer};
use crate::db::Database;
use crate::engine::Engine;
use crate::humanize::HumanDelay;
use crate::marketplace::{JobPosting, MarketplaceClient, SearchCriteria, SearchResults};
use crate::models::{NewJob, RelevanceTier};
use crate::oauth::{TokenGrant, TokenRefresher};
use crate::tasks::{Task, TaskQueue};

/// Seconds after 2026-01-01T00:00:00Z.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

pub fn new_job(external_id: &str, budget: Option<f64>) -> NewJob {
    NewJob {
        external_id: external_id.to_string(),
        title: format!("Job {}", external_id),
        description: Some(format!("Description for {}", external_id)),
        budget_info: budget.map(|b| format!("USD {}", b)),
        budget_amount: budget,
        budget_currency: budget.map(|_| "USD".to_string()),
        tier: budget.map(RelevanceTier::from_budget),
        posted_at: Some(ts(0)),
    }
}

pub fn posting(external_id: &str, budget: Option<&str>) -> JobPosting {
    JobPosting {
        external_id: external_id.to_string(),
        title: format!("Job {}", external_id),
        description: Some("Looking for help".to_string()),
        budget_amount: budget.map(str::to_string),
        budget_currency: budget.map(|_| "USD".to_string()),
        created_date_time: Some("2026-01-01T00:00:00Z".to_string()),
        ..Default::default()
    }
}

pub struct NoopPacer;

#[async_trait]
impl Pacer for NoopPacer {
    async fn pause(&self, _duration: Duration) {}
}

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Issues predictable tokens: `access-for-{code}` on exchange and
/// `refreshed-{refresh_token}` on refresh (without a new refresh token).
#[derive(Default)]
pub struct FakeOAuth;

#[async_trait]
impl TokenRefresher for FakeOAuth {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: format!("access-for-{}", code),
            refresh_token: Some(format!("refresh-for-{}", code)),
            expires_in: 3600,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", refresh_token),
            refresh_token: None,
            expires_in: 3600,
        })
    }
}

#[derive(Default)]
pub struct FakeMarketplace {
    postings: Vec<JobPosting>,
    failure: Option<String>,
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeMarketplace {
    pub fn with_postings(postings: Vec<JobPosting>) -> Self {
        Self {
            postings,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MarketplaceClient for FakeMarketplace {
    async fn search_job_postings(&self, access_token: &str, criteria: &SearchCriteria) -> Result<SearchResults> {
        self.calls
            .lock()
            .unwrap()
            .push((access_token.to_string(), criteria.query.clone()));
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(SearchResults {
            total_count: self.postings.len() as u64,
            postings: self.postings.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<(Duration, Task)>>,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<(Duration, Task)> {
        self.tasks.lock().unwrap().clone()
    }
}

impl TaskQueue for RecordingQueue {
    fn schedule_after(&self, delay: Duration, task: Task) -> Result<()> {
        self.tasks.lock().unwrap().push((delay, task));
        Ok(())
    }
}

#[derive(Default)]
struct PageState {
    /// Returned by successive `content()` calls; the last one repeats.
    contents: VecDeque<String>,
    present: Vec<Locator>,
    texts: HashMap<Locator, String>,
    failing: Vec<Locator>,
    goto_hangs: bool,
    close_fails: bool,
    calls: Vec<String>,
}

/// Scriptable page that records every interaction as a short string such as
/// `fill Css("textarea.cover-letter")` so tests can assert on the sequence.
#[derive(Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<PageState>>,
}

impl FakePage {
    pub fn new(contents: &[&str]) -> Self {
        let page = Self::default();
        page.state.lock().unwrap().contents = contents.iter().map(|c| c.to_string()).collect();
        page
    }

    pub fn with_element(self, at: Locator) -> Self {
        self.state.lock().unwrap().present.push(at);
        self
    }

    pub fn with_text(self, at: Locator, text: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.present.push(at);
            state.texts.insert(at, text.to_string());
        }
        self
    }

    /// The element is present but clicking or typing into it errors.
    pub fn broken(self, at: Locator) -> Self {
        self.state.lock().unwrap().failing.push(at);
        self
    }

    /// Navigation never completes.
    pub fn hanging(self) -> Self {
        self.state.lock().unwrap().goto_hangs = true;
        self
    }

    /// Closing the session errors.
    pub fn failing_close(self) -> Self {
        self.state.lock().unwrap().close_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn interact(&self, verb: &str, at: &Locator) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {:?}", verb, at));
        if !state.present.contains(at) {
            return Err(anyhow!("no element {:?}", at));
        }
        if state.failing.contains(at) {
            return Err(anyhow!("element {:?} is not interactable", at));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.record(format!("goto {}", url));
        let hangs = self.state.lock().unwrap().goto_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("content".to_string());
        let html = if state.contents.len() > 1 {
            state.contents.pop_front()
        } else {
            state.contents.front().cloned()
        };
        Ok(html.unwrap_or_default())
    }

    async fn scroll_by(&self, pixels: i64) -> Result<()> {
        self.record(format!("scroll {}", pixels));
        Ok(())
    }

    async fn wait_for(&self, candidates: &[Locator], _timeout: Duration) -> Result<Option<Locator>> {
        let state = self.state.lock().unwrap();
        Ok(candidates.iter().find(|c| state.present.contains(c)).copied())
    }

    async fn scroll_into_view(&self, at: &Locator) -> Result<()> {
        self.interact("scroll_into_view", at)
    }

    async fn click(&self, at: &Locator) -> Result<()> {
        self.interact("click", at)
    }

    async fn fill(&self, at: &Locator, text: &str) -> Result<()> {
        self.interact("fill", at)?;
        self.record(format!("typed {}", text));
        Ok(())
    }

    async fn text(&self, at: &Locator) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .texts
            .get(at)
            .cloned()
            .ok_or_else(|| anyhow!("no text for {:?}", at))
    }

    async fn close(&self) -> Result<()> {
        self.record("close".to_string());
        if self.state.lock().unwrap().close_fails {
            return Err(anyhow!("session already gone"));
        }
        Ok(())
    }
}

pub struct FakeLauncher {
    page: FakePage,
    fail: bool,
    pub launches: Mutex<Vec<SessionConfig>>,
}

impl FakeLauncher {
    pub fn serving(page: FakePage) -> Self {
        Self {
            page,
            fail: false,
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            page: FakePage::default(),
            fail: true,
            launches: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, config: &SessionConfig) -> Result<Box<dyn BrowserPage>> {
        self.launches.lock().unwrap().push(config.clone());
        if self.fail {
            return Err(anyhow!("session provider unreachable"));
        }
        Ok(Box::new(self.page.clone()))
    }
}

/// Everything an `Engine` needs, with handles kept for assertions.
pub struct Harness {
    pub db: Arc<Database>,
    pub queue: Arc<RecordingQueue>,
    pub clock: Arc<FixedClock>,
    pub marketplace: Arc<FakeMarketplace>,
    pub launcher: Arc<FakeLauncher>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeMarketplace::default(), FakeLauncher::serving(FakePage::default()))
    }

    pub fn with(marketplace: FakeMarketplace, launcher: FakeLauncher) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(RecordingQueue::default());
        let clock = Arc::new(FixedClock::at(ts(0)));
        let marketplace = Arc::new(marketplace);
        let launcher = Arc::new(launcher);
        let engine = Engine {
            db: db.clone(),
            marketplace: Some(marketplace.clone()),
            oauth: Some(Arc::new(FakeOAuth)),
            launcher: launcher.clone(),
            queue: queue.clone(),
            clock: clock.clone(),
            delay: Arc::new(HumanDelay::with_rng(Arc::new(NoopPacer), StdRng::seed_from_u64(11))),
            refresh_cap: 3,
            jitter_max: Duration::from_secs(2 * 60 * 60),
        };
        Self {
            db,
            queue,
            clock,
            marketplace,
            launcher,
            engine,
        }
    }

    /// Stores a non-expiring token pair so discovery can run.
    pub fn connect(&self, user_id: &str) {
        self.db
            .save_credentials(
                user_id,
                &crate::models::TokenPair {
                    access_token: format!("token-{}", user_id),
                    refresh_token: "refresh".to_string(),
                    expires_at: ts(365 * 24 * 3600),
                },
            )
            .unwrap();
    }
}
