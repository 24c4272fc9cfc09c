use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

pub const MAX_APPLICATIONS_PER_RUN: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct AutoApplySettings {
    pub user_id: String,
    pub enabled: bool,
    pub min_budget: f64,
    pub max_applications_per_run: u32, // 1..=10
    pub boost_to_first_place: bool,
    pub default_video_link: Option<String>,
    pub browser_context_id: Option<String>,
    pub search_query: Option<String>,
}

/// Partial update applied by `Database::upsert_settings`. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub min_budget: Option<f64>,
    pub max_applications_per_run: Option<u32>,
    pub boost_to_first_place: Option<bool>,
    pub default_video_link: Option<String>,
    pub browser_context_id: Option<String>,
    pub search_query: Option<String>,
}

impl AutoApplySettings {
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            enabled: false,
            min_budget: 5000.0,
            max_applications_per_run: 3,
            boost_to_first_place: true,
            default_video_link: None,
            browser_context_id: None,
            search_query: None,
        }
    }

    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(min_budget) = patch.min_budget {
            self.min_budget = min_budget;
        }
        if let Some(max) = patch.max_applications_per_run {
            self.max_applications_per_run = max;
        }
        if let Some(boost) = patch.boost_to_first_place {
            self.boost_to_first_place = boost;
        }
        if patch.default_video_link.is_some() {
            self.default_video_link = patch.default_video_link;
        }
        if patch.browser_context_id.is_some() {
            self.browser_context_id = patch.browser_context_id;
        }
        if patch.search_query.is_some() {
            self.search_query = patch.search_query;
        }
        self.clamp();
    }

    fn clamp(&mut self) {
        self.max_applications_per_run = self.max_applications_per_run.clamp(1, MAX_APPLICATIONS_PER_RUN);
        if !self.min_budget.is_finite() || self.min_budget < 0.0 {
            self.min_budget = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelevanceTier {
    Gold,
    Silver,
    Bronze,
}

impl RelevanceTier {
    pub fn from_budget(amount: f64) -> Self {
        if amount >= 5000.0 {
            RelevanceTier::Gold
        } else if amount >= 1000.0 {
            RelevanceTier::Silver
        } else {
            RelevanceTier::Bronze
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceTier::Gold => "gold",
            RelevanceTier::Silver => "silver",
            RelevanceTier::Bronze => "bronze",
        }
    }
}

impl FromStr for RelevanceTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gold" => Ok(RelevanceTier::Gold),
            "silver" => Ok(RelevanceTier::Silver),
            "bronze" => Ok(RelevanceTier::Bronze),
            other => Err(anyhow!("Unknown relevance tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredJob {
    pub id: i64,
    pub user_id: String,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub budget_info: Option<String>,
    pub budget_amount: Option<f64>,
    pub budget_currency: Option<String>,
    pub tier: Option<RelevanceTier>,
    pub posted_at: Option<DateTime<Utc>>,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub proposal_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl DiscoveredJob {
    /// Recency key used for ordering: when the posting went live, or when we
    /// first saw it if the marketplace did not say.
    pub fn recency(&self) -> DateTime<Utc> {
        self.posted_at.unwrap_or(self.created_at)
    }
}

/// A posting after normalization, ready to be written to the job ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub budget_info: Option<String>,
    pub budget_amount: Option<f64>,
    pub budget_currency: Option<String>,
    pub tier: Option<RelevanceTier>,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
    Submitted,
    Failed,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::Failed => "failed",
        }
    }

    /// Legal edges of the application lifecycle.
    pub fn can_become(&self, next: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Submitted) | (Approved, Failed)
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApplicationStatus::Pending),
            "approved" => Ok(ApplicationStatus::Approved),
            "rejected" => Ok(ApplicationStatus::Rejected),
            "submitted" => Ok(ApplicationStatus::Submitted),
            "failed" => Ok(ApplicationStatus::Failed),
            other => Err(anyhow!("Unknown application status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingApplication {
    pub id: i64,
    pub user_id: String,
    pub discovered_job_id: i64,
    pub external_job_id: String,
    pub job_title: String,
    pub budget_amount: Option<f64>,
    pub cover_letter: String,
    pub video_link: Option<String>,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStatus {
    Sent,
    Viewed,
    LoomViewed,
    Interviewing,
    Signed,
}

impl FunnelStatus {
    pub const ALL: [FunnelStatus; 5] = [
        FunnelStatus::Sent,
        FunnelStatus::Viewed,
        FunnelStatus::LoomViewed,
        FunnelStatus::Interviewing,
        FunnelStatus::Signed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStatus::Sent => "sent",
            FunnelStatus::Viewed => "viewed",
            FunnelStatus::LoomViewed => "loom_viewed",
            FunnelStatus::Interviewing => "interviewing",
            FunnelStatus::Signed => "signed",
        }
    }
}

impl fmt::Display for FunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FunnelStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(FunnelStatus::Sent),
            "viewed" => Ok(FunnelStatus::Viewed),
            "loom_viewed" => Ok(FunnelStatus::LoomViewed),
            "interviewing" => Ok(FunnelStatus::Interviewing),
            "signed" => Ok(FunnelStatus::Signed),
            other => Err(anyhow!(
                "Unknown funnel status '{}'. Expected one of: sent, viewed, loom_viewed, interviewing, signed",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: i64,
    pub user_id: String,
    pub external_job_id: String,
    pub job_title: String,
    pub cover_letter: String,
    pub video_link: Option<String>,
    pub status: FunnelStatus,
    pub boosted: bool,
    pub sent_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub loom_viewed_at: Option<DateTime<Utc>>,
    pub interviewing_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSource {
    Cron,
    Manual,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Cron => "cron",
            RunSource::Manual => "manual",
        }
    }
}

impl fmt::Display for RunSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(RunSource::Cron),
            "manual" => Ok(RunSource::Manual),
            other => Err(anyhow!("Unknown run source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryRun {
    pub id: i64,
    pub user_id: String,
    pub run_at: DateTime<Utc>,
    pub source: RunSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}
