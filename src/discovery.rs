use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::db::Database;
use crate::engine::Engine;
use crate::marketplace::{JobPosting, SearchCriteria};
use crate::models::{NewJob, RelevanceTier, RunSource};
use crate::oauth;

/// Stored descriptions are cut to this many characters.
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub fetched: usize,
    pub inserted: usize,
    pub already_known: usize,
    pub failed: usize,
}

/// Reads the leading decimal number of `raw`, ignoring anything after it:
/// `"1500.50 USD"` is 1500.5, `"USD 1500"` is nothing.
pub fn parse_budget(raw: &str) -> Option<f64> {
    let re = regex::Regex::new(r"^\s*[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").ok()?;
    let m = re.find(raw)?;
    m.as_str().trim_start().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Display string such as `USD 5000 · 3 to 6 months`.
pub fn budget_info(amount: Option<&str>, currency: Option<&str>, duration: Option<&str>) -> Option<String> {
    let amount = amount.filter(|a| !a.is_empty());
    let currency = currency.filter(|c| !c.is_empty());
    let duration = duration.filter(|d| !d.is_empty());

    let base = match (amount, currency) {
        (Some(amount), Some(currency)) => Some(format!("{} {}", currency, amount)),
        (Some(amount), None) => Some(amount.to_string()),
        _ => None,
    };
    match (base, duration) {
        (Some(base), Some(duration)) => Some(format!("{} · {}", base, duration)),
        (Some(base), None) => Some(base),
        (None, Some(duration)) => Some(duration.to_string()),
        (None, None) => None,
    }
}

pub fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

/// Accepts the timestamp shapes the marketplace has been seen to send.
/// Values without an offset are read as UTC.
pub fn parse_posted_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn normalize(posting: &JobPosting) -> NewJob {
    let raw_amount = posting.budget_amount.as_deref();
    let budget_amount = raw_amount.and_then(parse_budget);
    NewJob {
        external_id: posting.external_id.clone(),
        title: posting.title.clone(),
        description: posting
            .description
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(truncate_description),
        budget_info: budget_info(
            raw_amount,
            posting.budget_currency.as_deref(),
            posting.duration.as_deref(),
        ),
        budget_amount,
        budget_currency: posting.budget_currency.clone().filter(|c| !c.is_empty()),
        tier: budget_amount.map(RelevanceTier::from_budget),
        posted_at: posting.created_date_time.as_deref().and_then(parse_posted_at),
    }
}

/// Writes each posting for the account. A posting that fails to store is
/// logged and skipped; the rest still land.
pub fn ingest(db: &Database, user_id: &str, postings: &[JobPosting], now: DateTime<Utc>) -> DiscoveryReport {
    let mut report = DiscoveryReport {
        fetched: postings.len(),
        ..Default::default()
    };
    for posting in postings {
        let job = normalize(posting);
        match db.insert_discovered_job(user_id, &job, now) {
            Ok((_, true)) => report.inserted += 1,
            Ok((_, false)) => report.already_known += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    account = %user_id,
                    external_id = %posting.external_id,
                    error = %e,
                    "Failed to store discovered job"
                );
            }
        }
    }
    report
}

/// One discovery pass for one account. The run is logged before anything
/// else so "last run" reflects the attempt even when the search fails.
/// Missing configuration or a failed search end the run quietly; only
/// storage errors on the run log itself are returned.
pub async fn run_discovery(engine: &Engine, user_id: &str, source: RunSource) -> Result<DiscoveryReport> {
    let now = engine.clock.now();
    engine.db.record_discovery_run(user_id, source, now)?;

    let Some(marketplace) = engine.marketplace.as_deref() else {
        tracing::error!(account = %user_id, "Marketplace client not configured (UPWORK_CLIENT_ID / UPWORK_CLIENT_SECRET missing)");
        return Ok(DiscoveryReport::default());
    };

    let access_token = match oauth::fresh_access_token(&engine.db, engine.oauth.as_deref(), user_id, now).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            tracing::warn!(account = %user_id, "Account has not connected a marketplace login, skipping discovery");
            return Ok(DiscoveryReport::default());
        }
        Err(e) => {
            tracing::error!(account = %user_id, error = %e, "Could not obtain marketplace access token");
            return Ok(DiscoveryReport::default());
        }
    };

    let criteria = SearchCriteria {
        query: engine.db.get_settings(user_id)?.and_then(|s| s.search_query),
    };
    let results = match marketplace.search_job_postings(&access_token, &criteria).await {
        Ok(results) => results,
        Err(e) => {
            tracing::error!(account = %user_id, source = %source, error = %e, "Marketplace search failed");
            return Ok(DiscoveryReport::default());
        }
    };

    let report = ingest(&engine.db, user_id, &results.postings, now);
    tracing::info!(
        account = %user_id,
        source = %source,
        fetched = report.fetched,
        total = results.total_count,
        new = report.inserted,
        "Discovery finished"
    );
    Ok(report)
}
