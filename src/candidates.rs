use std::collections::HashSet;

use anyhow::Result;

use crate::db::Database;
use crate::models::DiscoveredJob;

/// Picks up to `limit` jobs worth queueing: not applied yet, budget known and
/// at least `min_budget`, and not already waiting for review. Most recently
/// posted first.
pub fn select_candidates(db: &Database, user_id: &str, min_budget: f64, limit: usize) -> Result<Vec<DiscoveredJob>> {
    let jobs = db.list_unapplied_jobs(user_id)?;
    let pending = db.pending_external_ids(user_id)?;
    Ok(filter_candidates(jobs, &pending, min_budget, limit))
}

pub fn filter_candidates(
    jobs: Vec<DiscoveredJob>,
    pending: &HashSet<String>,
    min_budget: f64,
    limit: usize,
) -> Vec<DiscoveredJob> {
    let mut eligible: Vec<DiscoveredJob> = jobs
        .into_iter()
        .filter(|job| !job.applied)
        .filter(|job| job.budget_amount.is_some_and(|amount| amount >= min_budget))
        .filter(|job| !pending.contains(&job.external_id))
        .collect();

    eligible.sort_by(|a, b| b.recency().cmp(&a.recency()));
    eligible.truncate(limit);
    eligible
}
