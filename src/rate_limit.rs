use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::models::RunSource;
use crate::tasks::Task;

pub const LIMIT_REACHED_MESSAGE: &str = "Refresh limit reached for today. Try again tomorrow.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshDecision {
    pub allowed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub count_today: u32,
    pub cap: u32,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Spends one of today's manual refreshes and schedules a discovery run.
/// Counting is per UTC calendar day. Over the cap nothing is written and
/// nothing is scheduled.
pub fn request_manual_refresh(engine: &Engine, user_id: &str) -> Result<RefreshDecision> {
    let today = engine.clock.today_utc();
    let Some(count) = engine.db.try_increment_refresh(user_id, &today, engine.refresh_cap)? else {
        tracing::info!(account = %user_id, cap = engine.refresh_cap, "Manual refresh refused, daily cap reached");
        return Ok(RefreshDecision {
            allowed: false,
            message: Some(LIMIT_REACHED_MESSAGE.to_string()),
        });
    };

    let scheduled = engine.queue.schedule_after(
        Duration::ZERO,
        Task::Discover {
            user_id: user_id.to_string(),
            source: RunSource::Manual,
        },
    );
    if let Err(e) = scheduled {
        engine.db.release_refresh(user_id, &today)?;
        return Err(e.context("Failed to schedule manual discovery"));
    }
    tracing::info!(account = %user_id, count, cap = engine.refresh_cap, "Manual refresh scheduled");
    Ok(RefreshDecision {
        allowed: true,
        message: None,
    })
}

pub fn discovery_status(engine: &Engine, user_id: &str) -> Result<DiscoveryStatus> {
    let today = engine.clock.today_utc();
    Ok(DiscoveryStatus {
        count_today: engine.db.refresh_count(user_id, &today)?,
        cap: engine.refresh_cap,
        last_run_at: engine.db.last_discovery_run(user_id)?.map(|run| run.run_at),
    })
}
