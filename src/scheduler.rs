//! Cron entry points.
//!
//! Both jobs only fan out tasks onto the queue; the work itself runs in the
//! worker. Auto-apply tasks get a random delay each so accounts do not all
//! hit the marketplace at the same instant.
//!
//! The queue lives in memory, so a submission task can be lost with the
//! process that held it. Approved records are therefore re-queued at startup
//! and on every discovery tick; the submitter skips anything no longer
//! approved.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::Config;
use crate::engine::Engine;
use crate::models::RunSource;
use crate::tasks::Task;

/// Queues a cron discovery run for every account that has settings.
pub fn schedule_discovery(engine: &Engine) -> Result<usize> {
    let accounts = engine.db.list_settings()?;
    for settings in &accounts {
        engine.queue.schedule_after(
            Duration::ZERO,
            Task::Discover {
                user_id: settings.user_id.clone(),
                source: RunSource::Cron,
            },
        )?;
    }
    Ok(accounts.len())
}

/// Queues a submission for every record still sitting in `approved`.
pub fn resume_approved(engine: &Engine) -> Result<usize> {
    let approved = engine.db.list_approved_applications()?;
    for app in &approved {
        tracing::info!(account = %app.user_id, application_id = app.id, "Re-queueing approved application");
        engine.queue.schedule_after(
            Duration::ZERO,
            Task::Submit {
                application_id: app.id,
                user_id: app.user_id.clone(),
            },
        )?;
    }
    Ok(approved.len())
}

/// Queues the discover-and-queue workflow for every enabled account, each
/// after a uniform random delay in `[0, engine.jitter_max)`.
pub fn schedule_auto_apply<R: Rng + ?Sized>(engine: &Engine, rng: &mut R) -> Result<usize> {
    let max_ms = engine.jitter_max.as_millis() as u64;
    let mut scheduled = 0;
    for settings in engine.db.list_settings()?.into_iter().filter(|s| s.enabled) {
        let jitter = if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..max_ms))
        };
        tracing::debug!(account = %settings.user_id, jitter_secs = jitter.as_secs(), "Auto-apply scheduled");
        engine.queue.schedule_after(jitter, Task::AutoApply { user_id: settings.user_id })?;
        scheduled += 1;
    }
    Ok(scheduled)
}

/// Start the cron jobs
pub async fn start_scheduler(engine: Arc<Engine>, config: &Config) -> Result<JobScheduler> {
    let resumed = resume_approved(&engine)?;
    if resumed > 0 {
        tracing::info!(applications = resumed, "Resumed approved applications");
    }

    let scheduler = JobScheduler::new().await?;

    let discovery_engine = engine.clone();
    let discovery_job = Job::new_async(config.discovery_cron.as_str(), move |_uuid, _lock| {
        let engine = discovery_engine.clone();
        Box::pin(async move {
            match schedule_discovery(&engine) {
                Ok(count) => tracing::info!(accounts = count, "Scheduled discovery runs"),
                Err(e) => tracing::error!("Scheduled discovery failed: {}", e),
            }
            if let Err(e) = resume_approved(&engine) {
                tracing::error!("Re-queueing approved applications failed: {}", e);
            }
        })
    })?;
    scheduler.add(discovery_job).await?;

    let apply_engine = engine.clone();
    let apply_job = Job::new_async(config.auto_apply_cron.as_str(), move |_uuid, _lock| {
        let engine = apply_engine.clone();
        Box::pin(async move {
            match schedule_auto_apply(&engine, &mut rand::thread_rng()) {
                Ok(count) => tracing::info!(accounts = count, "Scheduled auto-apply runs"),
                Err(e) => tracing::error!("Scheduled auto-apply failed: {}", e),
            }
        })
    })?;
    scheduler.add(apply_job).await?;

    scheduler.start().await?;
    tracing::info!(
        discovery = %config.discovery_cron,
        auto_apply = %config.auto_apply_cron,
        "Scheduled tasks started"
    );
    Ok(scheduler)
}
