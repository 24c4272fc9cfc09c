use anyhow::Result;

use crate::candidates::select_candidates;
use crate::cover_letter;
use crate::engine::Engine;
use crate::queue;

/// Picks the account's best unapplied jobs and queues each for review with a
/// composed cover letter. Returns how many records were queued; a disabled or
/// unconfigured account queues nothing.
pub async fn run_auto_apply_workflow(engine: &Engine, user_id: &str) -> Result<usize> {
    let settings = match engine.db.get_settings(user_id)? {
        Some(settings) if settings.enabled => settings,
        _ => {
            tracing::info!(account = %user_id, "Auto-apply disabled or not set up, nothing to queue");
            return Ok(0);
        }
    };

    let candidates = select_candidates(
        &engine.db,
        user_id,
        settings.min_budget,
        settings.max_applications_per_run as usize,
    )?;
    if candidates.is_empty() {
        tracing::info!(account = %user_id, min_budget = settings.min_budget, "No qualifying jobs found");
        return Ok(0);
    }

    let video_link = settings
        .default_video_link
        .clone()
        .filter(|link| !link.trim().is_empty());
    let now = engine.clock.now();
    for job in &candidates {
        let letter = cover_letter::compose(&job.title, video_link.as_deref());
        queue::enqueue(&engine.db, user_id, job, letter, video_link.clone(), now)?;
    }

    tracing::info!(account = %user_id, queued = candidates.len(), "Queued applications for review");
    Ok(candidates.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::run_discovery;
    use crate::models::{ApplicationStatus, RunSource, SettingsPatch};
    use crate::testing::{posting, FakeLauncher, FakeMarketplace, Harness};

    fn enable(h: &Harness, user: &str, patch: SettingsPatch) {
        h.db.upsert_settings(
            user,
            SettingsPatch {
                enabled: Some(true),
                ..patch
            },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_discover_then_queue_end_to_end() {
        let h = Harness::with(
            FakeMarketplace::with_postings(vec![
                posting("cheap", Some("3000")),
                posting("floor", Some("5000")),
                posting("rich", Some("7000")),
            ]),
            FakeLauncher::unavailable(),
        );
        h.connect("a");
        enable(
            &h,
            "a",
            SettingsPatch {
                min_budget: Some(5000.0),
                max_applications_per_run: Some(2),
                ..Default::default()
            },
        );

        let report = run_discovery(&h.engine, "a", RunSource::Cron).await.unwrap();
        assert_eq!(report.inserted, 3);

        assert_eq!(run_auto_apply_workflow(&h.engine, "a").await.unwrap(), 2);

        let apps = h.db.list_applications("a", 50).unwrap();
        assert_eq!(apps.len(), 2);
        let mut ids: Vec<_> = apps.iter().map(|a| a.external_job_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["floor", "rich"]);
        for app in &apps {
            assert_eq!(app.status, ApplicationStatus::Pending);
            assert!(!app.cover_letter.is_empty());
            assert!(app.cover_letter.contains(&format!("\"{}\"", app.job_title)));
        }
    }

    #[tokio::test]
    async fn test_second_run_does_not_requeue_pending_jobs() {
        let h = Harness::with(
            FakeMarketplace::with_postings(vec![posting("1", Some("9000"))]),
            FakeLauncher::unavailable(),
        );
        h.connect("a");
        enable(&h, "a", SettingsPatch::default());
        run_discovery(&h.engine, "a", RunSource::Cron).await.unwrap();

        assert_eq!(run_auto_apply_workflow(&h.engine, "a").await.unwrap(), 1);
        assert_eq!(run_auto_apply_workflow(&h.engine, "a").await.unwrap(), 0);
        assert_eq!(h.db.list_applications("a", 50).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_or_missing_settings_queue_nothing() {
        let h = Harness::new();
        h.db.insert_discovered_job("a", &crate::testing::new_job("1", Some(9000.0)), crate::testing::ts(0))
            .unwrap();
        assert_eq!(run_auto_apply_workflow(&h.engine, "a").await.unwrap(), 0);

        h.db.upsert_settings("a", SettingsPatch::default()).unwrap();
        assert_eq!(run_auto_apply_workflow(&h.engine, "a").await.unwrap(), 0);
        assert!(h.db.list_applications("a", 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_video_link_flows_into_letter_and_record() {
        let h = Harness::new();
        h.db.insert_discovered_job("a", &crate::testing::new_job("1", Some(9000.0)), crate::testing::ts(0))
            .unwrap();
        enable(
            &h,
            "a",
            SettingsPatch {
                default_video_link: Some("https://loom.example/abc".into()),
                ..Default::default()
            },
        );
        run_auto_apply_workflow(&h.engine, "a").await.unwrap();
        let app = &h.db.list_applications("a", 50).unwrap()[0];
        assert_eq!(app.video_link.as_deref(), Some("https://loom.example/abc"));
        assert!(app.cover_letter.contains("https://loom.example/abc"));
    }
}
