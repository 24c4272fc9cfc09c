//! Review queue for candidate applications.
//!
//! A record moves `pending -> approved | rejected`, and an approved record
//! moves `approved -> submitted | failed` once the submitter has run. Human
//! actions on a record that already left `pending` are reported as
//! [`Transition::Skipped`]: the usual cause is a double click or a task
//! delivered twice, not a bug.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::db::{Database, NewApplication};
use crate::engine::Engine;
use crate::models::{ApplicationStatus, DiscoveredJob, PendingApplication};
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Skipped { current: ApplicationStatus },
}

pub fn enqueue(
    db: &Database,
    user_id: &str,
    job: &DiscoveredJob,
    cover_letter: String,
    video_link: Option<String>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = db.insert_application(
        user_id,
        &NewApplication {
            discovered_job_id: job.id,
            external_job_id: job.external_id.clone(),
            job_title: job.title.clone(),
            budget_amount: job.budget_amount,
            cover_letter,
            video_link,
        },
        now,
    )?;
    tracing::debug!(account = %user_id, application_id = id, job = %job.external_id, "Queued application for review");
    Ok(id)
}

/// Loads an application only if it belongs to `user_id`. Someone else's
/// record is reported exactly like a missing one.
fn owned(db: &Database, user_id: &str, application_id: i64) -> Result<PendingApplication> {
    db.get_application(application_id)?
        .filter(|app| app.user_id == user_id)
        .ok_or_else(|| anyhow!("Application not found"))
}

fn decide(
    db: &Database,
    user_id: &str,
    application_id: i64,
    to: ApplicationStatus,
) -> Result<Transition> {
    let app = owned(db, user_id, application_id)?;
    if app.status != ApplicationStatus::Pending {
        return Ok(Transition::Skipped { current: app.status });
    }
    if db.transition_application(application_id, ApplicationStatus::Pending, to, None)? {
        return Ok(Transition::Applied);
    }
    // Lost a race with another decision on the same record.
    let current = owned(db, user_id, application_id)?.status;
    Ok(Transition::Skipped { current })
}

/// Approves a pending record and schedules its submission. Only the caller
/// that wins the `pending -> approved` change schedules anything, so repeated
/// approvals never produce a second submission task.
pub fn approve(engine: &Engine, user_id: &str, application_id: i64) -> Result<Transition> {
    let outcome = decide(&engine.db, user_id, application_id, ApplicationStatus::Approved)?;
    match outcome {
        Transition::Applied => {
            engine.queue.schedule_after(
                Duration::ZERO,
                Task::Submit {
                    application_id,
                    user_id: user_id.to_string(),
                },
            )?;
            tracing::info!(account = %user_id, application_id, "Application approved, submission scheduled");
        }
        Transition::Skipped { current } => {
            tracing::info!(account = %user_id, application_id, current = %current, "Approve ignored, application is not pending");
        }
    }
    Ok(outcome)
}

pub fn reject(db: &Database, user_id: &str, application_id: i64) -> Result<Transition> {
    let outcome = decide(db, user_id, application_id, ApplicationStatus::Rejected)?;
    if let Transition::Skipped { current } = outcome {
        tracing::info!(account = %user_id, application_id, current = %current, "Reject ignored, application is not pending");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_job, ts, Harness};

    fn queued(h: &Harness, user: &str, external_id: &str) -> i64 {
        let (job_id, _) = h
            .db
            .insert_discovered_job(user, &new_job(external_id, Some(6000.0)), ts(0))
            .unwrap();
        let job = h.db.get_discovered_job(user, job_id).unwrap().unwrap();
        enqueue(&h.db, user, &job, "Hi".into(), None, ts(1)).unwrap()
    }

    #[test]
    fn test_enqueue_creates_pending_record() {
        let h = Harness::new();
        let id = queued(&h, "a", "j1");
        let app = h.db.get_application(id).unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert_eq!(app.job_title, "Job j1");
        assert_eq!(app.budget_amount, Some(6000.0));
        assert!(h.queue.tasks().is_empty());
    }

    #[test]
    fn test_approve_schedules_exactly_one_submission() {
        let h = Harness::new();
        let id = queued(&h, "a", "j1");

        assert_eq!(approve(&h.engine, "a", id).unwrap(), Transition::Applied);
        assert_eq!(
            approve(&h.engine, "a", id).unwrap(),
            Transition::Skipped { current: ApplicationStatus::Approved }
        );

        let tasks = h.queue.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, Duration::ZERO);
        assert_eq!(tasks[0].1, Task::Submit { application_id: id, user_id: "a".into() });
    }

    #[test]
    fn test_reject_then_approve_is_skipped() {
        let h = Harness::new();
        let id = queued(&h, "a", "j1");

        assert_eq!(reject(&h.db, "a", id).unwrap(), Transition::Applied);
        assert_eq!(
            approve(&h.engine, "a", id).unwrap(),
            Transition::Skipped { current: ApplicationStatus::Rejected }
        );
        assert_eq!(
            reject(&h.db, "a", id).unwrap(),
            Transition::Skipped { current: ApplicationStatus::Rejected }
        );
        assert_eq!(h.db.get_application(id).unwrap().unwrap().status, ApplicationStatus::Rejected);
        assert!(h.queue.tasks().is_empty());
    }

    #[test]
    fn test_reject_after_approve_is_skipped() {
        let h = Harness::new();
        let id = queued(&h, "a", "j1");
        approve(&h.engine, "a", id).unwrap();
        assert_eq!(
            reject(&h.db, "a", id).unwrap(),
            Transition::Skipped { current: ApplicationStatus::Approved }
        );
    }

    #[test]
    fn test_other_accounts_cannot_decide() {
        let h = Harness::new();
        let id = queued(&h, "a", "j1");

        let err = approve(&h.engine, "b", id).unwrap_err();
        assert_eq!(err.to_string(), "Application not found");
        assert!(reject(&h.db, "b", id).is_err());
        assert!(approve(&h.engine, "a", 12345).is_err());
        assert_eq!(h.db.get_application(id).unwrap().unwrap().status, ApplicationStatus::Pending);
    }
}
