use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::models::{
    ApplicationStatus, AutoApplySettings, DiscoveredJob, DiscoveryRun, FunnelStatus, NewJob,
    PendingApplication, Proposal, RunSource, SettingsPatch, TokenPair,
};

/// Fields needed to queue a candidate for human review.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub discovered_job_id: i64,
    pub external_job_id: String,
    pub job_title: String,
    pub budget_amount: Option<f64>,
    pub cover_letter: String,
    pub video_link: Option<String>,
}

pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "autobid") {
            Ok(proj_dirs.data_dir().join("autobid.db"))
        } else {
            Ok(PathBuf::from("autobid.db"))
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> MutexGuard<'_, Connection> {
        self.conn().unwrap()
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS auto_apply_settings (
                user_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 0,
                min_budget REAL NOT NULL DEFAULT 5000 CHECK (min_budget >= 0),
                max_applications_per_run INTEGER NOT NULL DEFAULT 3
                    CHECK (max_applications_per_run BETWEEN 1 AND 10),
                boost_to_first_place INTEGER NOT NULL DEFAULT 1,
                default_video_link TEXT,
                browser_context_id TEXT,
                search_query TEXT
            );

            CREATE TABLE IF NOT EXISTS proposals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                external_job_id TEXT NOT NULL,
                job_title TEXT NOT NULL,
                cover_letter TEXT NOT NULL,
                video_link TEXT,
                status TEXT NOT NULL DEFAULT 'sent'
                    CHECK (status IN ('sent', 'viewed', 'loom_viewed', 'interviewing', 'signed')),
                boosted INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT NOT NULL,
                viewed_at TEXT,
                loom_viewed_at TEXT,
                interviewing_at TEXT,
                signed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS discovered_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                budget_info TEXT,
                budget_amount REAL,
                budget_currency TEXT,
                tier TEXT CHECK (tier IN ('gold', 'silver', 'bronze')),
                posted_at TEXT,
                applied INTEGER NOT NULL DEFAULT 0,
                applied_at TEXT,
                proposal_id INTEGER REFERENCES proposals(id),
                created_at TEXT NOT NULL,
                UNIQUE (user_id, external_id),
                CHECK (applied = 0 OR (applied_at IS NOT NULL AND proposal_id IS NOT NULL))
            );

            CREATE TABLE IF NOT EXISTS pending_applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                discovered_job_id INTEGER NOT NULL REFERENCES discovered_jobs(id),
                external_job_id TEXT NOT NULL,
                job_title TEXT NOT NULL,
                budget_amount REAL,
                cover_letter TEXT NOT NULL,
                video_link TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'approved', 'rejected', 'submitted', 'failed')),
                created_at TEXT NOT NULL,
                submitted_at TEXT,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS discovery_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                run_at TEXT NOT NULL,
                source TEXT NOT NULL CHECK (source IN ('cron', 'manual'))
            );

            CREATE TABLE IF NOT EXISTS discovery_refresh_log (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS marketplace_credentials (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_user_applied ON discovered_jobs(user_id, applied);
            CREATE INDEX IF NOT EXISTS idx_apps_user_status ON pending_applications(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_proposals_user ON proposals(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_runs_user ON discovery_runs(user_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='pending_applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'autobid init' first."));
        }
        Ok(())
    }

    // --- Settings ---

    pub fn get_settings(&self, user_id: &str) -> Result<Option<AutoApplySettings>> {
        let result = self.conn()?.query_row(
            "SELECT user_id, enabled, min_budget, max_applications_per_run, boost_to_first_place,
                    default_video_link, browser_context_id, search_query
             FROM auto_apply_settings WHERE user_id = ?1",
            [user_id],
            Self::row_to_settings,
        );
        match result {
            Ok(settings) => Ok(Some(settings)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the row with defaults on first write, otherwise patches only the
    /// fields that were provided.
    pub fn upsert_settings(&self, user_id: &str, patch: SettingsPatch) -> Result<AutoApplySettings> {
        let mut settings = self
            .get_settings(user_id)?
            .unwrap_or_else(|| AutoApplySettings::defaults_for(user_id));
        settings.apply(patch);

        self.conn()?.execute(
            "INSERT INTO auto_apply_settings (user_id, enabled, min_budget, max_applications_per_run,
                    boost_to_first_place, default_video_link, browser_context_id, search_query)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                enabled = excluded.enabled,
                min_budget = excluded.min_budget,
                max_applications_per_run = excluded.max_applications_per_run,
                boost_to_first_place = excluded.boost_to_first_place,
                default_video_link = excluded.default_video_link,
                browser_context_id = excluded.browser_context_id,
                search_query = excluded.search_query",
            params![
                settings.user_id,
                settings.enabled,
                settings.min_budget,
                settings.max_applications_per_run,
                settings.boost_to_first_place,
                settings.default_video_link,
                settings.browser_context_id,
                settings.search_query,
            ],
        )?;
        Ok(settings)
    }

    pub fn list_settings(&self) -> Result<Vec<AutoApplySettings>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, enabled, min_budget, max_applications_per_run, boost_to_first_place,
                    default_video_link, browser_context_id, search_query
             FROM auto_apply_settings ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], Self::row_to_settings)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list settings")
    }

    fn row_to_settings(row: &rusqlite::Row) -> rusqlite::Result<AutoApplySettings> {
        Ok(AutoApplySettings {
            user_id: row.get(0)?,
            enabled: row.get(1)?,
            min_budget: row.get(2)?,
            max_applications_per_run: row.get(3)?,
            boost_to_first_place: row.get(4)?,
            default_video_link: row.get(5)?,
            browser_context_id: row.get(6)?,
            search_query: row.get(7)?,
        })
    }

    // --- Discovered jobs ---

    /// Inserts the job unless (user, external id) is already known. The first
    /// sighting wins; re-discovery never rewrites stored content. Returns the
    /// row id and whether a new row was created.
    pub fn insert_discovered_job(&self, user_id: &str, job: &NewJob, now: DateTime<Utc>) -> Result<(i64, bool)> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO discovered_jobs (user_id, external_id, title, description, budget_info,
                    budget_amount, budget_currency, tier, posted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, external_id) DO NOTHING",
            params![
                user_id,
                job.external_id,
                job.title,
                job.description,
                job.budget_info,
                job.budget_amount,
                job.budget_currency,
                job.tier.map(|t| t.as_str()),
                job.posted_at,
                now,
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM discovered_jobs WHERE user_id = ?1 AND external_id = ?2",
            params![user_id, job.external_id],
            |row| row.get(0),
        )?;
        Ok((id, inserted > 0))
    }

    pub fn get_discovered_job(&self, user_id: &str, id: i64) -> Result<Option<DiscoveredJob>> {
        self.conn()?
            .query_row(
                &format!("{} WHERE id = ?1 AND user_id = ?2", JOB_SELECT),
                params![id, user_id],
                Self::row_to_job,
            )
            .optional()
            .context("Failed to load discovered job")
    }

    /// All jobs for the account, newest first by posting time (falling back to
    /// when we first saw them).
    pub fn list_discovered_jobs(&self, user_id: &str, applied_only: bool) -> Result<Vec<DiscoveredJob>> {
        let mut jobs = {
            let conn = self.conn()?;
            let mut sql = format!("{} WHERE user_id = ?1", JOB_SELECT);
            if applied_only {
                sql.push_str(" AND applied = 1");
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([user_id], Self::row_to_job)?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("Failed to list discovered jobs")?
        };
        jobs.sort_by(|a, b| b.recency().cmp(&a.recency()));
        Ok(jobs)
    }

    pub fn list_unapplied_jobs(&self, user_id: &str) -> Result<Vec<DiscoveredJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE user_id = ?1 AND applied = 0", JOB_SELECT))?;
        let rows = stmt.query_map([user_id], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list unapplied jobs")
    }

    pub fn count_discovered_jobs(&self, user_id: &str) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM discovered_jobs WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<DiscoveredJob> {
        let tier: Option<String> = row.get(8)?;
        Ok(DiscoveredJob {
            id: row.get(0)?,
            user_id: row.get(1)?,
            external_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            budget_info: row.get(5)?,
            budget_amount: row.get(6)?,
            budget_currency: row.get(7)?,
            tier: tier.map(|t| parse_column(8, t)).transpose()?,
            posted_at: row.get(9)?,
            applied: row.get(10)?,
            applied_at: row.get(11)?,
            proposal_id: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    // --- Pending applications ---

    pub fn pending_external_ids(&self, user_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT external_job_id FROM pending_applications WHERE user_id = ?1 AND status = 'pending'",
        )?;
        let rows = stmt.query_map([user_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>()
            .context("Failed to load pending job ids")
    }

    pub fn insert_application(&self, user_id: &str, app: &NewApplication, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_applications (user_id, discovered_job_id, external_job_id, job_title,
                    budget_amount, cover_letter, video_link, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                user_id,
                app.discovered_job_id,
                app.external_job_id,
                app.job_title,
                app.budget_amount,
                app.cover_letter,
                app.video_link,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_application(&self, id: i64) -> Result<Option<PendingApplication>> {
        self.conn()?
            .query_row(
                &format!("{} WHERE id = ?1", APP_SELECT),
                [id],
                Self::row_to_application,
            )
            .optional()
            .context("Failed to load application")
    }

    pub fn list_applications(&self, user_id: &str, limit: usize) -> Result<Vec<PendingApplication>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            APP_SELECT
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::row_to_application)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list applications")
    }

    /// Approved records across all accounts, oldest first. These are waiting on
    /// a submission task that may have been lost with a previous process.
    pub fn list_approved_applications(&self) -> Result<Vec<PendingApplication>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE status = 'approved' ORDER BY id", APP_SELECT))?;
        let rows = stmt.query_map([], Self::row_to_application)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list approved applications")
    }

    /// Compare-and-set on the status column. Returns false when the record was
    /// not in `from` any more, which is how duplicate clicks and re-delivered
    /// tasks are absorbed.
    pub fn transition_application(
        &self,
        id: i64,
        from: ApplicationStatus,
        to: ApplicationStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !from.can_become(to) {
            bail!("Illegal application transition {} -> {}", from, to);
        }
        let changed = self.conn()?.execute(
            "UPDATE pending_applications SET status = ?1, error_message = COALESCE(?2, error_message)
             WHERE id = ?3 AND status = ?4",
            params![to.as_str(), error_message, id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Records a successful submission: inserts the proposal, marks the source
    /// job applied and moves the application to `submitted`, all in one
    /// transaction. Nothing is committed unless all three writes land.
    pub fn record_submission(&self, application_id: i64, boosted: bool, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let app = tx
            .query_row(
                &format!("{} WHERE id = ?1", APP_SELECT),
                [application_id],
                Self::row_to_application,
            )
            .optional()?
            .ok_or_else(|| anyhow!("Application #{} not found", application_id))?;
        if app.status != ApplicationStatus::Approved {
            bail!(
                "Application #{} is {}, expected approved",
                application_id,
                app.status
            );
        }

        tx.execute(
            "INSERT INTO proposals (user_id, external_job_id, job_title, cover_letter, video_link,
                    status, boosted, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'sent', ?6, ?7)",
            params![
                app.user_id,
                app.external_job_id,
                app.job_title,
                app.cover_letter,
                app.video_link,
                boosted,
                now,
            ],
        )?;
        let proposal_id = tx.last_insert_rowid();

        let flipped = tx.execute(
            "UPDATE discovered_jobs SET applied = 1, applied_at = ?1, proposal_id = ?2
             WHERE id = ?3 AND user_id = ?4",
            params![now, proposal_id, app.discovered_job_id, app.user_id],
        )?;
        if flipped != 1 {
            bail!("Discovered job #{} not found", app.discovered_job_id);
        }

        tx.execute(
            "UPDATE pending_applications SET status = 'submitted', submitted_at = ?1, error_message = NULL
             WHERE id = ?2",
            params![now, application_id],
        )?;

        tx.commit()?;
        Ok(proposal_id)
    }

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<PendingApplication> {
        Ok(PendingApplication {
            id: row.get(0)?,
            user_id: row.get(1)?,
            discovered_job_id: row.get(2)?,
            external_job_id: row.get(3)?,
            job_title: row.get(4)?,
            budget_amount: row.get(5)?,
            cover_letter: row.get(6)?,
            video_link: row.get(7)?,
            status: parse_column(8, row.get(8)?)?,
            created_at: row.get(9)?,
            submitted_at: row.get(10)?,
            error_message: row.get(11)?,
        })
    }

    // --- Proposals ---

    pub fn insert_proposal(
        &self,
        user_id: &str,
        external_job_id: &str,
        job_title: &str,
        cover_letter: &str,
        video_link: Option<&str>,
        boosted: bool,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO proposals (user_id, external_job_id, job_title, cover_letter, video_link,
                    status, boosted, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'sent', ?6, ?7)",
            params![user_id, external_job_id, job_title, cover_letter, video_link, boosted, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_proposal(&self, user_id: &str, id: i64) -> Result<Option<Proposal>> {
        self.conn()?
            .query_row(
                &format!("{} WHERE id = ?1 AND user_id = ?2", PROPOSAL_SELECT),
                params![id, user_id],
                Self::row_to_proposal,
            )
            .optional()
            .context("Failed to load proposal")
    }

    pub fn list_proposals(&self, user_id: &str) -> Result<Vec<Proposal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE user_id = ?1 ORDER BY id DESC", PROPOSAL_SELECT))?;
        let rows = stmt.query_map([user_id], Self::row_to_proposal)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list proposals")
    }

    /// Sets the funnel status and stamps that stage's timestamp. Progression is
    /// not enforced to be monotonic.
    pub fn update_proposal_status(
        &self,
        user_id: &str,
        id: i64,
        status: FunnelStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stamp_column = match status {
            FunnelStatus::Sent => None,
            FunnelStatus::Viewed => Some("viewed_at"),
            FunnelStatus::LoomViewed => Some("loom_viewed_at"),
            FunnelStatus::Interviewing => Some("interviewing_at"),
            FunnelStatus::Signed => Some("signed_at"),
        };
        let conn = self.conn()?;
        let changed = match stamp_column {
            Some(column) => conn.execute(
                &format!(
                    "UPDATE proposals SET status = ?1, {} = ?2 WHERE id = ?3 AND user_id = ?4",
                    column
                ),
                params![status.as_str(), now, id, user_id],
            )?,
            None => conn.execute(
                "UPDATE proposals SET status = ?1 WHERE id = ?2 AND user_id = ?3",
                params![status.as_str(), id, user_id],
            )?,
        };
        if changed == 0 {
            return Err(anyhow!("Proposal #{} not found", id));
        }
        Ok(())
    }

    pub fn funnel_counts(&self, user_id: &str) -> Result<Vec<(FunnelStatus, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM proposals WHERE user_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok((parse_column::<FunnelStatus>(0, row.get(0)?)?, row.get::<_, i64>(1)?))
        })?;
        let found = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(FunnelStatus::ALL
            .iter()
            .map(|status| {
                let count = found
                    .iter()
                    .find(|(s, _)| s == status)
                    .map(|(_, c)| *c)
                    .unwrap_or(0);
                (*status, count)
            })
            .collect())
    }

    fn row_to_proposal(row: &rusqlite::Row) -> rusqlite::Result<Proposal> {
        Ok(Proposal {
            id: row.get(0)?,
            user_id: row.get(1)?,
            external_job_id: row.get(2)?,
            job_title: row.get(3)?,
            cover_letter: row.get(4)?,
            video_link: row.get(5)?,
            status: parse_column(6, row.get(6)?)?,
            boosted: row.get(7)?,
            sent_at: row.get(8)?,
            viewed_at: row.get(9)?,
            loom_viewed_at: row.get(10)?,
            interviewing_at: row.get(11)?,
            signed_at: row.get(12)?,
        })
    }

    // --- Discovery runs & refresh log ---

    pub fn record_discovery_run(&self, user_id: &str, source: RunSource, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO discovery_runs (user_id, run_at, source) VALUES (?1, ?2, ?3)",
            params![user_id, now, source.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn last_discovery_run(&self, user_id: &str) -> Result<Option<DiscoveryRun>> {
        self.conn()?
            .query_row(
                "SELECT id, user_id, run_at, source FROM discovery_runs
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                [user_id],
                |row| {
                    Ok(DiscoveryRun {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        run_at: row.get(2)?,
                        source: parse_column(3, row.get(3)?)?,
                    })
                },
            )
            .optional()
            .context("Failed to load last discovery run")
    }

    pub fn refresh_count(&self, user_id: &str, date: &str) -> Result<u32> {
        let count: Option<u32> = self
            .conn()?
            .query_row(
                "SELECT count FROM discovery_refresh_log WHERE user_id = ?1 AND date = ?2",
                params![user_id, date],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Atomically bumps the day's counter if it is still below `cap`.
    /// Returns the new count, or `None` when the cap was already reached.
    pub fn try_increment_refresh(&self, user_id: &str, date: &str, cap: u32) -> Result<Option<u32>> {
        if cap == 0 {
            return Ok(None);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "INSERT INTO discovery_refresh_log (user_id, date, count) VALUES (?1, ?2, 1)
             ON CONFLICT(user_id, date) DO UPDATE SET count = count + 1 WHERE count < ?3",
            params![user_id, date, cap],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let count: u32 = tx.query_row(
            "SELECT count FROM discovery_refresh_log WHERE user_id = ?1 AND date = ?2",
            params![user_id, date],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(Some(count))
    }

    /// Gives back a refresh spent by `try_increment_refresh` when the run it
    /// paid for could not be scheduled.
    pub fn release_refresh(&self, user_id: &str, date: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE discovery_refresh_log SET count = count - 1
             WHERE user_id = ?1 AND date = ?2 AND count > 0",
            params![user_id, date],
        )?;
        Ok(())
    }

    // --- Marketplace credentials & OAuth state ---

    pub fn get_credentials(&self, user_id: &str) -> Result<Option<TokenPair>> {
        self.conn()?
            .query_row(
                "SELECT access_token, refresh_token, expires_at FROM marketplace_credentials WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(TokenPair {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to load marketplace credentials")
    }

    pub fn save_credentials(&self, user_id: &str, tokens: &TokenPair) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO marketplace_credentials (user_id, access_token, refresh_token, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at",
            params![user_id, tokens.access_token, tokens.refresh_token, tokens.expires_at],
        )?;
        Ok(())
    }

    pub fn save_oauth_state(&self, state: &str, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO oauth_states (state, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![state, user_id, now],
        )?;
        Ok(())
    }

    /// Removes and returns the state row; a state can be redeemed once.
    pub fn take_oauth_state(&self, state: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT user_id, created_at FROM oauth_states WHERE state = ?1",
                [state],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if found.is_some() {
            conn.execute("DELETE FROM oauth_states WHERE state = ?1", [state])?;
        }
        Ok(found)
    }
}

const JOB_SELECT: &str = "SELECT id, user_id, external_id, title, description, budget_info, budget_amount,
        budget_currency, tier, posted_at, applied, applied_at, proposal_id, created_at
     FROM discovered_jobs";

const APP_SELECT: &str = "SELECT id, user_id, discovered_job_id, external_job_id, job_title, budget_amount,
        cover_letter, video_link, status, created_at, submitted_at, error_message
     FROM pending_applications";

const PROPOSAL_SELECT: &str = "SELECT id, user_id, external_job_id, job_title, cover_letter, video_link,
        status, boosted, sent_at, viewed_at, loom_viewed_at, interviewing_at, signed_at
     FROM proposals";

fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_job, ts};

    fn queue_one(db: &Database, user: &str, external_id: &str) -> (i64, i64) {
        let (job_id, _) = db
            .insert_discovered_job(user, &new_job(external_id, Some(6000.0)), ts(0))
            .unwrap();
        let app_id = db
            .insert_application(
                user,
                &NewApplication {
                    discovered_job_id: job_id,
                    external_job_id: external_id.to_string(),
                    job_title: format!("Job {}", external_id),
                    budget_amount: Some(6000.0),
                    cover_letter: "Hi".to_string(),
                    video_link: None,
                },
                ts(1),
            )
            .unwrap();
        (job_id, app_id)
    }

    #[test]
    fn test_upsert_settings_defaults_then_patch() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_settings("a").unwrap().is_none());

        let created = db
            .upsert_settings("a", SettingsPatch { enabled: Some(true), ..Default::default() })
            .unwrap();
        assert!(created.enabled);
        assert_eq!(created.min_budget, 5000.0);
        assert_eq!(created.max_applications_per_run, 3);

        db.upsert_settings("a", SettingsPatch { min_budget: Some(750.0), ..Default::default() })
            .unwrap();
        let stored = db.get_settings("a").unwrap().unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.min_budget, 750.0);
        assert_eq!(db.list_settings().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_discovered_job_first_seen_wins() {
        let db = Database::open_in_memory().unwrap();
        let (id1, created) = db.insert_discovered_job("a", &new_job("x1", Some(100.0)), ts(0)).unwrap();
        assert!(created);

        let mut changed = new_job("x1", Some(9999.0));
        changed.title = "Renamed".to_string();
        let (id2, created) = db.insert_discovered_job("a", &changed, ts(5)).unwrap();
        assert!(!created);
        assert_eq!(id1, id2);

        let job = db.get_discovered_job("a", id1).unwrap().unwrap();
        assert_eq!(job.budget_amount, Some(100.0));
        assert_ne!(job.title, "Renamed");

        // Same marketplace id under another account is a separate row.
        let (other, created) = db.insert_discovered_job("b", &new_job("x1", None), ts(0)).unwrap();
        assert!(created);
        assert_ne!(other, id1);
        assert!(db.get_discovered_job("a", other).unwrap().is_none());
    }

    #[test]
    fn test_transition_application_is_compare_and_set() {
        let db = Database::open_in_memory().unwrap();
        let (_, app_id) = queue_one(&db, "a", "j1");

        assert!(db
            .transition_application(app_id, ApplicationStatus::Pending, ApplicationStatus::Approved, None)
            .unwrap());
        assert!(!db
            .transition_application(app_id, ApplicationStatus::Pending, ApplicationStatus::Approved, None)
            .unwrap());
        assert!(db
            .transition_application(app_id, ApplicationStatus::Approved, ApplicationStatus::Submitted, None)
            .is_ok());
        assert!(db
            .transition_application(app_id, ApplicationStatus::Submitted, ApplicationStatus::Failed, None)
            .is_err());
    }

    #[test]
    fn test_list_approved_applications_spans_accounts() {
        let db = Database::open_in_memory().unwrap();
        let (_, a1) = queue_one(&db, "a", "j1");
        let (_, _a2) = queue_one(&db, "a", "j2");
        let (_, b1) = queue_one(&db, "b", "j1");
        for id in [a1, b1] {
            db.transition_application(id, ApplicationStatus::Pending, ApplicationStatus::Approved, None)
                .unwrap();
        }

        let approved: Vec<_> = db
            .list_approved_applications()
            .unwrap()
            .into_iter()
            .map(|app| (app.user_id, app.id))
            .collect();
        assert_eq!(approved, vec![("a".to_string(), a1), ("b".to_string(), b1)]);
    }

    #[test]
    fn test_record_submission_writes_all_three() {
        let db = Database::open_in_memory().unwrap();
        let (job_id, app_id) = queue_one(&db, "a", "j1");
        db.transition_application(app_id, ApplicationStatus::Pending, ApplicationStatus::Approved, None)
            .unwrap();

        let proposal_id = db.record_submission(app_id, true, ts(100)).unwrap();

        let job = db.get_discovered_job("a", job_id).unwrap().unwrap();
        assert!(job.applied);
        assert_eq!(job.proposal_id, Some(proposal_id));
        assert_eq!(job.applied_at, Some(ts(100)));

        let app = db.get_application(app_id).unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Submitted);
        assert_eq!(app.submitted_at, Some(ts(100)));

        let proposal = db.get_proposal("a", proposal_id).unwrap().unwrap();
        assert_eq!(proposal.status, FunnelStatus::Sent);
        assert!(proposal.boosted);
        assert_eq!(proposal.external_job_id, "j1");
    }

    #[test]
    fn test_record_submission_rolls_back_when_job_flip_fails() {
        let db = Database::open_in_memory().unwrap();
        let (_, app_id) = queue_one(&db, "a", "j1");
        db.transition_application(app_id, ApplicationStatus::Pending, ApplicationStatus::Approved, None)
            .unwrap();
        // Point the application at a job that does not exist so the second
        // write fails after the proposal insert.
        db.conn()
            .unwrap()
            .execute("UPDATE pending_applications SET discovered_job_id = 999 WHERE id = ?1", [app_id])
            .unwrap();

        assert!(db.record_submission(app_id, false, ts(100)).is_err());
        assert!(db.list_proposals("a").unwrap().is_empty());
        let app = db.get_application(app_id).unwrap().unwrap();
        assert_eq!(app.status, ApplicationStatus::Approved);
    }

    #[test]
    fn test_record_submission_requires_approved() {
        let db = Database::open_in_memory().unwrap();
        let (job_id, app_id) = queue_one(&db, "a", "j1");
        assert!(db.record_submission(app_id, false, ts(1)).is_err());
        assert!(!db.get_discovered_job("a", job_id).unwrap().unwrap().applied);
    }

    #[test]
    fn test_try_increment_refresh_stops_at_cap() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.try_increment_refresh("a", "2026-01-01", 2).unwrap(), Some(1));
        assert_eq!(db.try_increment_refresh("a", "2026-01-01", 2).unwrap(), Some(2));
        assert_eq!(db.try_increment_refresh("a", "2026-01-01", 2).unwrap(), None);
        assert_eq!(db.refresh_count("a", "2026-01-01").unwrap(), 2);
        assert_eq!(db.refresh_count("a", "2026-01-02").unwrap(), 0);
    }

    #[test]
    fn test_update_proposal_status_stamps_stage() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_proposal("a", "j1", "Job", "Hi", None, false, ts(0)).unwrap();
        db.update_proposal_status("a", id, FunnelStatus::Interviewing, ts(50)).unwrap();
        let proposal = db.get_proposal("a", id).unwrap().unwrap();
        assert_eq!(proposal.status, FunnelStatus::Interviewing);
        assert_eq!(proposal.interviewing_at, Some(ts(50)));
        assert!(proposal.viewed_at.is_none());

        assert!(db.update_proposal_status("b", id, FunnelStatus::Signed, ts(60)).is_err());

        let counts = db.funnel_counts("a").unwrap();
        assert_eq!(counts.len(), 5);
        assert!(counts.contains(&(FunnelStatus::Interviewing, 1)));
        assert!(counts.contains(&(FunnelStatus::Sent, 0)));
    }

    #[test]
    fn test_oauth_state_redeemed_once() {
        let db = Database::open_in_memory().unwrap();
        db.save_oauth_state("s1", "a", ts(0)).unwrap();
        assert_eq!(db.take_oauth_state("s1").unwrap().map(|(u, _)| u), Some("a".to_string()));
        assert!(db.take_oauth_state("s1").unwrap().is_none());
    }
}
