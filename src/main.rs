mod browser;
mod candidates;
mod clock;
mod config;
mod cover_letter;
mod db;
mod discovery;
mod engine;
mod humanize;
mod marketplace;
mod models;
mod oauth;
mod queue;
mod rate_limit;
mod scheduler;
mod submit;
mod tasks;
mod workflow;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clock::TokioPacer;
use config::Config;
use db::Database;
use engine::Engine;
use models::{FunnelStatus, RunSource, SettingsPatch};
use queue::Transition;
use tasks::ChannelQueue;

#[derive(Parser)]
#[command(name = "autobid")]
#[command(about = "Marketplace job discovery and reviewed, human-paced proposal submission")]
struct Cli {
    /// Account the command acts on
    #[arg(short, long, global = true, default_value = "default")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Show or change auto-apply settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },

    /// Print the URL that connects a marketplace login to this account
    Connect,

    /// Finish connecting with the values from the OAuth redirect
    Callback {
        #[arg(long)]
        code: String,

        #[arg(long)]
        state: String,
    },

    /// Run discovery now, as the scheduler would
    Discover,

    /// Manual discovery refresh (limited per day)
    Refresh,

    /// Show refresh usage and the last discovery run
    Status,

    /// List discovered jobs
    Jobs {
        /// Only jobs already applied to
        #[arg(long)]
        applied: bool,
    },

    /// Pick candidates and queue them for review now
    Queue,

    /// List queued applications
    Pending,

    /// Approve a queued application and submit it
    Approve {
        /// Application ID
        id: i64,
    },

    /// Reject a queued application
    Reject {
        /// Application ID
        id: i64,
    },

    /// List sent proposals
    Proposals,

    /// Record a proposal sent by hand
    ProposalAdd {
        /// Marketplace job id
        #[arg(long)]
        job_id: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        cover_letter: String,

        #[arg(long)]
        video_link: Option<String>,
    },

    /// Move a proposal along the funnel (sent, viewed, loom_viewed, interviewing, signed)
    ProposalStatus {
        /// Proposal ID
        id: i64,

        status: String,
    },

    /// Proposal counts per funnel stage
    Funnel,

    /// Run the cron scheduler and task worker until interrupted
    Daemon,
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show,

    /// Change settings (creates them with defaults on first use)
    Set {
        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        min_budget: Option<f64>,

        /// 1 to 10
        #[arg(long)]
        max_per_run: Option<u32>,

        #[arg(long)]
        boost: Option<bool>,

        #[arg(long)]
        video_link: Option<String>,

        /// Saved browser profile to reuse between sessions
        #[arg(long)]
        context_id: Option<String>,

        /// Marketplace search keywords
        #[arg(long)]
        query: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autobid=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let db = Arc::new(Database::open(config.db_path.as_deref())?);

    if !matches!(cli.command, Commands::Init) {
        db.ensure_initialized()?;
    }

    let (task_queue, mut rx) = ChannelQueue::new(Arc::new(TokioPacer));
    let engine = Arc::new(Engine::from_config(&config, db.clone(), Arc::new(task_queue))?);
    let account = cli.account.as_str();

    match cli.command {
        Commands::Init => {
            db.init()?;
            match db.path() {
                Some(path) => println!("Database initialized at {}", path.display()),
                None => println!("Database initialized"),
            }
        }

        Commands::Settings { command } => match command {
            SettingsCommands::Show => match db.get_settings(account)? {
                Some(s) => {
                    println!("Account: {}", s.user_id);
                    println!("Enabled: {}", s.enabled);
                    println!("Min budget: {}", s.min_budget);
                    println!("Max applications per run: {}", s.max_applications_per_run);
                    println!("Boost to first place: {}", s.boost_to_first_place);
                    println!("Video link: {}", s.default_video_link.as_deref().unwrap_or("-"));
                    println!("Browser context: {}", s.browser_context_id.as_deref().unwrap_or("-"));
                    println!("Search query: {}", s.search_query.as_deref().unwrap_or("-"));
                }
                None => println!("No settings for '{}'. Use 'autobid settings set' to create them.", account),
            },

            SettingsCommands::Set {
                enabled,
                min_budget,
                max_per_run,
                boost,
                video_link,
                context_id,
                query,
            } => {
                let saved = db.upsert_settings(
                    account,
                    SettingsPatch {
                        enabled,
                        min_budget,
                        max_applications_per_run: max_per_run,
                        boost_to_first_place: boost,
                        default_video_link: video_link,
                        browser_context_id: context_id,
                        search_query: query,
                    },
                )?;
                println!(
                    "Saved settings for '{}' (enabled: {}, min budget: {}, max per run: {}).",
                    account, saved.enabled, saved.min_budget, saved.max_applications_per_run
                );
            }
        },

        Commands::Connect => {
            let oauth_config = config
                .oauth
                .as_ref()
                .ok_or_else(|| anyhow!("OAuth is not configured (UPWORK_CLIENT_ID / UPWORK_CLIENT_SECRET)"))?;
            let url = oauth::begin_authorization(&db, oauth_config, account, engine.clock.now())?;
            println!("Open this URL to connect your marketplace login:\n{}", url);
        }

        Commands::Callback { code, state } => {
            let refresher = engine
                .oauth
                .as_deref()
                .ok_or_else(|| anyhow!("OAuth is not configured (UPWORK_CLIENT_ID / UPWORK_CLIENT_SECRET)"))?;
            let user = oauth::complete_authorization(&db, refresher, &state, &code, engine.clock.now()).await?;
            println!("Connected marketplace login for '{}'.", user);
        }

        Commands::Discover => {
            let report = discovery::run_discovery(&engine, account, RunSource::Cron).await?;
            println!(
                "Fetched {} postings: {} new, {} already known, {} failed.",
                report.fetched, report.inserted, report.already_known, report.failed
            );
        }

        Commands::Refresh => {
            let decision = rate_limit::request_manual_refresh(&engine, account)?;
            if decision.allowed {
                engine.drain(&mut rx).await;
                let status = rate_limit::discovery_status(&engine, account)?;
                println!("Refresh done ({}/{} used today).", status.count_today, status.cap);
            } else {
                println!("{}", decision.message.unwrap_or_default());
            }
        }

        Commands::Status => {
            let status = rate_limit::discovery_status(&engine, account)?;
            println!("Manual refreshes today: {}/{}", status.count_today, status.cap);
            match status.last_run_at {
                Some(at) => println!("Last discovery run: {}", at.format("%Y-%m-%d %H:%M UTC")),
                None => println!("Last discovery run: never"),
            }
            println!("Discovered jobs: {}", db.count_discovered_jobs(account)?);
        }

        Commands::Jobs { applied } => {
            let jobs = db.list_discovered_jobs(account, applied)?;
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<6} {:<8} {:<8} {:<40} {:<24}", "ID", "TIER", "APPLIED", "TITLE", "BUDGET");
                println!("{}", "-".repeat(90));
                for job in jobs {
                    println!(
                        "{:<6} {:<8} {:<8} {:<40} {:<24}",
                        job.id,
                        job.tier.map(|t| t.as_str()).unwrap_or("-"),
                        if job.applied { "yes" } else { "no" },
                        truncate(&job.title, 38),
                        truncate(job.budget_info.as_deref().unwrap_or("-"), 22)
                    );
                }
            }
        }

        Commands::Queue => {
            let queued = workflow::run_auto_apply_workflow(&engine, account).await?;
            println!("Queued {} application(s) for review.", queued);
        }

        Commands::Pending => {
            let apps = db.list_applications(account, 50)?;
            if apps.is_empty() {
                println!("No queued applications.");
            } else {
                println!("{:<6} {:<10} {:<10} {:<40} {:<30}", "ID", "STATUS", "BUDGET", "TITLE", "ERROR");
                println!("{}", "-".repeat(96));
                for app in apps {
                    println!(
                        "{:<6} {:<10} {:<10} {:<40} {:<30}",
                        app.id,
                        app.status,
                        app.budget_amount.map(|b| format!("{:.0}", b)).unwrap_or_else(|| "-".to_string()),
                        truncate(&app.job_title, 38),
                        truncate(app.error_message.as_deref().unwrap_or(""), 28)
                    );
                }
            }
        }

        Commands::Approve { id } => match queue::approve(&engine, account, id)? {
            Transition::Applied => {
                println!("Approved application #{}. Submitting...", id);
                engine.drain(&mut rx).await;
                if let Some(app) = db.get_application(id)? {
                    match app.error_message {
                        Some(error) if app.status == models::ApplicationStatus::Failed => {
                            println!("Application #{} failed: {}", id, error)
                        }
                        _ => println!("Application #{} is now {}.", id, app.status),
                    }
                }
            }
            Transition::Skipped { current } => {
                println!("Application #{} is already {}, nothing to do.", id, current);
            }
        },

        Commands::Reject { id } => match queue::reject(&db, account, id)? {
            Transition::Applied => println!("Rejected application #{}.", id),
            Transition::Skipped { current } => {
                println!("Application #{} is already {}, nothing to do.", id, current)
            }
        },

        Commands::Proposals => {
            let proposals = db.list_proposals(account)?;
            if proposals.is_empty() {
                println!("No proposals yet.");
            } else {
                println!("{:<6} {:<13} {:<8} {:<40} {:<17}", "ID", "STATUS", "BOOSTED", "TITLE", "SENT");
                println!("{}", "-".repeat(88));
                for p in proposals {
                    println!(
                        "{:<6} {:<13} {:<8} {:<40} {:<17}",
                        p.id,
                        p.status,
                        if p.boosted { "yes" } else { "no" },
                        truncate(&p.job_title, 38),
                        p.sent_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }

        Commands::ProposalAdd {
            job_id,
            title,
            cover_letter,
            video_link,
        } => {
            let id = db.insert_proposal(
                account,
                &job_id,
                &title,
                &cover_letter,
                video_link.as_deref(),
                false,
                engine.clock.now(),
            )?;
            println!("Recorded proposal #{}", id);
        }

        Commands::ProposalStatus { id, status } => {
            let status: FunnelStatus = status.parse()?;
            db.update_proposal_status(account, id, status, engine.clock.now())?;
            println!("Proposal #{} marked {}.", id, status);
        }

        Commands::Funnel => {
            for (status, count) in db.funnel_counts(account)? {
                println!("{:<13} {}", status, count);
            }
        }

        Commands::Daemon => {
            let mut cron = scheduler::start_scheduler(engine.clone(), &config).await?;
            tracing::info!("Worker started, press Ctrl-C to stop");
            tokio::select! {
                _ = engine::run_worker(engine.clone(), rx) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                }
            }
            cron.shutdown().await?;
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
