use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::browser::{BrowserLauncher, RemoteBrowserLauncher};
use crate::clock::{Clock, Pacer, SystemClock, TokioPacer};
use crate::config::Config;
use crate::db::Database;
use crate::humanize::HumanDelay;
use crate::marketplace::{MarketplaceClient, UpworkClient};
use crate::oauth::{TokenRefresher, UpworkOAuth};
use crate::tasks::{Task, TaskQueue};
use crate::{discovery, submit, workflow};

/// Every collaborator a workflow may touch, constructed once and passed in
/// explicitly. Optional services are `None` when their credentials are not
/// configured.
pub struct Engine {
    pub db: Arc<Database>,
    pub marketplace: Option<Arc<dyn MarketplaceClient>>,
    pub oauth: Option<Arc<dyn TokenRefresher>>,
    pub launcher: Arc<dyn BrowserLauncher>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
    pub delay: Arc<HumanDelay>,
    pub refresh_cap: u32,
    pub jitter_max: Duration,
}

impl Engine {
    pub fn from_config(config: &Config, db: Arc<Database>, queue: Arc<dyn TaskQueue>) -> Result<Self> {
        let oauth: Option<Arc<dyn TokenRefresher>> = match &config.oauth {
            Some(oauth) => Some(Arc::new(UpworkOAuth::new(oauth.clone())?)),
            None => None,
        };
        // Searching needs an access token, which only the OAuth flow produces.
        let marketplace: Option<Arc<dyn MarketplaceClient>> = match &oauth {
            Some(_) => Some(Arc::new(UpworkClient::new(&config.api_url)?)),
            None => None,
        };
        let pacer: Arc<dyn Pacer> = Arc::new(TokioPacer);

        Ok(Self {
            db,
            marketplace,
            oauth,
            launcher: Arc::new(RemoteBrowserLauncher::new(config.session_provider.clone())?),
            queue,
            clock: Arc::new(SystemClock),
            delay: Arc::new(HumanDelay::new(pacer)),
            refresh_cap: config.manual_refresh_cap,
            jitter_max: config.auto_apply_jitter,
        })
    }

    /// Runs one task to completion. Each handler re-checks current state, so
    /// a task delivered twice is harmless.
    pub async fn dispatch(&self, task: Task) -> Result<()> {
        match task {
            Task::Discover { user_id, source } => {
                discovery::run_discovery(self, &user_id, source).await?;
            }
            Task::AutoApply { user_id } => {
                workflow::run_auto_apply_workflow(self, &user_id).await?;
            }
            Task::Submit { application_id, user_id } => {
                submit::submit_application(self, application_id, &user_id).await?;
            }
        }
        Ok(())
    }

    /// Drains tasks that are already due without waiting for delayed ones.
    /// Used by one-shot commands. Returns how many ran.
    pub async fn drain(&self, rx: &mut UnboundedReceiver<Task>) -> usize {
        let mut ran = 0;
        while let Ok(task) = rx.try_recv() {
            self.run_logged(task).await;
            ran += 1;
        }
        ran
    }

    async fn run_logged(&self, task: Task) {
        let account = task.user_id().to_string();
        if let Err(e) = self.dispatch(task).await {
            tracing::error!(account = %account, error = %e, "Task failed");
        }
    }
}

/// Long-running consumer for the daemon. Tasks run concurrently so one slow
/// browser session does not hold up other accounts.
pub async fn run_worker(engine: Arc<Engine>, mut rx: UnboundedReceiver<Task>) {
    while let Some(task) = rx.recv().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.run_logged(task).await;
        });
    }
    tracing::info!("Task queue closed, worker exiting");
}
