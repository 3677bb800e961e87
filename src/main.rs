//! Councilbot - weekly LLM council over paper brokerage accounts.
//!
//! Boot order: env -> tracing -> config -> event store -> providers ->
//! job manager. Runs one job for the current market week, polls it to
//! a terminal state, and exits non-zero on failure. Scheduling
//! (cron) and any API surface live outside this binary.

use anyhow::{Context as _, Result};
use councilbot_backend::brokers::{BrokerSet, PaperBrokerConfig};
use councilbot_backend::config::Config;
use councilbot_backend::jobs::{JobInputs, JobManager, JobStatus};
use councilbot_backend::llm::{FileSearchFeed, OpenRouterClient, SearchProvider};
use councilbot_backend::market::FileSnapshotSource;
use councilbot_backend::models::AccountId;
use councilbot_backend::pipeline::PipelineDeps;
use councilbot_backend::store::EventStore;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cfg = Arc::new(Config::from_env().context("load configuration")?);
    info!(
        mode = cfg.mode.as_str(),
        roster = cfg.pm_roster.len(),
        universe = cfg.universe.len(),
        "🚀 councilbot starting weekly cycle"
    );

    let store = EventStore::open(&cfg.db_path).context("open event store")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build HTTP client")?;
    let llm = Arc::new(OpenRouterClient::from_env(http).context("configure LLM provider")?);

    let search: Arc<dyn SearchProvider> = match std::env::var("COUNCIL_SEARCH_FEED_PATH") {
        Ok(path) => Arc::new(
            FileSearchFeed::from_json_file(&path).context("load search feed")?,
        ),
        Err(_) => {
            warn!("COUNCIL_SEARCH_FEED_PATH unset, sentiment will run degraded");
            Arc::new(FileSearchFeed::default())
        }
    };

    let mut accounts: Vec<AccountId> = cfg
        .pm_roster
        .iter()
        .map(|r| r.account_id.clone())
        .collect();
    accounts.push(cfg.council_account.clone());
    let brokers = Arc::new(BrokerSet::paper_for(accounts, PaperBrokerConfig::from_env()));

    let snapshots = Arc::new(FileSnapshotSource::new(cfg.snapshot_path.clone()));

    let manager = JobManager::new(
        PipelineDeps {
            config: cfg.clone(),
            llm,
            search,
            brokers,
        },
        store,
        snapshots,
    );

    let job_id = manager
        .create(
            cfg.mode,
            JobInputs {
                week_id: None,
                user_query: std::env::var("COUNCIL_USER_QUERY").ok(),
            },
        )
        .context("create weekly job")?;
    info!(job_id = %job_id, "job scheduled");

    let final_status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling job");
                manager.cancel(job_id);
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }

        let Some(snap) = manager.status(job_id) else {
            anyhow::bail!("job {job_id} evicted while running");
        };
        for stage in &snap.stages {
            tracing::debug!(
                stage = %stage.name,
                status = ?stage.status,
                progress = stage.progress,
                "stage progress"
            );
        }
        if snap.status.is_terminal() {
            break snap;
        }
    };

    match final_status.status {
        JobStatus::Complete => {
            info!(job_id = %job_id, week = %final_status.week_id, "weekly cycle complete");
            Ok(())
        }
        JobStatus::Cancelled => {
            warn!(job_id = %job_id, "weekly cycle cancelled");
            std::process::exit(130);
        }
        _ => {
            let err = final_status
                .error
                .map(|e| format!("{} ({}): {}", e.stage, e.kind, e.message))
                .unwrap_or_else(|| "unknown error".into());
            anyhow::bail!("weekly cycle failed: {err}");
        }
    }
}
