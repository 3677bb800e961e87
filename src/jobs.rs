//! Job manager: asynchronous job creation, status polling,
//! cancellation, per-provider progress, and TTL eviction.
//!
//! One job = one pipeline run for one week. The manager is the single
//! writer of job records; stages talk to it only through the progress
//! channel, and status readers get deep copies taken under the lock.

use crate::config::Mode;
use crate::error::CouncilError;
use crate::market::SnapshotSource;
use crate::models::WeekId;
use crate::pipeline::{
    Context, ContextKey, ContextValue, Pipeline, PipelineDeps, PipelineOutcome, ProgressSink,
    ProgressUpdate, ProviderPhase, StageServices, StageStatus,
};
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProgress {
    pub status: ProviderPhase,
    pub progress: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub name: String,
    pub status: StageStatus,
    pub progress: u8,
    pub message: String,
    pub sub_providers: BTreeMap<String, ProviderProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub stage: String,
    pub kind: String,
    pub message: String,
}

/// Deep copy of one job's state, safe to hand to any reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub week_id: WeekId,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Stages in pipeline order.
    pub stages: Vec<StageProgress>,
    pub error: Option<JobError>,
}

impl JobSnapshot {
    pub fn stage(&self, name: &str) -> Option<&StageProgress> {
        self.stages.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Create errors / inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateJobError {
    #[error("a job for week {0} is already active")]
    DuplicateWeek(WeekId),
    #[error("market snapshot unavailable: {0}")]
    Snapshot(String),
}

#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    /// Anchor week; defaults to the current market week.
    pub week_id: Option<WeekId>,
    /// Optional research theme threaded into the prompts.
    pub user_query: Option<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct JobRecord {
    snapshot: JobSnapshot,
    cancel: CancellationToken,
}

struct Inner {
    deps: PipelineDeps,
    store: EventStore,
    snapshots: Arc<dyn SnapshotSource>,
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    ttl: Duration,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Must be called from within a Tokio runtime: spawns the progress
    /// collector and the TTL reaper.
    pub fn new(deps: PipelineDeps, store: EventStore, snapshots: Arc<dyn SnapshotSource>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ttl = deps.config.job_ttl;
        let manager = Self {
            inner: Arc::new(Inner {
                deps,
                store,
                snapshots,
                jobs: Mutex::new(HashMap::new()),
                tx,
                ttl,
            }),
        };
        manager.spawn_collector(rx);
        manager.spawn_reaper();
        manager
    }

    /// Insert a pending job and schedule the pipeline run.
    pub fn create(&self, mode: Mode, inputs: JobInputs) -> Result<Uuid, CreateJobError> {
        let week_id = inputs.week_id.unwrap_or_else(|| WeekId::anchor(Utc::now()));

        let snapshot = self
            .inner
            .snapshots
            .snapshot()
            .map_err(|e| CreateJobError::Snapshot(e.to_string()))?;

        let pipeline = Pipeline::for_mode(mode, &self.inner.deps);
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.inner.jobs.lock();
            // One active job per week.
            if jobs
                .values()
                .any(|j| j.snapshot.week_id == week_id && !j.snapshot.status.is_terminal())
            {
                return Err(CreateJobError::DuplicateWeek(week_id));
            }
            let stages = pipeline
                .stage_names()
                .into_iter()
                .map(|name| StageProgress {
                    name: name.to_string(),
                    status: StageStatus::Pending,
                    progress: 0,
                    message: String::new(),
                    sub_providers: BTreeMap::new(),
                })
                .collect();
            jobs.insert(
                job_id,
                JobRecord {
                    snapshot: JobSnapshot {
                        job_id,
                        week_id,
                        mode,
                        created_at: Utc::now(),
                        finished_at: None,
                        status: JobStatus::Pending,
                        stages,
                        error: None,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        let inner = self.inner.clone();
        let user_query = inputs.user_query;
        tokio::spawn(async move {
            run_job(inner, pipeline, job_id, week_id, mode, user_query, snapshot, cancel).await;
        });

        info!(job_id = %job_id, week = %week_id, mode = mode.as_str(), "job created");
        Ok(job_id)
    }

    /// Deep-copied snapshot of the job state.
    pub fn status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.inner
            .jobs
            .lock()
            .get(&job_id)
            .map(|j| j.snapshot.clone())
    }

    /// Fire the cancellation signal. Idempotent; a no-op on terminal jobs.
    pub fn cancel(&self, job_id: Uuid) {
        let jobs = self.inner.jobs.lock();
        if let Some(job) = jobs.get(&job_id) {
            if !job.snapshot.status.is_terminal() {
                info!(job_id = %job_id, "cancellation requested");
                job.cancel.cancel();
            }
        }
    }

    /// Evict terminal jobs older than the TTL. The background reaper
    /// calls this periodically; exposed for direct use in tests.
    pub fn reap_once(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inner.ttl).unwrap_or(chrono::Duration::zero());
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.snapshot.status.is_terminal()
                && j.snapshot.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        before - jobs.len()
    }

    fn spawn_collector(&self, mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                apply_progress(&inner, update);
            }
        });
    }

    fn spawn_reaper(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = manager.reap_once();
                if evicted > 0 {
                    info!(evicted, "evicted expired jobs");
                }
            }
        });
    }

    pub(crate) fn progress_sender(&self) -> mpsc::UnboundedSender<ProgressUpdate> {
        self.inner.tx.clone()
    }
}

/// Apply one progress update under the job table lock. Progress for a
/// stage keeps the snapshot invariants: no pending stage ever shows
/// progress, a complete stage always shows 100.
fn apply_progress(inner: &Inner, update: ProgressUpdate) {
    let mut jobs = inner.jobs.lock();
    match update {
        ProgressUpdate::Stage {
            job_id,
            stage,
            status,
            percent,
            message,
        } => {
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            let Some(entry) = job.snapshot.stages.iter_mut().find(|s| s.name == stage) else {
                return;
            };
            entry.status = status;
            entry.progress = match status {
                StageStatus::Pending => 0,
                StageStatus::Complete => 100,
                _ => percent.max(entry.progress),
            };
            entry.message = message;
        }
        ProgressUpdate::Provider {
            job_id,
            stage,
            provider_id,
            phase,
            percent,
            message,
        } => {
            let Some(job) = jobs.get_mut(&job_id) else {
                return;
            };
            let Some(entry) = job.snapshot.stages.iter_mut().find(|s| s.name == stage) else {
                return;
            };
            entry.sub_providers.insert(
                provider_id,
                ProviderProgress {
                    status: phase,
                    progress: if phase == ProviderPhase::Completed {
                        100
                    } else {
                        percent
                    },
                    message,
                },
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job(
    inner: Arc<Inner>,
    pipeline: Pipeline,
    job_id: Uuid,
    week_id: WeekId,
    mode: Mode,
    user_query: Option<String>,
    snapshot: Arc<crate::market::MarketSnapshot>,
    cancel: CancellationToken,
) {
    {
        let mut jobs = inner.jobs.lock();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.snapshot.status = JobStatus::Running;
        }
    }

    let ctx = Context::new()
        .with(ContextKey::JobId, ContextValue::JobId(job_id))
        .with(ContextKey::WeekId, ContextValue::Week(week_id))
        .with(ContextKey::MarketSnapshot, ContextValue::Snapshot(snapshot))
        .with(
            ContextKey::UserQuery,
            ContextValue::UserQuery(Arc::new(user_query.unwrap_or_default())),
        );

    let svc = StageServices {
        store: inner.store.clone(),
        progress: ProgressSink::new(job_id, inner.tx.clone()),
        cancel: cancel.clone(),
    };

    let job_cap = inner.deps.config.timeouts.job_wall_clock;
    let outcome = match tokio::time::timeout(job_cap, pipeline.run(ctx, &svc)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            // Job wall clock exceeded: signal the stages and report a
            // timeout against the job itself.
            cancel.cancel();
            PipelineOutcome::Failed {
                stage: "job",
                error: CouncilError::ProviderTimeout {
                    provider: "job".into(),
                    secs: job_cap.as_secs(),
                },
            }
        }
    };

    let mut jobs = inner.jobs.lock();
    let Some(job) = jobs.get_mut(&job_id) else {
        return;
    };
    if job.snapshot.status.is_terminal() {
        return;
    }
    job.snapshot.finished_at = Some(Utc::now());
    match outcome {
        PipelineOutcome::Complete(_) => {
            job.snapshot.status = JobStatus::Complete;
            info!(job_id = %job_id, week = %week_id, mode = mode.as_str(), "job complete");
        }
        PipelineOutcome::Cancelled { stage } => {
            job.snapshot.status = JobStatus::Cancelled;
            info!(job_id = %job_id, stage, "job cancelled");
        }
        PipelineOutcome::Failed { stage, error } => {
            job.snapshot.status = JobStatus::Error;
            job.snapshot.error = Some(JobError {
                stage: stage.to_string(),
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
            warn!(job_id = %job_id, stage, error = %error, "job failed");
        }
    }
}
