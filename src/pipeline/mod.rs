//! Pipeline runtime: sequences stages, enforces their declared
//! contracts, emits lifecycle events and progress, and contains
//! failures according to each stage's policy.

pub mod context;
pub mod stage;

pub use context::{Context, ContextKey, ContextValue};
pub use stage::{
    ProgressSink, ProgressUpdate, ProviderPhase, Stage, StagePolicy, StageServices, StageStatus,
};

use crate::brokers::BrokerSet;
use crate::config::{Config, Mode};
use crate::error::CouncilError;
use crate::llm::{LlmProvider, SearchProvider};
use crate::models::EventType;
use crate::stages::{
    ChairmanStage, ExecutionStage, PeerReviewStage, PmPitchStage, ResearchStage, SentimentStage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything the stage constructors need. The job manager owns one of
/// these for its whole lifetime.
#[derive(Clone)]
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,
    pub search: Arc<dyn SearchProvider>,
    pub brokers: Arc<BrokerSet>,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Complete(Context),
    Failed {
        stage: &'static str,
        error: CouncilError,
    },
    Cancelled {
        stage: &'static str,
    },
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    stage_wall_clock: Duration,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, stage_wall_clock: Duration) -> Self {
        Self {
            stages,
            stage_wall_clock,
        }
    }

    /// Compose the stage list for a mode:
    /// - `chat_only`: sentiment, research, pm_pitch, execution
    /// - `ranking`: adds peer_review before execution
    /// - `full`: adds chairman between peer_review and execution
    pub fn for_mode(mode: Mode, deps: &PipelineDeps) -> Self {
        let cfg = deps.config.clone();
        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(SentimentStage::new(
                cfg.clone(),
                deps.llm.clone(),
                deps.search.clone(),
            )),
            Arc::new(ResearchStage::new(cfg.clone(), deps.llm.clone())),
            Arc::new(PmPitchStage::new(cfg.clone(), deps.llm.clone())),
        ];
        if matches!(mode, Mode::Ranking | Mode::Full) {
            stages.push(Arc::new(PeerReviewStage::new(cfg.clone(), deps.llm.clone())));
        }
        if mode == Mode::Full {
            stages.push(Arc::new(ChairmanStage::new(cfg.clone(), deps.llm.clone())));
        }
        stages.push(Arc::new(ExecutionStage::new(
            mode,
            cfg.clone(),
            deps.brokers.clone(),
        )));
        Self::new(stages, cfg.timeouts.stage_wall_clock)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, mut ctx: Context, svc: &StageServices) -> PipelineOutcome {
        let Some(week) = ctx.week() else {
            return PipelineOutcome::Failed {
                stage: "pipeline",
                error: CouncilError::Configuration("context missing week_id".into()),
            };
        };
        let job_id = ctx.job_id();

        for stage in &self.stages {
            let name = stage.name();

            // Cancellation check at the stage boundary: stop before
            // starting the next stage.
            if svc.cancel.is_cancelled() {
                info!(stage = name, "job cancelled at stage boundary");
                return PipelineOutcome::Cancelled { stage: name };
            }

            // Precondition: every declared input must be present.
            for key in stage.inputs() {
                if !ctx.has(*key) {
                    let err = CouncilError::Precondition {
                        stage: name,
                        key: key.name(),
                    };
                    self.record_failure(svc, week, job_id, name, &err);
                    return PipelineOutcome::Failed { stage: name, error: err };
                }
            }

            if let Err(e) = svc.append_event(
                week,
                None,
                EventType::StageStarted,
                json!({"stage": name, "job_id": job_id}),
            ) {
                if stage.policy() == StagePolicy::Advisory {
                    warn!(stage = name, error = %e, "advisory stage skipped: event store unavailable");
                    ctx = ctx.mark_degraded(name);
                    continue;
                }
                return PipelineOutcome::Failed { stage: name, error: e };
            }
            svc.progress.stage(name, StageStatus::Running, 0, "started");

            let result = match tokio::time::timeout(
                self.stage_wall_clock,
                stage.run(ctx.clone(), svc),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(CouncilError::ProviderTimeout {
                    provider: format!("stage:{name}"),
                    secs: self.stage_wall_clock.as_secs(),
                }),
            };

            match result {
                Ok(new_ctx) => {
                    // Contract: every declared output must be present.
                    if let Some(missing) =
                        stage.outputs().iter().find(|key| !new_ctx.has(**key))
                    {
                        let err = CouncilError::Contract {
                            stage: name,
                            key: missing.name(),
                        };
                        if stage.policy() == StagePolicy::Advisory {
                            warn!(stage = name, error = %err, "advisory stage broke its contract, degrading");
                            ctx = ctx.mark_degraded(name);
                            continue;
                        }
                        self.record_failure(svc, week, job_id, name, &err);
                        return PipelineOutcome::Failed { stage: name, error: err };
                    }

                    if let Err(e) = svc.append_event(
                        week,
                        None,
                        EventType::StageCompleted,
                        json!({"stage": name, "job_id": job_id}),
                    ) {
                        if stage.policy() != StagePolicy::Advisory {
                            return PipelineOutcome::Failed { stage: name, error: e };
                        }
                    }
                    svc.progress
                        .stage(name, StageStatus::Complete, 100, "completed");
                    ctx = new_ctx;
                }
                Err(err) if err.is_cancelled() => {
                    self.record_cancellation(svc, week, job_id, name);
                    return PipelineOutcome::Cancelled { stage: name };
                }
                Err(err) => {
                    self.record_failure(svc, week, job_id, name, &err);
                    if stage.policy() == StagePolicy::Advisory {
                        warn!(stage = name, error = %err, "advisory stage failed, pipeline continues degraded");
                        ctx = ctx.mark_degraded(name);
                        continue;
                    }
                    error!(stage = name, error = %err, "stage failed, pipeline stops");
                    return PipelineOutcome::Failed { stage: name, error: err };
                }
            }
        }

        PipelineOutcome::Complete(ctx)
    }

    fn record_failure(
        &self,
        svc: &StageServices,
        week: crate::models::WeekId,
        job_id: Option<uuid::Uuid>,
        stage: &'static str,
        err: &CouncilError,
    ) {
        // Best effort: a store failure while recording a failure must
        // not mask the original error.
        if let Err(e) = svc.append_event(
            week,
            None,
            EventType::StageFailed,
            json!({
                "stage": stage,
                "job_id": job_id,
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        ) {
            warn!(stage, error = %e, "could not persist stage_failed event");
        }
        svc.progress
            .stage(stage, StageStatus::Failed, 100, err.to_string());
    }

    fn record_cancellation(
        &self,
        svc: &StageServices,
        week: crate::models::WeekId,
        job_id: Option<uuid::Uuid>,
        stage: &'static str,
    ) {
        if let Err(e) = svc.append_event(
            week,
            None,
            EventType::StageFailed,
            json!({"stage": stage, "job_id": job_id, "reason": "cancelled"}),
        ) {
            warn!(stage, error = %e, "could not persist cancellation event");
        }
        svc.progress
            .stage(stage, StageStatus::Failed, 100, "cancelled");
    }
}
