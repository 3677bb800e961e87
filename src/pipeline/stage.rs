//! Stage abstraction and the progress/event plumbing stages run with.

use crate::error::CouncilError;
use crate::models::{AccountId, EventType, NewEvent, WeekId};
use crate::pipeline::context::{Context, ContextKey};
use crate::store::EventStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPhase {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Whether a stage failure sinks the pipeline or only degrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    Fatal,
    Advisory,
}

// ---------------------------------------------------------------------------
// Progress channel
// ---------------------------------------------------------------------------

/// One update flowing from a running stage to the job manager.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Stage {
        job_id: Uuid,
        stage: &'static str,
        status: StageStatus,
        percent: u8,
        message: String,
    },
    Provider {
        job_id: Uuid,
        stage: &'static str,
        provider_id: String,
        phase: ProviderPhase,
        percent: u8,
        message: String,
    },
}

/// Job-scoped sender side of the progress channel. Send failures are
/// ignored: a job manager that went away must not sink a stage.
#[derive(Clone)]
pub struct ProgressSink {
    job_id: Uuid,
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressSink {
    pub fn new(job_id: Uuid, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            job_id,
            tx: Some(tx),
        }
    }

    /// A sink that drops everything, for tests and dry runs.
    pub fn disconnected(job_id: Uuid) -> Self {
        Self { job_id, tx: None }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn stage(&self, stage: &'static str, status: StageStatus, percent: u8, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressUpdate::Stage {
                job_id: self.job_id,
                stage,
                status,
                percent: percent.min(100),
                message: message.into(),
            });
        }
    }

    pub fn provider(
        &self,
        stage: &'static str,
        provider_id: &str,
        phase: ProviderPhase,
        percent: u8,
        message: impl Into<String>,
    ) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressUpdate::Provider {
                job_id: self.job_id,
                stage,
                provider_id: provider_id.to_string(),
                phase,
                percent: percent.min(100),
                message: message.into(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// StageServices
// ---------------------------------------------------------------------------

/// Run-scoped services handed to every stage invocation.
#[derive(Clone)]
pub struct StageServices {
    pub store: EventStore,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl StageServices {
    pub fn ensure_not_cancelled(&self) -> Result<(), CouncilError> {
        if self.cancel.is_cancelled() {
            Err(CouncilError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Append one artifact event for the week.
    pub fn append_event(
        &self,
        week_id: WeekId,
        account_id: Option<AccountId>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<i64, CouncilError> {
        self.store.append(NewEvent {
            week_id,
            account_id,
            event_type,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// One pipeline step. Declares the context keys it needs and the keys
/// it promises to produce; the runtime enforces both sides.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn inputs(&self) -> &'static [ContextKey];

    fn outputs(&self) -> &'static [ContextKey];

    fn policy(&self) -> StagePolicy {
        StagePolicy::Fatal
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_sink_swallows_updates() {
        let sink = ProgressSink::disconnected(Uuid::new_v4());
        sink.stage("research", StageStatus::Running, 50, "half way");
        sink.provider("research", "openai/gpt-5.2", ProviderPhase::Started, 0, "");
    }

    #[test]
    fn connected_sink_delivers_in_order() {
        let job_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(job_id, tx);

        sink.stage("pm_pitch", StageStatus::Running, 0, "fanning out");
        sink.provider("pm_pitch", "m1", ProviderPhase::Completed, 100, "ok");

        match rx.try_recv().unwrap() {
            ProgressUpdate::Stage { stage, status, .. } => {
                assert_eq!(stage, "pm_pitch");
                assert_eq!(status, StageStatus::Running);
            }
            other => panic!("unexpected update: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ProgressUpdate::Provider {
                provider_id, phase, percent, ..
            } => {
                assert_eq!(provider_id, "m1");
                assert_eq!(phase, ProviderPhase::Completed);
                assert_eq!(percent, 100);
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn percent_is_clamped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(Uuid::new_v4(), tx);
        sink.stage("execution", StageStatus::Running, 250, "");
        match rx.try_recv().unwrap() {
            ProgressUpdate::Stage { percent, .. } => assert_eq!(percent, 100),
            other => panic!("unexpected update: {other:?}"),
        }
    }
}
