//! Bounded-concurrency fan-out to LLM providers with repair.
//!
//! The harness never errors: every call comes back as a
//! `ProviderResult`, in the same order the calls went in, regardless
//! of completion order. Parse/validate failures get exactly one repair
//! round carrying the validator's error list; transport failures and
//! timeouts do not.

use crate::llm::{LlmCallOutput, LlmError, LlmProvider, LlmRequest, LlmUsage};
use crate::pipeline::stage::{ProviderPhase, StageServices};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProviderCall {
    /// Stable id the caller keys results by (model id or source name).
    pub provider_id: String,
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    Ok,
    ParseError,
    Timeout,
    TransportError,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProviderResult<T> {
    pub provider_id: String,
    pub status: ProviderOutcome,
    pub payload: Option<T>,
    pub error: Option<String>,
    pub usage: Option<LlmUsage>,
    pub latency_ms: u64,
    /// True when the repair round ran.
    pub repaired: bool,
}

impl<T> ProviderResult<T> {
    pub fn is_ok(&self) -> bool {
        self.status == ProviderOutcome::Ok
    }

    fn failed(provider_id: String, status: ProviderOutcome, error: String, latency_ms: u64, repaired: bool) -> Self {
        Self {
            provider_id,
            status,
            payload: None,
            error: Some(error),
            usage: None,
            latency_ms,
            repaired,
        }
    }
}

/// Caller-supplied parse + validate. `Err` carries the exact issue
/// list that goes into the repair prompt.
pub type ParseFn<T> = Arc<dyn Fn(&str) -> Result<T, String> + Send + Sync>;

enum AttemptError {
    Cancelled,
    Timeout,
    Transport(String),
}

async fn attempt(
    llm: &Arc<dyn LlmProvider>,
    req: &LlmRequest,
    cancel: &CancellationToken,
) -> Result<LlmCallOutput, AttemptError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        res = tokio::time::timeout(req.timeout, llm.ask(req)) => match res {
            Err(_) => Err(AttemptError::Timeout),
            Ok(Err(LlmError::Timeout)) => Err(AttemptError::Timeout),
            Ok(Err(e)) => Err(AttemptError::Transport(e.to_string())),
            Ok(Ok(out)) => Ok(out),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one<T>(
    llm: Arc<dyn LlmProvider>,
    call: ProviderCall,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    svc: StageServices,
    stage: &'static str,
    parse: ParseFn<T>,
) -> ProviderResult<T> {
    let id = call.provider_id.clone();

    // Cancellation check before dispatch, and again while queued on
    // the semaphore.
    let _permit = tokio::select! {
        _ = cancel.cancelled() => {
            return ProviderResult::failed(id, ProviderOutcome::Cancelled, "cancelled before dispatch".into(), 0, false);
        }
        permit = sem.clone().acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                return ProviderResult::failed(id, ProviderOutcome::Cancelled, "fan-out closed".into(), 0, false);
            }
        },
    };

    svc.progress
        .provider(stage, &id, ProviderPhase::Started, 0, "dispatching");

    let mut req = LlmRequest {
        model: call.model.clone(),
        system: call.system.clone(),
        user: call.user.clone(),
        temperature: call.temperature,
        max_tokens: call.max_tokens,
        timeout: call.timeout,
    };

    let first = match attempt(&llm, &req, &cancel).await {
        Ok(out) => out,
        Err(e) => return attempt_failure(e, id, stage, &svc, 0, false),
    };
    let mut latency_ms = first.latency_ms;

    match parse(&first.content) {
        Ok(payload) => {
            svc.progress
                .provider(stage, &id, ProviderPhase::Completed, 100, "ok");
            return ProviderResult {
                provider_id: id,
                status: ProviderOutcome::Ok,
                payload: Some(payload),
                error: None,
                usage: Some(first.usage),
                latency_ms,
                repaired: false,
            };
        }
        Err(issues) => {
            debug!(stage, provider = %id, issues = %issues, "reply failed validation, issuing repair");
            svc.progress
                .provider(stage, &id, ProviderPhase::InProgress, 50, "repairing");

            // One repair round: same request with the validator's
            // exact error list appended.
            req.user = format!(
                "{}\n\nYour previous reply was:\n{}\n\nIt failed validation. \
                 Fix the JSON to satisfy: {}. Return only the corrected JSON.",
                call.user, first.content, issues
            );

            let second = match attempt(&llm, &req, &cancel).await {
                Ok(out) => out,
                Err(e) => return attempt_failure(e, id, stage, &svc, latency_ms, true),
            };
            latency_ms += second.latency_ms;

            match parse(&second.content) {
                Ok(payload) => {
                    svc.progress
                        .provider(stage, &id, ProviderPhase::Completed, 100, "ok after repair");
                    ProviderResult {
                        provider_id: id,
                        status: ProviderOutcome::Ok,
                        payload: Some(payload),
                        error: None,
                        usage: Some(second.usage),
                        latency_ms,
                        repaired: true,
                    }
                }
                Err(issues) => {
                    warn!(stage, provider = %id, issues = %issues, "reply still invalid after repair");
                    svc.progress
                        .provider(stage, &id, ProviderPhase::Failed, 100, issues.clone());
                    ProviderResult::failed(id, ProviderOutcome::ParseError, issues, latency_ms, true)
                }
            }
        }
    }
}

fn attempt_failure<T>(
    err: AttemptError,
    id: String,
    stage: &'static str,
    svc: &StageServices,
    latency_ms: u64,
    repaired: bool,
) -> ProviderResult<T> {
    let (status, message) = match err {
        AttemptError::Cancelled => (ProviderOutcome::Cancelled, "cancelled".to_string()),
        AttemptError::Timeout => (ProviderOutcome::Timeout, "call timed out".to_string()),
        AttemptError::Transport(detail) => (ProviderOutcome::TransportError, detail),
    };
    svc.progress
        .provider(stage, &id, ProviderPhase::Failed, 100, message.clone());
    ProviderResult::failed(id, status, message, latency_ms, repaired)
}

/// Dispatch all calls concurrently under the cap and collect results
/// in input order.
pub async fn fan_out<T: Send + 'static>(
    llm: Arc<dyn LlmProvider>,
    calls: Vec<ProviderCall>,
    cap: usize,
    stage: &'static str,
    svc: &StageServices,
    parse: ParseFn<T>,
) -> Vec<ProviderResult<T>> {
    let sem = Arc::new(Semaphore::new(cap.max(1)));

    let mut handles = Vec::with_capacity(calls.len());
    for call in calls {
        let id = call.provider_id.clone();
        let handle = tokio::spawn(run_one(
            llm.clone(),
            call,
            sem.clone(),
            svc.cancel.clone(),
            svc.clone(),
            stage,
            parse.clone(),
        ));
        handles.push((id, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (id, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => results.push(ProviderResult::failed(
                id,
                ProviderOutcome::TransportError,
                format!("provider task failed: {e}"),
                0,
                false,
            )),
        }
    }
    results
}
