//! PM-pitch stage: fan out to the PM roster, parse and validate each
//! model's single pitch object, enrich with identity, persist in
//! roster order. At least one valid pitch is required to proceed.

use crate::config::Config;
use crate::council::fanout::{fan_out, ParseFn, ProviderCall, ProviderOutcome};
use crate::council::parsing::extract_first_object;
use crate::council::validate::{render_issues, validate_pm_pitch, PitchDraft};
use crate::error::CouncilError;
use crate::llm::LlmProvider;
use crate::models::EventType;
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{Stage, StageServices};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

const STAGE_NAME: &str = "pm_pitch";
const PITCH_MAX_TOKENS: u32 = 1_200;

pub struct PmPitchStage {
    cfg: Arc<Config>,
    llm: Arc<dyn LlmProvider>,
}

impl PmPitchStage {
    pub fn new(cfg: Arc<Config>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { cfg, llm }
    }
}

#[async_trait::async_trait]
impl Stage for PmPitchStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::ResearchPacks, ContextKey::MarketSnapshot]
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::PmPitches]
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError> {
        svc.ensure_not_cancelled()?;
        let week_id = ctx.week().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "week_id",
        })?;
        let packs = ctx.research_packs().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "research_packs",
        })?;
        let snapshot = ctx.snapshot().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "market_snapshot",
        })?;
        let sentiment = ctx.sentiment();
        let query = ctx.user_query().unwrap_or_default().to_string();
        let digest = snapshot.prompt_digest(&self.cfg.universe);

        let (system, user) = crate::council::prompts::pm_pitch_prompt(
            &self.cfg,
            &query,
            &packs,
            &digest,
            sentiment.as_deref(),
        );
        let calls: Vec<ProviderCall> = self
            .cfg
            .pm_roster
            .iter()
            .map(|entry| ProviderCall {
                provider_id: entry.model_id.clone(),
                model: entry.model_id.clone(),
                system: system.clone(),
                user: user.clone(),
                temperature: self.cfg.temperatures.pm_pitch,
                max_tokens: PITCH_MAX_TOKENS,
                timeout: self.cfg.timeouts.pm_call,
            })
            .collect();

        let cfg = self.cfg.clone();
        let parse: ParseFn<PitchDraft> = Arc::new(move |raw: &str| {
            let obj = extract_first_object(raw).ok_or("no JSON object in reply")?;
            let draft: PitchDraft =
                serde_json::from_str(&obj).map_err(|e| format!("invalid JSON: {e}"))?;
            let issues = validate_pm_pitch(&draft, &cfg);
            if issues.is_empty() {
                Ok(draft)
            } else {
                Err(render_issues(&issues))
            }
        });

        let results = fan_out(
            self.llm.clone(),
            calls,
            self.cfg.llm_cap(),
            STAGE_NAME,
            svc,
            parse,
        )
        .await;

        // Nothing is persisted for a cancelled run.
        svc.ensure_not_cancelled()?;

        let asof = Utc::now();
        let mut pitches = Vec::new();
        let mut failures = Vec::new();

        // Results arrive in roster order; zip back onto the roster for
        // account binding.
        for (entry, result) in self.cfg.pm_roster.iter().zip(results) {
            match result.payload {
                Some(draft) if result.status == ProviderOutcome::Ok => {
                    match draft.finalize(week_id, asof, &entry.model_id, &entry.account_id) {
                        Some(pitch) => {
                            if result.repaired {
                                info!(model = %entry.model_id, "pitch accepted after repair");
                            }
                            pitches.push(pitch);
                        }
                        None => failures.push(format!(
                            "{}: validated draft failed to finalize",
                            entry.model_id
                        )),
                    }
                }
                _ => {
                    let detail = result.error.unwrap_or_else(|| "unknown failure".into());
                    warn!(model = %entry.model_id, error = %detail, "pitch rejected");
                    failures.push(format!("{}: {detail}", entry.model_id));
                }
            }
        }

        if pitches.is_empty() {
            return Err(CouncilError::PartialProviderFailure {
                stage: STAGE_NAME,
                detail: format!("no valid pitch from any PM ({})", failures.join("; ")),
            });
        }
        info!(
            accepted = pitches.len(),
            rejected = failures.len(),
            "pm pitches collected"
        );

        for pitch in &pitches {
            let payload = serde_json::to_value(pitch)
                .map_err(|e| CouncilError::Persistence(e.to_string()))?;
            svc.append_event(
                week_id,
                Some(pitch.account_id.clone()),
                EventType::PmPitch,
                payload,
            )?;
        }

        Ok(ctx.with(
            ContextKey::PmPitches,
            ContextValue::Pitches(Arc::new(pitches)),
        ))
    }
}
