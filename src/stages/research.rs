//! Research stage: one or two research providers produce the weekly
//! macro pack. A single surviving pack is enough; only the loss of
//! every provider is fatal.

use crate::config::Config;
use crate::council::fanout::{fan_out, ParseFn, ProviderCall, ProviderOutcome};
use crate::council::parsing::extract_first_object;
use crate::council::validate::{render_issues, validate_research_pack, ResearchPackDraft};
use crate::error::CouncilError;
use crate::llm::LlmProvider;
use crate::models::{EventType, PackStatus, ResearchPack};
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{Stage, StageServices};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const STAGE_NAME: &str = "research";
const RESEARCH_MAX_TOKENS: u32 = 4_096;

pub struct ResearchStage {
    cfg: Arc<Config>,
    llm: Arc<dyn LlmProvider>,
}

impl ResearchStage {
    pub fn new(cfg: Arc<Config>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { cfg, llm }
    }
}

#[async_trait::async_trait]
impl Stage for ResearchStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        // Sentiment is read when present; an advisory failure upstream
        // must not block research.
        &[ContextKey::UserQuery, ContextKey::MarketSnapshot]
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::ResearchPacks]
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError> {
        svc.ensure_not_cancelled()?;
        let week_id = ctx.week().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "week_id",
        })?;
        let query = ctx.user_query().unwrap_or_default().to_string();
        let snapshot = ctx.snapshot().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "market_snapshot",
        })?;
        let sentiment = ctx.sentiment();
        let digest = snapshot.prompt_digest(&self.cfg.universe);

        let calls: Vec<ProviderCall> = self
            .cfg
            .research_sources
            .iter()
            .map(|source| {
                let (system, user) = crate::council::prompts::research_prompt(
                    &self.cfg,
                    &query,
                    &digest,
                    sentiment.as_deref(),
                );
                ProviderCall {
                    provider_id: source.clone(),
                    model: source.clone(),
                    system,
                    user,
                    temperature: self.cfg.temperatures.research,
                    max_tokens: RESEARCH_MAX_TOKENS,
                    timeout: self.cfg.timeouts.research_call,
                }
            })
            .collect();

        let cfg = self.cfg.clone();
        let parse: ParseFn<ResearchPackDraft> = Arc::new(move |raw: &str| {
            let obj = extract_first_object(raw).ok_or("no JSON object in reply")?;
            let draft: ResearchPackDraft =
                serde_json::from_str(&obj).map_err(|e| format!("invalid JSON: {e}"))?;
            let issues = validate_research_pack(&draft, &cfg);
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
        svc.ensure_not_cancelled()?;

        let asof = Utc::now();
        let mut packs = BTreeMap::new();
        let mut failures = Vec::new();
        let mut out_ctx = ctx.clone();

        for result in results {
            let source = result.provider_id.clone();
            match result.payload {
                Some(draft) if result.status == ProviderOutcome::Ok => {
                    let pack = ResearchPack {
                        week_id,
                        asof,
                        source: source.clone(),
                        natural_language: draft.natural_language.unwrap_or_default(),
                        macro_regime: draft.macro_regime.unwrap_or_default(),
                        top_narratives: draft.top_narratives,
                        tradable_candidates: draft
                            .tradable_candidates
                            .iter()
                            .map(|t| t.trim().to_ascii_uppercase())
                            .collect(),
                        event_calendar: draft.event_calendar,
                        confidence_notes: draft.confidence_notes.unwrap_or_default(),
                        status: PackStatus::Complete,
                    };
                    let payload = serde_json::to_value(&pack)
                        .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                    svc.append_event(week_id, None, EventType::ResearchPack, payload)?;
                    info!(source = %source, repaired = result.repaired, "research pack accepted");
                    packs.insert(source, pack);
                }
                _ => {
                    let detail = result.error.unwrap_or_else(|| "unknown failure".into());
                    warn!(source = %source, error = %detail, "research provider failed");
                    failures.push(format!("{source}: {detail}"));
                    out_ctx = out_ctx.mark_degraded(&format!("research:{source}"));
                }
            }
        }

        if packs.is_empty() {
            return Err(CouncilError::PartialProviderFailure {
                stage: STAGE_NAME,
                detail: format!("all research providers failed ({})", failures.join("; ")),
            });
        }

        Ok(out_ctx.with(
            ContextKey::ResearchPacks,
            ContextValue::ResearchPacks(Arc::new(packs)),
        ))
    }
}
