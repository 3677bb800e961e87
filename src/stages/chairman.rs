//! Chairman stage: a single model synthesizes the pitch set and the
//! peer-review corpus into one council decision. Fatal if the decision
//! does not validate after the repair round.

use crate::config::Config;
use crate::council::fanout::{fan_out, ParseFn, ProviderCall, ProviderOutcome};
use crate::council::parsing::extract_first_object;
use crate::council::validate::{render_issues, validate_chairman_decision, DecisionDraft};
use crate::error::CouncilError;
use crate::llm::LlmProvider;
use crate::models::EventType;
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{Stage, StageServices};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const STAGE_NAME: &str = "chairman";
const DECISION_MAX_TOKENS: u32 = 1_200;

pub struct ChairmanStage {
    cfg: Arc<Config>,
    llm: Arc<dyn LlmProvider>,
}

impl ChairmanStage {
    pub fn new(cfg: Arc<Config>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { cfg, llm }
    }
}

#[async_trait::async_trait]
impl Stage for ChairmanStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        &[
            ContextKey::PmPitches,
            ContextKey::PeerReviews,
            ContextKey::AnonLabelMap,
        ]
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::ChairmanDecision]
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError> {
        svc.ensure_not_cancelled()?;
        let week_id = ctx.week().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "week_id",
        })?;
        let pitches = ctx.pitches().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "pm_pitches",
        })?;
        let reviews = ctx.reviews().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "peer_reviews",
        })?;
        let label_map = ctx.label_map().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "anon_label_map",
        })?;

        // Aggregate review material per pitched model: mean of the
        // seven dimensions and the arguments-against corpus.
        let mut score_sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut arguments: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for review in reviews.iter() {
            let Some(target) = label_map.deanonymize(&review.target_label) else {
                continue;
            };
            let entry = score_sums.entry(target.pm_model.clone()).or_insert((0.0, 0));
            entry.0 += review.scores.mean();
            entry.1 += 1;
            if !review.best_argument_against.is_empty() {
                arguments
                    .entry(target.pm_model.clone())
                    .or_default()
                    .push(review.best_argument_against.clone());
            }
        }
        let mean_scores: BTreeMap<String, f64> = score_sums
            .into_iter()
            .map(|(model, (sum, count))| (model, sum / count as f64))
            .collect();

        let (system, user) =
            crate::council::prompts::chairman_prompt(&self.cfg, &pitches, &mean_scores, &arguments);
        let call = ProviderCall {
            provider_id: self.cfg.chairman_model.clone(),
            model: self.cfg.chairman_model.clone(),
            system,
            user,
            temperature: self.cfg.temperatures.chairman,
            max_tokens: DECISION_MAX_TOKENS,
            timeout: self.cfg.timeouts.chairman_call,
        };

        let cfg = self.cfg.clone();
        let parse: ParseFn<DecisionDraft> = Arc::new(move |raw: &str| {
            let obj = extract_first_object(raw).ok_or("no JSON object in reply")?;
            let draft: DecisionDraft =
                serde_json::from_str(&obj).map_err(|e| format!("invalid JSON: {e}"))?;
            let issues = validate_chairman_decision(&draft, &cfg);
            if issues.is_empty() {
                Ok(draft)
            } else {
                Err(render_issues(&issues))
            }
        });

        let mut results = fan_out(self.llm.clone(), vec![call], 1, STAGE_NAME, svc, parse).await;
        svc.ensure_not_cancelled()?;
        let result = results.remove(0);

        let decision = match (result.status, result.payload) {
            (ProviderOutcome::Ok, Some(draft)) => draft
                .finalize(week_id)
                .ok_or_else(|| CouncilError::Validation {
                    stage: STAGE_NAME,
                    detail: "validated decision failed to finalize".into(),
                })?,
            (ProviderOutcome::Cancelled, _) => return Err(CouncilError::Cancelled),
            (ProviderOutcome::Timeout, _) => {
                return Err(CouncilError::ProviderTimeout {
                    provider: self.cfg.chairman_model.clone(),
                    secs: self.cfg.timeouts.chairman_call.as_secs(),
                })
            }
            (ProviderOutcome::TransportError, _) => {
                return Err(CouncilError::ProviderTransport {
                    provider: self.cfg.chairman_model.clone(),
                    detail: result.error.unwrap_or_else(|| "unknown".into()),
                })
            }
            _ => {
                return Err(CouncilError::Validation {
                    stage: STAGE_NAME,
                    detail: result.error.unwrap_or_else(|| "unparseable decision".into()),
                })
            }
        };

        info!(
            instrument = %decision.selected_trade.instrument,
            direction = decision.selected_trade.direction.as_str(),
            conviction = decision.conviction,
            "chairman decision accepted"
        );

        let payload = serde_json::to_value(&decision)
            .map_err(|e| CouncilError::Persistence(e.to_string()))?;
        svc.append_event(
            week_id,
            Some(self.cfg.council_account.clone()),
            EventType::ChairmanDecision,
            payload,
        )?;

        Ok(ctx.with(
            ContextKey::ChairmanDecision,
            ContextValue::Decision(Arc::new(decision)),
        ))
    }
}
