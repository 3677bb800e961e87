//! Peer-review stage: anonymized N×(N−1) cross-review.
//!
//! Each reviewer sees the other N−1 pitches under stable labels and
//! must return a JSON array with one review per label. The parser also
//! accepts a bare object (degraded) and adjacent objects. Self-reviews
//! are discarded, duplicate targets keep the first occurrence, and a
//! per-reviewer coverage figure is persisted either way.

use crate::config::Config;
use crate::council::anonymizer::anonymize;
use crate::council::fanout::{fan_out, ParseFn, ProviderCall, ProviderOutcome};
use crate::council::parsing::extract_object_list;
use crate::council::validate::{render_issues, validate_peer_review, ReviewDraft};
use crate::error::CouncilError;
use crate::llm::LlmProvider;
use crate::models::{EventType, PeerReview};
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{Stage, StageServices};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const STAGE_NAME: &str = "peer_review";
const REVIEW_MAX_TOKENS: u32 = 2_000;

pub struct PeerReviewStage {
    cfg: Arc<Config>,
    llm: Arc<dyn LlmProvider>,
}

impl PeerReviewStage {
    pub fn new(cfg: Arc<Config>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { cfg, llm }
    }
}

/// One reviewer's parsed response.
#[derive(Debug, Clone)]
struct ReviewBatch {
    drafts: Vec<ReviewDraft>,
    degraded_shape: bool,
}

fn parse_review_batch(raw: &str) -> Result<ReviewBatch, String> {
    let extracted = extract_object_list(raw);
    if extracted.values.is_empty() {
        return Err("no review objects found in reply".to_string());
    }

    let mut drafts = Vec::with_capacity(extracted.values.len());
    let mut issues = Vec::new();
    for (i, value) in extracted.values.iter().enumerate() {
        match serde_json::from_value::<ReviewDraft>(value.clone()) {
            Ok(draft) => {
                let element_issues = validate_peer_review(&draft);
                if element_issues.is_empty() {
                    drafts.push(draft);
                } else {
                    issues.push(format!("review {i}: {}", render_issues(&element_issues)));
                }
            }
            Err(e) => issues.push(format!("review {i}: invalid JSON: {e}")),
        }
    }

    if !issues.is_empty() {
        return Err(issues.join("; "));
    }
    Ok(ReviewBatch {
        drafts,
        degraded_shape: extracted.degraded_shape,
    })
}

#[async_trait::async_trait]
impl Stage for PeerReviewStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        &[ContextKey::PmPitches]
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::PeerReviews, ContextKey::AnonLabelMap]
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

        let (anon, label_map) = anonymize(&pitches);
        let n = anon.len();
        if n < 2 {
            warn!(pitches = n, "not enough pitches to cross-review");
            return Ok(ctx
                .with(ContextKey::PeerReviews, ContextValue::Reviews(Arc::new(vec![])))
                .with(
                    ContextKey::AnonLabelMap,
                    ContextValue::LabelMap(Arc::new(label_map)),
                ));
        }

        // One call per reviewer, in roster order (the order of
        // PM_PITCHES). Each prompt carries the other N-1 pitches only;
        // the label map itself never reaches a model.
        let mut reviewers = Vec::with_capacity(n);
        let mut calls = Vec::with_capacity(n);
        for pitch in pitches.iter() {
            let own_label = label_map
                .label_for_pitch(&pitch.pitch_id)
                .ok_or_else(|| CouncilError::Validation {
                    stage: STAGE_NAME,
                    detail: format!("pitch {} missing from label map", pitch.pitch_id),
                })?
                .to_string();
            let others: Vec<_> = anon.iter().filter(|a| a.label != own_label).collect();
            let (system, user) = crate::council::prompts::peer_review_prompt(&own_label, &others);
            reviewers.push((pitch.pm_model.clone(), own_label));
            calls.push(ProviderCall {
                provider_id: pitch.pm_model.clone(),
                model: pitch.pm_model.clone(),
                system,
                user,
                temperature: self.cfg.temperatures.peer_review,
                max_tokens: REVIEW_MAX_TOKENS,
                timeout: self.cfg.timeouts.review_call,
            });
        }

        let parse: ParseFn<ReviewBatch> = Arc::new(parse_review_batch);
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

        let expected = n - 1;
        let mut reviews: Vec<PeerReview> = Vec::new();

        for ((reviewer_model, own_label), result) in reviewers.into_iter().zip(results) {
            let (batch, failed) = match result.payload {
                Some(batch) if result.status == ProviderOutcome::Ok => (batch, None),
                _ => (
                    ReviewBatch {
                        drafts: vec![],
                        degraded_shape: false,
                    },
                    Some(result.error.unwrap_or_else(|| "unknown failure".into())),
                ),
            };
            if let Some(detail) = &failed {
                warn!(reviewer = %reviewer_model, error = %detail, "reviewer produced no usable reviews");
            }
            if batch.degraded_shape {
                warn!(reviewer = %reviewer_model, "reviewer returned a bare object where an array is expected");
            }

            let mut seen_targets: BTreeSet<String> = BTreeSet::new();
            let mut kept = Vec::new();
            for draft in batch.drafts {
                let Some(target_label) = draft.target_label.clone() else {
                    continue;
                };
                if target_label == own_label {
                    warn!(reviewer = %reviewer_model, "discarding self-review");
                    continue;
                }
                let Some(target) = label_map.deanonymize(&target_label) else {
                    warn!(reviewer = %reviewer_model, target = %target_label, "unknown target label discarded");
                    continue;
                };
                if !seen_targets.insert(target_label.clone()) {
                    warn!(reviewer = %reviewer_model, target = %target_label, "duplicate target label, keeping first");
                    continue;
                }
                let Some(scores) = draft.finalize_scores() else {
                    continue;
                };
                kept.push((
                    target.account_id.clone(),
                    PeerReview {
                        review_id: uuid::Uuid::new_v4(),
                        week_id,
                        reviewer_model: reviewer_model.clone(),
                        target_label,
                        scores,
                        best_argument_against: draft.best_argument_against.unwrap_or_default(),
                        one_flip_condition: draft.one_flip_condition.unwrap_or_default(),
                        suggested_fix: draft.suggested_fix.unwrap_or_default(),
                        degraded_shape: batch.degraded_shape,
                    },
                ));
            }

            let coverage = kept.len() as f64 / expected as f64;
            svc.append_event(
                week_id,
                None,
                EventType::ReviewCoverage,
                json!({
                    "reviewer_model": reviewer_model,
                    "extracted": kept.len(),
                    "expected": expected,
                    "coverage": coverage,
                    "degraded_shape": batch.degraded_shape,
                    "error": failed,
                }),
            )?;

            for (target_account, review) in kept {
                let payload = serde_json::to_value(&review)
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                svc.append_event(
                    week_id,
                    Some(target_account),
                    EventType::PeerReview,
                    payload,
                )?;
                reviews.push(review);
            }
        }

        info!(
            reviews = reviews.len(),
            target = n * (n - 1),
            "peer review matrix collected"
        );

        Ok(ctx
            .with(
                ContextKey::PeerReviews,
                ContextValue::Reviews(Arc::new(reviews)),
            )
            .with(
                ContextKey::AnonLabelMap,
                ContextValue::LabelMap(Arc::new(label_map)),
            ))
    }
}
