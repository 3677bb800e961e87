//! Market-sentiment stage (advisory).
//!
//! Pulls a handful of recent items per instrument from the search
//! feed, scores each batch with a short model call, and aggregates by
//! arithmetic mean. Any internal failure degrades the output instead
//! of sinking the pipeline.

use crate::config::Config;
use crate::council::fanout::{fan_out, ParseFn, ProviderCall};
use crate::council::parsing::extract_first_object;
use crate::error::CouncilError;
use crate::llm::{LlmProvider, SearchProvider};
use crate::models::{EventType, MarketSentiment, WeekId};
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{Stage, StagePolicy, StageServices};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const STAGE_NAME: &str = "market_sentiment";
const ITEMS_PER_INSTRUMENT: usize = 3;
const SCORE_MAX_TOKENS: u32 = 64;

pub struct SentimentStage {
    cfg: Arc<Config>,
    llm: Arc<dyn LlmProvider>,
    search: Arc<dyn SearchProvider>,
}

impl SentimentStage {
    pub fn new(cfg: Arc<Config>, llm: Arc<dyn LlmProvider>, search: Arc<dyn SearchProvider>) -> Self {
        Self { cfg, llm, search }
    }

    async fn collect(
        &self,
        week_id: WeekId,
        theme: Option<&str>,
        svc: &StageServices,
    ) -> Result<MarketSentiment, CouncilError> {
        let mut calls = Vec::new();
        let mut sources = Vec::new();

        for inst in &self.cfg.universe {
            svc.ensure_not_cancelled()?;
            let items = self
                .search
                .recent_items(inst.as_str(), ITEMS_PER_INSTRUMENT)
                .await
                .map_err(|e| CouncilError::ProviderTransport {
                    provider: "sentiment_search".into(),
                    detail: e.to_string(),
                })?;
            if items.is_empty() {
                continue;
            }
            for item in &items {
                sources.push(item.url.clone());
            }
            let (system, user) =
                crate::council::prompts::sentiment_prompt(inst.as_str(), &items, theme);
            calls.push(ProviderCall {
                provider_id: inst.as_str().to_string(),
                model: self.cfg.sentiment_model.clone(),
                system,
                user,
                temperature: self.cfg.temperatures.market_sentiment,
                max_tokens: SCORE_MAX_TOKENS,
                timeout: self.cfg.timeouts.sentiment_call,
            });
        }

        if calls.is_empty() {
            return Err(CouncilError::PartialProviderFailure {
                stage: STAGE_NAME,
                detail: "search feed returned no items for any instrument".into(),
            });
        }

        let parse: ParseFn<f64> = Arc::new(|raw: &str| {
            let obj = extract_first_object(raw).ok_or("no JSON object in reply")?;
            let value: serde_json::Value =
                serde_json::from_str(&obj).map_err(|e| format!("invalid JSON: {e}"))?;
            let score = value
                .get("score")
                .and_then(|s| s.as_f64())
                .ok_or("missing numeric field 'score'")?;
            if !(-1.0..=1.0).contains(&score) {
                return Err(format!("score {score} not in [-1, 1]"));
            }
            Ok(score)
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

        let mut per_instrument = BTreeMap::new();
        for result in &results {
            match (&result.status, result.payload) {
                (crate::council::fanout::ProviderOutcome::Ok, Some(score)) => {
                    per_instrument.insert(result.provider_id.clone(), score);
                }
                _ => {
                    warn!(
                        instrument = %result.provider_id,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "sentiment scoring failed for instrument"
                    );
                }
            }
        }

        if per_instrument.is_empty() {
            return Err(CouncilError::PartialProviderFailure {
                stage: STAGE_NAME,
                detail: "no instrument produced a sentiment score".into(),
            });
        }

        let overall_score =
            per_instrument.values().sum::<f64>() / per_instrument.len() as f64;
        sources.sort();
        sources.dedup();

        Ok(MarketSentiment {
            week_id,
            asof: Utc::now(),
            overall_score,
            per_instrument,
            sources,
            degraded: false,
        })
    }
}

#[async_trait::async_trait]
impl Stage for SentimentStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        // USER_QUERY is an optional theme, read if present.
        &[]
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::Sentiment]
    }

    fn policy(&self) -> StagePolicy {
        StagePolicy::Advisory
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError> {
        let week_id = ctx.week().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "week_id",
        })?;
        let theme = ctx.user_query();

        let sentiment = match self.collect(week_id, theme, svc).await {
            Ok(s) => {
                info!(
                    overall = s.overall_score,
                    instruments = s.per_instrument.len(),
                    "sentiment aggregated"
                );
                s
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "sentiment feed failed, carrying degraded placeholder");
                MarketSentiment::degraded_placeholder(week_id, Utc::now())
            }
        };

        // Persisting the artifact is best-effort here: the stage is
        // advisory, a store hiccup must not sink the pipeline.
        let payload = serde_json::to_value(&sentiment)
            .map_err(|e| CouncilError::Persistence(e.to_string()))?;
        if let Err(e) = svc.append_event(week_id, None, EventType::MarketSentiment, payload) {
            warn!(error = %e, "could not persist sentiment artifact");
        }

        let mut out = ctx.with(
            ContextKey::Sentiment,
            ContextValue::Sentiment(Arc::new(sentiment.clone())),
        );
        if sentiment.degraded {
            out = out.mark_degraded(STAGE_NAME);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmCallOutput, LlmError, LlmRequest, LlmUsage, SearchItem};
    use crate::pipeline::stage::ProgressSink;
    use crate::store::EventStore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct ScoreLlm(f64);

    #[async_trait::async_trait]
    impl LlmProvider for ScoreLlm {
        async fn ask(&self, req: &LlmRequest) -> Result<LlmCallOutput, LlmError> {
            Ok(LlmCallOutput {
                model: req.model.clone(),
                content: format!("{{\"score\": {}}}", self.0),
                usage: LlmUsage::default(),
                latency_ms: 1,
            })
        }
    }

    struct OneItemFeed;

    #[async_trait::async_trait]
    impl SearchProvider for OneItemFeed {
        async fn recent_items(
            &self,
            query: &str,
            _limit: usize,
        ) -> Result<Vec<SearchItem>, LlmError> {
            Ok(vec![SearchItem {
                title: format!("{query} headline"),
                snippet: "macro chatter".into(),
                url: format!("https://example.com/{query}"),
            }])
        }
    }

    struct DeadFeed;

    #[async_trait::async_trait]
    impl SearchProvider for DeadFeed {
        async fn recent_items(
            &self,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<SearchItem>, LlmError> {
            Err(LlmError::Transport("feed offline".into()))
        }
    }

    fn ctx() -> Context {
        Context::new()
            .with(
                ContextKey::WeekId,
                ContextValue::Week("2026-07-29".parse().unwrap()),
            )
            .with(ContextKey::JobId, ContextValue::JobId(Uuid::new_v4()))
    }

    fn svc() -> StageServices {
        StageServices {
            store: EventStore::in_memory().unwrap(),
            progress: ProgressSink::disconnected(Uuid::new_v4()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn aggregates_mean_scores_per_instrument_and_overall() {
        let stage = SentimentStage::new(
            Arc::new(Config::default()),
            Arc::new(ScoreLlm(0.4)),
            Arc::new(OneItemFeed),
        );
        let services = svc();
        let out = stage.run(ctx(), &services).await.unwrap();

        let sentiment = out.sentiment().unwrap();
        assert!(!sentiment.degraded);
        assert!((sentiment.overall_score - 0.4).abs() < 1e-9);
        assert_eq!(sentiment.per_instrument.len(), Config::default().universe.len());
        assert!(!sentiment.sources.is_empty());

        let wk = "2026-07-29".parse().unwrap();
        let events = services
            .store
            .list(wk, Some(EventType::MarketSentiment))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn dead_feed_degrades_instead_of_failing() {
        let stage = SentimentStage::new(
            Arc::new(Config::default()),
            Arc::new(ScoreLlm(0.0)),
            Arc::new(DeadFeed),
        );
        let out = stage.run(ctx(), &svc()).await.unwrap();
        let sentiment = out.sentiment().unwrap();
        assert!(sentiment.degraded);
        assert!(out.is_degraded(STAGE_NAME));
    }

    #[tokio::test]
    async fn cancellation_propagates_instead_of_degrading() {
        let stage = SentimentStage::new(
            Arc::new(Config::default()),
            Arc::new(ScoreLlm(0.1)),
            Arc::new(OneItemFeed),
        );
        let services = svc();
        services.cancel.cancel();
        let err = stage.run(ctx(), &services).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
