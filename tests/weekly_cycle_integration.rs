//! Integration test for the weekly council cycle.
//!
//! Drives the public library surface end to end: scripted council
//! models, a paper broker per account, a frozen snapshot, and an
//! in-memory event store. No network access.

use councilbot_backend::brokers::{BrokerSet, PaperBrokerConfig};
use councilbot_backend::config::{Config, Mode};
use councilbot_backend::jobs::{JobInputs, JobManager, JobStatus};
use councilbot_backend::llm::{
    LlmCallOutput, LlmError, LlmProvider, LlmRequest, LlmUsage, SearchItem, SearchProvider,
};
use councilbot_backend::market::{InstrumentQuote, MarketSnapshot, StaticSnapshotSource};
use councilbot_backend::models::{AccountId, EventType, WeekId};
use councilbot_backend::pipeline::PipelineDeps;
use councilbot_backend::store::EventStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

fn week() -> WeekId {
    "2026-07-29".parse().unwrap()
}

struct ScriptedCouncil {
    replies: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedCouncil {
    fn new(entries: Vec<(&str, Vec<String>)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.into_iter().collect()))
                    .collect(),
            ),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedCouncil {
    async fn ask(&self, req: &LlmRequest) -> Result<LlmCallOutput, LlmError> {
        let content = self
            .replies
            .lock()
            .get_mut(&req.model)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| LlmError::Transport("no scripted reply".into()))?;
        Ok(LlmCallOutput {
            model: req.model.clone(),
            content,
            usage: LlmUsage::default(),
            latency_ms: 1,
        })
    }
}

struct QuietFeed;

#[async_trait::async_trait]
impl SearchProvider for QuietFeed {
    async fn recent_items(&self, _query: &str, _limit: usize) -> Result<Vec<SearchItem>, LlmError> {
        Ok(vec![])
    }
}

fn pitch_json(instrument: &str, direction: &str, conviction: f64) -> String {
    format!(
        r#"{{"instrument": "{instrument}", "direction": "{direction}", "horizon": "1w",
            "conviction": {conviction},
            "thesis_bullets": ["positioning washed out", "seasonality supportive"],
            "risk_profile": "BASE",
            "entry_policy": {{"mode": "MOO", "limit_price": null}},
            "exit_policy": {{"time_stop_days": 7, "stop_loss_pct": 2.5,
                            "take_profit_pct": 5.0, "exit_before_events": ["FOMC"]}},
            "risk_notes": "crowded trade risk"}}"#
    )
}

fn review_array() -> String {
    let objs: Vec<String> = ["Pitch A", "Pitch B", "Pitch C", "Pitch D"]
        .iter()
        .map(|label| {
            format!(
                r#"{{"target_label": "{label}",
                     "scores": {{"clarity": 8, "edge_plausibility": 7, "timing_catalyst": 6,
                                "risk_definition": 7, "indicator_integrity": 9,
                                "originality": 5, "tradeability": 6}},
                     "best_argument_against": "no catalyst this week",
                     "one_flip_condition": "CPI surprise",
                     "suggested_fix": "smaller size"}}"#
            )
        })
        .collect();
    format!("[{}]", objs.join(","))
}

fn council_setup() -> (JobManager, EventStore) {
    let mut cfg = Config::default();
    cfg.timeouts.research_call = Duration::from_secs(5);
    cfg.timeouts.pm_call = Duration::from_secs(5);
    cfg.timeouts.review_call = Duration::from_secs(5);
    cfg.timeouts.chairman_call = Duration::from_secs(5);
    cfg.timeouts.sentiment_call = Duration::from_secs(5);
    let cfg = Arc::new(cfg);

    let pack = r#"{"natural_language": "dollar softening into supply week",
                   "macro_regime": "late-cycle disinflation",
                   "top_narratives": ["duration demand"],
                   "tradable_candidates": ["TLT", "GLD"],
                   "event_calendar": ["FOMC Wednesday"],
                   "confidence_notes": "high"}"#;
    let decision = r#"{"selected_trade": {"instrument": "TLT", "direction": "SHORT",
                        "horizon": "1w", "risk_profile": "TIGHT"},
                        "conviction": -1.0, "rationale": "supply pressure dominates",
                        "dissent_summary": ["one PM prefers gold"],
                        "monitoring_plan": "watch the 10y auction"}"#;

    let llm = ScriptedCouncil::new(vec![
        ("openai/gpt-5.2-deep-research", vec![pack.to_string()]),
        (
            "openai/gpt-5.2",
            vec![pitch_json("SPY", "LONG", 1.5), review_array()],
        ),
        (
            "google/gemini-3.0-pro",
            vec![pitch_json("TLT", "SHORT", -1.0), review_array()],
        ),
        (
            "anthropic/claude-opus-4.5",
            vec![
                pitch_json("GLD", "LONG", 0.5),
                review_array(),
                decision.to_string(),
            ],
        ),
        (
            "x-ai/grok-4.1",
            vec![pitch_json("QQQ", "SHORT", -2.0), review_array()],
        ),
    ]);

    let instruments: BTreeMap<String, InstrumentQuote> = ["SPY", "TLT", "GLD", "QQQ"]
        .iter()
        .map(|t| {
            (
                t.to_string(),
                InstrumentQuote {
                    price: 100.0,
                    ohlcv: vec![],
                },
            )
        })
        .collect();
    let account_equity = ["A1", "A2", "A3", "A4", "COUNCIL"]
        .iter()
        .map(|a| (a.to_string(), 100_000.0))
        .collect();
    let snapshot = Arc::new(MarketSnapshot {
        asof: Utc::now(),
        instruments,
        account_equity,
    });

    let mut accounts: Vec<AccountId> = cfg.pm_roster.iter().map(|r| r.account_id.clone()).collect();
    accounts.push(cfg.council_account.clone());
    let brokers = Arc::new(BrokerSet::paper_for(
        accounts,
        PaperBrokerConfig {
            base_latency_ms: 0,
            latency_jitter_ms: 0,
            reject_prob: 0.0,
            seed: Some(7),
        },
    ));

    let store = EventStore::in_memory().unwrap();
    let manager = JobManager::new(
        PipelineDeps {
            config: cfg,
            llm,
            search: Arc::new(QuietFeed),
            brokers,
        },
        store.clone(),
        Arc::new(StaticSnapshotSource(snapshot)),
    );
    (manager, store)
}

async fn wait_terminal(manager: &JobManager, job_id: uuid::Uuid) -> councilbot_backend::JobSnapshot {
    for _ in 0..500 {
        let snap = manager.status(job_id).expect("job exists");
        if snap.status.is_terminal() {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached a terminal state");
}

#[tokio::test]
async fn full_mode_cycle_lands_every_artifact() {
    let (manager, store) = council_setup();
    let job_id = manager
        .create(
            Mode::Full,
            JobInputs {
                week_id: Some(week()),
                user_query: Some("rates and gold".into()),
            },
        )
        .unwrap();

    let snap = wait_terminal(&manager, job_id).await;
    assert_eq!(snap.status, JobStatus::Complete, "error: {:?}", snap.error);

    // Artifact trail: 4 pitches, 12 reviews, 1 decision, 5 submissions
    // (4 PM accounts + the council account).
    assert_eq!(store.list(week(), Some(EventType::PmPitch)).unwrap().len(), 4);
    assert_eq!(
        store.list(week(), Some(EventType::PeerReview)).unwrap().len(),
        12
    );
    assert_eq!(
        store
            .list(week(), Some(EventType::ChairmanDecision))
            .unwrap()
            .len(),
        1
    );
    let submitted = store
        .list(week(), Some(EventType::ExecutionResult))
        .unwrap();
    assert_eq!(submitted.len(), 5);

    // Event ids are strictly increasing over the whole week.
    let all = store.list(week(), None).unwrap();
    assert!(all.windows(2).all(|w| w[0].event_id < w[1].event_id));

    // Causal order per stage: started before artifacts before
    // completed.
    let started_id = all
        .iter()
        .find(|e| {
            e.event_type == EventType::StageStarted && e.payload["stage"] == "pm_pitch"
        })
        .unwrap()
        .event_id;
    let completed_id = all
        .iter()
        .find(|e| {
            e.event_type == EventType::StageCompleted && e.payload["stage"] == "pm_pitch"
        })
        .unwrap()
        .event_id;
    for pitch_event in store.list(week(), Some(EventType::PmPitch)).unwrap() {
        assert!(pitch_event.event_id > started_id);
        assert!(pitch_event.event_id < completed_id);
    }
}

#[tokio::test]
async fn duplicate_week_job_is_refused() {
    let (manager, _store) = council_setup();
    let first = manager
        .create(
            Mode::Ranking,
            JobInputs {
                week_id: Some(week()),
                user_query: None,
            },
        )
        .unwrap();
    // Immediately after create the first job is pending/running, so a
    // second job for the same week must be refused.
    let second = manager.create(
        Mode::Ranking,
        JobInputs {
            week_id: Some(week()),
            user_query: None,
        },
    );
    assert!(second.is_err());
    wait_terminal(&manager, first).await;
}
