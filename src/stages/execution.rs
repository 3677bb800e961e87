//! Execution stage: conviction-sized bracket orders fanned out to the
//! per-account broker clients. Accounts are isolated: one broker's
//! failure never cancels another's dispatch, and per-trade errors are
//! never pipeline-fatal.

use crate::brokers::BrokerSet;
use crate::config::{Config, Mode};
use crate::error::CouncilError;
use crate::models::{
    AccountId, Direction, EntryMode, EventType, ExecStatus, ExecutionResult, Instrument, Order,
    OrderSide, OrderType, RiskLimits,
};
use crate::pipeline::context::{Context, ContextKey, ContextValue};
use crate::pipeline::stage::{ProviderPhase, Stage, StageServices};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

const STAGE_NAME: &str = "execution";

/// Monotone step mapping |conviction| -> fraction of account equity.
pub fn size_factor(conviction_abs: f64) -> f64 {
    if conviction_abs >= 1.5 {
        0.20
    } else if conviction_abs >= 1.0 {
        0.10
    } else if conviction_abs > 0.0 {
        0.05
    } else {
        0.0
    }
}

/// One trade to place, normalized from either a PM pitch or the
/// chairman decision.
#[derive(Debug, Clone)]
struct TradeIntent {
    account_id: AccountId,
    instrument: Instrument,
    direction: Direction,
    conviction: f64,
    entry_mode: EntryMode,
    limit_price: Option<f64>,
    limits: RiskLimits,
}

pub struct ExecutionStage {
    mode: Mode,
    cfg: Arc<Config>,
    brokers: Arc<BrokerSet>,
}

impl ExecutionStage {
    pub fn new(mode: Mode, cfg: Arc<Config>, brokers: Arc<BrokerSet>) -> Self {
        Self { mode, cfg, brokers }
    }

    fn intents(&self, ctx: &Context) -> Result<Vec<TradeIntent>, CouncilError> {
        let pitches = ctx.pitches().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "pm_pitches",
        })?;

        let mut intents: Vec<TradeIntent> = pitches
            .iter()
            .map(|p| TradeIntent {
                account_id: p.account_id.clone(),
                instrument: p.instrument.clone(),
                direction: p.direction,
                conviction: p.conviction,
                entry_mode: p.entry_policy.mode,
                limit_price: p.entry_policy.limit_price,
                limits: RiskLimits {
                    stop_loss_pct: p
                        .exit_policy
                        .stop_loss_pct
                        .unwrap_or_else(|| self.cfg.risk_profiles.limits_for(p.risk_profile).stop_loss_pct),
                    take_profit_pct: p.exit_policy.take_profit_pct.unwrap_or_else(|| {
                        self.cfg.risk_profiles.limits_for(p.risk_profile).take_profit_pct
                    }),
                },
            })
            .collect();

        // In full mode the designated council account also executes
        // the chairman's decision. Cross-account conflicts are allowed.
        if self.mode == Mode::Full {
            let decision = ctx.decision().ok_or(CouncilError::Precondition {
                stage: STAGE_NAME,
                key: "chairman_decision",
            })?;
            intents.push(TradeIntent {
                account_id: self.cfg.council_account.clone(),
                instrument: decision.selected_trade.instrument.clone(),
                direction: decision.selected_trade.direction,
                conviction: decision.conviction,
                entry_mode: EntryMode::Moo,
                limit_price: None,
                limits: self
                    .cfg
                    .risk_profiles
                    .limits_for(decision.selected_trade.risk_profile),
            });
        }
        Ok(intents)
    }
}

/// Either an order ready for dispatch or a result decided locally.
enum Prepared {
    Dispatch(Order),
    Decided(ExecutionResult),
}

fn prepare(
    intent: &TradeIntent,
    snapshot: &crate::market::MarketSnapshot,
    fallback_equity: f64,
) -> Prepared {
    let trade_id = Uuid::new_v4();
    let skipped = |reason: &str| {
        Prepared::Decided(ExecutionResult {
            trade_id,
            account_id: intent.account_id.clone(),
            status: ExecStatus::Skipped,
            order_id: None,
            message: Some(reason.to_string()),
        })
    };

    if intent.direction == Direction::Flat {
        return skipped("flat");
    }

    let Some(price) = snapshot.price_of(&intent.instrument) else {
        return Prepared::Decided(ExecutionResult {
            trade_id,
            account_id: intent.account_id.clone(),
            status: ExecStatus::Error,
            order_id: None,
            message: Some(format!("no snapshot price for {}", intent.instrument)),
        });
    };

    let equity = snapshot
        .equity_of(&intent.account_id)
        .unwrap_or(fallback_equity);
    let target_notional = equity * size_factor(intent.conviction.abs());
    let qty = (target_notional / price).floor() as u64;
    if qty == 0 {
        return skipped("qty_zero");
    }

    let entry = match intent.entry_mode {
        EntryMode::Limit => intent.limit_price.unwrap_or(price),
        EntryMode::Moo => price,
    };
    let (take_profit_price, stop_loss_price) = match intent.direction {
        Direction::Long => (
            entry * (1.0 + intent.limits.take_profit_pct / 100.0),
            entry * (1.0 - intent.limits.stop_loss_pct / 100.0),
        ),
        Direction::Short => (
            entry * (1.0 - intent.limits.take_profit_pct / 100.0),
            entry * (1.0 + intent.limits.stop_loss_pct / 100.0),
        ),
        Direction::Flat => unreachable!("flat handled above"),
    };

    Prepared::Dispatch(Order {
        account_id: intent.account_id.clone(),
        symbol: intent.instrument.as_str().to_string(),
        side: match intent.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
            Direction::Flat => unreachable!(),
        },
        qty,
        order_type: match intent.entry_mode {
            EntryMode::Limit => OrderType::Limit,
            EntryMode::Moo => OrderType::Market,
        },
        time_in_force: "day".to_string(),
        limit_price: intent.limit_price,
        take_profit_price,
        stop_loss_price,
    })
}

#[async_trait::async_trait]
impl Stage for ExecutionStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn inputs(&self) -> &'static [ContextKey] {
        match self.mode {
            Mode::Full => &[
                ContextKey::PmPitches,
                ContextKey::MarketSnapshot,
                ContextKey::ChairmanDecision,
            ],
            _ => &[ContextKey::PmPitches, ContextKey::MarketSnapshot],
        }
    }

    fn outputs(&self) -> &'static [ContextKey] {
        &[ContextKey::ExecutionResults]
    }

    async fn run(&self, ctx: Context, svc: &StageServices) -> Result<Context, CouncilError> {
        svc.ensure_not_cancelled()?;
        let week_id = ctx.week().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "week_id",
        })?;
        let snapshot = ctx.snapshot().ok_or(CouncilError::Precondition {
            stage: STAGE_NAME,
            key: "market_snapshot",
        })?;

        let intents = self.intents(&ctx)?;
        let total = intents.len();
        let sem = Arc::new(Semaphore::new(self.cfg.concurrency.broker_cap.max(1)));

        // Prepare locally, then dispatch all ready orders concurrently.
        // Results keep intent order regardless of completion order.
        let mut slots: Vec<Option<(ExecutionResult, Option<Order>)>> = Vec::new();
        let mut dispatches = Vec::new();
        for (i, intent) in intents.iter().enumerate() {
            match prepare(intent, &snapshot, self.cfg.fallback_equity) {
                Prepared::Decided(result) => slots.push(Some((result, None))),
                Prepared::Dispatch(order) => {
                    slots.push(None);
                    dispatches.push((i, order));
                }
            }
        }

        svc.ensure_not_cancelled()?;
        let mut handles = Vec::with_capacity(dispatches.len());
        for (i, order) in dispatches {
            let broker = self.brokers.get(&order.account_id);
            let sem = sem.clone();
            let timeout = self.cfg.timeouts.broker_call;
            let progress = svc.progress.clone();
            handles.push(tokio::spawn(async move {
                let trade_id = Uuid::new_v4();
                let account = order.account_id.clone();
                let _permit = sem.acquire_owned().await;
                progress.provider(
                    STAGE_NAME,
                    account.as_str(),
                    ProviderPhase::Started,
                    0,
                    "submitting bracket",
                );

                let Some(broker) = broker else {
                    progress.provider(
                        STAGE_NAME,
                        account.as_str(),
                        ProviderPhase::Failed,
                        100,
                        "no broker bound",
                    );
                    return (
                        i,
                        ExecutionResult {
                            trade_id,
                            account_id: account,
                            status: ExecStatus::Error,
                            order_id: None,
                            message: Some("no broker bound to account".into()),
                        },
                        order,
                    );
                };

                let outcome = tokio::time::timeout(timeout, broker.place_bracket(&order)).await;
                let result = match outcome {
                    Ok(Ok(ack)) => {
                        progress.provider(
                            STAGE_NAME,
                            account.as_str(),
                            ProviderPhase::Completed,
                            100,
                            "submitted",
                        );
                        ExecutionResult {
                            trade_id,
                            account_id: account,
                            status: ExecStatus::Submitted,
                            order_id: Some(ack.order_id),
                            message: None,
                        }
                    }
                    Ok(Err(e)) => {
                        progress.provider(
                            STAGE_NAME,
                            account.as_str(),
                            ProviderPhase::Failed,
                            100,
                            e.to_string(),
                        );
                        ExecutionResult {
                            trade_id,
                            account_id: account,
                            status: ExecStatus::Error,
                            order_id: None,
                            message: Some(e.to_string()),
                        }
                    }
                    Err(_) => {
                        progress.provider(
                            STAGE_NAME,
                            account.as_str(),
                            ProviderPhase::Failed,
                            100,
                            "broker call timed out",
                        );
                        ExecutionResult {
                            trade_id,
                            account_id: account,
                            status: ExecStatus::Error,
                            order_id: None,
                            message: Some("broker call timed out".into()),
                        }
                    }
                };
                (i, result, order)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((i, result, order)) => slots[i] = Some((result, Some(order))),
                Err(e) => {
                    return Err(CouncilError::PartialProviderFailure {
                        stage: STAGE_NAME,
                        detail: format!("broker dispatch task failed: {e}"),
                    })
                }
            }
        }

        // A cancellation observed now means: report nothing further.
        svc.ensure_not_cancelled()?;

        let mut results = Vec::with_capacity(total);
        for slot in slots {
            let (result, order) = slot.ok_or_else(|| CouncilError::PartialProviderFailure {
                stage: STAGE_NAME,
                detail: "missing dispatch result".into(),
            })?;

            let event_type = match result.status {
                ExecStatus::Submitted => EventType::ExecutionResult,
                ExecStatus::Skipped => EventType::ExecutionSkipped,
                ExecStatus::Error => EventType::ExecutionError,
            };
            let mut payload = serde_json::to_value(&result)
                .map_err(|e| CouncilError::Persistence(e.to_string()))?;
            if let Some(order) = &order {
                payload["order"] = serde_json::to_value(order)
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
            }
            svc.append_event(
                week_id,
                Some(result.account_id.clone()),
                event_type,
                payload,
            )?;

            match result.status {
                ExecStatus::Submitted => info!(
                    account = %result.account_id,
                    order_id = result.order_id.as_deref().unwrap_or(""),
                    "order submitted"
                ),
                _ => warn!(
                    account = %result.account_id,
                    status = ?result.status,
                    message = result.message.as_deref().unwrap_or(""),
                    "trade not submitted"
                ),
            }
            results.push(result);
        }

        Ok(ctx.with(
            ContextKey::ExecutionResults,
            ContextValue::Executions(Arc::new(results)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{BrokerAck, BrokerClient, BrokerError};
    use crate::market::{InstrumentQuote, MarketSnapshot};
    use crate::models::{
        ChairmanDecision, EntryPolicy, ExitPolicy, PMPitch, RiskProfile, SelectedTrade, WeekId,
    };
    use crate::pipeline::stage::ProgressSink;
    use crate::store::EventStore;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn wk() -> WeekId {
        "2026-07-29".parse().unwrap()
    }

    struct CountingBroker {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingBroker {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl BrokerClient for CountingBroker {
        async fn place_bracket(&self, order: &Order) -> Result<BrokerAck, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BrokerError::Transport("gateway unreachable".into()));
            }
            Ok(BrokerAck {
                order_id: format!("brk:{}:{}", order.account_id, order.symbol),
                accepted_at: Utc::now(),
            })
        }
    }

    fn pitch(seq: u128, model: &str, account: &str, inst: &str, dir: Direction, conviction: f64) -> PMPitch {
        PMPitch {
            pitch_id: Uuid::from_u128(seq),
            week_id: wk(),
            asof: Utc::now(),
            pm_model: model.to_string(),
            account_id: AccountId::new(account),
            instrument: Instrument::new(inst),
            direction: dir,
            horizon: "1w".into(),
            conviction,
            thesis_bullets: vec!["flows".into()],
            risk_profile: RiskProfile::Base,
            entry_policy: EntryPolicy {
                mode: EntryMode::Moo,
                limit_price: None,
            },
            exit_policy: ExitPolicy {
                time_stop_days: 7,
                stop_loss_pct: Some(2.5),
                take_profit_pct: Some(5.0),
                exit_before_events: vec![],
            },
            risk_notes: "gap risk".into(),
        }
    }

    fn snapshot(price: f64) -> MarketSnapshot {
        let instruments: BTreeMap<String, InstrumentQuote> = ["SPY", "TLT", "GLD", "QQQ"]
            .iter()
            .map(|t| {
                (
                    t.to_string(),
                    InstrumentQuote {
                        price,
                        ohlcv: vec![],
                    },
                )
            })
            .collect();
        let account_equity = ["A1", "A2", "A3", "A4", "COUNCIL"]
            .iter()
            .map(|a| (a.to_string(), 100_000.0))
            .collect();
        MarketSnapshot {
            asof: Utc::now(),
            instruments,
            account_equity,
        }
    }

    fn four_pitches() -> Vec<PMPitch> {
        vec![
            pitch(1, "m1", "A1", "SPY", Direction::Long, 1.5),
            pitch(2, "m2", "A2", "TLT", Direction::Short, -1.0),
            pitch(3, "m3", "A3", "GLD", Direction::Long, 0.5),
            pitch(4, "m4", "A4", "QQQ", Direction::Short, -2.0),
        ]
    }

    fn ctx_with(pitches: Vec<PMPitch>, snap: MarketSnapshot) -> Context {
        Context::new()
            .with(ContextKey::WeekId, ContextValue::Week(wk()))
            .with(ContextKey::JobId, ContextValue::JobId(Uuid::new_v4()))
            .with(ContextKey::PmPitches, ContextValue::Pitches(Arc::new(pitches)))
            .with(
                ContextKey::MarketSnapshot,
                ContextValue::Snapshot(Arc::new(snap)),
            )
    }

    fn svc() -> StageServices {
        StageServices {
            store: EventStore::in_memory().unwrap(),
            progress: ProgressSink::disconnected(Uuid::new_v4()),
            cancel: CancellationToken::new(),
        }
    }

    fn set_for(accounts: &[&str], broker: Arc<CountingBroker>) -> Arc<BrokerSet> {
        let mut set = BrokerSet::new();
        for a in accounts {
            set.insert(AccountId::new(*a), broker.clone() as Arc<dyn BrokerClient>);
        }
        Arc::new(set)
    }

    #[test]
    fn size_factor_steps_and_monotonicity() {
        assert_eq!(size_factor(0.0), 0.0);
        assert_eq!(size_factor(0.5), 0.05);
        assert_eq!(size_factor(1.0), 0.10);
        assert_eq!(size_factor(1.49), 0.10);
        assert_eq!(size_factor(1.5), 0.20);
        assert_eq!(size_factor(2.0), 0.20);

        let mut last = 0.0;
        for step in 0..=40 {
            let c = step as f64 * 0.05;
            let f = size_factor(c);
            assert!(f >= last, "size factor must be monotone in |conviction|");
            last = f;
        }
    }

    #[tokio::test]
    async fn four_pitches_submit_with_expected_sides_and_qty() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Ranking,
            Arc::new(Config::default()),
            set_for(&["A1", "A2", "A3", "A4"], broker.clone()),
        );
        let services = svc();
        let out = stage
            .run(ctx_with(four_pitches(), snapshot(100.0)), &services)
            .await
            .unwrap();

        let results = out.executions().unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == ExecStatus::Submitted));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 4);

        // 100k equity, price 100: conviction 1.5 -> 200, 1.0 -> 100,
        // 0.5 -> 50, 2.0 -> 200 shares.
        let events = services
            .store
            .list(wk(), Some(EventType::ExecutionResult))
            .unwrap();
        assert_eq!(events.len(), 4);
        let sides: Vec<_> = events
            .iter()
            .map(|e| e.payload["order"]["side"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(sides, vec!["buy", "sell", "buy", "sell"]);
        let qtys: Vec<_> = events
            .iter()
            .map(|e| e.payload["order"]["qty"].as_u64().unwrap())
            .collect();
        assert_eq!(qtys, vec![200, 100, 50, 200]);
    }

    #[tokio::test]
    async fn bracket_prices_derive_from_risk_profile() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Ranking,
            Arc::new(Config::default()),
            set_for(&["A1"], broker),
        );
        let services = svc();
        let pitches = vec![pitch(1, "m1", "A1", "SPY", Direction::Long, 1.0)];
        stage
            .run(ctx_with(pitches, snapshot(100.0)), &services)
            .await
            .unwrap();

        let ev = &services
            .store
            .list(wk(), Some(EventType::ExecutionResult))
            .unwrap()[0];
        // BASE profile: stop 2.5%, take profit 5% around entry 100.
        assert!((ev.payload["order"]["take_profit_price"].as_f64().unwrap() - 105.0).abs() < 1e-9);
        assert!((ev.payload["order"]["stop_loss_price"].as_f64().unwrap() - 97.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_broker_outage_leaves_other_accounts_untouched() {
        let good = CountingBroker::ok();
        let bad = CountingBroker::failing();
        let mut set = BrokerSet::new();
        for a in ["A1", "A2", "A4"] {
            set.insert(AccountId::new(a), good.clone() as Arc<dyn BrokerClient>);
        }
        set.insert(AccountId::new("A3"), bad as Arc<dyn BrokerClient>);

        let stage = ExecutionStage::new(Mode::Ranking, Arc::new(Config::default()), Arc::new(set));
        let services = svc();
        let out = stage
            .run(ctx_with(four_pitches(), snapshot(100.0)), &services)
            .await
            .unwrap();

        let results = out.executions().unwrap();
        let submitted: Vec<_> = results
            .iter()
            .filter(|r| r.status == ExecStatus::Submitted)
            .map(|r| r.account_id.as_str().to_string())
            .collect();
        assert_eq!(submitted, vec!["A1", "A2", "A4"]);
        let errored: Vec<_> = results
            .iter()
            .filter(|r| r.status == ExecStatus::Error)
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].account_id.as_str(), "A3");

        let error_events = services
            .store
            .list(wk(), Some(EventType::ExecutionError))
            .unwrap();
        assert_eq!(error_events.len(), 1);
        assert_eq!(error_events[0].account_id.as_ref().unwrap().as_str(), "A3");
    }

    #[tokio::test]
    async fn flat_decision_is_skipped_without_broker_calls() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Full,
            Arc::new(Config::default()),
            set_for(&["A1", "COUNCIL"], broker.clone()),
        );
        let decision = ChairmanDecision {
            decision_id: Uuid::new_v4(),
            week_id: wk(),
            selected_trade: SelectedTrade {
                instrument: Instrument::new("SPY"),
                direction: Direction::Flat,
                horizon: "1w".into(),
                risk_profile: RiskProfile::Base,
            },
            conviction: 0.0,
            rationale: "no edge this week".into(),
            dissent_summary: vec![],
            monitoring_plan: "revisit next week".into(),
        };
        let flat_pitch = pitch(1, "m1", "A1", "SPY", Direction::Flat, 0.0);
        let ctx = ctx_with(vec![flat_pitch], snapshot(100.0)).with(
            ContextKey::ChairmanDecision,
            ContextValue::Decision(Arc::new(decision)),
        );

        let services = svc();
        let out = stage.run(ctx, &services).await.unwrap();
        let results = out.executions().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.status == ExecStatus::Skipped && r.message.as_deref() == Some("flat")));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 0);

        let skipped_events = services
            .store
            .list(wk(), Some(EventType::ExecutionSkipped))
            .unwrap();
        assert_eq!(skipped_events.len(), 2);
    }

    #[tokio::test]
    async fn unaffordable_price_skips_with_qty_zero() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Ranking,
            Arc::new(Config::default()),
            set_for(&["A1"], broker.clone()),
        );
        // 5% of 100k = 5k target notional; price 1e6 -> qty 0.
        let pitches = vec![pitch(1, "m1", "A1", "SPY", Direction::Long, 0.5)];
        let out = stage
            .run(ctx_with(pitches, snapshot(1_000_000.0)), &svc())
            .await
            .unwrap();
        let results = out.executions().unwrap();
        assert_eq!(results[0].status, ExecStatus::Skipped);
        assert_eq!(results[0].message.as_deref(), Some("qty_zero"));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_mode_executes_council_account_after_pm_accounts() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Full,
            Arc::new(Config::default()),
            set_for(&["A1", "A2", "A3", "A4", "COUNCIL"], broker.clone()),
        );
        let decision = ChairmanDecision {
            decision_id: Uuid::new_v4(),
            week_id: wk(),
            selected_trade: SelectedTrade {
                instrument: Instrument::new("TLT"),
                direction: Direction::Short,
                horizon: "1w".into(),
                risk_profile: RiskProfile::Tight,
            },
            conviction: -1.5,
            rationale: "supply".into(),
            dissent_summary: vec![],
            monitoring_plan: "auction".into(),
        };
        let ctx = ctx_with(four_pitches(), snapshot(100.0)).with(
            ContextKey::ChairmanDecision,
            ContextValue::Decision(Arc::new(decision)),
        );

        let out = stage.run(ctx, &svc()).await.unwrap();
        let results = out.executions().unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[4].account_id.as_str(), "COUNCIL");
        assert_eq!(results[4].status, ExecStatus::Submitted);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn missing_snapshot_price_is_a_per_trade_error() {
        let broker = CountingBroker::ok();
        let stage = ExecutionStage::new(
            Mode::Ranking,
            Arc::new(Config::default()),
            set_for(&["A1"], broker),
        );
        let mut snap = snapshot(100.0);
        snap.instruments.remove("SPY");
        let pitches = vec![pitch(1, "m1", "A1", "SPY", Direction::Long, 1.0)];
        let out = stage.run(ctx_with(pitches, snap), &svc()).await.unwrap();
        let results = out.executions().unwrap();
        assert_eq!(results[0].status, ExecStatus::Error);
        assert!(results[0].message.as_deref().unwrap().contains("no snapshot price"));
    }
}
