//! Core value objects for the weekly council cycle.
//!
//! Everything here is a plain serde value: stages pass these through
//! the context, the event store persists them as JSON payloads, and
//! tests build them literally. Timestamps are UTC; the business
//! calendar (week anchoring) runs in US/Eastern.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use chrono_tz::US::Eastern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// WeekId
// ---------------------------------------------------------------------------

/// The Wednesday (US/Eastern) anchoring a weekly cycle. Partition key
/// for every persisted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekId(NaiveDate);

impl WeekId {
    /// Snap an instant back to the most recent Wednesday in market time
    /// (Wednesday itself included).
    pub fn anchor(now: DateTime<Utc>) -> Self {
        let mut d = now.with_timezone(&Eastern).date_naive();
        while d.weekday() != Weekday::Wed {
            d = d.pred_opt().expect("date underflow");
        }
        WeekId(d)
    }

    /// Wrap an explicit anchor date. Rejects non-Wednesdays.
    pub fn from_date(d: NaiveDate) -> Option<Self> {
        (d.weekday() == Weekday::Wed).then_some(WeekId(d))
    }

    pub fn as_date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for WeekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl std::str::FromStr for WeekId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|e| format!("invalid week id '{s}': {e}"))?;
        WeekId::from_date(d).ok_or_else(|| format!("week id '{s}' is not a Wednesday"))
    }
}

// ---------------------------------------------------------------------------
// AccountId / Instrument
// ---------------------------------------------------------------------------

/// Brokerage sub-account identifier. The configured roster binds each
/// account to exactly one role for the week.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ticker drawn from the closed tradable universe. Construction
/// normalizes case; membership is enforced by the validator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(ticker: impl AsRef<str>) -> Self {
        Instrument(ticker.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Direction / RiskProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Flat => "FLAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            "FLAT" => Some(Direction::Flat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskProfile {
    Tight,
    Base,
    Wide,
}

impl RiskProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Tight => "TIGHT",
            RiskProfile::Base => "BASE",
            RiskProfile::Wide => "WIDE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TIGHT" => Some(RiskProfile::Tight),
            "BASE" => Some(RiskProfile::Base),
            "WIDE" => Some(RiskProfile::Wide),
            _ => None,
        }
    }
}

/// Stop/take-profit percentages bound to a risk profile. Only the
/// three configured triples are legal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskProfileTable {
    pub tight: RiskLimits,
    pub base: RiskLimits,
    pub wide: RiskLimits,
}

impl RiskProfileTable {
    pub fn limits_for(&self, profile: RiskProfile) -> RiskLimits {
        match profile {
            RiskProfile::Tight => self.tight,
            RiskProfile::Base => self.base,
            RiskProfile::Wide => self.wide,
        }
    }
}

impl Default for RiskProfileTable {
    fn default() -> Self {
        Self {
            tight: RiskLimits {
                stop_loss_pct: 1.0,
                take_profit_pct: 2.0,
            },
            base: RiskLimits {
                stop_loss_pct: 2.5,
                take_profit_pct: 5.0,
            },
            wide: RiskLimits {
                stop_loss_pct: 5.0,
                take_profit_pct: 10.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Entry / exit policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    /// Market-on-open.
    #[serde(rename = "MOO", alias = "moo")]
    Moo,
    #[serde(rename = "limit", alias = "LIMIT")]
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPolicy {
    pub mode: EntryMode,
    /// Required iff `mode == Limit`.
    #[serde(default)]
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MacroEvent {
    Nfp,
    Cpi,
    Fomc,
}

fn default_time_stop_days() -> u32 {
    7
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPolicy {
    #[serde(default = "default_time_stop_days")]
    pub time_stop_days: u32,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub exit_before_events: Vec<MacroEvent>,
}

// ---------------------------------------------------------------------------
// PMPitch
// ---------------------------------------------------------------------------

/// A single trade pitch from one PM model, enriched with identity and
/// timing after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PMPitch {
    pub pitch_id: Uuid,
    pub week_id: WeekId,
    pub asof: DateTime<Utc>,
    pub pm_model: String,
    pub account_id: AccountId,
    pub instrument: Instrument,
    pub direction: Direction,
    pub horizon: String,
    /// Signed conviction in [-2, 2]; magnitude maps to sizing.
    pub conviction: f64,
    pub thesis_bullets: Vec<String>,
    pub risk_profile: RiskProfile,
    pub entry_policy: EntryPolicy,
    pub exit_policy: ExitPolicy,
    pub risk_notes: String,
}

/// A pitch with PM identity stripped for peer review. Reviewers only
/// ever see these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizedPitch {
    pub label: String,
    pub instrument: Instrument,
    pub direction: Direction,
    pub horizon: String,
    pub conviction: f64,
    pub thesis_bullets: Vec<String>,
    pub risk_profile: RiskProfile,
    pub entry_policy: EntryPolicy,
    pub exit_policy: ExitPolicy,
    pub risk_notes: String,
}

// ---------------------------------------------------------------------------
// PeerReview
// ---------------------------------------------------------------------------

/// The seven scored dimensions, each an integer in [1, 10].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewScores {
    pub clarity: i64,
    pub edge_plausibility: i64,
    pub timing_catalyst: i64,
    pub risk_definition: i64,
    pub indicator_integrity: i64,
    pub originality: i64,
    pub tradeability: i64,
}

impl ReviewScores {
    pub fn all(&self) -> [i64; 7] {
        [
            self.clarity,
            self.edge_plausibility,
            self.timing_catalyst,
            self.risk_definition,
            self.indicator_integrity,
            self.originality,
            self.tradeability,
        ]
    }

    pub fn mean(&self) -> f64 {
        self.all().iter().sum::<i64>() as f64 / 7.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReview {
    pub review_id: Uuid,
    pub week_id: WeekId,
    pub reviewer_model: String,
    pub target_label: String,
    pub scores: ReviewScores,
    pub best_argument_against: String,
    pub one_flip_condition: String,
    pub suggested_fix: String,
    /// True when the reviewer returned a bare object where the contract
    /// asks for an array.
    #[serde(default)]
    pub degraded_shape: bool,
}

// ---------------------------------------------------------------------------
// ChairmanDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedTrade {
    pub instrument: Instrument,
    pub direction: Direction,
    pub horizon: String,
    pub risk_profile: RiskProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChairmanDecision {
    pub decision_id: Uuid,
    pub week_id: WeekId,
    pub selected_trade: SelectedTrade,
    pub conviction: f64,
    pub rationale: String,
    pub dissent_summary: Vec<String>,
    pub monitoring_plan: String,
}

// ---------------------------------------------------------------------------
// ResearchPack / MarketSentiment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackStatus {
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPack {
    pub week_id: WeekId,
    pub asof: DateTime<Utc>,
    pub source: String,
    pub natural_language: String,
    pub macro_regime: String,
    pub top_narratives: Vec<String>,
    pub tradable_candidates: Vec<String>,
    pub event_calendar: Vec<String>,
    pub confidence_notes: String,
    pub status: PackStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSentiment {
    pub week_id: WeekId,
    pub asof: DateTime<Utc>,
    /// Arithmetic mean of per-instrument scores, in [-1, 1].
    pub overall_score: f64,
    pub per_instrument: BTreeMap<String, f64>,
    pub sources: Vec<String>,
    /// True when the sentiment feed failed and this object is a
    /// placeholder the pipeline carried forward.
    #[serde(default)]
    pub degraded: bool,
}

impl MarketSentiment {
    pub fn degraded_placeholder(week_id: WeekId, asof: DateTime<Utc>) -> Self {
        Self {
            week_id,
            asof,
            overall_score: 0.0,
            per_instrument: BTreeMap::new(),
            sources: Vec::new(),
            degraded: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Order / ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

fn default_tif() -> String {
    "day".to_string()
}

/// A bracket-order description: entry plus attached take-profit and
/// stop-loss prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub account_id: AccountId,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
    pub order_type: OrderType,
    #[serde(default = "default_tif")]
    pub time_in_force: String,
    #[serde(default)]
    pub limit_price: Option<f64>,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Submitted,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub trade_id: Uuid,
    pub account_id: AccountId,
    pub status: ExecStatus,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ResearchPack,
    MarketSentiment,
    PmPitch,
    PeerReview,
    ReviewCoverage,
    ChairmanDecision,
    ExecutionResult,
    ExecutionError,
    ExecutionSkipped,
    StageStarted,
    StageCompleted,
    StageFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ResearchPack => "research_pack",
            EventType::MarketSentiment => "market_sentiment",
            EventType::PmPitch => "pm_pitch",
            EventType::PeerReview => "peer_review",
            EventType::ReviewCoverage => "review_coverage",
            EventType::ChairmanDecision => "chairman_decision",
            EventType::ExecutionResult => "execution_result",
            EventType::ExecutionError => "execution_error",
            EventType::ExecutionSkipped => "execution_skipped",
            EventType::StageStarted => "stage_started",
            EventType::StageCompleted => "stage_completed",
            EventType::StageFailed => "stage_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "research_pack" => Some(EventType::ResearchPack),
            "market_sentiment" => Some(EventType::MarketSentiment),
            "pm_pitch" => Some(EventType::PmPitch),
            "peer_review" => Some(EventType::PeerReview),
            "review_coverage" => Some(EventType::ReviewCoverage),
            "chairman_decision" => Some(EventType::ChairmanDecision),
            "execution_result" => Some(EventType::ExecutionResult),
            "execution_error" => Some(EventType::ExecutionError),
            "execution_skipped" => Some(EventType::ExecutionSkipped),
            "stage_started" => Some(EventType::StageStarted),
            "stage_completed" => Some(EventType::StageCompleted),
            "stage_failed" => Some(EventType::StageFailed),
            _ => None,
        }
    }
}

/// Append-only record as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub week_id: WeekId,
    pub account_id: Option<AccountId>,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// An event about to be appended (id and timestamp assigned by the store).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub week_id: WeekId,
    pub account_id: Option<AccountId>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn week_anchor_snaps_back_to_wednesday() {
        // 2026-07-31 is a Friday; the anchor is Wednesday 2026-07-29.
        let friday = Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap();
        let wk = WeekId::anchor(friday);
        assert_eq!(wk.to_string(), "2026-07-29");
        assert_eq!(wk.as_date().weekday(), Weekday::Wed);
    }

    #[test]
    fn week_anchor_keeps_wednesday() {
        // Wednesday noon Eastern stays on the same date.
        let wed = Utc.with_ymd_and_hms(2026, 7, 29, 16, 0, 0).unwrap();
        assert_eq!(WeekId::anchor(wed).to_string(), "2026-07-29");
    }

    #[test]
    fn week_anchor_respects_market_timezone() {
        // 01:00 UTC Thursday is still Wednesday evening in New York.
        let utc_thursday = Utc.with_ymd_and_hms(2026, 7, 30, 1, 0, 0).unwrap();
        assert_eq!(WeekId::anchor(utc_thursday).to_string(), "2026-07-29");
    }

    #[test]
    fn week_id_parse_rejects_non_wednesday() {
        assert!("2026-07-29".parse::<WeekId>().is_ok());
        assert!("2026-07-30".parse::<WeekId>().is_err());
        assert!("garbage".parse::<WeekId>().is_err());
    }

    #[test]
    fn direction_parse_is_case_insensitive() {
        assert_eq!(Direction::parse("long"), Some(Direction::Long));
        assert_eq!(Direction::parse(" SHORT "), Some(Direction::Short));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn risk_table_default_triples() {
        let table = RiskProfileTable::default();
        let base = table.limits_for(RiskProfile::Base);
        assert_eq!(base.stop_loss_pct, 2.5);
        assert_eq!(base.take_profit_pct, 5.0);
    }

    #[test]
    fn entry_mode_accepts_wire_literals() {
        let moo: EntryMode = serde_json::from_str("\"MOO\"").unwrap();
        assert_eq!(moo, EntryMode::Moo);
        let limit: EntryMode = serde_json::from_str("\"limit\"").unwrap();
        assert_eq!(limit, EntryMode::Limit);
    }

    #[test]
    fn event_type_round_trips() {
        for ty in [
            EventType::ResearchPack,
            EventType::PmPitch,
            EventType::StageFailed,
            EventType::ExecutionSkipped,
        ] {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn review_scores_mean() {
        let scores = ReviewScores {
            clarity: 7,
            edge_plausibility: 7,
            timing_catalyst: 7,
            risk_definition: 7,
            indicator_integrity: 7,
            originality: 7,
            tradeability: 7,
        };
        assert!((scores.mean() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn instrument_normalizes_case() {
        assert_eq!(Instrument::new(" spy ").as_str(), "SPY");
    }
}
