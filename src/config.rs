//! Process configuration, loaded once from the environment.
//!
//! Everything has a code default so a paper run works out of the box;
//! env vars override individual knobs. Lists are comma-separated, the
//! PM roster uses `model_id:account_id` pairs.

use crate::error::CouncilError;
use crate::models::{AccountId, Instrument, RiskProfileTable};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Pipeline composition selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ChatOnly,
    Ranking,
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ChatOnly => "chat_only",
            Mode::Ranking => "ranking",
            Mode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat_only" => Some(Mode::ChatOnly),
            "ranking" => Some(Mode::Ranking),
            "full" => Some(Mode::Full),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Roster / knob groups
// ---------------------------------------------------------------------------

/// One PM model bound to one brokerage sub-account for the week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub model_id: String,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Temperatures {
    pub market_sentiment: f64,
    pub research: f64,
    pub pm_pitch: f64,
    pub peer_review: f64,
    pub chairman: f64,
}

impl Default for Temperatures {
    fn default() -> Self {
        Self {
            market_sentiment: 0.3,
            research: 0.2,
            pm_pitch: 0.7,
            peer_review: 0.1,
            chairman: 0.4,
        }
    }
}

/// Per-call and wall-clock deadlines. Research calls run long (deep
/// research agents); chat-sized calls run in seconds.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub sentiment_call: Duration,
    pub research_call: Duration,
    pub pm_call: Duration,
    pub review_call: Duration,
    pub chairman_call: Duration,
    pub broker_call: Duration,
    pub stage_wall_clock: Duration,
    pub job_wall_clock: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sentiment_call: Duration::from_secs(30),
            research_call: Duration::from_secs(600),
            pm_call: Duration::from_secs(120),
            review_call: Duration::from_secs(90),
            chairman_call: Duration::from_secs(120),
            broker_call: Duration::from_secs(15),
            stage_wall_clock: Duration::from_secs(1800),
            job_wall_clock: Duration::from_secs(5400),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Concurrency {
    /// Cap on concurrent LLM calls inside one fan-out. 0 = roster size.
    pub llm_cap: usize,
    /// Cap on concurrent broker dispatches.
    pub broker_cap: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            llm_cap: 0,
            broker_cap: 4,
        }
    }
}

pub const DEFAULT_BANNED_KEYWORDS: &[&str] = &[
    "rsi",
    "macd",
    "ema",
    "sma",
    "bollinger",
    "stochastic",
    "moving average",
];

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub pm_roster: Vec<RosterEntry>,
    pub chairman_model: String,
    pub council_account: AccountId,
    pub research_sources: Vec<String>,
    pub sentiment_model: String,
    pub universe: Vec<Instrument>,
    pub risk_profiles: RiskProfileTable,
    pub temperatures: Temperatures,
    pub timeouts: Timeouts,
    pub concurrency: Concurrency,
    /// Lower-cased, matched as case-insensitive substrings.
    pub banned_keywords: Vec<String>,
    pub db_path: String,
    pub snapshot_path: String,
    /// Equity assumed for an account the snapshot has no figure for.
    pub fallback_equity: f64,
    pub job_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Full,
            pm_roster: vec![
                roster_entry("openai/gpt-5.2", "A1"),
                roster_entry("google/gemini-3.0-pro", "A2"),
                roster_entry("anthropic/claude-opus-4.5", "A3"),
                roster_entry("x-ai/grok-4.1", "A4"),
            ],
            chairman_model: "anthropic/claude-opus-4.5".to_string(),
            council_account: AccountId::new("COUNCIL"),
            research_sources: vec!["openai/gpt-5.2-deep-research".to_string()],
            sentiment_model: "google/gemini-3.0-flash".to_string(),
            universe: ["SPY", "QQQ", "IWM", "TLT", "GLD", "USO", "UUP", "HYG"]
                .iter()
                .map(Instrument::new)
                .collect(),
            risk_profiles: RiskProfileTable::default(),
            temperatures: Temperatures::default(),
            timeouts: Timeouts::default(),
            concurrency: Concurrency::default(),
            banned_keywords: DEFAULT_BANNED_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            db_path: "./councilbot.db".to_string(),
            snapshot_path: "./snapshot.json".to_string(),
            fallback_equity: 100_000.0,
            job_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

fn roster_entry(model: &str, account: &str) -> RosterEntry {
    RosterEntry {
        model_id: model.to_string(),
        account_id: AccountId::new(account),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut cfg = Config::default();

        if let Ok(v) = env::var("COUNCIL_MODE") {
            cfg.mode = Mode::parse(&v)
                .ok_or_else(|| anyhow::anyhow!("COUNCIL_MODE invalid: {v}"))?;
        }

        if let Ok(v) = env::var("COUNCIL_PM_ROSTER") {
            cfg.pm_roster = parse_roster(&v)?;
        }
        if let Ok(v) = env::var("COUNCIL_CHAIRMAN_MODEL") {
            cfg.chairman_model = v.trim().to_string();
        }
        if let Ok(v) = env::var("COUNCIL_COUNCIL_ACCOUNT") {
            cfg.council_account = AccountId::new(v);
        }
        if let Ok(v) = env::var("COUNCIL_RESEARCH_SOURCES") {
            cfg.research_sources = csv(&v);
        }
        if let Ok(v) = env::var("COUNCIL_SENTIMENT_MODEL") {
            cfg.sentiment_model = v.trim().to_string();
        }
        if let Ok(v) = env::var("COUNCIL_UNIVERSE") {
            cfg.universe = csv(&v).iter().map(Instrument::new).collect();
        }
        if let Ok(v) = env::var("COUNCIL_BANNED_KEYWORDS") {
            cfg.banned_keywords = csv(&v)
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect();
        }
        if let Ok(v) = env::var("COUNCIL_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("COUNCIL_SNAPSHOT_PATH") {
            cfg.snapshot_path = v;
        }

        cfg.fallback_equity = env_f64("COUNCIL_FALLBACK_EQUITY", cfg.fallback_equity);
        cfg.temperatures.market_sentiment =
            env_f64("COUNCIL_TEMP_SENTIMENT", cfg.temperatures.market_sentiment);
        cfg.temperatures.research = env_f64("COUNCIL_TEMP_RESEARCH", cfg.temperatures.research);
        cfg.temperatures.pm_pitch = env_f64("COUNCIL_TEMP_PM_PITCH", cfg.temperatures.pm_pitch);
        cfg.temperatures.peer_review =
            env_f64("COUNCIL_TEMP_PEER_REVIEW", cfg.temperatures.peer_review);
        cfg.temperatures.chairman = env_f64("COUNCIL_TEMP_CHAIRMAN", cfg.temperatures.chairman);

        cfg.timeouts.sentiment_call =
            env_secs("COUNCIL_TIMEOUT_SENTIMENT_SEC", cfg.timeouts.sentiment_call);
        cfg.timeouts.research_call =
            env_secs("COUNCIL_TIMEOUT_RESEARCH_SEC", cfg.timeouts.research_call);
        cfg.timeouts.pm_call = env_secs("COUNCIL_TIMEOUT_PM_SEC", cfg.timeouts.pm_call);
        cfg.timeouts.review_call = env_secs("COUNCIL_TIMEOUT_REVIEW_SEC", cfg.timeouts.review_call);
        cfg.timeouts.chairman_call =
            env_secs("COUNCIL_TIMEOUT_CHAIRMAN_SEC", cfg.timeouts.chairman_call);
        cfg.timeouts.broker_call = env_secs("COUNCIL_TIMEOUT_BROKER_SEC", cfg.timeouts.broker_call);
        cfg.timeouts.stage_wall_clock =
            env_secs("COUNCIL_TIMEOUT_STAGE_SEC", cfg.timeouts.stage_wall_clock);
        cfg.timeouts.job_wall_clock =
            env_secs("COUNCIL_TIMEOUT_JOB_SEC", cfg.timeouts.job_wall_clock);

        cfg.concurrency.llm_cap = env_usize("COUNCIL_LLM_CONCURRENCY", cfg.concurrency.llm_cap);
        cfg.concurrency.broker_cap =
            env_usize("COUNCIL_BROKER_CONCURRENCY", cfg.concurrency.broker_cap).max(1);
        cfg.job_ttl = env_secs("COUNCIL_JOB_TTL_SEC", cfg.job_ttl);

        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks a run must not start without.
    pub fn validate(&self) -> Result<(), CouncilError> {
        if self.pm_roster.len() < 2 {
            return Err(CouncilError::Configuration(format!(
                "PM roster needs at least 2 models, got {}",
                self.pm_roster.len()
            )));
        }
        let mut accounts: Vec<&AccountId> =
            self.pm_roster.iter().map(|r| &r.account_id).collect();
        accounts.sort();
        accounts.dedup();
        if accounts.len() != self.pm_roster.len() {
            return Err(CouncilError::Configuration(
                "PM roster binds the same account twice".to_string(),
            ));
        }
        if self
            .pm_roster
            .iter()
            .any(|r| r.account_id == self.council_account)
        {
            return Err(CouncilError::Configuration(format!(
                "council account {} is also bound to a PM",
                self.council_account
            )));
        }
        if self.universe.is_empty() {
            return Err(CouncilError::Configuration(
                "tradable universe is empty".to_string(),
            ));
        }
        if self.research_sources.is_empty() || self.research_sources.len() > 2 {
            return Err(CouncilError::Configuration(format!(
                "research_sources must hold 1 or 2 providers, got {}",
                self.research_sources.len()
            )));
        }
        Ok(())
    }

    /// Effective fan-out cap for LLM calls: configured value or the
    /// roster size when unset.
    pub fn llm_cap(&self) -> usize {
        if self.concurrency.llm_cap == 0 {
            self.pm_roster.len().max(1)
        } else {
            self.concurrency.llm_cap
        }
    }

    pub fn in_universe(&self, instrument: &Instrument) -> bool {
        self.universe.iter().any(|i| i == instrument)
    }

    pub fn roster_entry_for_account(&self, account: &AccountId) -> Option<&RosterEntry> {
        self.pm_roster.iter().find(|r| &r.account_id == account)
    }
}

/// `model_id:account_id,model_id:account_id,...`
fn parse_roster(raw: &str) -> anyhow::Result<Vec<RosterEntry>> {
    let mut roster = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (model, account) = pair
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("roster entry '{pair}' is not model:account"))?;
        roster.push(RosterEntry {
            model_id: model.trim().to_string(),
            account_id: AccountId::new(account),
        });
    }
    Ok(roster)
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn roster_parse_handles_model_ids_with_colons() {
        // Provider-prefixed model ids keep their prefix; only the last
        // colon splits the account off.
        let roster = parse_roster("openai/gpt-5.2:A1, x-ai/grok:beta:A2").unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].model_id, "openai/gpt-5.2");
        assert_eq!(roster[0].account_id.as_str(), "A1");
        assert_eq!(roster[1].model_id, "x-ai/grok:beta");
        assert_eq!(roster[1].account_id.as_str(), "A2");
    }

    #[test]
    fn roster_smaller_than_two_is_rejected() {
        let mut cfg = Config::default();
        cfg.pm_roster.truncate(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_account_is_rejected() {
        let mut cfg = Config::default();
        let dup = cfg.pm_roster[0].account_id.clone();
        cfg.pm_roster[1].account_id = dup;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn council_account_must_not_be_a_pm_account() {
        let mut cfg = Config::default();
        cfg.council_account = cfg.pm_roster[2].account_id.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn llm_cap_defaults_to_roster_size() {
        let cfg = Config::default();
        assert_eq!(cfg.llm_cap(), cfg.pm_roster.len());
        let mut capped = Config::default();
        capped.concurrency.llm_cap = 2;
        assert_eq!(capped.llm_cap(), 2);
    }

    #[test]
    fn universe_membership() {
        let cfg = Config::default();
        assert!(cfg.in_universe(&Instrument::new("spy")));
        assert!(!cfg.in_universe(&Instrument::new("TSLA")));
    }
}
