//! Prompt builders for every council stage.
//!
//! Each builder returns (system, user). The system prompt carries the
//! output contract; the user prompt carries the week's material. Long
//! free text is truncated before it reaches a prompt.

use crate::config::Config;
use crate::models::{AnonymizedPitch, MarketSentiment, PMPitch, ResearchPack, RiskProfile};
use std::collections::BTreeMap;

fn clip(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

fn universe_line(cfg: &Config) -> String {
    cfg.universe
        .iter()
        .map(|i| i.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn risk_table_lines(cfg: &Config) -> String {
    [RiskProfile::Tight, RiskProfile::Base, RiskProfile::Wide]
        .iter()
        .map(|p| {
            let limits = cfg.risk_profiles.limits_for(*p);
            format!(
                "- {}: stop_loss_pct={}, take_profit_pct={}",
                p.as_str(),
                limits.stop_loss_pct,
                limits.take_profit_pct
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn sentiment_line(sentiment: Option<&MarketSentiment>) -> String {
    match sentiment {
        Some(s) if !s.degraded => {
            let per = s
                .per_instrument
                .iter()
                .map(|(k, v)| format!("{k}={v:+.2}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("Sentiment overall {:+.2} ({per})", s.overall_score)
        }
        _ => "Sentiment feed unavailable this week.".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Market sentiment
// ---------------------------------------------------------------------------

pub fn sentiment_prompt(
    instrument: &str,
    items: &[crate::llm::SearchItem],
    theme: Option<&str>,
) -> (String, String) {
    let system = "You are a market-news scorer. Read the headlines and return ONLY a JSON \
                  object {\"score\": <number>} where score is in [-1, 1]: -1 maximally \
                  bearish for the instrument, +1 maximally bullish. No extra text."
        .to_string();

    let mut user = String::new();
    if let Some(theme) = theme {
        user.push_str(&format!("Weekly theme: {}\n\n", clip(theme, 200)));
    }
    user.push_str(&format!("Instrument: {instrument}\nRecent items:\n"));
    for item in items {
        user.push_str(&format!(
            "- {} — {}\n",
            clip(&item.title, 160),
            clip(&item.snippet, 240)
        ));
    }
    (system, user)
}

// ---------------------------------------------------------------------------
// Research
// ---------------------------------------------------------------------------

pub fn research_prompt(
    cfg: &Config,
    user_query: &str,
    snapshot_digest: &str,
    sentiment: Option<&MarketSentiment>,
) -> (String, String) {
    let system = format!(
        "You are a macro research analyst preparing a weekly pack for a council of \
         portfolio managers. Tradable universe: {}.\n\
         Return ONLY a JSON object with fields:\n\
         {{\"natural_language\": string, \"macro_regime\": string, \
         \"top_narratives\": [string], \"tradable_candidates\": [ticker], \
         \"event_calendar\": [string], \"confidence_notes\": string}}\n\
         tradable_candidates must come from the universe. No extra text.",
        universe_line(cfg)
    );

    let user = format!(
        "Research question: {}\n\nMarket snapshot:\n{}\n\n{}",
        clip(user_query, 1_000),
        snapshot_digest,
        sentiment_line(sentiment)
    );
    (system, user)
}

// ---------------------------------------------------------------------------
// PM pitch
// ---------------------------------------------------------------------------

pub fn pm_pitch_prompt(
    cfg: &Config,
    user_query: &str,
    packs: &BTreeMap<String, ResearchPack>,
    snapshot_digest: &str,
    sentiment: Option<&MarketSentiment>,
) -> (String, String) {
    let banned = cfg.banned_keywords.join(", ");
    let system = format!(
        "You are a discretionary macro portfolio manager. Produce exactly ONE trade \
         pitch for the coming week.\n\
         Tradable universe: {}.\nRisk profiles:\n{}\n\
         Return ONLY a single JSON object (not an array) with fields:\n\
         {{\"instrument\": ticker, \"direction\": \"LONG\"|\"SHORT\"|\"FLAT\", \
         \"horizon\": string, \"conviction\": number in [-2, 2], \
         \"thesis_bullets\": [string] (max 5), \"risk_profile\": \"TIGHT\"|\"BASE\"|\"WIDE\", \
         \"entry_policy\": {{\"mode\": \"MOO\"|\"limit\", \"limit_price\": number|null}}, \
         \"exit_policy\": {{\"time_stop_days\": 7, \"stop_loss_pct\": number, \
         \"take_profit_pct\": number, \"exit_before_events\": [\"NFP\"|\"CPI\"|\"FOMC\"]}}, \
         \"risk_notes\": string}}\n\
         Rules:\n\
         - stop_loss_pct and take_profit_pct must equal your chosen risk profile's values.\n\
         - direction FLAT requires conviction 0.\n\
         - Do not mention technical indicators ({banned}); argue from macro, flows and \
         positioning.\n\
         - No extra text.",
        universe_line(cfg),
        risk_table_lines(cfg)
    );

    let mut user = format!("Weekly question: {}\n\n", clip(user_query, 1_000));
    for (source, pack) in packs {
        user.push_str(&format!(
            "Research pack [{source}] — regime: {}\nNarratives: {}\nCandidates: {}\n{}\n\n",
            clip(&pack.macro_regime, 200),
            pack.top_narratives
                .iter()
                .map(|n| clip(n, 160))
                .collect::<Vec<_>>()
                .join("; "),
            pack.tradable_candidates.join(", "),
            clip(&pack.natural_language, 2_000)
        ));
    }
    user.push_str(&format!(
        "Market snapshot:\n{}\n\n{}",
        snapshot_digest,
        sentiment_line(sentiment)
    ));
    (system, user)
}

// ---------------------------------------------------------------------------
// Peer review
// ---------------------------------------------------------------------------

pub fn peer_review_prompt(
    reviewer_label: &str,
    others: &[&AnonymizedPitch],
) -> (String, String) {
    let system = format!(
        "You are a portfolio manager reviewing {} anonymized pitches from peers. \
         Score each pitch on seven dimensions, integers 1-10.\n\
         Return ONLY a JSON array with one object per pitch:\n\
         [{{\"target_label\": string, \"scores\": {{\"clarity\": int, \
         \"edge_plausibility\": int, \"timing_catalyst\": int, \"risk_definition\": int, \
         \"indicator_integrity\": int, \"originality\": int, \"tradeability\": int}}, \
         \"best_argument_against\": string, \"one_flip_condition\": string, \
         \"suggested_fix\": string}}]\n\
         Review every listed pitch exactly once. Do not review your own pitch \
         ({reviewer_label}). No extra text.",
        others.len()
    );

    let mut user = String::from("Pitches under review:\n\n");
    for pitch in others {
        user.push_str(&format!(
            "{}: {} {} ({}), conviction {:+.1}, risk {}\nThesis: {}\nRisk notes: {}\n\n",
            pitch.label,
            pitch.direction.as_str(),
            pitch.instrument,
            clip(&pitch.horizon, 40),
            pitch.conviction,
            pitch.risk_profile.as_str(),
            pitch
                .thesis_bullets
                .iter()
                .map(|b| clip(b, 200))
                .collect::<Vec<_>>()
                .join(" | "),
            clip(&pitch.risk_notes, 300)
        ));
    }
    (system, user)
}

// ---------------------------------------------------------------------------
// Chairman
// ---------------------------------------------------------------------------

pub fn chairman_prompt(
    cfg: &Config,
    pitches: &[PMPitch],
    mean_scores: &BTreeMap<String, f64>,
    arguments_against: &BTreeMap<String, Vec<String>>,
) -> (String, String) {
    let system = format!(
        "You chair a weekly investment council. Synthesize the pitches and their peer \
         reviews into ONE decision. Tradable universe: {}.\n\
         Return ONLY a JSON object:\n\
         {{\"selected_trade\": {{\"instrument\": ticker, \"direction\": \
         \"LONG\"|\"SHORT\"|\"FLAT\", \"horizon\": string, \"risk_profile\": \
         \"TIGHT\"|\"BASE\"|\"WIDE\"}}, \"conviction\": number in [-2, 2], \
         \"rationale\": string, \"dissent_summary\": [string], \
         \"monitoring_plan\": string}}\n\
         direction FLAT requires conviction 0. No extra text.",
        universe_line(cfg)
    );

    let mut user = String::from("Council pitches with mean peer scores:\n\n");
    for pitch in pitches {
        let label_scores = mean_scores
            .get(&pitch.pm_model)
            .map(|m| format!("{m:.1}"))
            .unwrap_or_else(|| "unreviewed".to_string());
        user.push_str(&format!(
            "[{}] {} {} conviction {:+.1}, mean peer score {}\nThesis: {}\n",
            pitch.pm_model,
            pitch.direction.as_str(),
            pitch.instrument,
            pitch.conviction,
            label_scores,
            pitch
                .thesis_bullets
                .iter()
                .map(|b| clip(b, 200))
                .collect::<Vec<_>>()
                .join(" | ")
        ));
        if let Some(args) = arguments_against.get(&pitch.pm_model) {
            for arg in args {
                user.push_str(&format!("Against: {}\n", clip(arg, 240)));
            }
        }
        user.push('\n');
    }
    (system, user)
}
