//! Per-stage output contracts: schema and semantic validation.
//!
//! Draft structs mirror what a model is asked to return, every field
//! optional so that a half-formed reply still deserializes and we can
//! name exactly what is wrong. Validators are pure and return the
//! full issue list; the rendered issues feed the repair prompt
//! verbatim.

use crate::config::Config;
use crate::models::{
    AccountId, Direction, EntryMode, EntryPolicy, ExitPolicy, Instrument, MacroEvent, PMPitch,
    ReviewScores, RiskProfile, SelectedTrade, WeekId,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationIssue {
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("field '{field}' out of range: {detail}")]
    OutOfRange { field: String, detail: String },
    #[error("field '{field}' has illegal value: {detail}")]
    EnumViolation { field: String, detail: String },
    #[error("banned keyword '{keyword}' in '{field}'")]
    BannedKeyword { field: String, keyword: String },
    #[error("exit policy does not match risk profile: {0}")]
    RiskProfileMismatch(String),
    #[error("direction FLAT requires conviction 0, got {0}")]
    FlatConvictionMismatch(f64),
    #[error("instrument '{0}' is outside the tradable universe")]
    UnknownInstrument(String),
}

/// Render an issue list the way the repair prompt wants it.
pub fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Case-insensitive substring scan for banned indicator keywords.
pub fn banned_hits<'a>(text: &str, banned: &'a [String]) -> Vec<&'a str> {
    let lower = text.to_lowercase();
    banned
        .iter()
        .filter(|kw| lower.contains(kw.as_str()))
        .map(|kw| kw.as_str())
        .collect()
}

// ---------------------------------------------------------------------------
// PM pitch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryPolicyDraft {
    pub mode: Option<String>,
    #[serde(default)]
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExitPolicyDraft {
    #[serde(default)]
    pub time_stop_days: Option<u32>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub exit_before_events: Vec<String>,
}

/// What a PM model is asked to return: a single pitch object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PitchDraft {
    pub instrument: Option<String>,
    pub direction: Option<String>,
    pub horizon: Option<String>,
    pub conviction: Option<f64>,
    #[serde(default)]
    pub thesis_bullets: Vec<String>,
    pub risk_profile: Option<String>,
    pub entry_policy: Option<EntryPolicyDraft>,
    pub exit_policy: Option<ExitPolicyDraft>,
    pub risk_notes: Option<String>,
}

pub fn validate_pm_pitch(draft: &PitchDraft, cfg: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    match &draft.instrument {
        None => issues.push(ValidationIssue::MissingField("instrument".into())),
        Some(raw) => {
            let inst = Instrument::new(raw);
            if !cfg.in_universe(&inst) {
                issues.push(ValidationIssue::UnknownInstrument(inst.as_str().into()));
            }
        }
    }

    let direction = match &draft.direction {
        None => {
            issues.push(ValidationIssue::MissingField("direction".into()));
            None
        }
        Some(raw) => match Direction::parse(raw) {
            Some(d) => Some(d),
            None => {
                issues.push(ValidationIssue::EnumViolation {
                    field: "direction".into(),
                    detail: format!("'{raw}' is not one of LONG, SHORT, FLAT"),
                });
                None
            }
        },
    };

    if draft.horizon.is_none() {
        issues.push(ValidationIssue::MissingField("horizon".into()));
    }

    match draft.conviction {
        None => issues.push(ValidationIssue::MissingField("conviction".into())),
        Some(c) if !(-2.0..=2.0).contains(&c) => issues.push(ValidationIssue::OutOfRange {
            field: "conviction".into(),
            detail: format!("{c} not in [-2, 2]"),
        }),
        Some(c) => {
            if direction == Some(Direction::Flat) && c.abs() > EPS {
                issues.push(ValidationIssue::FlatConvictionMismatch(c));
            }
        }
    }

    if draft.thesis_bullets.len() > 5 {
        issues.push(ValidationIssue::OutOfRange {
            field: "thesis_bullets".into(),
            detail: format!("{} bullets, maximum is 5", draft.thesis_bullets.len()),
        });
    }
    for bullet in &draft.thesis_bullets {
        for kw in banned_hits(bullet, &cfg.banned_keywords) {
            issues.push(ValidationIssue::BannedKeyword {
                field: "thesis_bullets".into(),
                keyword: kw.to_string(),
            });
        }
    }

    match &draft.risk_notes {
        None => issues.push(ValidationIssue::MissingField("risk_notes".into())),
        Some(notes) => {
            for kw in banned_hits(notes, &cfg.banned_keywords) {
                issues.push(ValidationIssue::BannedKeyword {
                    field: "risk_notes".into(),
                    keyword: kw.to_string(),
                });
            }
        }
    }

    let profile = match &draft.risk_profile {
        None => {
            issues.push(ValidationIssue::MissingField("risk_profile".into()));
            None
        }
        Some(raw) => match RiskProfile::parse(raw) {
            Some(p) => Some(p),
            None => {
                issues.push(ValidationIssue::EnumViolation {
                    field: "risk_profile".into(),
                    detail: format!("'{raw}' is not one of TIGHT, BASE, WIDE"),
                });
                None
            }
        },
    };

    match &draft.entry_policy {
        None => issues.push(ValidationIssue::MissingField("entry_policy".into())),
        Some(entry) => match entry.mode.as_deref() {
            None => issues.push(ValidationIssue::MissingField("entry_policy.mode".into())),
            Some(raw) => match parse_entry_mode(raw) {
                None => issues.push(ValidationIssue::EnumViolation {
                    field: "entry_policy.mode".into(),
                    detail: format!("'{raw}' is not one of MOO, limit"),
                }),
                Some(EntryMode::Limit) => match entry.limit_price {
                    None => issues.push(ValidationIssue::MissingField(
                        "entry_policy.limit_price".into(),
                    )),
                    Some(p) if p <= 0.0 => issues.push(ValidationIssue::OutOfRange {
                        field: "entry_policy.limit_price".into(),
                        detail: format!("{p} must be positive"),
                    }),
                    Some(_) => {}
                },
                Some(EntryMode::Moo) => {
                    if entry.limit_price.is_some() {
                        issues.push(ValidationIssue::EnumViolation {
                            field: "entry_policy.limit_price".into(),
                            detail: "must be null when mode is MOO".into(),
                        });
                    }
                }
            },
        },
    }

    match &draft.exit_policy {
        None => issues.push(ValidationIssue::MissingField("exit_policy".into())),
        Some(exit) => {
            if let Some(profile) = profile {
                let limits = cfg.risk_profiles.limits_for(profile);
                match exit.stop_loss_pct {
                    Some(sl) if (sl - limits.stop_loss_pct).abs() < EPS => {}
                    Some(sl) => issues.push(ValidationIssue::RiskProfileMismatch(format!(
                        "stop_loss_pct {sl} != {} required by {}",
                        limits.stop_loss_pct,
                        profile.as_str()
                    ))),
                    None => issues.push(ValidationIssue::RiskProfileMismatch(format!(
                        "stop_loss_pct missing, {} requires {}",
                        profile.as_str(),
                        limits.stop_loss_pct
                    ))),
                }
                match exit.take_profit_pct {
                    Some(tp) if (tp - limits.take_profit_pct).abs() < EPS => {}
                    Some(tp) => issues.push(ValidationIssue::RiskProfileMismatch(format!(
                        "take_profit_pct {tp} != {} required by {}",
                        limits.take_profit_pct,
                        profile.as_str()
                    ))),
                    None => issues.push(ValidationIssue::RiskProfileMismatch(format!(
                        "take_profit_pct missing, {} requires {}",
                        profile.as_str(),
                        limits.take_profit_pct
                    ))),
                }
            }
            for ev in &exit.exit_before_events {
                if parse_macro_event(ev).is_none() {
                    issues.push(ValidationIssue::EnumViolation {
                        field: "exit_policy.exit_before_events".into(),
                        detail: format!("'{ev}' is not one of NFP, CPI, FOMC"),
                    });
                }
            }
        }
    }

    issues
}

fn parse_entry_mode(raw: &str) -> Option<EntryMode> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "MOO" => Some(EntryMode::Moo),
        "LIMIT" => Some(EntryMode::Limit),
        _ => None,
    }
}

fn parse_macro_event(raw: &str) -> Option<MacroEvent> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "NFP" => Some(MacroEvent::Nfp),
        "CPI" => Some(MacroEvent::Cpi),
        "FOMC" => Some(MacroEvent::Fomc),
        _ => None,
    }
}

impl PitchDraft {
    /// Build the enriched pitch. Call only after `validate_pm_pitch`
    /// returned no issues; a draft that still has holes yields None.
    pub fn finalize(
        &self,
        week_id: WeekId,
        asof: DateTime<Utc>,
        pm_model: &str,
        account_id: &AccountId,
    ) -> Option<PMPitch> {
        let entry = self.entry_policy.as_ref()?;
        let exit = self.exit_policy.as_ref()?;
        Some(PMPitch {
            pitch_id: Uuid::new_v4(),
            week_id,
            asof,
            pm_model: pm_model.to_string(),
            account_id: account_id.clone(),
            instrument: Instrument::new(self.instrument.as_deref()?),
            direction: Direction::parse(self.direction.as_deref()?)?,
            horizon: self.horizon.clone()?,
            conviction: self.conviction?,
            thesis_bullets: self.thesis_bullets.clone(),
            risk_profile: RiskProfile::parse(self.risk_profile.as_deref()?)?,
            entry_policy: EntryPolicy {
                mode: parse_entry_mode(entry.mode.as_deref()?)?,
                limit_price: entry.limit_price,
            },
            exit_policy: ExitPolicy {
                time_stop_days: exit.time_stop_days.unwrap_or(7),
                stop_loss_pct: exit.stop_loss_pct,
                take_profit_pct: exit.take_profit_pct,
                exit_before_events: exit
                    .exit_before_events
                    .iter()
                    .filter_map(|e| parse_macro_event(e))
                    .collect(),
            },
            risk_notes: self.risk_notes.clone()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Peer review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoresDraft {
    pub clarity: Option<f64>,
    pub edge_plausibility: Option<f64>,
    pub timing_catalyst: Option<f64>,
    pub risk_definition: Option<f64>,
    pub indicator_integrity: Option<f64>,
    pub originality: Option<f64>,
    pub tradeability: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewDraft {
    pub target_label: Option<String>,
    pub scores: Option<ScoresDraft>,
    pub best_argument_against: Option<String>,
    pub one_flip_condition: Option<String>,
    pub suggested_fix: Option<String>,
}

pub fn validate_peer_review(draft: &ReviewDraft) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if draft.target_label.is_none() {
        issues.push(ValidationIssue::MissingField("target_label".into()));
    }
    match &draft.scores {
        None => issues.push(ValidationIssue::MissingField("scores".into())),
        Some(scores) => {
            check_score(&mut issues, "scores.clarity", scores.clarity);
            check_score(&mut issues, "scores.edge_plausibility", scores.edge_plausibility);
            check_score(&mut issues, "scores.timing_catalyst", scores.timing_catalyst);
            check_score(&mut issues, "scores.risk_definition", scores.risk_definition);
            check_score(
                &mut issues,
                "scores.indicator_integrity",
                scores.indicator_integrity,
            );
            check_score(&mut issues, "scores.originality", scores.originality);
            check_score(&mut issues, "scores.tradeability", scores.tradeability);
        }
    }
    if draft.best_argument_against.is_none() {
        issues.push(ValidationIssue::MissingField("best_argument_against".into()));
    }
    if draft.one_flip_condition.is_none() {
        issues.push(ValidationIssue::MissingField("one_flip_condition".into()));
    }
    if draft.suggested_fix.is_none() {
        issues.push(ValidationIssue::MissingField("suggested_fix".into()));
    }

    issues
}

fn check_score(issues: &mut Vec<ValidationIssue>, field: &str, value: Option<f64>) {
    match value {
        None => issues.push(ValidationIssue::MissingField(field.into())),
        Some(v) if v.fract().abs() > EPS => issues.push(ValidationIssue::OutOfRange {
            field: field.into(),
            detail: format!("{v} must be an integer"),
        }),
        Some(v) if !(1.0..=10.0).contains(&v) => issues.push(ValidationIssue::OutOfRange {
            field: field.into(),
            detail: format!("{v} not in [1, 10]"),
        }),
        Some(_) => {}
    }
}

impl ReviewDraft {
    /// Call only after `validate_peer_review` returned no issues.
    pub fn finalize_scores(&self) -> Option<ReviewScores> {
        let s = self.scores.as_ref()?;
        Some(ReviewScores {
            clarity: s.clarity? as i64,
            edge_plausibility: s.edge_plausibility? as i64,
            timing_catalyst: s.timing_catalyst? as i64,
            risk_definition: s.risk_definition? as i64,
            indicator_integrity: s.indicator_integrity? as i64,
            originality: s.originality? as i64,
            tradeability: s.tradeability? as i64,
        })
    }
}

// ---------------------------------------------------------------------------
// Chairman decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectedTradeDraft {
    pub instrument: Option<String>,
    pub direction: Option<String>,
    pub horizon: Option<String>,
    pub risk_profile: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionDraft {
    pub selected_trade: Option<SelectedTradeDraft>,
    pub conviction: Option<f64>,
    pub rationale: Option<String>,
    #[serde(default)]
    pub dissent_summary: Vec<String>,
    pub monitoring_plan: Option<String>,
}

pub fn validate_chairman_decision(draft: &DecisionDraft, cfg: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut direction = None;
    match &draft.selected_trade {
        None => issues.push(ValidationIssue::MissingField("selected_trade".into())),
        Some(trade) => {
            match &trade.instrument {
                None => issues.push(ValidationIssue::MissingField(
                    "selected_trade.instrument".into(),
                )),
                Some(raw) => {
                    let inst = Instrument::new(raw);
                    if !cfg.in_universe(&inst) {
                        issues.push(ValidationIssue::UnknownInstrument(inst.as_str().into()));
                    }
                }
            }
            match trade.direction.as_deref() {
                None => issues.push(ValidationIssue::MissingField(
                    "selected_trade.direction".into(),
                )),
                Some(raw) => match Direction::parse(raw) {
                    Some(d) => direction = Some(d),
                    None => issues.push(ValidationIssue::EnumViolation {
                        field: "selected_trade.direction".into(),
                        detail: format!("'{raw}' is not one of LONG, SHORT, FLAT"),
                    }),
                },
            }
            if trade.horizon.is_none() {
                issues.push(ValidationIssue::MissingField("selected_trade.horizon".into()));
            }
            match trade.risk_profile.as_deref() {
                None => issues.push(ValidationIssue::MissingField(
                    "selected_trade.risk_profile".into(),
                )),
                Some(raw) => {
                    if RiskProfile::parse(raw).is_none() {
                        issues.push(ValidationIssue::EnumViolation {
                            field: "selected_trade.risk_profile".into(),
                            detail: format!("'{raw}' is not one of TIGHT, BASE, WIDE"),
                        });
                    }
                }
            }
        }
    }

    match draft.conviction {
        None => issues.push(ValidationIssue::MissingField("conviction".into())),
        Some(c) if !(-2.0..=2.0).contains(&c) => issues.push(ValidationIssue::OutOfRange {
            field: "conviction".into(),
            detail: format!("{c} not in [-2, 2]"),
        }),
        Some(c) => {
            if direction == Some(Direction::Flat) && c.abs() > EPS {
                issues.push(ValidationIssue::FlatConvictionMismatch(c));
            }
        }
    }

    if draft.rationale.is_none() {
        issues.push(ValidationIssue::MissingField("rationale".into()));
    }
    if draft.monitoring_plan.is_none() {
        issues.push(ValidationIssue::MissingField("monitoring_plan".into()));
    }

    issues
}

impl DecisionDraft {
    /// Call only after `validate_chairman_decision` returned no issues.
    pub fn finalize(&self, week_id: WeekId) -> Option<crate::models::ChairmanDecision> {
        let trade = self.selected_trade.as_ref()?;
        Some(crate::models::ChairmanDecision {
            decision_id: Uuid::new_v4(),
            week_id,
            selected_trade: SelectedTrade {
                instrument: Instrument::new(trade.instrument.as_deref()?),
                direction: Direction::parse(trade.direction.as_deref()?)?,
                horizon: trade.horizon.clone()?,
                risk_profile: RiskProfile::parse(trade.risk_profile.as_deref()?)?,
            },
            conviction: self.conviction?,
            rationale: self.rationale.clone()?,
            dissent_summary: self.dissent_summary.clone(),
            monitoring_plan: self.monitoring_plan.clone()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Research pack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResearchPackDraft {
    pub natural_language: Option<String>,
    pub macro_regime: Option<String>,
    #[serde(default)]
    pub top_narratives: Vec<String>,
    #[serde(default)]
    pub tradable_candidates: Vec<String>,
    #[serde(default)]
    pub event_calendar: Vec<String>,
    pub confidence_notes: Option<String>,
}

pub fn validate_research_pack(draft: &ResearchPackDraft, cfg: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if draft.macro_regime.is_none() {
        issues.push(ValidationIssue::MissingField("macro_regime".into()));
    }
    if draft.natural_language.is_none() {
        issues.push(ValidationIssue::MissingField("natural_language".into()));
    }
    for raw in &draft.tradable_candidates {
        let inst = Instrument::new(raw);
        if !cfg.in_universe(&inst) {
            issues.push(ValidationIssue::UnknownInstrument(inst.as_str().into()));
        }
    }

    issues
}
