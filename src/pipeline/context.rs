//! Immutable typed context threaded through pipeline stages.
//!
//! A write returns a new `Context`; the old one stays valid and both
//! share the untouched values through `Arc`. Any number of tasks may
//! read a context concurrently; nobody ever mutates one in place.

use crate::council::anonymizer::LabelMap;
use crate::market::MarketSnapshot;
use crate::models::{
    ChairmanDecision, ExecutionResult, MarketSentiment, PMPitch, PeerReview, ResearchPack, WeekId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Closed set of context slots. Stages declare which of these they
/// require and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    UserQuery,
    MarketSnapshot,
    Sentiment,
    ResearchPacks,
    PmPitches,
    AnonLabelMap,
    PeerReviews,
    ChairmanDecision,
    ExecutionResults,
    JobId,
    WeekId,
    DegradedSources,
}

impl ContextKey {
    pub fn name(&self) -> &'static str {
        match self {
            ContextKey::UserQuery => "user_query",
            ContextKey::MarketSnapshot => "market_snapshot",
            ContextKey::Sentiment => "sentiment",
            ContextKey::ResearchPacks => "research_packs",
            ContextKey::PmPitches => "pm_pitches",
            ContextKey::AnonLabelMap => "anon_label_map",
            ContextKey::PeerReviews => "peer_reviews",
            ContextKey::ChairmanDecision => "chairman_decision",
            ContextKey::ExecutionResults => "execution_results",
            ContextKey::JobId => "job_id",
            ContextKey::WeekId => "week_id",
            ContextKey::DegradedSources => "degraded_sources",
        }
    }
}

/// Typed payloads, one variant per key family. Heavier values sit
/// behind `Arc` so copies of the context stay cheap.
#[derive(Debug, Clone)]
pub enum ContextValue {
    UserQuery(Arc<String>),
    Snapshot(Arc<MarketSnapshot>),
    Sentiment(Arc<MarketSentiment>),
    ResearchPacks(Arc<BTreeMap<String, ResearchPack>>),
    Pitches(Arc<Vec<PMPitch>>),
    LabelMap(Arc<LabelMap>),
    Reviews(Arc<Vec<PeerReview>>),
    Decision(Arc<ChairmanDecision>),
    Executions(Arc<Vec<ExecutionResult>>),
    JobId(Uuid),
    Week(WeekId),
    Degraded(Arc<BTreeSet<String>>),
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    entries: Arc<BTreeMap<ContextKey, ContextValue>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: ContextKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.entries.get(&key)
    }

    /// Copy-on-write insert: returns a new context, leaves `self` untouched.
    pub fn with(&self, key: ContextKey, value: ContextValue) -> Context {
        let mut entries = (*self.entries).clone();
        entries.insert(key, value);
        Context {
            entries: Arc::new(entries),
        }
    }

    /// Record that an advisory source failed, without disturbing any
    /// other slot.
    pub fn mark_degraded(&self, source: &str) -> Context {
        let mut set = match self.get(ContextKey::DegradedSources) {
            Some(ContextValue::Degraded(s)) => (**s).clone(),
            _ => BTreeSet::new(),
        };
        set.insert(source.to_string());
        self.with(ContextKey::DegradedSources, ContextValue::Degraded(Arc::new(set)))
    }

    pub fn is_degraded(&self, source: &str) -> bool {
        matches!(
            self.get(ContextKey::DegradedSources),
            Some(ContextValue::Degraded(set)) if set.contains(source)
        )
    }

    // -- typed accessors ----------------------------------------------------

    pub fn user_query(&self) -> Option<&str> {
        match self.get(ContextKey::UserQuery) {
            Some(ContextValue::UserQuery(q)) => Some(q.as_str()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<MarketSnapshot>> {
        match self.get(ContextKey::MarketSnapshot) {
            Some(ContextValue::Snapshot(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn sentiment(&self) -> Option<Arc<MarketSentiment>> {
        match self.get(ContextKey::Sentiment) {
            Some(ContextValue::Sentiment(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn research_packs(&self) -> Option<Arc<BTreeMap<String, ResearchPack>>> {
        match self.get(ContextKey::ResearchPacks) {
            Some(ContextValue::ResearchPacks(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn pitches(&self) -> Option<Arc<Vec<PMPitch>>> {
        match self.get(ContextKey::PmPitches) {
            Some(ContextValue::Pitches(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn label_map(&self) -> Option<Arc<LabelMap>> {
        match self.get(ContextKey::AnonLabelMap) {
            Some(ContextValue::LabelMap(m)) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn reviews(&self) -> Option<Arc<Vec<PeerReview>>> {
        match self.get(ContextKey::PeerReviews) {
            Some(ContextValue::Reviews(r)) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn decision(&self) -> Option<Arc<ChairmanDecision>> {
        match self.get(ContextKey::ChairmanDecision) {
            Some(ContextValue::Decision(d)) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn executions(&self) -> Option<Arc<Vec<ExecutionResult>>> {
        match self.get(ContextKey::ExecutionResults) {
            Some(ContextValue::Executions(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self.get(ContextKey::JobId) {
            Some(ContextValue::JobId(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn week(&self) -> Option<WeekId> {
        match self.get(ContextKey::WeekId) {
            Some(ContextValue::Week(w)) => Some(*w),
            _ => None,
        }
    }
}
