//! Frozen weekly market snapshot.
//!
//! The external data fetcher writes one snapshot per week; everything
//! downstream (research prompts, execution pricing, sizing) reads this
//! frozen copy and never refetches mid-cycle.

use crate::models::{AccountId, Instrument};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentQuote {
    pub price: f64,
    /// Trailing daily bars (about 30), oldest first.
    #[serde(default)]
    pub ohlcv: Vec<OhlcvBar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub asof: DateTime<Utc>,
    pub instruments: BTreeMap<String, InstrumentQuote>,
    pub account_equity: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read market snapshot {:?}", path.as_ref()))?;
        serde_json::from_str(&raw).context("parse market snapshot json")
    }

    pub fn price_of(&self, instrument: &Instrument) -> Option<f64> {
        self.instruments.get(instrument.as_str()).map(|q| q.price)
    }

    pub fn equity_of(&self, account: &AccountId) -> Option<f64> {
        self.account_equity.get(account.as_str()).copied()
    }

    /// Compact text rendering for prompts: last price and trailing
    /// move per instrument.
    pub fn prompt_digest(&self, universe: &[Instrument]) -> String {
        let mut lines = Vec::with_capacity(universe.len());
        for inst in universe {
            let Some(quote) = self.instruments.get(inst.as_str()) else {
                continue;
            };
            let trail = match (quote.ohlcv.first(), quote.ohlcv.last()) {
                (Some(first), Some(last)) if first.close > 0.0 => {
                    let pct = (last.close / first.close - 1.0) * 100.0;
                    format!(" ({:+.1}% over {} sessions)", pct, quote.ohlcv.len())
                }
                _ => String::new(),
            };
            lines.push(format!("{}: {:.2}{}", inst, quote.price, trail));
        }
        lines.join("\n")
    }
}

/// Read-only accessor handed to the job manager. Implementations must
/// return the same frozen snapshot for the whole week.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<Arc<MarketSnapshot>>;
}

/// Loads the weekly snapshot file once and serves the cached copy.
pub struct FileSnapshotSource {
    path: PathBuf,
    cached: Mutex<Option<Arc<MarketSnapshot>>>,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn snapshot(&self) -> Result<Arc<MarketSnapshot>> {
        let mut cached = self.cached.lock();
        if let Some(snap) = cached.as_ref() {
            return Ok(snap.clone());
        }
        let snap = Arc::new(MarketSnapshot::from_json_file(&self.path)?);
        *cached = Some(snap.clone());
        Ok(snap)
    }
}

/// Fixed in-memory source for tests and dry runs.
pub struct StaticSnapshotSource(pub Arc<MarketSnapshot>);

impl SnapshotSource for StaticSnapshotSource {
    fn snapshot(&self) -> Result<Arc<MarketSnapshot>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub fn snapshot_with(prices: &[(&str, f64)], equity: &[(&str, f64)]) -> MarketSnapshot {
        MarketSnapshot {
            asof: Utc::now(),
            instruments: prices
                .iter()
                .map(|(t, p)| {
                    (
                        t.to_string(),
                        InstrumentQuote {
                            price: *p,
                            ohlcv: vec![],
                        },
                    )
                })
                .collect(),
            account_equity: equity.iter().map(|(a, e)| (a.to_string(), *e)).collect(),
        }
    }

    #[test]
    fn price_and_equity_lookups() {
        let snap = snapshot_with(&[("SPY", 100.0)], &[("A1", 100_000.0)]);
        assert_eq!(snap.price_of(&Instrument::new("spy")), Some(100.0));
        assert_eq!(snap.price_of(&Instrument::new("TLT")), None);
        assert_eq!(snap.equity_of(&AccountId::new("A1")), Some(100_000.0));
    }

    #[test]
    fn file_source_loads_once_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let snap = snapshot_with(&[("GLD", 200.0)], &[]);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(serde_json::to_string(&snap).unwrap().as_bytes())
            .unwrap();

        let source = FileSnapshotSource::new(&path);
        let first = source.snapshot().unwrap();
        // Delete the file; the cached copy must keep serving.
        std::fs::remove_file(&path).unwrap();
        let second = source.snapshot().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.price_of(&Instrument::new("GLD")), Some(200.0));
    }

    #[test]
    fn prompt_digest_reports_trailing_move() {
        let mut snap = snapshot_with(&[("SPY", 110.0)], &[]);
        snap.instruments.get_mut("SPY").unwrap().ohlcv = vec![
            OhlcvBar {
                date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0e6,
            },
            OhlcvBar {
                date: NaiveDate::from_ymd_opt(2026, 7, 2).unwrap(),
                open: 100.0,
                high: 111.0,
                low: 100.0,
                close: 110.0,
                volume: 1.1e6,
            },
        ];
        let digest = snap.prompt_digest(&[Instrument::new("SPY"), Instrument::new("QQQ")]);
        assert!(digest.contains("SPY: 110.00"));
        assert!(digest.contains("+10.0%"));
        assert!(!digest.contains("QQQ"));
    }
}
