//! Stable anonymization of pitches for peer review.
//!
//! Labels are assigned "Pitch A", "Pitch B", ... by ascending
//! `pitch_id`, giving a bijection that is deterministic for a given
//! pitch set. The label map stays in process memory (and the context);
//! it is never serialized into reviewer prompts or persisted review
//! payloads.

use crate::models::{AccountId, AnonymizedPitch, PMPitch};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identity behind one label. Only de-anonymization code sees this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub pitch_id: Uuid,
    pub pm_model: String,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    by_label: BTreeMap<String, LabelEntry>,
}

impl LabelMap {
    pub fn deanonymize(&self, label: &str) -> Option<&LabelEntry> {
        self.by_label.get(label)
    }

    pub fn label_for_model(&self, pm_model: &str) -> Option<&str> {
        self.by_label
            .iter()
            .find(|(_, entry)| entry.pm_model == pm_model)
            .map(|(label, _)| label.as_str())
    }

    pub fn label_for_pitch(&self, pitch_id: &Uuid) -> Option<&str> {
        self.by_label
            .iter()
            .find(|(_, entry)| entry.pitch_id == *pitch_id)
            .map(|(label, _)| label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.by_label.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }
}

/// Spreadsheet-style letter sequence: A..Z, AA, AB, ...
fn letter_label(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii label")
}

/// Assign labels by ascending pitch id and strip PM identity.
pub fn anonymize(pitches: &[PMPitch]) -> (Vec<AnonymizedPitch>, LabelMap) {
    let mut ordered: Vec<&PMPitch> = pitches.iter().collect();
    ordered.sort_by_key(|p| p.pitch_id);

    let mut anon = Vec::with_capacity(ordered.len());
    let mut map = LabelMap::default();
    for (i, pitch) in ordered.iter().enumerate() {
        let label = format!("Pitch {}", letter_label(i));
        map.by_label.insert(
            label.clone(),
            LabelEntry {
                pitch_id: pitch.pitch_id,
                pm_model: pitch.pm_model.clone(),
                account_id: pitch.account_id.clone(),
            },
        );
        anon.push(AnonymizedPitch {
            label,
            instrument: pitch.instrument.clone(),
            direction: pitch.direction,
            horizon: pitch.horizon.clone(),
            conviction: pitch.conviction,
            thesis_bullets: pitch.thesis_bullets.clone(),
            risk_profile: pitch.risk_profile,
            entry_policy: pitch.entry_policy.clone(),
            exit_policy: pitch.exit_policy.clone(),
            risk_notes: pitch.risk_notes.clone(),
        });
    }
    (anon, map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Direction, EntryMode, EntryPolicy, ExitPolicy, Instrument, RiskProfile, WeekId,
    };
    use chrono::Utc;

    fn pitch(model: &str, account: &str) -> PMPitch {
        PMPitch {
            pitch_id: Uuid::new_v4(),
            week_id: "2026-07-29".parse::<WeekId>().unwrap(),
            asof: Utc::now(),
            pm_model: model.to_string(),
            account_id: AccountId::new(account),
            instrument: Instrument::new("SPY"),
            direction: Direction::Long,
            horizon: "1w".to_string(),
            conviction: 1.0,
            thesis_bullets: vec!["breadth improving".to_string()],
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
            risk_notes: "crowded positioning".to_string(),
        }
    }

    #[test]
    fn labels_follow_pitch_id_order() {
        let pitches = vec![pitch("m1", "A1"), pitch("m2", "A2"), pitch("m3", "A3")];
        let (anon, map) = anonymize(&pitches);

        assert_eq!(anon.len(), 3);
        let labels: Vec<_> = anon.iter().map(|p| p.label.clone()).collect();
        assert_eq!(labels, vec!["Pitch A", "Pitch B", "Pitch C"]);

        // Labels are assigned to pitches sorted by id, independent of
        // input order.
        let mut sorted = pitches.clone();
        sorted.sort_by_key(|p| p.pitch_id);
        for (i, p) in sorted.iter().enumerate() {
            let entry = map.deanonymize(&format!("Pitch {}", letter_label(i))).unwrap();
            assert_eq!(entry.pitch_id, p.pitch_id);
            assert_eq!(entry.pm_model, p.pm_model);
        }
    }

    #[test]
    fn map_is_a_bijection() {
        let pitches = vec![
            pitch("m1", "A1"),
            pitch("m2", "A2"),
            pitch("m3", "A3"),
            pitch("m4", "A4"),
        ];
        let (_, map) = anonymize(&pitches);
        assert_eq!(map.len(), 4);

        let mut seen = std::collections::BTreeSet::new();
        for label in map.labels() {
            let entry = map.deanonymize(label).unwrap();
            assert!(seen.insert(entry.account_id.clone()), "duplicate account");
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn anonymized_pitch_carries_no_identity() {
        let pitches = vec![pitch("m1", "A1"), pitch("m2", "A2")];
        let (anon, _) = anonymize(&pitches);
        let raw = serde_json::to_string(&anon).unwrap();
        assert!(!raw.contains("m1"));
        assert!(!raw.contains("A1"));
        assert!(!raw.contains("pm_model"));
        assert!(!raw.contains("account_id"));
    }

    #[test]
    fn label_sequence_extends_past_z() {
        assert_eq!(letter_label(0), "A");
        assert_eq!(letter_label(25), "Z");
        assert_eq!(letter_label(26), "AA");
        assert_eq!(letter_label(27), "AB");
    }

    #[test]
    fn label_for_model_inverts() {
        let pitches = vec![pitch("m1", "A1"), pitch("m2", "A2")];
        let (_, map) = anonymize(&pitches);
        let label = map.label_for_model("m2").unwrap();
        assert_eq!(map.deanonymize(label).unwrap().pm_model, "m2");
        assert!(map.label_for_model("nobody").is_none());
    }
}
