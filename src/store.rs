//! Append-only event store.
//!
//! Every stage artifact and lifecycle marker lands here as one row,
//! keyed by week and monotonically numbered by SQLite's AUTOINCREMENT
//! rowid. Events are never updated or deleted; this module exposes no
//! UPDATE/DELETE path at all. Appends serialize on the connection
//! mutex; reads see consistent ordering by `event_id`.

use crate::error::CouncilError;
use crate::models::{AccountId, Event, EventType, NewEvent, WeekId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS events (
    event_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    week_id    TEXT NOT NULL,
    account_id TEXT,
    event_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_week ON events(week_id, event_id);
CREATE INDEX IF NOT EXISTS idx_events_week_type ON events(week_id, event_type, event_id);
"#;

#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path.as_ref(), flags)
            .with_context(|| format!("open event store at {:?}", path.as_ref()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("apply event store schema")?;
        debug!(path = ?path.as_ref(), "event store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory event store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("apply event store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one event; returns the assigned monotonic id.
    pub fn append(&self, ev: NewEvent) -> Result<i64, CouncilError> {
        let payload = serde_json::to_string(&ev.payload)
            .map_err(|e| CouncilError::Persistence(format!("serialize payload: {e}")))?;
        let created_at = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (week_id, account_id, event_type, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ev.week_id.to_string(),
                ev.account_id.as_ref().map(|a| a.as_str()),
                ev.event_type.as_str(),
                created_at,
                payload,
            ],
        )
        .map_err(|e| CouncilError::Persistence(format!("insert event: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// All events for a week, optionally narrowed to one type, ordered
    /// by `event_id` ascending.
    pub fn list(
        &self,
        week_id: WeekId,
        event_type: Option<EventType>,
    ) -> Result<Vec<Event>, CouncilError> {
        let conn = self.conn.lock();
        let mut out = Vec::new();

        let mut push_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            match Self::row_to_event(row) {
                Ok(ev) => {
                    out.push(ev);
                    Ok(())
                }
                Err(e) => Err(rusqlite::Error::ToSqlConversionFailure(e.into())),
            }
        };

        match event_type {
            Some(ty) => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT event_id, week_id, account_id, event_type, created_at, payload
                         FROM events WHERE week_id = ?1 AND event_type = ?2
                         ORDER BY event_id ASC",
                    )
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                let mut rows = stmt
                    .query(params![week_id.to_string(), ty.as_str()])
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                while let Some(row) = rows
                    .next()
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?
                {
                    push_row(row).map_err(|e| CouncilError::Persistence(e.to_string()))?;
                }
            }
            None => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT event_id, week_id, account_id, event_type, created_at, payload
                         FROM events WHERE week_id = ?1 ORDER BY event_id ASC",
                    )
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                let mut rows = stmt
                    .query(params![week_id.to_string()])
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?;
                while let Some(row) = rows
                    .next()
                    .map_err(|e| CouncilError::Persistence(e.to_string()))?
                {
                    push_row(row).map_err(|e| CouncilError::Persistence(e.to_string()))?;
                }
            }
        }
        Ok(out)
    }

    /// Most recent event of a type for a week.
    pub fn latest(
        &self,
        week_id: WeekId,
        event_type: EventType,
    ) -> Result<Option<Event>, CouncilError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT event_id, week_id, account_id, event_type, created_at, payload
                 FROM events WHERE week_id = ?1 AND event_type = ?2
                 ORDER BY event_id DESC LIMIT 1",
            )
            .map_err(|e| CouncilError::Persistence(e.to_string()))?;
        let mut rows = stmt
            .query(params![week_id.to_string(), event_type.as_str()])
            .map_err(|e| CouncilError::Persistence(e.to_string()))?;
        match rows
            .next()
            .map_err(|e| CouncilError::Persistence(e.to_string()))?
        {
            Some(row) => Self::row_to_event(row)
                .map(Some)
                .map_err(|e| CouncilError::Persistence(e.to_string())),
            None => Ok(None),
        }
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> anyhow::Result<Event> {
        let event_id: i64 = row.get(0)?;
        let week_raw: String = row.get(1)?;
        let account_raw: Option<String> = row.get(2)?;
        let type_raw: String = row.get(3)?;
        let created_raw: String = row.get(4)?;
        let payload_raw: String = row.get(5)?;

        let week_id: WeekId = week_raw
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("week_id column")?;
        let event_type = EventType::parse(&type_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown event_type '{type_raw}'"))?;
        let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_raw)
            .context("created_at column")?
            .with_timezone(&Utc);
        let payload: serde_json::Value =
            serde_json::from_str(&payload_raw).context("payload column")?;

        Ok(Event {
            event_id,
            week_id,
            account_id: account_raw.map(AccountId::new),
            event_type,
            created_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wk() -> WeekId {
        "2026-07-29".parse().unwrap()
    }

    fn ev(ty: EventType, account: Option<&str>, payload: serde_json::Value) -> NewEvent {
        NewEvent {
            week_id: wk(),
            account_id: account.map(AccountId::new),
            event_type: ty,
            payload,
        }
    }

    #[test]
    fn append_assigns_strictly_increasing_ids() {
        let store = EventStore::in_memory().unwrap();
        let mut last = 0;
        for i in 0..10 {
            let id = store
                .append(ev(EventType::PmPitch, Some("A1"), json!({"i": i})))
                .unwrap();
            assert!(id > last, "event ids must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn list_orders_by_event_id_and_filters_by_type() {
        let store = EventStore::in_memory().unwrap();
        store
            .append(ev(EventType::StageStarted, None, json!({"stage": "research"})))
            .unwrap();
        store
            .append(ev(EventType::PmPitch, Some("A1"), json!({"n": 1})))
            .unwrap();
        store
            .append(ev(EventType::PmPitch, Some("A2"), json!({"n": 2})))
            .unwrap();

        let all = store.list(wk(), None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].event_id < w[1].event_id));

        let pitches = store.list(wk(), Some(EventType::PmPitch)).unwrap();
        assert_eq!(pitches.len(), 2);
        assert_eq!(pitches[0].payload["n"], 1);
        assert_eq!(pitches[1].payload["n"], 2);
    }

    #[test]
    fn latest_returns_last_of_type() {
        let store = EventStore::in_memory().unwrap();
        store
            .append(ev(EventType::ChairmanDecision, None, json!({"v": "old"})))
            .unwrap();
        store
            .append(ev(EventType::ChairmanDecision, None, json!({"v": "new"})))
            .unwrap();

        let latest = store.latest(wk(), EventType::ChairmanDecision).unwrap();
        assert_eq!(latest.unwrap().payload["v"], "new");
        assert!(store.latest(wk(), EventType::PeerReview).unwrap().is_none());
    }

    #[test]
    fn other_weeks_are_not_visible() {
        let store = EventStore::in_memory().unwrap();
        store
            .append(ev(EventType::PmPitch, Some("A1"), json!({})))
            .unwrap();
        let other: WeekId = "2026-08-05".parse().unwrap();
        assert!(store.list(other, None).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let store = EventStore::open(&path).unwrap();
            store
                .append(ev(EventType::MarketSentiment, None, json!({"overall": 0.2})))
                .unwrap();
        }
        let reopened = EventStore::open(&path).unwrap();
        let events = reopened.list(wk(), None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::MarketSentiment);
        assert!(events[0].account_id.is_none());
    }
}
