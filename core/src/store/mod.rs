//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods — they never execute SQL directly.
//!
//! Every status transition is a conditional UPDATE keyed on the previously
//! observed status. The affected-row count is the compare-and-set outcome:
//! 1 means this caller won the transition, 0 means a concurrent actor got
//! there first. Workers on other hosts race through these writes, never
//! through shared memory.

mod captain;
mod offer;
mod ride;
mod task;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{DispatchResult, DispatchError};
use crate::event::{DispatchEvent, EventLogEntry};

pub struct DispatchStore {
    conn: Connection,
}

impl DispatchStore {
    pub fn open(path: &str) -> DispatchResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DispatchResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DispatchResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(
        &self,
        component: &str,
        event: &DispatchEvent,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (subject_id, component, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.subject_id(),
                component,
                event.type_name(),
                serde_json::to_string(event)?,
                ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_subject(&self, subject_id: &str) -> DispatchResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject_id, component, event_type, payload, created_at
             FROM event_log WHERE subject_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![subject_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries
            .into_iter()
            .map(|(id, subject_id, component, event_type, payload, created)| {
                Ok(EventLogEntry {
                    id: Some(id),
                    subject_id,
                    component,
                    event_type,
                    payload,
                    created_at: parse_ts(&created)?,
                })
            })
            .collect()
    }

    pub fn event_count(&self, subject_id: &str, event_type: &str) -> DispatchResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM event_log WHERE subject_id = ?1 AND event_type = ?2",
                params![subject_id, event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

/// Timestamps are stored as RFC 3339 text in UTC.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> DispatchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DispatchError::Other(anyhow::anyhow!("bad timestamp '{s}': {e}")))
}
