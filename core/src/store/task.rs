use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{parse_ts, ts, DispatchStore};
use crate::error::{DispatchError, DispatchResult};
use crate::reassign::{DispatchTask, ReassignReason, TaskKind};

struct RawTask {
    task_id: i64,
    ride_id: String,
    kind: String,
    reason: Option<String>,
    acting_captain_id: Option<String>,
    attempt: i64,
    run_after: String,
    created_at: String,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task_id: row.get(0)?,
        ride_id: row.get(1)?,
        kind: row.get(2)?,
        reason: row.get(3)?,
        acting_captain_id: row.get(4)?,
        attempt: row.get(5)?,
        run_after: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn decode(raw: RawTask) -> DispatchResult<DispatchTask> {
    let kind = TaskKind::parse(&raw.kind).ok_or_else(|| {
        DispatchError::Other(anyhow::anyhow!("unknown task kind '{}'", raw.kind))
    })?;
    let reason = raw
        .reason
        .as_deref()
        .map(|s| {
            ReassignReason::parse(s).ok_or_else(|| {
                DispatchError::Other(anyhow::anyhow!("unknown reassign reason '{s}'"))
            })
        })
        .transpose()?;
    Ok(DispatchTask {
        task_id: Some(raw.task_id),
        ride_id: raw.ride_id,
        kind,
        reason,
        acting_captain_id: raw.acting_captain_id,
        attempt: raw.attempt as u32,
        run_after: parse_ts(&raw.run_after)?,
        created_at: parse_ts(&raw.created_at)?,
    })
}

/// How long a claim fences other workers off a task. A worker that dies
/// mid-cycle forfeits the task once the lease lapses.
const CLAIM_LEASE_SECS: i64 = 60;

impl DispatchStore {
    /// Tasks ready to run, oldest first: run_after has passed and the task
    /// is unclaimed or its claim lease has lapsed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> DispatchResult<Vec<DispatchTask>> {
        let reclaim_before = now - chrono::Duration::seconds(CLAIM_LEASE_SECS);
        let mut stmt = self.conn.prepare(
            "SELECT task_id, ride_id, kind, reason, acting_captain_id, attempt,
                    run_after, created_at
             FROM dispatch_task
             WHERE run_after <= ?1 AND (claimed_at IS NULL OR claimed_at <= ?2)
             ORDER BY run_after ASC, task_id ASC",
        )?;
        let raws = stmt
            .query_map(params![ts(now), ts(reclaim_before)], raw_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    /// Claim a task by stamping claimed_at. Returns false when another
    /// worker holds a live claim. The row survives the claim so a crash
    /// before the cycle finishes leaves the task reclaimable.
    pub fn claim_task(&self, task_id: i64, now: DateTime<Utc>) -> DispatchResult<bool> {
        let reclaim_before = now - chrono::Duration::seconds(CLAIM_LEASE_SECS);
        let rows = self.conn.execute(
            "UPDATE dispatch_task SET claimed_at = ?1
             WHERE task_id = ?2 AND (claimed_at IS NULL OR claimed_at <= ?3)",
            params![ts(now), task_id, ts(reclaim_before)],
        )?;
        Ok(rows == 1)
    }

    /// Delete a task whose cycle completed.
    pub fn finish_task(&self, task_id: i64) -> DispatchResult<()> {
        self.conn.execute(
            "DELETE FROM dispatch_task WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    pub fn task_count_for_ride(&self, ride_id: &str) -> DispatchResult<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM dispatch_task WHERE ride_id = ?1",
            params![ride_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}
