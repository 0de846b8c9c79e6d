use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{parse_ts, ts, DispatchStore};
use crate::admission::CaptainMetricsRecord;
use crate::error::{DispatchError, DispatchResult};
use crate::proximity::{CaptainRecord, CaptainStatus};
use crate::types::{GeoPoint, VehicleClass};

const CAPTAIN_COLUMNS: &str =
    "captain_id, vehicle_id, vehicle_class, status, rating, lat, lng, location_updated_at";

struct RawCaptain {
    captain_id: String,
    vehicle_id: String,
    vehicle_class: String,
    status: String,
    rating: f64,
    lat: f64,
    lng: f64,
    location_updated_at: String,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCaptain> {
    Ok(RawCaptain {
        captain_id: row.get(0)?,
        vehicle_id: row.get(1)?,
        vehicle_class: row.get(2)?,
        status: row.get(3)?,
        rating: row.get(4)?,
        lat: row.get(5)?,
        lng: row.get(6)?,
        location_updated_at: row.get(7)?,
    })
}

fn decode(raw: RawCaptain) -> DispatchResult<CaptainRecord> {
    let status = CaptainStatus::parse(&raw.status).ok_or_else(|| {
        DispatchError::Other(anyhow::anyhow!("unknown captain status '{}'", raw.status))
    })?;
    let vehicle_class = VehicleClass::parse(&raw.vehicle_class).ok_or_else(|| {
        DispatchError::Other(anyhow::anyhow!(
            "unknown vehicle class '{}'",
            raw.vehicle_class
        ))
    })?;
    Ok(CaptainRecord {
        captain_id: raw.captain_id,
        vehicle_id: raw.vehicle_id,
        vehicle_class,
        status,
        rating: raw.rating,
        location: GeoPoint::new(raw.lat, raw.lng),
        location_updated_at: parse_ts(&raw.location_updated_at)?,
    })
}

impl DispatchStore {
    /// Insert or refresh a captain's roster row.
    pub fn upsert_captain(&self, captain: &CaptainRecord) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO captain (
                captain_id, vehicle_id, vehicle_class, status, rating,
                lat, lng, location_updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(captain_id) DO UPDATE SET
                vehicle_id = excluded.vehicle_id,
                vehicle_class = excluded.vehicle_class,
                status = excluded.status,
                rating = excluded.rating,
                lat = excluded.lat,
                lng = excluded.lng,
                location_updated_at = excluded.location_updated_at",
            params![
                captain.captain_id,
                captain.vehicle_id,
                captain.vehicle_class.as_str(),
                captain.status.as_str(),
                captain.rating,
                captain.location.lat,
                captain.location.lng,
                ts(captain.location_updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_captain(&self, captain_id: &str) -> DispatchResult<CaptainRecord> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {CAPTAIN_COLUMNS} FROM captain WHERE captain_id = ?1"),
                params![captain_id],
                raw_from_row,
            )
            .optional()?
            .ok_or_else(|| DispatchError::NotFound {
                entity: "captain",
                id: captain_id.to_string(),
            })?;
        decode(raw)
    }

    pub fn update_captain_location(
        &self,
        captain_id: &str,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let rows = self.conn.execute(
            "UPDATE captain SET lat = ?1, lng = ?2, location_updated_at = ?3
             WHERE captain_id = ?4",
            params![location.lat, location.lng, ts(now), captain_id],
        )?;
        if rows == 0 {
            return Err(DispatchError::NotFound {
                entity: "captain",
                id: captain_id.to_string(),
            });
        }
        Ok(())
    }

    /// CAS on captain availability.
    pub fn update_captain_status_cas(
        &self,
        captain_id: &str,
        from: CaptainStatus,
        to: CaptainStatus,
    ) -> DispatchResult<bool> {
        let rows = self.conn.execute(
            "UPDATE captain SET status = ?1 WHERE captain_id = ?2 AND status = ?3",
            params![to.as_str(), captain_id, from.as_str()],
        )?;
        Ok(rows == 1)
    }

    /// Online captains of `vehicle_class` with a location fix at or after
    /// `freshest_allowed`. Distance filtering happens in the caller.
    pub fn online_captains(
        &self,
        vehicle_class: VehicleClass,
        freshest_allowed: DateTime<Utc>,
    ) -> DispatchResult<Vec<CaptainRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CAPTAIN_COLUMNS} FROM captain
             WHERE status = 'online' AND vehicle_class = ?1
               AND location_updated_at >= ?2"
        ))?;
        let raws = stmt
            .query_map(
                params![vehicle_class.as_str(), ts(freshest_allowed)],
                raw_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    // ── Captain metrics ────────────────────────────────────────

    pub fn get_captain_metrics(
        &self,
        captain_id: &str,
    ) -> DispatchResult<Option<CaptainMetricsRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT captain_id, daily_cancel_count, daily_window_date,
                        lifetime_cancelled, lifetime_completed, cancellation_rate,
                        cooldown_until
                 FROM captain_metrics WHERE captain_id = ?1",
                params![captain_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        raw.map(
            |(captain_id, daily, window, cancelled, completed, rate, cooldown)| {
                Ok(CaptainMetricsRecord {
                    captain_id,
                    daily_cancel_count: daily as u32,
                    daily_window_date: window,
                    lifetime_cancelled: cancelled as u64,
                    lifetime_completed: completed as u64,
                    cancellation_rate: rate,
                    cooldown_until: cooldown.as_deref().map(parse_ts).transpose()?,
                })
            },
        )
        .transpose()
    }

    pub fn upsert_captain_metrics(&self, m: &CaptainMetricsRecord) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO captain_metrics (
                captain_id, daily_cancel_count, daily_window_date,
                lifetime_cancelled, lifetime_completed, cancellation_rate,
                cooldown_until
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                m.captain_id,
                m.daily_cancel_count as i64,
                m.daily_window_date,
                m.lifetime_cancelled as i64,
                m.lifetime_completed as i64,
                m.cancellation_rate,
                m.cooldown_until.map(ts),
            ],
        )?;
        Ok(())
    }

    /// Whether the captain is inside an active cooldown window.
    pub fn captain_cooldown_active(
        &self,
        captain_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let until: Option<String> = self
            .conn
            .query_row(
                "SELECT cooldown_until FROM captain_metrics WHERE captain_id = ?1",
                params![captain_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        match until {
            None => Ok(false),
            Some(s) => Ok(now < parse_ts(&s)?),
        }
    }
}
