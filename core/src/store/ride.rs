use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{parse_ts, ts, DispatchStore};
use crate::error::{DispatchError, DispatchResult};
use crate::lifecycle::{RideRecord, RideStatus};
use crate::reassign::{PlanOutcome, ReassignmentPlan};
use crate::types::{GeoPoint, VehicleClass};

const RIDE_COLUMNS: &str = "ride_id, rider_id, pickup_lat, pickup_lng, drop_lat, drop_lng,
    pickup_address, drop_address, vehicle_class, locality, status, captain_id,
    vehicle_id, pickup_code, otp_attempts, fare_json, match_state,
    requested_at, matched_at, cancelled_at, cancelled_by, cancel_reason";

/// Column values as they come off a row, before JSON and enum decoding.
struct RawRide {
    ride_id: String,
    rider_id: String,
    pickup_lat: f64,
    pickup_lng: f64,
    drop_lat: f64,
    drop_lng: f64,
    pickup_address: String,
    drop_address: String,
    vehicle_class: String,
    locality: String,
    status: String,
    captain_id: Option<String>,
    vehicle_id: Option<String>,
    pickup_code: String,
    otp_attempts: i64,
    fare_json: Option<String>,
    match_state: String,
    requested_at: String,
    matched_at: Option<String>,
    cancelled_at: Option<String>,
    cancelled_by: Option<String>,
    cancel_reason: Option<String>,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRide> {
    Ok(RawRide {
        ride_id: row.get(0)?,
        rider_id: row.get(1)?,
        pickup_lat: row.get(2)?,
        pickup_lng: row.get(3)?,
        drop_lat: row.get(4)?,
        drop_lng: row.get(5)?,
        pickup_address: row.get(6)?,
        drop_address: row.get(7)?,
        vehicle_class: row.get(8)?,
        locality: row.get(9)?,
        status: row.get(10)?,
        captain_id: row.get(11)?,
        vehicle_id: row.get(12)?,
        pickup_code: row.get(13)?,
        otp_attempts: row.get(14)?,
        fare_json: row.get(15)?,
        match_state: row.get(16)?,
        requested_at: row.get(17)?,
        matched_at: row.get(18)?,
        cancelled_at: row.get(19)?,
        cancelled_by: row.get(20)?,
        cancel_reason: row.get(21)?,
    })
}

fn decode(raw: RawRide) -> DispatchResult<RideRecord> {
    let status = RideStatus::parse(&raw.status)
        .ok_or_else(|| DispatchError::Other(anyhow::anyhow!("unknown ride status '{}'", raw.status)))?;
    let vehicle_class = VehicleClass::parse(&raw.vehicle_class).ok_or_else(|| {
        DispatchError::Other(anyhow::anyhow!(
            "unknown vehicle class '{}'",
            raw.vehicle_class
        ))
    })?;
    Ok(RideRecord {
        ride_id: raw.ride_id,
        rider_id: raw.rider_id,
        pickup: GeoPoint::new(raw.pickup_lat, raw.pickup_lng),
        dropoff: GeoPoint::new(raw.drop_lat, raw.drop_lng),
        pickup_address: raw.pickup_address,
        drop_address: raw.drop_address,
        vehicle_class,
        locality: raw.locality,
        status,
        captain_id: raw.captain_id,
        vehicle_id: raw.vehicle_id,
        pickup_code: raw.pickup_code,
        otp_attempts: raw.otp_attempts as u32,
        fare: raw
            .fare_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        match_state: serde_json::from_str(&raw.match_state)?,
        requested_at: parse_ts(&raw.requested_at)?,
        matched_at: raw.matched_at.as_deref().map(parse_ts).transpose()?,
        cancelled_at: raw.cancelled_at.as_deref().map(parse_ts).transpose()?,
        cancelled_by: raw.cancelled_by,
        cancel_reason: raw.cancel_reason,
    })
}

impl DispatchStore {
    pub fn insert_ride(&self, ride: &RideRecord) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO ride (
                ride_id, rider_id, pickup_lat, pickup_lng, drop_lat, drop_lng,
                pickup_address, drop_address, vehicle_class, locality, status,
                captain_id, vehicle_id, pickup_code, otp_attempts, fare_json,
                match_state, requested_at, matched_at, cancelled_at,
                cancelled_by, cancel_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                ride.ride_id,
                ride.rider_id,
                ride.pickup.lat,
                ride.pickup.lng,
                ride.dropoff.lat,
                ride.dropoff.lng,
                ride.pickup_address,
                ride.drop_address,
                ride.vehicle_class.as_str(),
                ride.locality,
                ride.status.as_str(),
                ride.captain_id,
                ride.vehicle_id,
                ride.pickup_code,
                ride.otp_attempts as i64,
                ride.fare
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&ride.match_state)?,
                ts(ride.requested_at),
                ride.matched_at.map(ts),
                ride.cancelled_at.map(ts),
                ride.cancelled_by,
                ride.cancel_reason,
            ],
        )?;
        Ok(())
    }

    pub fn get_ride(&self, ride_id: &str) -> DispatchResult<RideRecord> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RIDE_COLUMNS} FROM ride WHERE ride_id = ?1"),
                params![ride_id],
                raw_from_row,
            )
            .optional()?
            .ok_or_else(|| DispatchError::NotFound {
                entity: "ride",
                id: ride_id.to_string(),
            })?;
        decode(raw)
    }

    /// CAS: flip status from `from` to `to`. Returns whether this caller
    /// won the transition.
    pub fn update_ride_status_cas(
        &self,
        ride_id: &str,
        from: RideStatus,
        to: RideStatus,
    ) -> DispatchResult<bool> {
        let rows = self.conn.execute(
            "UPDATE ride SET status = ?1 WHERE ride_id = ?2 AND status = ?3",
            params![to.as_str(), ride_id, from.as_str()],
        )?;
        Ok(rows == 1)
    }

    /// CAS pending → matched, attaching the captain and vehicle.
    pub fn try_match_ride(
        &self,
        ride_id: &str,
        captain_id: &str,
        vehicle_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let rows = self.conn.execute(
            "UPDATE ride
             SET status = 'matched', captain_id = ?1, vehicle_id = ?2, matched_at = ?3
             WHERE ride_id = ?4 AND status = 'pending'",
            params![captain_id, vehicle_id, ts(now), ride_id],
        )?;
        Ok(rows == 1)
    }

    /// CAS any non-terminal status → cancelled, detaching the captain and
    /// vehicle (a captain is attached only while the ride is live). In the
    /// same transaction: void any pending offer, release the captain, and
    /// drop queued work for the ride.
    pub fn cancel_ride_cas(
        &self,
        ride_id: &str,
        prior: RideStatus,
        cancelled_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        // The attached captain, read before the UPDATE nulls it out.
        let captain_id: Option<String> = tx
            .query_row(
                "SELECT captain_id FROM ride WHERE ride_id = ?1",
                params![ride_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let rows = tx.execute(
            "UPDATE ride
             SET status = 'cancelled', captain_id = NULL, vehicle_id = NULL,
                 cancelled_at = ?1, cancelled_by = ?2, cancel_reason = ?3
             WHERE ride_id = ?4 AND status = ?5",
            params![ts(now), cancelled_by, reason, ride_id, prior.as_str()],
        )?;
        if rows != 1 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE ride_offer SET status = 'cancelled', resolved_at = ?1
             WHERE ride_id = ?2 AND status = 'pending'",
            params![ts(now), ride_id],
        )?;
        if prior.has_captain() {
            if let Some(captain_id) = captain_id {
                tx.execute(
                    "UPDATE captain SET status = 'online'
                     WHERE captain_id = ?1 AND status = 'on_ride'",
                    params![captain_id],
                )?;
            }
        }
        tx.execute(
            "DELETE FROM dispatch_task WHERE ride_id = ?1",
            params![ride_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Bump the mismatch counter and return the new value.
    pub fn increment_otp_attempts(&self, ride_id: &str) -> DispatchResult<u32> {
        self.conn.execute(
            "UPDATE ride SET otp_attempts = otp_attempts + 1 WHERE ride_id = ?1",
            params![ride_id],
        )?;
        let attempts: i64 = self.conn.query_row(
            "SELECT otp_attempts FROM ride WHERE ride_id = ?1",
            params![ride_id],
            |row| row.get(0),
        )?;
        Ok(attempts as u32)
    }

    /// Apply one reassignment atomically: the guarded ride reset (or
    /// termination), pending-offer cleanup, captain release, cancellation
    /// accounting, the follow-up task, and the events. Returns false when
    /// the status guard fails — the whole plan rolls back.
    pub fn apply_reassignment(
        &self,
        plan: &ReassignmentPlan,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let tx = self.conn.unchecked_transaction()?;

        let rows = match &plan.outcome {
            PlanOutcome::Redispatch { match_state, .. } => tx.execute(
                "UPDATE ride
                 SET status = 'pending', captain_id = NULL, vehicle_id = NULL,
                     matched_at = NULL, match_state = ?1
                 WHERE ride_id = ?2 AND status = ?3",
                params![
                    serde_json::to_string(match_state)?,
                    plan.ride_id,
                    plan.prior_status.as_str()
                ],
            )?,
            PlanOutcome::Terminate {
                match_state,
                cancel_reason,
            } => tx.execute(
                "UPDATE ride
                 SET status = 'cancelled', captain_id = NULL, vehicle_id = NULL,
                     match_state = ?1, cancelled_at = ?2, cancelled_by = 'system',
                     cancel_reason = ?3
                 WHERE ride_id = ?4 AND status = ?5",
                params![
                    serde_json::to_string(match_state)?,
                    ts(now),
                    cancel_reason,
                    plan.ride_id,
                    plan.prior_status.as_str()
                ],
            )?,
        };
        if rows != 1 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE ride_offer SET status = 'cancelled', resolved_at = ?1
             WHERE ride_id = ?2 AND status = 'pending'",
            params![ts(now), plan.ride_id],
        )?;

        if let Some(captain_id) = &plan.released_captain {
            tx.execute(
                "UPDATE captain SET status = 'online'
                 WHERE captain_id = ?1 AND status = 'on_ride'",
                params![captain_id],
            )?;
        }

        if let Some(m) = &plan.metrics {
            tx.execute(
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
        }

        match &plan.outcome {
            PlanOutcome::Redispatch { task, .. } => {
                tx.execute(
                    "INSERT INTO dispatch_task (
                        ride_id, kind, reason, acting_captain_id, attempt,
                        run_after, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        task.ride_id,
                        task.kind.as_str(),
                        task.reason.map(|r| r.as_str()),
                        task.acting_captain_id,
                        task.attempt as i64,
                        ts(task.run_after),
                        ts(task.created_at),
                    ],
                )?;
            }
            PlanOutcome::Terminate { .. } => {
                tx.execute(
                    "DELETE FROM dispatch_task WHERE ride_id = ?1",
                    params![plan.ride_id],
                )?;
            }
        }

        for event in &plan.events {
            tx.execute(
                "INSERT INTO event_log (subject_id, component, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.subject_id(),
                    "reassign",
                    event.type_name(),
                    serde_json::to_string(event)?,
                    ts(now),
                ],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }
}
