use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{parse_ts, ts, DispatchStore};
use crate::dispatch::{OfferRecord, OfferStatus};
use crate::error::{DispatchError, DispatchResult};

const OFFER_COLUMNS: &str = "offer_id, ride_id, captain_id, status, decline_reason,
    distance_km, estimated_earnings, created_at, expires_at, resolved_at";

struct RawOffer {
    offer_id: String,
    ride_id: String,
    captain_id: String,
    status: String,
    decline_reason: Option<String>,
    distance_km: f64,
    estimated_earnings: f64,
    created_at: String,
    expires_at: String,
    resolved_at: Option<String>,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOffer> {
    Ok(RawOffer {
        offer_id: row.get(0)?,
        ride_id: row.get(1)?,
        captain_id: row.get(2)?,
        status: row.get(3)?,
        decline_reason: row.get(4)?,
        distance_km: row.get(5)?,
        estimated_earnings: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

fn decode(raw: RawOffer) -> DispatchResult<OfferRecord> {
    let status = OfferStatus::parse(&raw.status).ok_or_else(|| {
        DispatchError::Other(anyhow::anyhow!("unknown offer status '{}'", raw.status))
    })?;
    Ok(OfferRecord {
        offer_id: raw.offer_id,
        ride_id: raw.ride_id,
        captain_id: raw.captain_id,
        status,
        decline_reason: raw.decline_reason,
        distance_km: raw.distance_km,
        estimated_earnings: raw.estimated_earnings,
        created_at: parse_ts(&raw.created_at)?,
        expires_at: parse_ts(&raw.expires_at)?,
        resolved_at: raw.resolved_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl DispatchStore {
    /// Insert a pending offer. The partial unique indexes reject a second
    /// pending offer for the same ride or captain; callers treat that
    /// constraint failure as losing the single-flight race.
    pub fn insert_offer(&self, offer: &OfferRecord) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO ride_offer (
                offer_id, ride_id, captain_id, status, decline_reason,
                distance_km, estimated_earnings, created_at, expires_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                offer.offer_id,
                offer.ride_id,
                offer.captain_id,
                offer.status.as_str(),
                offer.decline_reason,
                offer.distance_km,
                offer.estimated_earnings,
                ts(offer.created_at),
                ts(offer.expires_at),
                offer.resolved_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_offer(&self, offer_id: &str) -> DispatchResult<OfferRecord> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {OFFER_COLUMNS} FROM ride_offer WHERE offer_id = ?1"),
                params![offer_id],
                raw_from_row,
            )
            .optional()?
            .ok_or_else(|| DispatchError::NotFound {
                entity: "offer",
                id: offer_id.to_string(),
            })?;
        decode(raw)
    }

    pub fn pending_offer_for_ride(&self, ride_id: &str) -> DispatchResult<Option<OfferRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {OFFER_COLUMNS} FROM ride_offer
                     WHERE ride_id = ?1 AND status = 'pending'"
                ),
                params![ride_id],
                raw_from_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    pub fn offers_for_ride(&self, ride_id: &str) -> DispatchResult<Vec<OfferRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OFFER_COLUMNS} FROM ride_offer
             WHERE ride_id = ?1 ORDER BY created_at ASC"
        ))?;
        let raws = stmt
            .query_map(params![ride_id], raw_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode).collect()
    }

    pub fn offer_count_for_ride(&self, ride_id: &str) -> DispatchResult<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ride_offer WHERE ride_id = ?1",
            params![ride_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// CAS pending → `to`. Returns whether this caller resolved the offer.
    pub fn resolve_offer_cas(
        &self,
        offer_id: &str,
        to: OfferStatus,
        decline_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        self.resolve_offer_cas_from(offer_id, OfferStatus::Pending, to, now)
            .and_then(|won| {
                if won {
                    if let Some(reason) = decline_reason {
                        self.conn.execute(
                            "UPDATE ride_offer SET decline_reason = ?1 WHERE offer_id = ?2",
                            params![reason, offer_id],
                        )?;
                    }
                }
                Ok(won)
            })
    }

    pub fn resolve_offer_cas_from(
        &self,
        offer_id: &str,
        from: OfferStatus,
        to: OfferStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let rows = self.conn.execute(
            "UPDATE ride_offer SET status = ?1, resolved_at = ?2
             WHERE offer_id = ?3 AND status = ?4",
            params![to.as_str(), ts(now), offer_id, from.as_str()],
        )?;
        Ok(rows == 1)
    }

    /// Flip every pending offer past its TTL to expired and return them.
    /// Each flip is its own CAS, so a concurrent accept of one offer never
    /// blocks the rest of the sweep.
    pub fn expire_due_offers(&self, now: DateTime<Utc>) -> DispatchResult<Vec<OfferRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OFFER_COLUMNS} FROM ride_offer
             WHERE status = 'pending' AND expires_at <= ?1
             ORDER BY expires_at ASC"
        ))?;
        let raws = stmt
            .query_map(params![ts(now)], raw_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut expired = Vec::new();
        for raw in raws {
            let offer = decode(raw)?;
            if self.resolve_offer_cas(
                &offer.offer_id,
                OfferStatus::Expired,
                Some("captain_no_response"),
                now,
            )? {
                expired.push(OfferRecord {
                    status: OfferStatus::Expired,
                    decline_reason: Some("captain_no_response".to_string()),
                    resolved_at: Some(now),
                    ..offer
                });
            }
        }
        Ok(expired)
    }

    pub fn captain_has_pending_offer(&self, captain_id: &str) -> DispatchResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ride_offer WHERE captain_id = ?1 AND status = 'pending'",
            params![captain_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
