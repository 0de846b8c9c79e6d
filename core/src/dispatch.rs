//! Offer dispatch — single-flight offers and the accept/decline/expiry
//! protocol.
//!
//! One pending offer per ride, one pending offer per captain; both are
//! enforced by partial unique indexes, so a racing second dispatcher loses
//! at the INSERT, not in memory. Acceptance resolves the offer first and
//! only then claims the ride: the offer CAS serializes the captain's accept
//! against the expiry sweep, and the ride CAS guarantees exactly one
//! captain wins a ride that was dispatched twice.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::event::DispatchEvent;
use crate::lifecycle::{RideLifecycle, RideStatus};
use crate::proximity::{CaptainStatus, ProximitySearch};
use crate::reassign::{ReassignOutcome, ReassignReason, ReassignmentController};
use crate::store::DispatchStore;
use crate::types::{CaptainId, OfferId, RideId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
    Cancelled,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One offer extended to one captain, as persisted.
#[derive(Debug, Clone)]
pub struct OfferRecord {
    pub offer_id: OfferId,
    pub ride_id: RideId,
    pub captain_id: CaptainId,
    pub status: OfferStatus,
    pub decline_reason: Option<String>,
    pub distance_km: f64,
    pub estimated_earnings: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// What one dispatch cycle did for a ride.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchCycle {
    Offered {
        offer_id: OfferId,
        captain_id: CaptainId,
    },
    /// A pending offer already exists (ours lost the single-flight race,
    /// or an earlier cycle's offer is still live).
    AlreadyInFlight,
    /// The search came up empty; the reassignment controller decided what
    /// happens next.
    NoCandidates(ReassignOutcome),
    /// The ride left pending before this cycle ran.
    NotPending,
}

pub struct OfferDispatch<'a> {
    store: &'a DispatchStore,
    clock: &'a Clock,
    config: &'a DispatchConfig,
}

impl<'a> OfferDispatch<'a> {
    pub fn new(store: &'a DispatchStore, clock: &'a Clock, config: &'a DispatchConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Run one dispatch cycle: find the best eligible captain inside the
    /// ride's current radius and extend exactly one offer.
    pub fn dispatch_once(&self, ride_id: &str) -> DispatchResult<DispatchCycle> {
        let now = self.clock.now();
        let ride = self.store.get_ride(ride_id)?;
        if ride.status != RideStatus::Pending {
            log::debug!(
                "ride {ride_id}: dispatch skipped in status {}",
                ride.status.as_str()
            );
            return Ok(DispatchCycle::NotPending);
        }
        if self.store.pending_offer_for_ride(ride_id)?.is_some() {
            return Ok(DispatchCycle::AlreadyInFlight);
        }

        let cfg = self.config.matching_for(&ride.locality);

        // Hard ceiling on offers for one ride; routed through the controller
        // so the ride terminates instead of cycling forever.
        if self.store.offer_count_for_ride(ride_id)? >= cfg.max_offers_per_ride {
            return self.no_candidates(ride_id);
        }

        let search = ProximitySearch::new(self.store, self.clock);
        let candidates = search.candidates(
            ride.pickup,
            ride.vehicle_class,
            ride.match_state.current_radius_km,
            cfg,
            &ride.match_state.excluded_captain_ids,
        )?;

        let Some(best) = candidates.first() else {
            return self.no_candidates(ride_id);
        };

        let estimated_earnings = ride
            .fare
            .as_ref()
            .map(|f| f.final_fare * self.config.fare_engine.captain_earnings_share)
            .unwrap_or(0.0);

        let offer = OfferRecord {
            offer_id: Uuid::new_v4().to_string(),
            ride_id: ride_id.to_string(),
            captain_id: best.captain.captain_id.clone(),
            status: OfferStatus::Pending,
            decline_reason: None,
            distance_km: best.distance_km,
            estimated_earnings,
            created_at: now,
            expires_at: now + Duration::seconds(cfg.offer_ttl_secs),
            resolved_at: None,
        };

        // The partial unique indexes decide single-flight races here.
        match self.store.insert_offer(&offer) {
            Ok(()) => {}
            Err(DispatchError::Database(e)) if is_constraint_violation(&e) => {
                log::debug!("ride {ride_id}: lost single-flight race, offer not created");
                return Ok(DispatchCycle::AlreadyInFlight);
            }
            Err(e) => return Err(e),
        }

        self.store.append_event(
            "dispatch",
            &DispatchEvent::OfferCreated {
                offer_id: offer.offer_id.clone(),
                ride_id: offer.ride_id.clone(),
                captain_id: offer.captain_id.clone(),
                distance_km: offer.distance_km,
                expires_at: offer.expires_at,
            },
            now,
        )?;
        log::info!(
            "ride {ride_id}: offered to captain {} at {:.2} km (ttl {}s)",
            offer.captain_id,
            offer.distance_km,
            cfg.offer_ttl_secs
        );
        Ok(DispatchCycle::Offered {
            offer_id: offer.offer_id,
            captain_id: offer.captain_id,
        })
    }

    fn no_candidates(&self, ride_id: &str) -> DispatchResult<DispatchCycle> {
        let controller = ReassignmentController::new(self.store, self.clock, self.config);
        match ignore_benign_race(controller.handle(ride_id, ReassignReason::NoCandidates, None))? {
            Some(outcome) => Ok(DispatchCycle::NoCandidates(outcome)),
            None => Ok(DispatchCycle::NotPending),
        }
    }

    /// Captain accepts an offer. Exactly one captain ever wins a ride:
    /// the offer CAS fences out the expiry sweep, the ride CAS fences out
    /// any other accepted offer for the same ride.
    pub fn accept_offer(&self, offer_id: &str, captain_id: &str) -> DispatchResult<()> {
        let now = self.clock.now();
        let offer = self.store.get_offer(offer_id)?;
        if offer.captain_id != captain_id {
            return Err(DispatchError::NotAuthorized);
        }
        match offer.status {
            OfferStatus::Pending => {}
            // Duplicate delivery of an accept we already processed.
            OfferStatus::Accepted => return Ok(()),
            _ => return Err(DispatchError::AlreadyResolved),
        }

        if now > offer.expires_at {
            // Too late; resolve as expired and hand the ride back.
            if self.store.resolve_offer_cas(
                offer_id,
                OfferStatus::Expired,
                Some("captain_no_response"),
                now,
            )? {
                self.emit_expired(&offer, now)?;
                let controller = ReassignmentController::new(self.store, self.clock, self.config);
                ignore_benign_race(controller.handle(
                    &offer.ride_id,
                    ReassignReason::OfferExpired,
                    Some(captain_id),
                ))?;
            }
            return Err(DispatchError::OfferExpired);
        }

        if !self
            .store
            .resolve_offer_cas(offer_id, OfferStatus::Accepted, None, now)?
        {
            let current = self.store.get_offer(offer_id)?;
            return match current.status {
                OfferStatus::Accepted => Ok(()),
                OfferStatus::Expired => Err(DispatchError::OfferExpired),
                _ => Err(DispatchError::AlreadyResolved),
            };
        }

        let captain = self.store.get_captain(captain_id)?;
        let lifecycle = RideLifecycle::new(self.store, self.clock);
        if !lifecycle.accept_match(&offer.ride_id, captain_id, &captain.vehicle_id)? {
            // The ride was cancelled or claimed while we held the offer.
            self.store
                .resolve_offer_cas_from(offer_id, OfferStatus::Accepted, OfferStatus::Expired, now)?;
            return Err(DispatchError::AlreadyResolved);
        }

        if !self
            .store
            .update_captain_status_cas(captain_id, CaptainStatus::Online, CaptainStatus::OnRide)?
        {
            log::warn!("captain {captain_id}: accepted while not online");
        }

        self.store.append_event(
            "dispatch",
            &DispatchEvent::OfferAccepted {
                offer_id: offer_id.to_string(),
                ride_id: offer.ride_id.clone(),
                captain_id: captain_id.to_string(),
            },
            now,
        )?;
        log::info!("ride {}: captain {captain_id} accepted", offer.ride_id);
        Ok(())
    }

    /// Captain declines an offer. The decline excludes the captain from the
    /// ride and queues a deferred re-dispatch at a wider radius.
    pub fn decline_offer(
        &self,
        offer_id: &str,
        captain_id: &str,
        reason: Option<&str>,
    ) -> DispatchResult<ReassignOutcome> {
        let now = self.clock.now();
        let offer = self.store.get_offer(offer_id)?;
        if offer.captain_id != captain_id {
            return Err(DispatchError::NotAuthorized);
        }

        if !self
            .store
            .resolve_offer_cas(offer_id, OfferStatus::Declined, reason, now)?
        {
            let current = self.store.get_offer(offer_id)?;
            return match current.status {
                // Duplicate decline: the reassignment already happened.
                OfferStatus::Declined => Ok(ReassignOutcome::Skipped),
                OfferStatus::Expired => Err(DispatchError::OfferExpired),
                _ => Err(DispatchError::AlreadyResolved),
            };
        }

        self.store.append_event(
            "dispatch",
            &DispatchEvent::OfferDeclined {
                offer_id: offer_id.to_string(),
                ride_id: offer.ride_id.clone(),
                captain_id: captain_id.to_string(),
                reason: reason.map(str::to_string),
            },
            now,
        )?;
        log::info!("ride {}: captain {captain_id} declined", offer.ride_id);

        let controller = ReassignmentController::new(self.store, self.clock, self.config);
        match controller.handle(&offer.ride_id, ReassignReason::OfferDeclined, Some(captain_id)) {
            // The ride resolved under us (rider cancelled mid-decline);
            // the decline itself still stands.
            Err(DispatchError::RideNotReassignable { .. }) | Err(DispatchError::AlreadyResolved) => {
                Ok(ReassignOutcome::Skipped)
            }
            other => other,
        }
    }

    /// Expire every pending offer whose TTL has elapsed and hand each ride
    /// back to the reassignment controller. Returns the number swept.
    pub fn sweep_expired_offers(&self) -> DispatchResult<u32> {
        let now = self.clock.now();
        let due = self.store.expire_due_offers(now)?;
        let swept = due.len() as u32;
        for offer in due {
            self.emit_expired(&offer, now)?;
            log::info!(
                "ride {}: offer to captain {} expired",
                offer.ride_id,
                offer.captain_id
            );
            let controller = ReassignmentController::new(self.store, self.clock, self.config);
            ignore_benign_race(controller.handle(
                &offer.ride_id,
                ReassignReason::OfferExpired,
                Some(&offer.captain_id),
            ))?;
        }
        Ok(swept)
    }

    fn emit_expired(&self, offer: &OfferRecord, now: DateTime<Utc>) -> DispatchResult<()> {
        self.store.append_event(
            "dispatch",
            &DispatchEvent::OfferExpired {
                offer_id: offer.offer_id.clone(),
                ride_id: offer.ride_id.clone(),
                captain_id: offer.captain_id.clone(),
            },
            now,
        )
    }
}

/// Rides can resolve between a trigger and the controller acting on it;
/// that race is expected, not a sweep failure.
fn ignore_benign_race(
    result: DispatchResult<ReassignOutcome>,
) -> DispatchResult<Option<ReassignOutcome>> {
    match result {
        Ok(outcome) => Ok(Some(outcome)),
        Err(DispatchError::RideNotReassignable { .. }) | Err(DispatchError::AlreadyResolved) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
