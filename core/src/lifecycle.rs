//! Ride state machine — the canonical ride status and its legal transitions.
//!
//!   pending → matched → captain_arriving → waiting_for_rider
//!           → in_progress → completed
//!
//! `cancelled` is reachable from every non-terminal state. The only backward
//! transition is the reassignment reset (matched/captain_arriving/
//! waiting_for_rider → pending), performed exclusively by the reassignment
//! controller.
//!
//! RULES:
//!   - Only this module (and the reassignment transaction it sanctions)
//!     writes ride.status.
//!   - Every write is a compare-and-set on the previously observed status;
//!     workers on other hosts race through the store, not through memory.
//!   - Duplicate delivery of the same transition is a no-op, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{DispatchError, DispatchResult};
use crate::event::DispatchEvent;
use crate::fare::FareBreakdown;
use crate::reassign::MatchState;
use crate::store::DispatchStore;
use crate::types::{CaptainId, GeoPoint, RideId, RiderId, VehicleClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Matched,
    CaptainArriving,
    WaitingForRider,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::CaptainArriving => "captain_arriving",
            Self::WaitingForRider => "waiting_for_rider",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "matched" => Some(Self::Matched),
            "captain_arriving" => Some(Self::CaptainArriving),
            "waiting_for_rider" => Some(Self::WaitingForRider),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States in which a captain is attached to the ride.
    pub fn has_captain(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::CaptainArriving | Self::WaitingForRider | Self::InProgress
        )
    }

    /// The forward transition table. Cancellation and the reassignment
    /// reset are handled separately.
    pub fn can_advance_to(&self, to: RideStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, RideStatus::Matched)
                | (Self::Matched, RideStatus::CaptainArriving)
                | (Self::CaptainArriving, RideStatus::WaitingForRider)
                | (Self::WaitingForRider, RideStatus::InProgress)
                | (Self::InProgress, RideStatus::Completed)
        )
    }

    /// Statuses the reassignment controller may reset back to pending.
    pub fn is_reassignable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Matched | Self::CaptainArriving | Self::WaitingForRider
        )
    }

    /// Coarse rider-facing wording; internal codes are never shown.
    pub fn display_state(&self) -> &'static str {
        match self {
            Self::Pending => "searching",
            Self::Matched | Self::CaptainArriving => "captain on the way",
            Self::WaitingForRider => "captain waiting",
            Self::InProgress => "on trip",
            Self::Completed => "completed",
            Self::Cancelled => "ride cancelled",
        }
    }
}

/// One trip request, as persisted.
#[derive(Debug, Clone)]
pub struct RideRecord {
    pub ride_id: RideId,
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub pickup_address: String,
    pub drop_address: String,
    pub vehicle_class: VehicleClass,
    pub locality: String,
    pub status: RideStatus,
    pub captain_id: Option<CaptainId>,
    pub vehicle_id: Option<String>,
    pub pickup_code: String,
    pub otp_attempts: u32,
    pub fare: Option<FareBreakdown>,
    pub match_state: MatchState,
    pub requested_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,
}

impl RideRecord {
    pub fn display_state(&self) -> &'static str {
        if self.status == RideStatus::Cancelled
            && self.cancelled_by.as_deref() == Some("system")
        {
            return "no captains available";
        }
        self.status.display_state()
    }
}

pub struct RideLifecycle<'a> {
    store: &'a DispatchStore,
    clock: &'a Clock,
}

impl<'a> RideLifecycle<'a> {
    pub fn new(store: &'a DispatchStore, clock: &'a Clock) -> Self {
        Self { store, clock }
    }

    /// Advance `ride_id` from `from` to `to`. Idempotent under duplicate
    /// delivery: a lost CAS against a ride already at `to` is a no-op.
    pub fn advance(&self, ride_id: &str, from: RideStatus, to: RideStatus) -> DispatchResult<()> {
        if !from.can_advance_to(to) {
            return Err(DispatchError::IllegalTransition { from, to });
        }
        if self.store.update_ride_status_cas(ride_id, from, to)? {
            self.emit_change(ride_id, from, to)?;
            return Ok(());
        }
        // Lost the CAS: re-read and decide between duplicate and illegal.
        let current = self.store.get_ride(ride_id)?.status;
        if current == to {
            log::debug!("ride {ride_id}: duplicate {from:?}->{to:?} ignored");
            Ok(())
        } else {
            Err(DispatchError::IllegalTransition { from: current, to })
        }
    }

    /// The exactly-one-accept gate: CAS pending → matched, attaching the
    /// captain and vehicle. Returns false if the ride was no longer pending.
    pub fn accept_match(
        &self,
        ride_id: &str,
        captain_id: &str,
        vehicle_id: &str,
    ) -> DispatchResult<bool> {
        let now = self.clock.now();
        let won = self
            .store
            .try_match_ride(ride_id, captain_id, vehicle_id, now)?;
        if won {
            self.emit_change(ride_id, RideStatus::Pending, RideStatus::Matched)?;
        }
        Ok(won)
    }

    /// Cancel from any non-terminal state. Retries the CAS once after a
    /// re-read. Returns the status the ride held before cancellation.
    pub fn cancel(
        &self,
        ride_id: &str,
        cancelled_by: &str,
        reason: &str,
    ) -> DispatchResult<RideStatus> {
        let now = self.clock.now();
        for _ in 0..2 {
            let prior = self.store.get_ride(ride_id)?.status;
            if prior.is_terminal() {
                return Err(DispatchError::IllegalTransition {
                    from: prior,
                    to: RideStatus::Cancelled,
                });
            }
            if self
                .store
                .cancel_ride_cas(ride_id, prior, cancelled_by, reason, now)?
            {
                self.emit_change(ride_id, prior, RideStatus::Cancelled)?;
                self.store.append_event(
                    "lifecycle",
                    &DispatchEvent::RideCancelled {
                        ride_id: ride_id.to_string(),
                        cancelled_by: cancelled_by.to_string(),
                        reason: reason.to_string(),
                    },
                    now,
                )?;
                return Ok(prior);
            }
        }
        Err(DispatchError::AlreadyResolved)
    }

    fn emit_change(&self, ride_id: &str, from: RideStatus, to: RideStatus) -> DispatchResult<()> {
        log::info!("ride {ride_id}: {} -> {}", from.as_str(), to.as_str());
        self.store.append_event(
            "lifecycle",
            &DispatchEvent::RideStatusChanged {
                ride_id: ride_id.to_string(),
                from,
                to,
            },
            self.clock.now(),
        )
    }
}
