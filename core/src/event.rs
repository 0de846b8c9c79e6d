//! The change feed — every externally meaningful mutation is appended to
//! the event_log table as a serialized DispatchEvent.
//!
//! RULE: UI and notification layers subscribe by reading the log; the core
//! never depends on a subscriber being present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::RideStatus;
use crate::reassign::ReassignReason;
use crate::types::{CaptainId, OfferId, RideId, RiderId, VehicleClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    RideRequested {
        ride_id: RideId,
        rider_id: RiderId,
        vehicle_class: VehicleClass,
        locality: String,
    },
    RideStatusChanged {
        ride_id: RideId,
        from: RideStatus,
        to: RideStatus,
    },
    OfferCreated {
        offer_id: OfferId,
        ride_id: RideId,
        captain_id: CaptainId,
        distance_km: f64,
        expires_at: DateTime<Utc>,
    },
    OfferAccepted {
        offer_id: OfferId,
        ride_id: RideId,
        captain_id: CaptainId,
    },
    OfferDeclined {
        offer_id: OfferId,
        ride_id: RideId,
        captain_id: CaptainId,
        reason: Option<String>,
    },
    OfferExpired {
        offer_id: OfferId,
        ride_id: RideId,
        captain_id: CaptainId,
    },
    RideReassigned {
        ride_id: RideId,
        reason: ReassignReason,
        attempt: u32,
        radius_km: f64,
    },
    RideCancelled {
        ride_id: RideId,
        cancelled_by: String,
        reason: String,
    },
    PickupVerified {
        ride_id: RideId,
    },
    CaptainCooldownStarted {
        captain_id: CaptainId,
        until: DateTime<Utc>,
    },
}

impl DispatchEvent {
    /// Stable string name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RideRequested { .. } => "ride_requested",
            Self::RideStatusChanged { .. } => "ride_status_changed",
            Self::OfferCreated { .. } => "offer_created",
            Self::OfferAccepted { .. } => "offer_accepted",
            Self::OfferDeclined { .. } => "offer_declined",
            Self::OfferExpired { .. } => "offer_expired",
            Self::RideReassigned { .. } => "ride_reassigned",
            Self::RideCancelled { .. } => "ride_cancelled",
            Self::PickupVerified { .. } => "pickup_verified",
            Self::CaptainCooldownStarted { .. } => "captain_cooldown_started",
        }
    }

    /// The entity the event is about (ride id for ride/offer events,
    /// captain id for cooldown events).
    pub fn subject_id(&self) -> &str {
        match self {
            Self::RideRequested { ride_id, .. }
            | Self::RideStatusChanged { ride_id, .. }
            | Self::OfferCreated { ride_id, .. }
            | Self::OfferAccepted { ride_id, .. }
            | Self::OfferDeclined { ride_id, .. }
            | Self::OfferExpired { ride_id, .. }
            | Self::RideReassigned { ride_id, .. }
            | Self::RideCancelled { ride_id, .. }
            | Self::PickupVerified { ride_id } => ride_id,
            Self::CaptainCooldownStarted { captain_id, .. } => captain_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub subject_id: String,
    pub component: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized DispatchEvent
    pub created_at: DateTime<Utc>,
}
