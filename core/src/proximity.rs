//! Captain roster and proximity search.
//!
//! Candidate selection reads a point-in-time view: online captains of the
//! requested class with a fresh location report, ranked nearest-first with
//! rating as the tiebreak. Staleness and cooldown screens happen here so
//! the dispatch engine only ever sees offerable captains.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::MatchingConfig;
use crate::error::DispatchResult;
use crate::spatial::haversine_km;
use crate::store::DispatchStore;
use crate::types::{CaptainId, GeoPoint, VehicleClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptainStatus {
    Online,
    Offline,
    OnRide,
}

impl CaptainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::OnRide => "on_ride",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "on_ride" => Some(Self::OnRide),
            _ => None,
        }
    }
}

/// A captain as persisted: identity, class, availability, last fix.
#[derive(Debug, Clone)]
pub struct CaptainRecord {
    pub captain_id: CaptainId,
    pub vehicle_id: String,
    pub vehicle_class: VehicleClass,
    pub status: CaptainStatus,
    pub rating: f64,
    pub location: GeoPoint,
    pub location_updated_at: DateTime<Utc>,
}

/// A candidate surfaced by the search, with its distance to the pickup.
#[derive(Debug, Clone)]
pub struct NearbyCaptain {
    pub captain: CaptainRecord,
    pub distance_km: f64,
}

pub struct ProximitySearch<'a> {
    store: &'a DispatchStore,
    clock: &'a Clock,
}

impl<'a> ProximitySearch<'a> {
    pub fn new(store: &'a DispatchStore, clock: &'a Clock) -> Self {
        Self { store, clock }
    }

    /// All offerable captains within `radius_km` of `pickup`, nearest first.
    ///
    /// A captain qualifies when: online, the right vehicle class, a location
    /// fix newer than the staleness window, not in the exclusion list, not
    /// cooling down, and not already holding a pending offer.
    pub fn candidates(
        &self,
        pickup: GeoPoint,
        vehicle_class: VehicleClass,
        radius_km: f64,
        cfg: &MatchingConfig,
        excluded: &[CaptainId],
    ) -> DispatchResult<Vec<NearbyCaptain>> {
        let now = self.clock.now();
        let freshest_allowed = now - Duration::seconds(cfg.location_staleness_secs);
        let online = self.store.online_captains(vehicle_class, freshest_allowed)?;

        let mut nearby: Vec<NearbyCaptain> = Vec::new();
        for captain in online {
            if excluded.iter().any(|id| *id == captain.captain_id) {
                continue;
            }
            if self.store.captain_cooldown_active(&captain.captain_id, now)? {
                continue;
            }
            if self.store.captain_has_pending_offer(&captain.captain_id)? {
                continue;
            }
            let distance_km = haversine_km(pickup, captain.location);
            if distance_km <= radius_km {
                nearby.push(NearbyCaptain {
                    captain,
                    distance_km,
                });
            }
        }

        // Nearest wins; rating breaks ties, captain id keeps the order
        // stable across workers.
        nearby.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.captain
                        .rating
                        .partial_cmp(&a.captain.rating)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| a.captain.captain_id.cmp(&b.captain.captain_id))
        });
        Ok(nearby)
    }
}
