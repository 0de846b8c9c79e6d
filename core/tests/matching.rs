//! Offer dispatch tests: candidate eligibility and ranking, single-flight
//! offers, the exactly-one-accept guarantee, and decline handling.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ridematch_core::dispatch::{DispatchCycle, OfferStatus};
use ridematch_core::engine::{DispatchEngine, RideRequest};
use ridematch_core::error::DispatchError;
use ridematch_core::lifecycle::RideStatus;
use ridematch_core::proximity::{CaptainRecord, CaptainStatus};
use ridematch_core::reassign::ReassignOutcome;
use ridematch_core::types::{GeoPoint, VehicleClass};

const PICKUP: GeoPoint = GeoPoint {
    lat: 12.9716,
    lng: 77.5946,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).single().unwrap()
}

fn north_of(p: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(p.lat + km / 111.1949, p.lng)
}

fn engine() -> DispatchEngine {
    DispatchEngine::build_test(start(), 7).expect("build test engine")
}

fn seed_captain(e: &mut DispatchEngine, id: &str, km: f64, class: VehicleClass, rating: f64) {
    let now = e.clock().now();
    e.upsert_captain(&CaptainRecord {
        captain_id: id.to_string(),
        vehicle_id: format!("veh-{id}"),
        vehicle_class: class,
        status: CaptainStatus::Online,
        rating,
        location: north_of(PICKUP, km),
        location_updated_at: now,
    })
    .expect("seed captain");
}

fn request(e: &mut DispatchEngine) -> (String, DispatchCycle) {
    let (ride, cycle) = e
        .request_ride(RideRequest {
            rider_id: "rider-1".to_string(),
            pickup: PICKUP,
            dropoff: north_of(PICKUP, 5.0),
            pickup_address: "MG Road".to_string(),
            drop_address: "Koramangala".to_string(),
            vehicle_class: VehicleClass::Bike,
            locality: "test_city".to_string(),
            surge_multiplier: 1.0,
            promo_code: None,
        })
        .expect("request ride");
    (ride.ride_id, cycle)
}

fn offered(cycle: DispatchCycle) -> (String, String) {
    match cycle {
        DispatchCycle::Offered {
            offer_id,
            captain_id,
        } => (offer_id, captain_id),
        other => panic!("expected an offer, got {other:?}"),
    }
}

/// The nearest eligible captain gets the offer.
#[test]
fn nearest_captain_wins() {
    let mut e = engine();
    seed_captain(&mut e, "cap-near", 0.4, VehicleClass::Bike, 4.2);
    seed_captain(&mut e, "cap-far", 1.2, VehicleClass::Bike, 5.0);

    let (_, cycle) = request(&mut e);
    let (_, captain_id) = offered(cycle);
    assert_eq!(captain_id, "cap-near");
}

/// Equidistant captains are ranked by rating.
#[test]
fn rating_breaks_distance_ties() {
    let mut e = engine();
    seed_captain(&mut e, "cap-a", 0.8, VehicleClass::Bike, 4.1);
    seed_captain(&mut e, "cap-b", 0.8, VehicleClass::Bike, 4.9);

    let (_, cycle) = request(&mut e);
    let (_, captain_id) = offered(cycle);
    assert_eq!(captain_id, "cap-b");
}

/// Wrong class, offline, out-of-radius, and stale-location captains are
/// all invisible to the search.
#[test]
fn ineligible_captains_are_skipped() {
    let mut e = engine();
    seed_captain(&mut e, "cap-car", 0.3, VehicleClass::Car, 5.0);
    seed_captain(&mut e, "cap-off", 0.3, VehicleClass::Bike, 5.0);
    e.set_captain_offline("cap-off").unwrap();
    seed_captain(&mut e, "cap-out", 2.5, VehicleClass::Bike, 5.0); // beyond 1.5 km
    seed_captain(&mut e, "cap-stale", 0.3, VehicleClass::Bike, 5.0);
    e.clock().advance(Duration::seconds(180)); // past the 120 s staleness bound
    seed_captain(&mut e, "cap-fresh", 1.0, VehicleClass::Bike, 4.0);

    let (_, cycle) = request(&mut e);
    let (_, captain_id) = offered(cycle);
    assert_eq!(captain_id, "cap-fresh");
}

/// One pending offer per ride: a second dispatch cycle while an offer is
/// live creates nothing.
#[test]
fn single_flight_per_ride() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (ride_id, cycle) = request(&mut e);
    offered(cycle);

    // Force another cycle directly through a queued task path: none is due,
    // so run the dispatcher by re-requesting dispatch via the sweep (no-op)
    // and verifying the offer count stayed at one.
    assert_eq!(e.sweep_expired_offers().unwrap(), 0);
    assert_eq!(e.store().offer_count_for_ride(&ride_id).unwrap(), 1);
}

/// A captain holding a pending offer is not offered a second ride.
#[test]
fn busy_captain_not_double_offered() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (_, cycle) = request(&mut e);
    offered(cycle);

    // Same captain is the only candidate; the second ride finds nobody.
    let (_, cycle2) = request(&mut e);
    assert!(matches!(cycle2, DispatchCycle::NoCandidates(_)));
}

/// Accept is exactly-once: the winner takes the ride, replays are no-ops,
/// and responses to a resolved offer are typed failures.
#[test]
fn accept_is_exactly_once() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (ride_id, cycle) = request(&mut e);
    let (offer_id, _) = offered(cycle);

    e.accept_offer(&offer_id, "cap-1").unwrap();
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Matched);
    assert_eq!(ride.captain_id.as_deref(), Some("cap-1"));
    assert_eq!(ride.vehicle_id.as_deref(), Some("veh-cap-1"));
    assert_eq!(
        e.store().get_captain("cap-1").unwrap().status,
        CaptainStatus::OnRide
    );

    // Duplicate accept: idempotent.
    e.accept_offer(&offer_id, "cap-1").unwrap();
    // Decline after accept: already resolved.
    let err = e.decline_offer(&offer_id, "cap-1", None).unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyResolved));
}

/// When the ride is claimed out from under a live offer, the late accept
/// loses the ride CAS: it fails as already resolved and the offer reverts
/// so the winner's claim stands alone.
#[test]
fn losing_accept_reverts_the_offer() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (ride_id, cycle) = request(&mut e);
    let (offer_id, _) = offered(cycle);

    // A concurrent worker matches the ride while cap-1's offer is live.
    let now = e.clock().now();
    assert!(e
        .store()
        .try_match_ride(&ride_id, "cap-9", "veh-9", now)
        .unwrap());

    let err = e.accept_offer(&offer_id, "cap-1").unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyResolved));

    let offer = e.store().get_offer(&offer_id).unwrap();
    assert_eq!(offer.status, OfferStatus::Expired);
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Matched);
    assert_eq!(ride.captain_id.as_deref(), Some("cap-9"));
}

/// Only the offered captain may respond.
#[test]
fn foreign_captain_cannot_respond() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (_, cycle) = request(&mut e);
    let (offer_id, _) = offered(cycle);

    let err = e.accept_offer(&offer_id, "cap-2").unwrap_err();
    assert!(matches!(err, DispatchError::NotAuthorized));
}

/// Decline resolves the offer, excludes the captain from the ride, and
/// defers the re-dispatch to the task queue instead of re-offering inline.
#[test]
fn decline_excludes_and_defers() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    seed_captain(&mut e, "cap-2", 0.9, VehicleClass::Bike, 4.8);
    let (ride_id, cycle) = request(&mut e);
    let (offer_id, _) = offered(cycle);

    let outcome = e.decline_offer(&offer_id, "cap-1", Some("too far")).unwrap();
    assert!(matches!(outcome, ReassignOutcome::Redispatched { attempt: 1, .. }));

    let offer = e.store().get_offer(&offer_id).unwrap();
    assert_eq!(offer.status, OfferStatus::Declined);
    assert_eq!(offer.decline_reason.as_deref(), Some("too far"));

    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Pending);
    assert!(ride
        .match_state
        .excluded_captain_ids
        .contains(&"cap-1".to_string()));
    // No inline re-offer; the task queue carries the next cycle.
    assert_eq!(e.store().offer_count_for_ride(&ride_id).unwrap(), 1);
    assert_eq!(e.store().task_count_for_ride(&ride_id).unwrap(), 1);

    // After the settle delay the next cycle skips the decliner.
    e.clock().advance(Duration::seconds(3));
    assert_eq!(e.run_due_tasks().unwrap(), 1);
    let offers = e.store().offers_for_ride(&ride_id).unwrap();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[1].captain_id, "cap-2");
}

/// The offer carries the captain's share of the fare estimate.
#[test]
fn offer_quotes_captain_earnings() {
    let mut e = engine();
    seed_captain(&mut e, "cap-1", 0.5, VehicleClass::Bike, 4.8);
    let (ride_id, cycle) = request(&mut e);
    let (offer_id, _) = offered(cycle);

    let ride = e.get_ride(&ride_id).unwrap();
    let fare = ride.fare.expect("estimate attached at request");
    let offer = e.store().get_offer(&offer_id).unwrap();
    assert!((offer.estimated_earnings - fare.final_fare * 0.8).abs() < 1e-9);
}
