//! Ride lifecycle tests: the forward transition table, idempotent duplicate
//! delivery, cancellation from every non-terminal state, and the
//! rider-facing display mapping.

use chrono::{DateTime, TimeZone, Utc};
use ridematch_core::dispatch::DispatchCycle;
use ridematch_core::engine::{DispatchEngine, RideRequest};
use ridematch_core::error::DispatchError;
use ridematch_core::lifecycle::RideStatus;
use ridematch_core::proximity::{CaptainRecord, CaptainStatus};
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
    DispatchEngine::build_test(start(), 42).expect("build test engine")
}

fn seed_captain(e: &mut DispatchEngine, id: &str, km_from_pickup: f64) {
    let now = e.clock().now();
    e.upsert_captain(&CaptainRecord {
        captain_id: id.to_string(),
        vehicle_id: format!("veh-{id}"),
        vehicle_class: VehicleClass::Bike,
        status: CaptainStatus::Online,
        rating: 4.8,
        location: north_of(PICKUP, km_from_pickup),
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

/// Drive a ride to matched and return (ride_id, offer_id).
fn matched_ride(e: &mut DispatchEngine) -> (String, String) {
    seed_captain(e, "cap-1", 0.5);
    let (ride_id, cycle) = request(e);
    let offer_id = match cycle {
        DispatchCycle::Offered { offer_id, .. } => offer_id,
        other => panic!("expected an offer, got {other:?}"),
    };
    e.accept_offer(&offer_id, "cap-1").expect("accept");
    (ride_id, offer_id)
}

/// The full happy path walks every forward transition in order.
#[test]
fn happy_path_reaches_completed() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    assert_eq!(e.get_ride(&ride_id).unwrap().status, RideStatus::Matched);

    e.mark_arriving(&ride_id, "cap-1").unwrap();
    e.mark_waiting(&ride_id, "cap-1").unwrap();
    let code = e.get_ride(&ride_id).unwrap().pickup_code;
    e.verify_pickup(&ride_id, "cap-1", &code).unwrap();
    assert_eq!(e.get_ride(&ride_id).unwrap().status, RideStatus::InProgress);

    e.complete_ride(&ride_id, "cap-1").unwrap();
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Completed);
    // The captain is back on the market.
    let captain = e.store().get_captain("cap-1").unwrap();
    assert_eq!(captain.status, CaptainStatus::Online);
}

/// Skipping a state is rejected: waiting cannot follow matched directly.
#[test]
fn skipped_transition_is_illegal() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);

    let err = e.mark_waiting(&ride_id, "cap-1").unwrap_err();
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));
}

/// Completing before the trip started is rejected.
#[test]
fn complete_before_start_is_illegal() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    e.mark_arriving(&ride_id, "cap-1").unwrap();

    let err = e.complete_ride(&ride_id, "cap-1").unwrap_err();
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));
}

/// Duplicate delivery of the same captain-reported transition is a no-op.
#[test]
fn duplicate_transition_is_noop() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);

    e.mark_arriving(&ride_id, "cap-1").unwrap();
    e.mark_arriving(&ride_id, "cap-1").unwrap();
    assert_eq!(
        e.get_ride(&ride_id).unwrap().status,
        RideStatus::CaptainArriving
    );
}

/// Only the assigned captain may report trip progress.
#[test]
fn foreign_captain_is_rejected() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);

    let err = e.mark_arriving(&ride_id, "cap-other").unwrap_err();
    assert!(matches!(err, DispatchError::NotAuthorized));
}

/// The rider can cancel from any non-terminal state; the captain is
/// released and queued work for the ride is dropped.
#[test]
fn rider_cancel_releases_captain() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    e.mark_arriving(&ride_id, "cap-1").unwrap();

    e.cancel_ride(&ride_id, "rider-1", "changed my mind").unwrap();
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.cancelled_by.as_deref(), Some("rider"));
    assert_eq!(
        e.store().get_captain("cap-1").unwrap().status,
        CaptainStatus::Online
    );
    assert_eq!(e.store().task_count_for_ride(&ride_id).unwrap(), 0);
}

/// A cancelled ride carries no captain: the attachment is nulled in the
/// same transaction that flips the status, so captain_id is only ever
/// populated while the ride is live.
#[test]
fn cancel_detaches_captain_from_the_ride() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    e.mark_arriving(&ride_id, "cap-1").unwrap();

    e.cancel_ride(&ride_id, "rider-1", "plans changed").unwrap();
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.captain_id, None);
    assert_eq!(ride.vehicle_id, None);
}

/// Cancelling a completed ride is rejected, and a second cancel of a
/// cancelled ride is too.
#[test]
fn cancel_from_terminal_state_is_illegal() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    e.cancel_ride(&ride_id, "rider-1", "first").unwrap();

    let err = e.cancel_ride(&ride_id, "rider-1", "second").unwrap_err();
    assert!(matches!(err, DispatchError::IllegalTransition { .. }));
}

/// Only the requesting rider may cancel.
#[test]
fn foreign_rider_cannot_cancel() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);

    let err = e.cancel_ride(&ride_id, "rider-9", "nope").unwrap_err();
    assert!(matches!(err, DispatchError::NotAuthorized));
}

/// Rider-facing wording is a derived mapping, never the stored status.
#[test]
fn display_states_are_coarse() {
    let mut e = engine();
    let (ride_id, cycle) = request(&mut e);
    // No captains at all: the first cycle widens the radius and retries.
    assert!(matches!(cycle, DispatchCycle::NoCandidates(_)));
    let ride = e.get_ride(&ride_id).unwrap();
    assert_eq!(ride.display_state(), "searching");

    let mut e2 = engine();
    let (ride2, _) = matched_ride(&mut e2);
    assert_eq!(e2.get_ride(&ride2).unwrap().display_state(), "captain on the way");
}

/// Every status change lands in the event log for subscribers.
#[test]
fn status_changes_are_journaled() {
    let mut e = engine();
    let (ride_id, _) = matched_ride(&mut e);
    e.mark_arriving(&ride_id, "cap-1").unwrap();

    let events = e.store().events_for_subject(&ride_id).unwrap();
    let types: Vec<&str> = events.iter().map(|ev| ev.event_type.as_str()).collect();
    assert!(types.contains(&"ride_requested"));
    assert!(types.contains(&"offer_created"));
    assert!(types.contains(&"offer_accepted"));
    assert!(types.contains(&"ride_status_changed"));
}
