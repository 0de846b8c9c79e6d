//! Fare quoting through the engine: the haversine fallback estimate, surge,
//! promos, display rounding, and the estimate attached at request time.

use chrono::{DateTime, TimeZone, Utc};
use ridematch_core::engine::{DispatchEngine, RideRequest};
use ridematch_core::fare::GeometrySource;
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
    DispatchEngine::build_test(start(), 5).expect("build test engine")
}

/// A 5 km bike trip at the 25 km/h fallback speed takes 12 minutes:
/// 20 base + 50 distance + 12 time = 82, above the 30 floor.
#[test]
fn quote_uses_fallback_geometry() {
    let e = engine();
    let fare = e
        .quote_fare(PICKUP, north_of(PICKUP, 5.0), VehicleClass::Bike, 1.0, None)
        .unwrap();
    assert_eq!(fare.source, GeometrySource::Estimated);
    assert_eq!(fare.base_fare, 20.0);
    assert_eq!(fare.distance_fare, 50.0);
    assert_eq!(fare.time_fare, 12.0);
    assert_eq!(fare.final_fare, 82.0);
    assert_eq!(fare.discount, 0.0);
}

/// Surge multiplies the whole subtotal.
#[test]
fn quote_applies_surge() {
    let e = engine();
    let fare = e
        .quote_fare(PICKUP, north_of(PICKUP, 5.0), VehicleClass::Bike, 1.5, None)
        .unwrap();
    assert_eq!(fare.final_fare, 123.0);
}

/// WELCOME10 takes 10% off the surged-and-floored total.
#[test]
fn quote_honours_percent_promo() {
    let e = engine();
    let fare = e
        .quote_fare(
            PICKUP,
            north_of(PICKUP, 5.0),
            VehicleClass::Bike,
            1.0,
            Some("WELCOME10"),
        )
        .unwrap();
    assert_eq!(fare.discount, 8.2);
    assert_eq!(fare.final_fare, 73.8);
    assert_eq!(fare.promo_code.as_deref(), Some("WELCOME10"));
    assert!(fare.promo_rejection.is_none());
}

/// A class-restricted promo on the wrong class is rejected in-band: full
/// fare plus a rejection reason, never an error.
#[test]
fn quote_carries_promo_rejection() {
    let e = engine();
    let fare = e
        .quote_fare(
            PICKUP,
            north_of(PICKUP, 5.0),
            VehicleClass::Bike,
            1.0,
            Some("FLAT50"),
        )
        .unwrap();
    assert_eq!(fare.final_fare, 82.0);
    assert_eq!(
        fare.promo_rejection.as_deref(),
        Some("not_applicable_to_vehicle_class")
    );
}

/// Short trips quote the per-class minimum fare.
#[test]
fn quote_floors_short_trips() {
    let e = engine();
    let fare = e
        .quote_fare(PICKUP, north_of(PICKUP, 0.3), VehicleClass::Bike, 1.0, None)
        .unwrap();
    assert_eq!(fare.final_fare, 30.0);
}

/// The estimate attached to a requested ride matches an equivalent quote
/// and keeps its unrounded precision in storage.
#[test]
fn request_attaches_matching_estimate() {
    let mut e = engine();
    let quote = e
        .quote_fare(PICKUP, north_of(PICKUP, 5.0), VehicleClass::Bike, 1.0, None)
        .unwrap();
    let (ride, _) = e
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
        .unwrap();

    let stored = ride.fare.expect("estimate attached at request");
    let decimals = e.config().fare_engine.minor_unit_decimals;
    assert_eq!(stored.rounded(decimals).final_fare, quote.final_fare);
    assert_eq!(stored.source, GeometrySource::Estimated);
}
