//! dispatch-runner: headless demo driver for the ride dispatch core.
//!
//! Usage:
//!   dispatch-runner --db run.db --data-dir ./data
//!   dispatch-runner                      (in-memory, built-in config)
//!
//! Seeds a handful of captains, then walks two rides through the full
//! machinery: a decline with a deferred re-dispatch, an accept, pickup
//! verification, and completion; then an offer left to expire until the
//! retry ceiling terminates the ride.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use ridematch_core::clock::Clock;
use ridematch_core::config::DispatchConfig;
use ridematch_core::dispatch::DispatchCycle;
use ridematch_core::engine::{DispatchEngine, RideRequest};
use ridematch_core::proximity::{CaptainRecord, CaptainStatus};
use ridematch_core::store::DispatchStore;
use ridematch_core::types::{GeoPoint, VehicleClass};
use std::env;

const PICKUP: GeoPoint = GeoPoint {
    lat: 12.9716,
    lng: 77.5946,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or(":memory:");
    let data_dir = args.windows(2).find(|w| w[0] == "--data-dir").map(|w| w[1].as_str());

    println!("ridematch — dispatch-runner");
    println!("  db:        {db}");
    println!("  data_dir:  {}", data_dir.unwrap_or("(built-in defaults)"));
    println!();

    let store = if db == ":memory:" {
        DispatchStore::in_memory()?
    } else {
        DispatchStore::open(db)?
    };
    store.migrate()?;

    let config = match data_dir {
        Some(dir) => DispatchConfig::load(dir)?,
        None => DispatchConfig::default_test(),
    };
    let locality = config.default_locality.clone();

    // A driven clock so the demo can jump over offer TTLs and settle delays
    // instead of sleeping through them.
    let clock = Clock::fixed(Utc::now());
    let mut engine = DispatchEngine::new(store, clock, config);

    seed_captains(&mut engine)?;

    println!("=== RIDE 1: decline, re-dispatch, accept, complete ===");
    run_happy_path(&mut engine, &locality)?;

    println!();
    println!("=== RIDE 2: offers expire until the ride terminates ===");
    run_exhaustion(&mut engine, &locality)?;

    Ok(())
}

fn seed_captains(engine: &mut DispatchEngine) -> Result<()> {
    let now = engine.clock().now();
    let captains = [
        ("cap-asha", 0.4, 4.9),
        ("cap-binu", 0.9, 4.6),
        ("cap-chand", 1.3, 4.2),
    ];
    for (id, km_north, rating) in captains {
        engine.upsert_captain(&CaptainRecord {
            captain_id: id.to_string(),
            vehicle_id: format!("veh-{id}"),
            vehicle_class: VehicleClass::Bike,
            status: CaptainStatus::Online,
            rating,
            location: GeoPoint::new(PICKUP.lat + km_north / 111.1949, PICKUP.lng),
            location_updated_at: now,
        })?;
        println!("seeded captain {id} ({km_north} km out, rating {rating})");
    }
    println!();
    Ok(())
}

fn bike_request(rider: &str, locality: &str, promo: Option<&str>) -> RideRequest {
    RideRequest {
        rider_id: rider.to_string(),
        pickup: PICKUP,
        dropoff: GeoPoint::new(PICKUP.lat + 5.0 / 111.1949, PICKUP.lng),
        pickup_address: "MG Road".to_string(),
        drop_address: "Koramangala".to_string(),
        vehicle_class: VehicleClass::Bike,
        locality: locality.to_string(),
        surge_multiplier: 1.0,
        promo_code: promo.map(str::to_string),
    }
}

fn run_happy_path(engine: &mut DispatchEngine, locality: &str) -> Result<()> {
    let quote = engine.quote_fare(
        PICKUP,
        GeoPoint::new(PICKUP.lat + 5.0 / 111.1949, PICKUP.lng),
        VehicleClass::Bike,
        1.0,
        Some("WELCOME10"),
    )?;
    println!(
        "quote: {:.2} (discount {:.2}{})",
        quote.final_fare,
        quote.discount,
        quote
            .promo_rejection
            .as_deref()
            .map(|r| format!(", promo rejected: {r}"))
            .unwrap_or_default()
    );

    let (ride, cycle) = engine.request_ride(bike_request("rider-maya", locality, Some("WELCOME10")))?;
    let DispatchCycle::Offered { offer_id, captain_id } = cycle else {
        bail!("expected an offer on the first cycle, got {cycle:?}");
    };
    println!("ride {}: offered to {captain_id}", ride.ride_id);

    engine.decline_offer(&offer_id, &captain_id, Some("heading home"))?;
    println!("{captain_id} declined; re-dispatch queued");

    engine.clock().advance(Duration::seconds(3));
    engine.run_due_tasks()?;
    let offers = engine.store().offers_for_ride(&ride.ride_id)?;
    let offer = offers.last().ok_or_else(|| anyhow::anyhow!("no second offer"))?;
    println!("re-dispatched to {}", offer.captain_id);

    engine.accept_offer(&offer.offer_id, &offer.captain_id)?;
    engine.mark_arriving(&ride.ride_id, &offer.captain_id)?;
    engine.mark_waiting(&ride.ride_id, &offer.captain_id)?;

    let code = engine.get_ride(&ride.ride_id)?.pickup_code;
    engine.verify_pickup(&ride.ride_id, &offer.captain_id, &code)?;
    println!("pickup verified with code {code}, trip started");

    engine.clock().advance(Duration::minutes(12));
    engine.complete_ride(&ride.ride_id, &offer.captain_id)?;

    let done = engine.get_ride(&ride.ride_id)?;
    println!("ride finished: {}", done.display_state());
    if let Some(fare) = done.fare {
        let decimals = engine.config().fare_engine.minor_unit_decimals;
        println!("final fare: {:.2}", fare.rounded(decimals).final_fare);
    }
    Ok(())
}

fn run_exhaustion(engine: &mut DispatchEngine, locality: &str) -> Result<()> {
    // Nobody refreshes a location after the jumps above, so every captain
    // is stale and the ride cycles through no-candidate retries.
    let (ride, cycle) = engine.request_ride(bike_request("rider-dev", locality, None))?;
    println!("ride {}: first cycle {cycle:?}", ride.ride_id);

    for _ in 0..8 {
        let current = engine.get_ride(&ride.ride_id)?;
        if current.status.is_terminal() {
            break;
        }
        engine.clock().advance(Duration::seconds(31));
        engine.sweep_expired_offers()?;
        engine.run_due_tasks()?;
    }

    let final_ride = engine.get_ride(&ride.ride_id)?;
    println!(
        "final state: {} (reassignments: {}, offers: {})",
        final_ride.display_state(),
        final_ride.match_state.reassignment_count,
        engine.store().offer_count_for_ride(&ride.ride_id)?
    );
    Ok(())
}
